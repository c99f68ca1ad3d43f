//! H.264 (AVC) 解码状态机.
//!
//! 消费上层解析器给出的 SPS/PPS/切片记录, 维护 POC、参考标记、
//! 参考列表与 DPB, 按显示顺序吐出解码帧. 覆盖帧编码与场编码
//! (PicAFF), frame_num 间隙以丢帧恢复, MVC 等扩展不支持.
//!
//! 使用方式: `decode_sps`/`decode_pps` 送参数集, `decode_slice` 按
//! 码流顺序送切片, `receive_frame` 取输出; 码流结束时 `end_of_sequence`
//! 排空 DPB, seek 时 `flush` 丢弃全部状态.

mod dpb;
mod headers;
mod marking;
mod picture;
mod poc;
mod refs;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, VecDeque};

use lan_core::{LanError, LanResult, timestamp::is_valid_pts};
use log::{debug, warn};

use crate::backend::{
    DecodeBackend, OutputFrame, PictureParams, PictureStructure, RefPicEntry, SliceParams,
    SurfaceDescriptor,
};

pub use headers::{
    DecRefPicMarking, MmcoOp, Pps, RefPicListMod, Slice, SliceHeader, Sps, VuiParameters,
};

use picture::{Arena, FrameStore, FrameStoreId, Picture, PictureFlags, PictureId, ReferenceKind};
use poc::{BOTTOM_FIELD, PocCounters, TOP_FIELD};

const MAX_SPS_COUNT: u32 = 32;
const MAX_PPS_COUNT: u32 = 256;

/// H.264 解码器
pub struct H264Decoder {
    backend: Box<dyn DecodeBackend>,

    sps_map: HashMap<u32, Sps>,
    pps_map: HashMap<u32, Pps>,
    /// 当前序列激活的参数集 (副本, 参数集中途被覆盖不影响本序列)
    active_sps: Option<Sps>,
    active_pps: Option<Pps>,

    pictures: Arena<Picture>,
    stores: Arena<FrameStore>,

    dpb: Vec<FrameStoreId>,
    dpb_size: usize,

    current_picture: Option<PictureId>,
    /// 最近一个已处理切片的头部, 用于图像边界判定与参考标记
    prev_slice_header: Option<SliceHeader>,

    /// 参考集合, 每个图像开始时从 DPB 重建
    short_ref: Vec<PictureId>,
    long_ref: Vec<PictureId>,
    ref_pic_list0: Vec<Option<PictureId>>,
    ref_pic_list1: Vec<Option<PictureId>>,

    /// 最近入库的帧槽 (场配对入口)
    prev_frame: Option<FrameStoreId>,
    /// 最近入库的参考帧槽 (间隙修复的克隆来源)
    prev_ref_frame: Option<FrameStoreId>,

    poc: PocCounters,
    /// 当前图像的 frame_num (MMCO 5 会清零, 与头部字段分开存)
    frame_num: i32,
    prev_frame_num: i32,
    prev_ref_frame_num: i32,
    prev_pic_has_mmco5: bool,
    prev_pic_reference: bool,
    prev_pic_structure: PictureStructure,

    /// 解码上下文指纹, 任一项变化都重建上下文
    profile_idc: u8,
    chroma_format_idc: u32,
    mb_width: u32,
    mb_height: u32,
    has_context: bool,

    progressive_sequence: bool,
    top_field_first: bool,

    /// 低延迟模式: 每个图像结束后立即输出已就绪的帧
    force_low_latency: bool,
    output_queue: VecDeque<OutputFrame>,

    got_i_frame: bool,
    got_slice: bool,
    au_has_inter: bool,
    drained: bool,
}

impl H264Decoder {
    pub fn new(backend: Box<dyn DecodeBackend>) -> Self {
        Self {
            backend,
            sps_map: HashMap::new(),
            pps_map: HashMap::new(),
            active_sps: None,
            active_pps: None,
            pictures: Arena::new(),
            stores: Arena::new(),
            dpb: Vec::new(),
            dpb_size: 0,
            current_picture: None,
            prev_slice_header: None,
            short_ref: Vec::new(),
            long_ref: Vec::new(),
            ref_pic_list0: Vec::new(),
            ref_pic_list1: Vec::new(),
            prev_frame: None,
            prev_ref_frame: None,
            poc: PocCounters::default(),
            frame_num: 0,
            prev_frame_num: 0,
            prev_ref_frame_num: 0,
            prev_pic_has_mmco5: false,
            prev_pic_reference: false,
            prev_pic_structure: PictureStructure::Frame,
            profile_idc: 0,
            chroma_format_idc: 0,
            mb_width: 0,
            mb_height: 0,
            has_context: false,
            progressive_sequence: true,
            top_field_first: false,
            force_low_latency: false,
            output_queue: VecDeque::new(),
            got_i_frame: false,
            got_slice: false,
            au_has_inter: false,
            drained: false,
        }
    }

    /// 低延迟模式开关 (降低输出延迟, 乱序码流可能丢帧)
    pub fn set_low_latency(&mut self, enabled: bool) {
        self.force_low_latency = enabled;
    }

    fn pic(&self, id: PictureId) -> LanResult<&Picture> {
        self.pictures
            .get(id)
            .ok_or_else(|| LanError::Internal("失效的图像句柄".into()))
    }

    fn pic_mut(&mut self, id: PictureId) -> LanResult<&mut Picture> {
        self.pictures
            .get_mut(id)
            .ok_or_else(|| LanError::Internal("失效的图像句柄".into()))
    }

    fn fs_of(&self, id: FrameStoreId) -> LanResult<&FrameStore> {
        self.stores
            .get(id)
            .ok_or_else(|| LanError::Internal("失效的帧槽句柄".into()))
    }

    fn fs_mut(&mut self, id: FrameStoreId) -> LanResult<&mut FrameStore> {
        self.stores
            .get_mut(id)
            .ok_or_else(|| LanError::Internal("失效的帧槽句柄".into()))
    }

    fn active_sps(&self) -> LanResult<&Sps> {
        self.active_sps
            .as_ref()
            .ok_or_else(|| LanError::Internal("没有激活的 SPS".into()))
    }

    /// 登记一个 SPS
    pub fn decode_sps(&mut self, sps: Sps) -> LanResult<()> {
        if sps.sps_id >= MAX_SPS_COUNT {
            return Err(LanError::InvalidData(format!(
                "SPS 序号 {} 超出范围",
                sps.sps_id
            )));
        }
        debug!(
            "SPS {}: profile {} level {} {}x{}",
            sps.sps_id,
            sps.profile_idc,
            sps.level_idc,
            sps.width(),
            sps.height()
        );
        self.sps_map.insert(sps.sps_id, sps);
        Ok(())
    }

    /// 登记一个 PPS
    pub fn decode_pps(&mut self, pps: Pps) -> LanResult<()> {
        if pps.pps_id >= MAX_PPS_COUNT {
            return Err(LanError::InvalidData(format!(
                "PPS 序号 {} 超出范围",
                pps.pps_id
            )));
        }
        debug!("PPS {} -> SPS {}", pps.pps_id, pps.sps_id);
        self.pps_map.insert(pps.pps_id, pps);
        Ok(())
    }

    /// 按码流顺序送入一个切片
    pub fn decode_slice(&mut self, slice: &Slice) -> LanResult<()> {
        let hdr = &slice.header;
        self.drained = false;

        let redundant = {
            let Some(pps) = self.pps_map.get(&hdr.pps_id) else {
                warn!("切片引用了未知的 PPS {}, 丢弃", hdr.pps_id);
                return Ok(());
            };
            let sps_id = pps.sps_id;
            let redundant = pps.redundant_pic_cnt_present_flag && hdr.redundant_pic_cnt > 0;
            if self.sps_map.get(&sps_id).is_none() {
                warn!("PPS {} 引用了未知的 SPS {}, 丢弃切片", hdr.pps_id, sps_id);
                return Ok(());
            }
            redundant
        };
        if redundant {
            debug!("跳过冗余切片");
            return Ok(());
        }

        let is_new = match &self.prev_slice_header {
            None => true,
            Some(prev) => self.is_new_picture(hdr, prev),
        };
        if is_new || self.current_picture.is_none() {
            self.decode_current_picture()?;
            self.start_picture(slice)?;
        }
        self.process_slice(slice)?;
        self.prev_slice_header = Some(hdr.clone());
        Ok(())
    }

    /// 取出一个按显示顺序排好的输出帧
    pub fn receive_frame(&mut self) -> LanResult<OutputFrame> {
        if let Some(frame) = self.output_queue.pop_front() {
            return Ok(frame);
        }
        if self.drained {
            return Err(LanError::Eof);
        }
        Err(LanError::NeedMoreData)
    }

    /// 码流结束: 结束进行中的图像并排空 DPB
    pub fn end_of_sequence(&mut self) -> LanResult<()> {
        self.decode_current_picture()?;
        self.dpb_flush(true)?;
        self.prev_slice_header = None;
        self.drained = true;
        Ok(())
    }

    /// 丢弃全部解码状态 (seek), 不产生输出
    pub fn flush(&mut self) -> LanResult<()> {
        if let Some(pic_id) = self.current_picture.take() {
            self.discard_picture(pic_id);
        }
        self.dpb_clear(true)?;
        for frame in std::mem::take(&mut self.output_queue) {
            self.backend.release_surface(frame.surface);
        }
        self.poc.reset();
        self.frame_num = 0;
        self.prev_frame_num = 0;
        self.prev_ref_frame_num = 0;
        self.prev_pic_has_mmco5 = false;
        self.prev_pic_reference = false;
        self.prev_pic_structure = PictureStructure::Frame;
        self.prev_slice_header = None;
        self.top_field_first = false;
        self.got_i_frame = false;
        self.got_slice = false;
        self.au_has_inter = false;
        self.drained = false;
        Ok(())
    }

    /// 7.4.1.2.4 - 当前切片是否开启新的图像
    fn is_new_picture(&self, hdr: &SliceHeader, prev: &SliceHeader) -> bool {
        if hdr.frame_num != prev.frame_num
            || hdr.pps_id != prev.pps_id
            || hdr.field_pic_flag != prev.field_pic_flag
        {
            return true;
        }
        if hdr.field_pic_flag && hdr.bottom_field_flag != prev.bottom_field_flag {
            return true;
        }
        if (hdr.nal_ref_idc != 0) != (prev.nal_ref_idc != 0) {
            return true;
        }

        let pps = self.pps_map.get(&hdr.pps_id);
        let sps = pps.and_then(|pps| self.sps_map.get(&pps.sps_id));
        match sps.map(|sps| sps.pic_order_cnt_type) {
            Some(0) => {
                if hdr.pic_order_cnt_lsb != prev.pic_order_cnt_lsb {
                    return true;
                }
                let pic_order_present = pps.is_some_and(|pps| pps.pic_order_present_flag);
                if pic_order_present
                    && !hdr.field_pic_flag
                    && hdr.delta_pic_order_cnt_bottom != prev.delta_pic_order_cnt_bottom
                {
                    return true;
                }
            }
            Some(1) => {
                if hdr.delta_pic_order_cnt != prev.delta_pic_order_cnt {
                    return true;
                }
            }
            _ => {}
        }

        if hdr.is_idr != prev.is_idr {
            return true;
        }
        if hdr.is_idr && hdr.idr_pic_id != prev.idr_pic_id {
            return true;
        }
        false
    }

    /// 参数集变化时重建解码上下文
    fn ensure_context(&mut self) -> LanResult<()> {
        let sps = self.active_sps()?.clone();

        let progressive = sps.frame_mbs_only_flag;
        if self.progressive_sequence != progressive {
            self.progressive_sequence = progressive;
            self.top_field_first = false;
        }

        let dpb_size = dpb::max_dec_frame_buffering(&sps) as usize;
        let reset = !self.has_context
            || self.dpb_size < dpb_size
            || self.profile_idc != sps.profile_idc
            || self.chroma_format_idc != sps.chroma_format_idc
            || self.mb_width != sps.pic_width_in_mbs
            || self.mb_height != sps.pic_height_in_map_units;
        if reset {
            debug!(
                "重建解码上下文: {}x{}, DPB 容量 {}",
                sps.width(),
                sps.height(),
                dpb_size
            );
            self.profile_idc = sps.profile_idc;
            self.chroma_format_idc = sps.chroma_format_idc;
            self.mb_width = sps.pic_width_in_mbs;
            self.mb_height = sps.pic_height_in_map_units;
            self.has_context = true;
            self.dpb_reset(dpb_size);
        }
        Ok(())
    }

    /// 开启一个新图像
    fn start_picture(&mut self, slice: &Slice) -> LanResult<()> {
        let hdr = &slice.header;
        let pps = self
            .pps_map
            .get(&hdr.pps_id)
            .cloned()
            .ok_or_else(|| LanError::InvalidData(format!("未知的 PPS {}", hdr.pps_id)))?;
        let sps = self
            .sps_map
            .get(&pps.sps_id)
            .cloned()
            .ok_or_else(|| LanError::InvalidData(format!("未知的 SPS {}", pps.sps_id)))?;
        self.active_pps = Some(pps);
        self.active_sps = Some(sps.clone());
        self.ensure_context()?;

        let pic_id = match self.find_first_field(hdr)? {
            // 互补场, 与首场共享表面
            Some(first) => self.new_second_field(first)?,
            None => {
                let surface = self.backend.alloc_surface(&SurfaceDescriptor {
                    width: sps.width(),
                    height: sps.height(),
                    chroma_format_idc: sps.chroma_format_idc,
                })?;
                self.pictures.insert(Picture::new(surface))
            }
        };
        self.current_picture = Some(pic_id);
        self.got_slice = false;
        self.au_has_inter = false;

        self.init_picture(pic_id, slice)?;

        let params = self.fill_picture_params(pic_id)?;
        self.backend.begin_picture(&params)?;
        Ok(())
    }

    /// 处理当前图像的一个切片: 构建参考列表并提交后端
    fn process_slice(&mut self, slice: &Slice) -> LanResult<()> {
        let hdr = &slice.header;
        let pic_id = self
            .current_picture
            .ok_or_else(|| LanError::Internal("没有进行中的图像".into()))?;
        if !hdr.is_i_slice() && !hdr.is_si_slice() {
            self.au_has_inter = true;
        }

        self.init_picture_refs(pic_id, hdr)?;

        let params = SliceParams {
            slice_type: hdr.slice_type,
            first_mb_in_slice: hdr.first_mb_in_slice,
            ref_pic_list0: self.export_ref_list(&self.ref_pic_list0),
            ref_pic_list1: self.export_ref_list(&self.ref_pic_list1),
        };
        self.backend.submit_slice(&params, slice.data.clone())?;
        self.got_slice = true;
        Ok(())
    }

    /// 8.2.1 之前的图像级初始化: 帧序号、结构、参考标记、POC
    fn init_picture(&mut self, pic_id: PictureId, slice: &Slice) -> LanResult<()> {
        let hdr = &slice.header;

        if self.prev_pic_reference {
            self.prev_ref_frame_num = self.frame_num;
        }
        self.prev_frame_num = self.frame_num;
        self.frame_num = hdr.frame_num as i32;
        {
            let pic = self.pic_mut(pic_id)?;
            pic.frame_num = hdr.frame_num;
            pic.frame_num_wrap = hdr.frame_num as i32;
            // Annex A 码流没有 output_flag 语法元素, 恒为输出
            pic.output_flag = true;
            if is_valid_pts(slice.pts) {
                pic.pts = slice.pts;
            }
        }

        if hdr.is_idr {
            debug!("IDR 图像");
            self.pic_mut(pic_id)?.flags |= PictureFlags::IDR;
            // C.4.5.3 - IDR 排空并清空 DPB
            self.dpb_flush(true)?;
        } else {
            self.fill_picture_gaps(pic_id, hdr)?;
        }

        // 图像结构
        let structure = if !hdr.field_pic_flag {
            PictureStructure::Frame
        } else if hdr.bottom_field_flag {
            PictureStructure::BottomField
        } else {
            PictureStructure::TopField
        };
        let is_first_field = {
            let pic = self.pic_mut(pic_id)?;
            pic.structure = structure;
            pic.base_structure = structure;
            if hdr.field_pic_flag {
                pic.flags |= PictureFlags::INTERLACED;
            }
            pic.is_first_field()
        };

        // 顶场在前跟踪 (输出侧的场序提示)
        if hdr.field_pic_flag {
            if is_first_field {
                self.top_field_first = structure == PictureStructure::TopField;
            }
        } else if !self.progressive_sequence && self.dpb.is_empty() {
            self.top_field_first = true;
        }

        // 参考标记初值 (8.2.5.1)
        if hdr.is_reference() {
            let kind = if hdr.is_idr && hdr.dec_ref_pic_marking.long_term_reference_flag {
                self.pic_mut(pic_id)?.long_term_frame_idx = 0;
                ReferenceKind::LongTerm
            } else {
                ReferenceKind::ShortTerm
            };
            self.pic_mut(pic_id)?.reference = kind;
        }

        self.init_picture_poc(pic_id, hdr)
    }

    /// 结束进行中的图像: 触发后端解码、参考标记、入库
    fn decode_current_picture(&mut self) -> LanResult<()> {
        let Some(pic_id) = self.current_picture.take() else {
            return Ok(());
        };
        let surface = self.pic(pic_id)?.surface;
        self.backend.end_picture(surface)?;

        if !self.got_slice {
            self.discard_picture(pic_id);
            return Ok(());
        }
        // 首个 I 帧之前的帧缺少参考, 不出图
        if !self.got_i_frame {
            if self.au_has_inter {
                debug!("尚未收到 I 帧, 丢弃非关键帧");
                self.discard_picture(pic_id);
                return Ok(());
            }
            self.got_i_frame = true;
        }

        let marking = self
            .prev_slice_header
            .as_ref()
            .map(|hdr| hdr.dec_ref_pic_marking.clone())
            .unwrap_or_default();
        self.exec_ref_pic_marking(pic_id, &marking)?;
        self.dpb_add(pic_id)?;

        if self.force_low_latency {
            self.dpb_output_ready_frames()?;
        }
        Ok(())
    }

    /// 丢弃一个未入库的图像, 收回其表面
    fn discard_picture(&mut self, pic_id: PictureId) {
        let Some(pic) = self.pictures.remove(pic_id) else {
            return;
        };
        if pic.owns_surface && !pic.flags.contains(PictureFlags::HANDED_OFF) {
            self.backend.release_surface(pic.surface);
        }
        if let Some(other_id) = pic.other_field {
            if let Some(other) = self.pictures.get_mut(other_id) {
                other.other_field = None;
            }
        }
    }

    /// 派生互补场图像并建立双向配对
    fn new_second_field(&mut self, first_id: PictureId) -> LanResult<PictureId> {
        let second = Picture::new_field_of(self.pic(first_id)?);
        let second_id = self.pictures.insert(second);
        self.pic_mut(first_id)?.other_field = Some(second_id);
        self.pic_mut(second_id)?.other_field = Some(first_id);
        Ok(second_id)
    }

    /// 在场配对入口中寻找当前切片的首场.
    ///
    /// 返回 `Some` 表示当前图像是该首场的互补场; 返回 `None` 表示
    /// 当前图像独立开槽 (必要时先为落单的首场补一个占位场).
    fn find_first_field(&mut self, hdr: &SliceHeader) -> LanResult<Option<PictureId>> {
        let Some(fs_id) = self.prev_frame else {
            return Ok(None);
        };
        let (has_frame, first) = {
            let fs = self.fs_of(fs_id)?;
            (fs.has_frame(), fs.first())
        };
        let Some(first) = first else {
            return Ok(None);
        };

        if !hdr.field_pic_flag {
            // 帧图像: 落单的首场永远等不到互补场了
            if !has_frame {
                self.fill_picture_other_field_gap(first)?;
            }
            return Ok(None);
        }
        if has_frame {
            return Ok(None);
        }

        let (first_frame_num, first_structure) = {
            let pic = self.pic(first)?;
            (pic.frame_num, pic.base_structure)
        };
        if first_frame_num != hdr.frame_num {
            self.fill_picture_other_field_gap(first)?;
            return Ok(None);
        }
        let structure = if hdr.bottom_field_flag {
            PictureStructure::BottomField
        } else {
            PictureStructure::TopField
        };
        if structure == first_structure {
            // 同极性场无法配对
            self.fill_picture_other_field_gap(first)?;
            return Ok(None);
        }
        Ok(Some(first))
    }

    /// 8.2.5.2 - frame_num 间隙: 克隆最近的参考帧补足丢失的帧
    fn fill_picture_gaps(&mut self, pic_id: PictureId, hdr: &SliceHeader) -> LanResult<()> {
        let sps = self.active_sps()?.clone();
        let max_frame_num = sps.max_frame_num();

        if self.prev_ref_frame_num == self.frame_num
            || (self.prev_ref_frame_num + 1) % max_frame_num == self.frame_num
        {
            return Ok(());
        }
        if self.dpb.is_empty() {
            return Ok(());
        }
        if !sps.gaps_in_frame_num_value_allowed_flag {
            warn!("frame_num 间隙但 SPS 未允许, 仍按丢帧修复");
        }
        let Some(prev_fs_id) = self.prev_ref_frame else {
            warn!("frame_num 间隙但没有可克隆的参考帧");
            return Ok(());
        };
        let Some(mut prev_picture) = self.fs_of(prev_fs_id)?.first() else {
            return Ok(());
        };

        // 占位图像的虚拟切片头: 帧编码, POC 增量清零, 滑动窗口标记
        let mut ghost_hdr = hdr.clone();
        ghost_hdr.field_pic_flag = false;
        ghost_hdr.bottom_field_flag = false;
        if sps.pic_order_cnt_type == 1 {
            ghost_hdr.delta_pic_order_cnt = [0, 0];
        }
        ghost_hdr.dec_ref_pic_marking = DecRefPicMarking::default();

        // 间隙超过参考帧窗口时只补窗口内的部分
        let mut prev_frame_num = self.prev_ref_frame_num;
        if prev_frame_num > hdr.frame_num as i32 {
            prev_frame_num -= max_frame_num;
        }
        if (hdr.frame_num as i32 - prev_frame_num) - 1 > sps.num_ref_frames as i32 {
            prev_frame_num = hdr.frame_num as i32 - sps.num_ref_frames as i32 - 1;
            if prev_frame_num < 0 {
                prev_frame_num += max_frame_num;
            }
        }
        self.frame_num = prev_frame_num;

        let mut result = Ok(());
        loop {
            self.prev_ref_frame_num = self.frame_num;
            self.frame_num = (self.prev_ref_frame_num + 1) % max_frame_num;
            if self.frame_num == hdr.frame_num as i32 {
                break;
            }
            debug!("补齐丢失的帧: frame_num {}", self.frame_num);

            let ghost = {
                let prev = self.pic(prev_picture)?;
                let mut ghost = Picture::new_ghost_of(prev);
                ghost.frame_num = self.frame_num as u32;
                ghost.frame_num_wrap = self.frame_num;
                ghost.reference = ReferenceKind::ShortTerm;
                if sps.pic_order_cnt_type == 0 {
                    // 无法重算 lsb, 按每帧 +2 顺延
                    ghost.poc = prev.poc + 2;
                    for i in [TOP_FIELD, BOTTOM_FIELD] {
                        ghost.field_poc[i] = if prev.field_poc[i] != i32::MAX {
                            prev.field_poc[i] + 2
                        } else {
                            i32::MAX
                        };
                    }
                }
                ghost
            };
            let ghost_id = self.pictures.insert(ghost);
            if sps.pic_order_cnt_type != 0 {
                if let Err(e) = self.init_picture_poc(ghost_id, &ghost_hdr) {
                    result = Err(e);
                    break;
                }
            }
            prev_picture = ghost_id;

            let step = self
                .init_picture_ref_lists(ghost_id)
                .and_then(|_| self.init_picture_refs_pic_num(ghost_id))
                .and_then(|_| self.exec_ref_pic_marking_sliding_window(ghost_id))
                .and_then(|_| self.dpb_add(ghost_id));
            if let Err(e) = step {
                result = Err(e);
                break;
            }
        }

        self.frame_num = hdr.frame_num as i32;
        self.prev_ref_frame_num = (self.frame_num + max_frame_num - 1) % max_frame_num;
        result
    }

    /// 落单首场的互补场永远丢失: 从 DPB 借一个同极性场凑成整帧
    fn fill_picture_other_field_gap(&mut self, first_id: PictureId) -> LanResult<()> {
        let (base_structure, first_poc, first_frame_num) = {
            let pic = self.pic(first_id)?;
            (pic.base_structure, pic.poc, pic.frame_num)
        };
        if base_structure == PictureStructure::Frame {
            return Err(LanError::Internal("帧图像不存在互补场间隙".into()));
        }
        let structure = base_structure.opposite();
        self.pic_mut(first_id)?.flags |= PictureFlags::ONEFIELD;

        let Some(donor) = self.dpb_find_nearest_prev_poc(first_poc, structure) else {
            warn!("找不到可替补的互补场, 首场按单场帧显示");
            return Ok(());
        };
        debug!("互补场丢失, 以 POC {} 的场替补", self.pic(donor)?.poc);

        let donor_surface = self.pic(donor)?.surface;
        let second_id = self.new_second_field(first_id)?;
        {
            let second = self.pic_mut(second_id)?;
            second.surface = donor_surface;
            second.flags |= PictureFlags::GHOST;
            second.frame_num = first_frame_num;
            second.poc = first_poc + 1;
            let field = if structure == PictureStructure::TopField {
                TOP_FIELD
            } else {
                BOTTOM_FIELD
            };
            second.field_poc[field] = first_poc + 1;
        }

        self.init_picture_ref_lists(second_id)?;
        self.init_picture_refs_pic_num(second_id)?;
        self.exec_ref_pic_marking_sliding_window(second_id)?;
        self.dpb_add(second_id)
    }

    /// 生成后端的图像级参数
    fn fill_picture_params(&self, pic_id: PictureId) -> LanResult<PictureParams> {
        let pic = self.pic(pic_id)?;
        let mut reference_frames = Vec::new();
        for &fs_id in &self.dpb {
            let Some(fs) = self.stores.get(fs_id) else {
                continue;
            };
            if let Some(entry) = self.store_ref_entry(fs) {
                reference_frames.push(entry);
            }
        }
        Ok(PictureParams {
            surface: pic.surface,
            frame_num: pic.frame_num,
            structure: pic.base_structure,
            top_field_order_cnt: field_poc_or_zero(pic.field_poc[TOP_FIELD]),
            bottom_field_order_cnt: field_poc_or_zero(pic.field_poc[BOTTOM_FIELD]),
            is_reference: pic.is_reference(),
            is_idr: pic.is_idr(),
            reference_frames,
        })
    }

    /// 帧槽 -> ReferenceFrames 表项 (无参考的槽位不上报)
    fn store_ref_entry(&self, fs: &FrameStore) -> Option<RefPicEntry> {
        let id = fs
            .buffers()
            .find(|&id| self.pictures.get(id).is_some_and(|pic| pic.is_reference()))?;
        let pic = self.pictures.get(id)?;
        Some(RefPicEntry {
            surface: pic.surface,
            frame_idx: if pic.is_long_term() {
                pic.long_term_frame_idx
            } else {
                pic.frame_num
            },
            top_field_order_cnt: field_poc_or_zero(pic.field_poc[TOP_FIELD]),
            bottom_field_order_cnt: field_poc_or_zero(pic.field_poc[BOTTOM_FIELD]),
            structure: if fs.has_frame() {
                PictureStructure::Frame
            } else {
                pic.base_structure
            },
            is_long_term: pic.is_long_term(),
        })
    }

    /// RefPicList -> 后端列表, 在首个空位截断
    fn export_ref_list(&self, list: &[Option<PictureId>]) -> Vec<Option<RefPicEntry>> {
        list.iter()
            .map(|slot| slot.and_then(|id| self.ref_pic_entry(id)))
            .take_while(Option::is_some)
            .collect()
    }

    fn ref_pic_entry(&self, id: PictureId) -> Option<RefPicEntry> {
        let pic = self.pictures.get(id)?;
        let (top, bottom) = match pic.structure {
            PictureStructure::Frame => (
                field_poc_or_zero(pic.field_poc[TOP_FIELD]),
                field_poc_or_zero(pic.field_poc[BOTTOM_FIELD]),
            ),
            PictureStructure::TopField => (field_poc_or_zero(pic.field_poc[TOP_FIELD]), 0),
            PictureStructure::BottomField => (0, field_poc_or_zero(pic.field_poc[BOTTOM_FIELD])),
        };
        Some(RefPicEntry {
            surface: pic.surface,
            frame_idx: if pic.is_long_term() {
                pic.long_term_frame_idx
            } else {
                pic.frame_num
            },
            top_field_order_cnt: top,
            bottom_field_order_cnt: bottom,
            structure: pic.structure,
            is_long_term: pic.is_long_term(),
        })
    }
}

fn field_poc_or_zero(poc: i32) -> i32 {
    if poc == i32::MAX { 0 } else { poc }
}
