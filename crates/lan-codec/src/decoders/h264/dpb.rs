//! 解码图像缓冲区 (DPB) 管理 (Annex C).
//!
//! 槽位以帧为单位 ([`super::picture::FrameStore`]), 输出顺序由 POC 决定.
//! "bump" 指把 POC 最小的待输出帧推入输出队列, 腾出槽位.

use lan_core::{LanError, LanResult};
use log::{debug, warn};

use crate::backend::{OutputFrame, PictureStructure};

use super::H264Decoder;
use super::headers::Sps;
use super::picture::{FrameStore, PictureFlags, PictureId};

/// Table A-1 级别限制: (level_idc, MaxDpbMbs)
const LEVEL_LIMITS: &[(u8, u32)] = &[
    (10, 396),
    (11, 900),
    (12, 2376),
    (13, 2376),
    (20, 2376),
    (21, 4752),
    (22, 8100),
    (30, 8100),
    (31, 18000),
    (32, 20480),
    (40, 32768),
    (41, 32768),
    (42, 34816),
    (50, 110400),
    (51, 184320),
    (52, 184320),
    (60, 696320),
    (61, 1392640),
    (62, 2772480),
];

/// Level 1b 的 MaxDpbMbs (level_idc == 11 且 constraint_set3_flag)
const LEVEL_1B_MAX_DPB_MBS: u32 = 396;

/// 多视图 profile (Multiview High / Stereo High)
pub(super) fn is_mvc_profile(profile_idc: u8) -> bool {
    profile_idc == 118 || profile_idc == 128
}

/// A.3.1 - 按级别与图像尺寸推导 max_dec_frame_buffering
pub(super) fn max_dec_frame_buffering(sps: &Sps) -> u32 {
    let max_dpb_mbs = if sps.level_idc == 11 && sps.constraint_set3_flag() {
        Some(LEVEL_1B_MAX_DPB_MBS)
    } else {
        LEVEL_LIMITS
            .iter()
            .find(|&&(idc, _)| idc == sps.level_idc)
            .map(|&(_, mbs)| mbs)
    };

    let mut max_dec_frame_buffering = match max_dpb_mbs {
        Some(mbs) => mbs / sps.pic_size_in_mbs().max(1),
        None => {
            warn!("未知的 level_idc {}, DPB 按 16 帧处理", sps.level_idc);
            16
        }
    };

    if is_mvc_profile(sps.profile_idc) {
        max_dec_frame_buffering <<= 1;
    }

    if let Some(vui) = &sps.vui {
        if vui.bitstream_restriction_flag {
            max_dec_frame_buffering = vui.max_dec_frame_buffering;
        } else if let 44 | 86 | 100 | 110 | 122 | 244 = sps.profile_idc {
            // 纯帧内 profile 不需要缓冲
            if sps.constraint_set3_flag() {
                max_dec_frame_buffering = 0;
            }
        }
    }

    let num_views = sps.num_views.max(1);
    let max_dpb_frames = 16 * if num_views > 1 {
        u32::BITS - (num_views - 1).leading_zeros()
    } else {
        1
    };
    if max_dec_frame_buffering > max_dpb_frames {
        max_dec_frame_buffering = max_dpb_frames;
    } else if max_dec_frame_buffering < sps.num_ref_frames {
        max_dec_frame_buffering = sps.num_ref_frames;
    }
    max_dec_frame_buffering.max(1)
}

impl H264Decoder {
    /// 调整 DPB 容量 (上下文重建时)
    pub(super) fn dpb_reset(&mut self, dpb_size: usize) {
        self.dpb_size = dpb_size;
        debug!("DPB 容量 {}", dpb_size);
    }

    /// 从 DPB 移除一个槽位并在无人引用时释放
    pub(super) fn dpb_remove_index(&mut self, index: usize) -> LanResult<()> {
        let fs_id = self.dpb.swap_remove(index);
        self.release_store_if_unused(fs_id)
    }

    /// 槽位既不在 DPB 中也不被场配对句柄持有时, 释放其图像与表面
    pub(super) fn release_store_if_unused(
        &mut self,
        fs_id: super::picture::FrameStoreId,
    ) -> LanResult<()> {
        if self.dpb.contains(&fs_id)
            || self.prev_frame == Some(fs_id)
            || self.prev_ref_frame == Some(fs_id)
        {
            return Ok(());
        }
        let Some(fs) = self.stores.remove(fs_id) else {
            return Ok(());
        };
        for id in fs.buffers() {
            if let Some(pic) = self.pictures.remove(id) {
                if pic.owns_surface && !pic.flags.contains(PictureFlags::HANDED_OFF) {
                    self.backend.release_surface(pic.surface);
                }
            }
        }
        let pictures = &self.pictures;
        self.short_ref.retain(|&id| pictures.get(id).is_some());
        self.long_ref.retain(|&id| pictures.get(id).is_some());
        Ok(())
    }

    /// 请求输出一个槽位; 不完整的槽位记账后静默成功, 等补齐后再发
    pub(super) fn dpb_output(&mut self, fs_id: super::picture::FrameStoreId) -> LanResult<()> {
        self.fs_mut(fs_id)?.output_called += 1;

        let fs = self.fs_of(fs_id)?;
        if !fs.is_complete(&self.pictures) {
            return Ok(());
        }
        let buffers: Vec<PictureId> = fs.buffers().collect();

        let mut out_pic = None;
        for &id in &buffers {
            let pic = self.pic_mut(id)?;
            pic.output_needed = false;
            if !pic.is_ghost() {
                out_pic = Some(id);
            }
        }
        {
            let fs = self.fs_mut(fs_id)?;
            fs.output_needed = 0;
            fs.output_called = 0;
        }

        let Some(id) = out_pic else {
            // 纯占位帧, 无内容可发
            return Ok(());
        };
        for &buf in &buffers {
            self.pic_mut(buf)?.flags |= PictureFlags::HANDED_OFF;
        }
        let pic = self.pic(id)?;
        debug!("输出帧: POC {}", pic.poc);
        self.output_queue.push_back(OutputFrame {
            surface: pic.surface,
            poc: pic.poc,
            pts: pic.pts,
            corrupted: pic.flags.contains(PictureFlags::CORRUPTED),
        });
        Ok(())
    }

    /// 槽位不再需要输出且没有参考时, 从 DPB 驱逐
    fn dpb_evict(&mut self, index: usize) -> LanResult<()> {
        let fs_id = self.dpb[index];
        let fs = self.fs_of(fs_id)?;
        if fs.output_needed == 0 && !fs.has_reference(&self.pictures) {
            self.dpb_remove_index(index)?;
        }
        Ok(())
    }

    /// 找到 POC 最小的待输出槽位
    pub(super) fn dpb_find_lowest_poc(&self) -> Option<(usize, i32)> {
        let mut found: Option<(usize, i32)> = None;
        for (i, &fs_id) in self.dpb.iter().enumerate() {
            let Some(fs) = self.stores.get(fs_id) else {
                continue;
            };
            if fs.output_needed == 0 {
                continue;
            }
            for id in fs.buffers() {
                let Some(pic) = self.pictures.get(id) else {
                    continue;
                };
                if !pic.output_needed {
                    continue;
                }
                if found.is_none_or(|(_, poc)| pic.poc < poc) {
                    found = Some((i, pic.poc));
                }
            }
        }
        found
    }

    /// 低延迟输出检查: POC 最小的待输出槽位此刻能否安全输出.
    ///
    /// 只有当它是 DPB 中最早的帧, 或与最近输出的帧之间没有空隙 (POC 差
    /// 不超过 2) 时才能输出; 若已有更大 POC 的帧被输出, 该帧只能丢弃.
    fn dpb_find_lowest_poc_for_output(&mut self) -> LanResult<Option<usize>> {
        let mut found: Option<(usize, i32)> = None;
        let mut is_first = true;
        let mut last_output_poc = -1i32;

        for (i, &fs_id) in self.dpb.iter().enumerate() {
            let Some(fs) = self.stores.get(fs_id) else {
                continue;
            };
            if fs.output_needed == 0 {
                // 统计仍留在 DPB 中的已输出帧的最大 POC
                for id in fs.buffers() {
                    if let Some(pic) = self.pictures.get(id) {
                        if is_first || pic.poc > last_output_poc {
                            is_first = false;
                            last_output_poc = pic.poc;
                        }
                    }
                }
                continue;
            }
            for id in fs.buffers() {
                let Some(pic) = self.pictures.get(id) else {
                    continue;
                };
                if !pic.output_needed {
                    continue;
                }
                if found.is_none_or(|(_, poc)| pic.poc < poc) {
                    found = Some((i, pic.poc));
                }
            }
        }

        let Some((index, poc)) = found else {
            return Ok(None);
        };
        let fs_id = self.dpb[index];
        if !self.fs_of(fs_id)?.is_complete(&self.pictures) {
            return Ok(None);
        }
        if is_first {
            return Ok(Some(index));
        }
        if poc > last_output_poc {
            if poc - last_output_poc <= 2 {
                return Ok(Some(index));
            }
            return Ok(None);
        }
        // 更大 POC 的帧已经发出, 此帧只能丢弃
        warn!("丢弃乱序帧: POC {} 落后于已输出的 {}", poc, last_output_poc);
        self.fs_mut(fs_id)?.output_needed = 0;
        Ok(None)
    }

    /// 输出 POC 最小的待输出帧, 腾出槽位
    pub(super) fn dpb_bump(&mut self) -> LanResult<bool> {
        let Some((index, _)) = self.dpb_find_lowest_poc() else {
            return Ok(false);
        };
        let fs_id = self.dpb[index];
        self.dpb_output(fs_id)?;
        self.dpb_evict(index)?;
        Ok(true)
    }

    /// 低延迟模式: 把 POC 已不可能再变小的帧全部发出
    pub(super) fn dpb_output_ready_frames(&mut self) -> LanResult<()> {
        while let Some(index) = self.dpb_find_lowest_poc_for_output()? {
            let fs_id = self.dpb[index];
            self.dpb_output(fs_id)?;
        }
        Ok(())
    }

    /// 清空 DPB 与场配对句柄, 不产生输出
    pub(super) fn dpb_clear(&mut self, clear_prev_ref: bool) -> LanResult<()> {
        let ids = std::mem::take(&mut self.dpb);
        for fs_id in ids {
            self.release_store_if_unused(fs_id)?;
        }
        if let Some(fs_id) = self.prev_frame.take() {
            self.release_store_if_unused(fs_id)?;
        }
        if clear_prev_ref {
            if let Some(fs_id) = self.prev_ref_frame.take() {
                self.release_store_if_unused(fs_id)?;
            }
        }
        self.short_ref.clear();
        self.long_ref.clear();
        Ok(())
    }

    /// 输出所有剩余的帧并清空 DPB
    pub(super) fn dpb_flush(&mut self, clear_prev_ref: bool) -> LanResult<()> {
        // 缺场的损坏帧按单场帧放行
        let mut broken = Vec::new();
        for &fs_id in &self.dpb {
            let Some(fs) = self.stores.get(fs_id) else {
                continue;
            };
            if fs.output_needed > 0 && !fs.is_complete(&self.pictures) {
                if let Some(id) = fs.first() {
                    broken.push(id);
                }
            }
        }
        for id in broken {
            self.pic_mut(id)?.flags |= PictureFlags::ONEFIELD;
        }

        while self.dpb_bump()? {}
        self.dpb_clear(clear_prev_ref)
    }

    /// 找到 POC 小于给定值且结构相同的最近图像 (场间隙修复用)
    pub(super) fn dpb_find_nearest_prev_poc(
        &self,
        poc: i32,
        structure: PictureStructure,
    ) -> Option<PictureId> {
        let mut found: Option<(PictureId, i32)> = None;
        for &fs_id in &self.dpb {
            let Some(fs) = self.stores.get(fs_id) else {
                continue;
            };
            for id in fs.buffers() {
                let Some(pic) = self.pictures.get(id) else {
                    continue;
                };
                if pic.base_structure != structure || pic.poc >= poc {
                    continue;
                }
                if found.is_none_or(|(_, best)| best < pic.poc) {
                    found = Some((id, pic.poc));
                }
            }
        }
        found.map(|(id, _)| id)
    }

    /// 互补场并入首场所在槽位, 合并场 POC
    pub(super) fn attach_second_field(
        &mut self,
        fs_id: super::picture::FrameStoreId,
        pic_id: PictureId,
    ) -> LanResult<()> {
        let fs = self.fs_of(fs_id)?;
        let first_id = fs
            .first()
            .ok_or_else(|| LanError::Internal("空的帧槽".into()))?;
        if fs.num_buffers() != 1 {
            return Err(LanError::Codec("帧槽已满, 无法并入第二场".into()));
        }

        let pic = self.pic(pic_id)?;
        if pic.is_frame() || !pic.is_second_field() {
            return Err(LanError::Codec("并入帧槽的图像不是第二场".into()));
        }
        let field = if pic.structure == PictureStructure::TopField {
            0
        } else {
            1
        };
        let field_poc = pic.field_poc[field];
        let output_flag = pic.output_flag;

        {
            let fs = self.fs_mut(fs_id)?;
            fs.push(pic_id);
            fs.structure = PictureStructure::Frame;
            if output_flag {
                fs.output_needed += 1;
            }
        }
        if output_flag {
            self.pic_mut(pic_id)?.output_needed = true;
        }

        let first = self.pic_mut(first_id)?;
        if first.field_poc[field] != i32::MAX {
            return Err(LanError::Codec("首场的互补场 POC 已被占用".into()));
        }
        first.field_poc[field] = field_poc;
        first.other_field = Some(pic_id);
        first.update_poc();
        let other_poc = first.field_poc[field ^ 1];

        let pic = self.pic_mut(pic_id)?;
        if pic.field_poc[field ^ 1] != i32::MAX {
            return Err(LanError::Codec("第二场的两侧 POC 均已赋值".into()));
        }
        pic.field_poc[field ^ 1] = other_poc;
        pic.other_field = Some(first_id);
        pic.update_poc();
        Ok(())
    }

    /// 隔行序列中把帧槽拆成两个场视图
    fn split_frame_store_fields(&mut self, fs_id: super::picture::FrameStoreId) -> LanResult<()> {
        let first_id = self
            .fs_of(fs_id)?
            .first()
            .ok_or_else(|| LanError::Internal("空的帧槽".into()))?;
        let tff = self.top_field_first;

        let second = {
            let first = self.pic_mut(first_id)?;
            first.base_structure = if tff {
                PictureStructure::TopField
            } else {
                PictureStructure::BottomField
            };
            first.flags |= PictureFlags::INTERLACED;

            let mut second = super::picture::Picture::new_field_of(first);
            second.frame_num = first.frame_num;
            second.field_poc = first.field_poc;
            second.poc = first.poc;
            second.output_flag = first.output_flag;
            second.reference = first.reference;
            if second.output_flag {
                second.output_needed = true;
            }
            second
        };
        let output_flag = second.output_flag;
        let second_id = self.pictures.insert(second);

        self.pic_mut(first_id)?.other_field = Some(second_id);
        self.pic_mut(second_id)?.other_field = Some(first_id);

        let fs = self.fs_mut(fs_id)?;
        fs.push(second_id);
        if output_flag {
            fs.output_needed += 1;
        }
        Ok(())
    }

    /// C.4.4 / C.4.5 - 把解码完的图像存入 DPB
    pub(super) fn dpb_add(&mut self, pic_id: PictureId) -> LanResult<()> {
        let (is_idr, is_second, is_ref, output_flag, poc, other_field) = {
            let pic = self.pic(pic_id)?;
            (
                pic.is_idr(),
                pic.is_second_field(),
                pic.is_reference(),
                pic.output_flag,
                pic.poc,
                pic.other_field,
            )
        };

        // C.4.4 - 移除既不需输出也无参考的槽位 (IDR 时 DPB 已清空)
        if !is_idr {
            let mut i = 0;
            while i < self.dpb.len() {
                let fs_id = self.dpb[i];
                let prune = self
                    .stores
                    .get(fs_id)
                    .is_some_and(|fs| fs.output_needed == 0 && !fs.has_reference(&self.pictures));
                if prune {
                    self.dpb_remove_index(i)?;
                } else {
                    i += 1;
                }
            }
        }

        // 第二场: 并入首场所在的槽位
        if is_second {
            let fs_id = self
                .prev_frame
                .ok_or_else(|| LanError::Codec("第二场没有可配对的首场".into()))?;
            if self.fs_of(fs_id)?.first() != other_field {
                return Err(LanError::Codec("第二场与配对槽位中的首场不匹配".into()));
            }
            self.attach_second_field(fs_id, pic_id)?;
            if self.fs_of(fs_id)?.output_called > 0 {
                return self.dpb_output(fs_id);
            }
            return Ok(());
        }

        // 上一帧若被请求过输出 (等场时被延迟), 先补发
        if let Some(fs_id) = self.prev_frame {
            if self.fs_of(fs_id)?.output_called > 0 {
                self.dpb_output(fs_id)?;
            }
        }

        // 新建槽位
        let fs_id = {
            let pic = self.pic_mut(pic_id)?;
            let fs = FrameStore::new(pic_id, pic);
            self.stores.insert(fs)
        };
        if let Some(old) = self.prev_frame.replace(fs_id) {
            self.release_store_if_unused(old)?;
        }
        if !self.progressive_sequence && self.fs_of(fs_id)?.has_frame() {
            self.split_frame_store_fields(fs_id)?;
        }

        if is_ref {
            // C.4.5.1 - 参考图像入库, 满则先腾位
            while self.dpb.len() >= self.dpb_size {
                if !self.dpb_bump()? {
                    return Err(LanError::Codec("DPB 已满且没有可输出的帧".into()));
                }
            }
            if let Some(old) = self.prev_ref_frame.replace(fs_id) {
                self.release_store_if_unused(old)?;
            }
        } else {
            // C.4.5.2 - 非参考图像
            if !output_flag {
                return Ok(());
            }
            while self.dpb.len() >= self.dpb_size {
                match self.dpb_find_lowest_poc() {
                    // 等待中的帧都比当前帧晚, 当前帧直接显示, 不占槽位
                    Some((_, lowest)) if lowest <= poc => {
                        if !self.dpb_bump()? {
                            return Err(LanError::Codec("DPB 已满且没有可输出的帧".into()));
                        }
                    }
                    _ => return self.dpb_output(fs_id),
                }
            }
        }
        self.dpb.push(fs_id);
        Ok(())
    }
}
