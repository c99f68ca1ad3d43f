//! 图像序号 (POC) 计算 (8.2.1).
//!
//! 三种 pic_order_cnt_type 的持久计数器集中在 [`PocCounters`] 中,
//! 不散落在调用点, MMCO 5 与 IDR 的重置路径一目了然.

use lan_core::LanResult;
use log::debug;

use crate::backend::PictureStructure;

use super::H264Decoder;
use super::headers::{SliceHeader, Sps};
use super::picture::PictureId;

pub(super) const TOP_FIELD: usize = 0;
pub(super) const BOTTOM_FIELD: usize = 1;

/// POC 解码过程的持久计数器
#[derive(Debug, Clone, Default)]
pub(super) struct PocCounters {
    /// PicOrderCntMsb
    pub poc_msb: i32,
    /// 最近一次 slice_header() 中的 pic_order_cnt_lsb
    pub poc_lsb: i32,
    /// prevPicOrderCntMsb
    pub prev_poc_msb: i32,
    /// prevPicOrderCntLsb
    pub prev_poc_lsb: i32,
    /// FrameNumOffset (POC 类型 1/2)
    pub frame_num_offset: i32,
    /// 最近一个图像的场 POC
    pub field_poc: [i32; 2],
}

impl PocCounters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl H264Decoder {
    /// 8.2.1 - 图像序号解码总入口
    pub(super) fn init_picture_poc(
        &mut self,
        pic_id: PictureId,
        hdr: &SliceHeader,
    ) -> LanResult<()> {
        let sps = self.active_sps()?.clone();
        let pic = self.pic(pic_id)?;
        let structure = pic.structure;
        let is_idr = pic.is_idr();
        let is_ref = pic.is_reference();

        match sps.pic_order_cnt_type {
            0 => self.init_picture_poc_0(&sps, hdr, structure, is_idr),
            1 => self.init_picture_poc_1(&sps, hdr, structure, is_idr, is_ref),
            _ => self.init_picture_poc_2(&sps, structure, is_idr, is_ref),
        }

        let field_poc = self.poc.field_poc;
        let pic = self.pic_mut(pic_id)?;
        if structure != PictureStructure::BottomField {
            pic.field_poc[TOP_FIELD] = field_poc[TOP_FIELD];
        }
        if structure != PictureStructure::TopField {
            pic.field_poc[BOTTOM_FIELD] = field_poc[BOTTOM_FIELD];
        }
        pic.update_poc();
        debug!("图像 POC: {} (场 POC {:?})", pic.poc, pic.field_poc);
        Ok(())
    }

    /// 8.2.1.1 - POC 类型 0: lsb/msb 回绕运算
    fn init_picture_poc_0(
        &mut self,
        sps: &Sps,
        hdr: &SliceHeader,
        structure: PictureStructure,
        is_idr: bool,
    ) {
        let max_poc_lsb = sps.max_pic_order_cnt_lsb();
        let poc = &mut self.poc;

        if is_idr {
            poc.prev_poc_msb = 0;
            poc.prev_poc_lsb = 0;
        } else if self.prev_pic_has_mmco5 {
            poc.prev_poc_msb = 0;
            poc.prev_poc_lsb = if self.prev_pic_structure == PictureStructure::BottomField {
                0
            } else {
                poc.field_poc[TOP_FIELD]
            };
        } else {
            poc.prev_poc_msb = poc.poc_msb;
            poc.prev_poc_lsb = poc.poc_lsb;
        }

        // (8-3)
        poc.poc_lsb = hdr.pic_order_cnt_lsb as i32;
        if poc.poc_lsb < poc.prev_poc_lsb && poc.prev_poc_lsb - poc.poc_lsb >= max_poc_lsb / 2 {
            poc.poc_msb = poc.prev_poc_msb + max_poc_lsb;
        } else if poc.poc_lsb > poc.prev_poc_lsb && poc.poc_lsb - poc.prev_poc_lsb > max_poc_lsb / 2
        {
            poc.poc_msb = poc.prev_poc_msb - max_poc_lsb;
        } else {
            poc.poc_msb = poc.prev_poc_msb;
        }

        let temp_poc = poc.poc_msb + poc.poc_lsb;
        match structure {
            // (8-4, 8-5)
            PictureStructure::Frame => {
                poc.field_poc[TOP_FIELD] = temp_poc;
                poc.field_poc[BOTTOM_FIELD] = temp_poc + hdr.delta_pic_order_cnt_bottom;
            }
            PictureStructure::TopField => poc.field_poc[TOP_FIELD] = temp_poc,
            PictureStructure::BottomField => poc.field_poc[BOTTOM_FIELD] = temp_poc,
        }
    }

    /// 8.2.1.2 - POC 类型 1: 基于 frame_num 与偏移表
    fn init_picture_poc_1(
        &mut self,
        sps: &Sps,
        hdr: &SliceHeader,
        structure: PictureStructure,
        is_idr: bool,
        is_ref: bool,
    ) {
        let max_frame_num = sps.max_frame_num();
        let num_ref_frames_in_cycle = sps.offset_for_ref_frame.len() as i32;

        let prev_frame_num_offset = if self.prev_pic_has_mmco5 {
            0
        } else {
            self.poc.frame_num_offset
        };

        // (8-6)
        self.poc.frame_num_offset = if is_idr {
            0
        } else if self.prev_frame_num > self.frame_num {
            prev_frame_num_offset + max_frame_num
        } else {
            prev_frame_num_offset
        };

        // (8-7)
        let mut abs_frame_num = if num_ref_frames_in_cycle != 0 {
            self.poc.frame_num_offset + self.frame_num
        } else {
            0
        };
        if !is_ref && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }

        let mut expected_poc = 0;
        if abs_frame_num > 0 {
            let expected_delta_per_cycle: i32 = sps.offset_for_ref_frame.iter().sum();

            // (8-8)
            let poc_cycle_cnt = (abs_frame_num - 1) / num_ref_frames_in_cycle;
            let frame_num_in_cycle = (abs_frame_num - 1) % num_ref_frames_in_cycle;

            // (8-9)
            expected_poc = poc_cycle_cnt * expected_delta_per_cycle;
            for i in 0..=frame_num_in_cycle {
                expected_poc += sps.offset_for_ref_frame[i as usize];
            }
        }
        if !is_ref {
            expected_poc += sps.offset_for_non_ref_pic;
        }

        // (8-10)
        let poc = &mut self.poc;
        match structure {
            PictureStructure::Frame => {
                poc.field_poc[TOP_FIELD] = expected_poc + hdr.delta_pic_order_cnt[0];
                poc.field_poc[BOTTOM_FIELD] = poc.field_poc[TOP_FIELD]
                    + sps.offset_for_top_to_bottom_field
                    + hdr.delta_pic_order_cnt[1];
            }
            PictureStructure::TopField => {
                poc.field_poc[TOP_FIELD] = expected_poc + hdr.delta_pic_order_cnt[0];
            }
            PictureStructure::BottomField => {
                poc.field_poc[BOTTOM_FIELD] = expected_poc
                    + sps.offset_for_top_to_bottom_field
                    + hdr.delta_pic_order_cnt[0];
            }
        }
    }

    /// 8.2.1.3 - POC 类型 2: 按解码顺序递增
    fn init_picture_poc_2(
        &mut self,
        sps: &Sps,
        structure: PictureStructure,
        is_idr: bool,
        is_ref: bool,
    ) {
        let max_frame_num = sps.max_frame_num();

        let prev_frame_num_offset = if self.prev_pic_has_mmco5 {
            0
        } else {
            self.poc.frame_num_offset
        };

        // (8-11)
        self.poc.frame_num_offset = if is_idr {
            0
        } else if self.prev_frame_num > self.frame_num {
            prev_frame_num_offset + max_frame_num
        } else {
            prev_frame_num_offset
        };

        // (8-12)
        let temp_poc = if is_idr {
            0
        } else if !is_ref {
            2 * (self.poc.frame_num_offset + self.frame_num) - 1
        } else {
            2 * (self.poc.frame_num_offset + self.frame_num)
        };

        // (8-13)
        if structure != PictureStructure::BottomField {
            self.poc.field_poc[TOP_FIELD] = temp_poc;
        }
        if structure != PictureStructure::TopField {
            self.poc.field_poc[BOTTOM_FIELD] = temp_poc;
        }
    }
}
