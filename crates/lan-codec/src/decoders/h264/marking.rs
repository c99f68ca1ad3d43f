//! 参考图像标记 (8.2.5).
//!
//! 滑动窗口与自适应 (MMCO) 两种模式. 标记只改写图像对象上的
//! [`ReferenceKind`](super::picture::ReferenceKind) 与长期序号,
//! `short_ref`/`long_ref` 列表会在下一个图像开始时从 DPB 重建.

use lan_core::{LanError, LanResult};
use log::{debug, error, warn};

use crate::backend::PictureStructure;

use super::H264Decoder;
use super::headers::{DecRefPicMarking, MmcoOp};
use super::picture::{PictureId, ReferenceKind};
use super::poc::{BOTTOM_FIELD, TOP_FIELD};

impl H264Decoder {
    /// 改写参考标记, 可选地同步互补场
    pub(super) fn set_reference(
        &mut self,
        pic_id: PictureId,
        kind: ReferenceKind,
        other_field_too: bool,
    ) -> LanResult<()> {
        let other = {
            let pic = self.pic_mut(pic_id)?;
            pic.reference = kind;
            pic.other_field
        };
        if other_field_too {
            if let Some(other_id) = other {
                if let Some(other) = self.pictures.get_mut(other_id) {
                    other.reference = kind;
                }
            }
        }
        Ok(())
    }

    /// 8.2.5 - 当前图像解码完成后的参考标记总入口
    pub(super) fn exec_ref_pic_marking(
        &mut self,
        pic_id: PictureId,
        marking: &DecRefPicMarking,
    ) -> LanResult<()> {
        let (is_ref, is_idr, structure) = {
            let pic = self.pic(pic_id)?;
            (pic.is_reference(), pic.is_idr(), pic.structure)
        };
        self.prev_pic_reference = is_ref;
        self.prev_pic_has_mmco5 = false;
        self.prev_pic_structure = structure;

        if !is_ref {
            return Ok(());
        }
        if is_idr {
            // IDR 的标记 (8.2.5.1) 已在图像初始化时随 DPB 清空完成
            return Ok(());
        }
        if marking.adaptive_ref_pic_marking_mode_flag {
            self.exec_ref_pic_marking_adaptive(pic_id, &marking.ops)
        } else {
            self.exec_ref_pic_marking_sliding_window(pic_id)
        }
    }

    /// 8.2.5.3 - 滑动窗口: 短期参考满额时移除 FrameNumWrap 最小者
    pub(super) fn exec_ref_pic_marking_sliding_window(&mut self, pic_id: PictureId) -> LanResult<()> {
        let (is_first_field, is_frame) = {
            let pic = self.pic(pic_id)?;
            (pic.is_first_field(), pic.is_frame())
        };
        // 互补场对只在首场时执行一次
        if !is_first_field {
            return Ok(());
        }

        let num_ref_frames = self.active_sps()?.num_ref_frames;
        let mut max_num_ref_frames = num_ref_frames.max(1) as usize;
        if !is_frame {
            max_num_ref_frames <<= 1;
        }
        if self.short_ref.len() + self.long_ref.len() < max_num_ref_frames {
            return Ok(());
        }
        if self.short_ref.is_empty() {
            return Err(LanError::Codec("滑动窗口中没有可移除的短期参考".into()));
        }

        let mut found = 0;
        for i in 1..self.short_ref.len() {
            let a = self.pic(self.short_ref[i])?.frame_num_wrap;
            let b = self.pic(self.short_ref[found])?.frame_num_wrap;
            if a < b {
                found = i;
            }
        }
        let removed = self.short_ref[found];
        debug!(
            "滑动窗口移除短期参考: frame_num {}",
            self.pic(removed)?.frame_num
        );
        self.set_reference(removed, ReferenceKind::None, true)?;
        let pictures = &self.pictures;
        self.short_ref
            .retain(|&id| pictures.get(id).is_some_and(|pic| pic.is_short_term()));
        Ok(())
    }

    /// 8.2.5.4 - 自适应标记: 按码流顺序执行 MMCO 序列
    fn exec_ref_pic_marking_adaptive(
        &mut self,
        pic_id: PictureId,
        ops: &[MmcoOp],
    ) -> LanResult<()> {
        for op in ops {
            match *op {
                MmcoOp::ForgetShort {
                    difference_of_pic_nums_minus1,
                } => self.exec_mmco_1(pic_id, difference_of_pic_nums_minus1)?,
                MmcoOp::ForgetLong { long_term_pic_num } => {
                    self.exec_mmco_2(pic_id, long_term_pic_num)?
                }
                MmcoOp::ConvertShortToLong {
                    difference_of_pic_nums_minus1,
                    long_term_frame_idx,
                } => self.exec_mmco_3(pic_id, difference_of_pic_nums_minus1, long_term_frame_idx)?,
                MmcoOp::TrimLong {
                    max_long_term_frame_idx_plus1,
                } => self.exec_mmco_4(pic_id, max_long_term_frame_idx_plus1)?,
                MmcoOp::ClearAll => self.exec_mmco_5(pic_id)?,
                MmcoOp::MarkCurrentLong {
                    long_term_frame_idx,
                } => self.exec_mmco_6(pic_id, long_term_frame_idx)?,
                MmcoOp::Unknown { id } => {
                    error!("未知的 MMCO 操作 {}", id);
                    return Err(LanError::Unsupported(format!("MMCO 操作 {}", id)));
                }
            }
        }
        Ok(())
    }

    /// (8-40) picNumX
    fn get_pic_num_x(
        &self,
        pic_id: PictureId,
        difference_of_pic_nums_minus1: u32,
    ) -> LanResult<i32> {
        let pic = self.pic(pic_id)?;
        let pic_num = if pic.is_frame() {
            pic.frame_num_wrap
        } else {
            2 * pic.frame_num_wrap + 1
        };
        Ok(pic_num - (difference_of_pic_nums_minus1 as i32 + 1))
    }

    /// MMCO 1 - 短期参考标记为"不用于参考"
    fn exec_mmco_1(
        &mut self,
        pic_id: PictureId,
        difference_of_pic_nums_minus1: u32,
    ) -> LanResult<()> {
        let pic_num_x = self.get_pic_num_x(pic_id, difference_of_pic_nums_minus1)?;
        let is_frame = self.pic(pic_id)?.is_frame();
        let Some(index) = self.find_short_term_index(pic_num_x) else {
            return Ok(());
        };
        let target = self.short_ref.swap_remove(index);
        self.set_reference(target, ReferenceKind::None, is_frame)
    }

    /// MMCO 2 - 长期参考标记为"不用于参考"
    fn exec_mmco_2(&mut self, pic_id: PictureId, long_term_pic_num: u32) -> LanResult<()> {
        let is_frame = self.pic(pic_id)?.is_frame();
        let Some(index) = self.find_long_term_index(long_term_pic_num) else {
            return Ok(());
        };
        let target = self.long_ref.swap_remove(index);
        self.set_reference(target, ReferenceKind::None, is_frame)
    }

    /// MMCO 3 - 短期参考转为长期参考
    fn exec_mmco_3(
        &mut self,
        pic_id: PictureId,
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    ) -> LanResult<()> {
        let pic_num_x = self.get_pic_num_x(pic_id, difference_of_pic_nums_minus1)?;
        let is_frame = self.pic(pic_id)?.is_frame();

        // 先腾出同序号的旧长期参考
        self.evict_long_term_frame_idx(long_term_frame_idx, is_frame, None)?;

        let Some(index) = self.find_short_term_index(pic_num_x) else {
            return Ok(());
        };
        let target = self.short_ref.swap_remove(index);
        self.set_reference(target, ReferenceKind::LongTerm, is_frame)?;
        let other = {
            let pic = self.pic_mut(target)?;
            pic.long_term_frame_idx = long_term_frame_idx;
            pic.other_field
        };
        if let Some(other_id) = other {
            if let Some(other) = self.pictures.get_mut(other_id) {
                other.long_term_frame_idx = long_term_frame_idx;
            }
        }
        self.long_ref.push(target);
        Ok(())
    }

    /// MMCO 4 - 收紧 MaxLongTermFrameIdx, 超出者全部失效
    fn exec_mmco_4(
        &mut self,
        _pic_id: PictureId,
        max_long_term_frame_idx_plus1: u32,
    ) -> LanResult<()> {
        let mut i = 0;
        while i < self.long_ref.len() {
            let id = self.long_ref[i];
            let over = self
                .pictures
                .get(id)
                .is_some_and(|pic| pic.long_term_frame_idx + 1 > max_long_term_frame_idx_plus1);
            if over {
                self.long_ref.swap_remove(i);
                self.set_reference(id, ReferenceKind::None, false)?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// MMCO 5 - 清空所有参考并重置帧序号与 POC 基准
    fn exec_mmco_5(&mut self, pic_id: PictureId) -> LanResult<()> {
        debug!("MMCO 5: 清空参考图像");
        self.dpb_flush(false)?;
        self.prev_pic_has_mmco5 = true;

        // (8-44)
        self.frame_num = 0;
        self.poc.frame_num_offset = 0;

        let pic = self.pic_mut(pic_id)?;
        pic.frame_num = 0;

        // 当前图像的 POC 以自身为零点重新表达
        let poc = pic.poc;
        match pic.structure {
            PictureStructure::Frame => {
                pic.field_poc[TOP_FIELD] -= poc;
                pic.field_poc[BOTTOM_FIELD] -= poc;
            }
            PictureStructure::TopField => pic.field_poc[TOP_FIELD] -= poc,
            PictureStructure::BottomField => pic.field_poc[BOTTOM_FIELD] -= poc,
        }
        pic.update_poc();
        Ok(())
    }

    /// MMCO 6 - 当前图像标记为长期参考
    fn exec_mmco_6(&mut self, pic_id: PictureId, long_term_frame_idx: u32) -> LanResult<()> {
        let is_complete = self.pic(pic_id)?.is_complete();
        self.evict_long_term_frame_idx(long_term_frame_idx, is_complete, Some(pic_id))?;

        self.set_reference(pic_id, ReferenceKind::LongTerm, is_complete)?;
        let other = {
            let pic = self.pic_mut(pic_id)?;
            pic.long_term_frame_idx = long_term_frame_idx;
            pic.other_field
        };
        if let Some(other_id) = other {
            if let Some(other) = self.pictures.get_mut(other_id) {
                other.long_term_frame_idx = long_term_frame_idx;
            }
        }
        Ok(())
    }

    /// 移除占用给定 LongTermFrameIdx 的旧长期参考
    fn evict_long_term_frame_idx(
        &mut self,
        long_term_frame_idx: u32,
        other_field_too: bool,
        keep: Option<PictureId>,
    ) -> LanResult<()> {
        let mut i = 0;
        while i < self.long_ref.len() {
            let id = self.long_ref[i];
            let collide = Some(id) != keep
                && self
                    .pictures
                    .get(id)
                    .is_some_and(|pic| pic.long_term_frame_idx == long_term_frame_idx);
            if collide {
                self.long_ref.swap_remove(i);
                self.set_reference(id, ReferenceKind::None, other_field_too)?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// 按 PicNum 查找短期参考在 `short_ref` 中的下标
    pub(super) fn find_short_term_index(&self, pic_num: i32) -> Option<usize> {
        let index = self.short_ref.iter().position(|&id| {
            self.pictures
                .get(id)
                .is_some_and(|pic| pic.pic_num == pic_num)
        });
        if index.is_none() {
            warn!("找不到 PicNum 为 {} 的短期参考", pic_num);
        }
        index
    }

    /// 按 LongTermPicNum 查找长期参考在 `long_ref` 中的下标
    pub(super) fn find_long_term_index(&self, long_term_pic_num: u32) -> Option<usize> {
        let index = self.long_ref.iter().position(|&id| {
            self.pictures
                .get(id)
                .is_some_and(|pic| pic.long_term_pic_num == long_term_pic_num)
        });
        if index.is_none() {
            warn!("找不到 LongTermPicNum 为 {} 的长期参考", long_term_pic_num);
        }
        index
    }
}
