//! 参考图像列表构建 (8.2.4).
//!
//! 每个图像开始时从 DPB 重建 `short_ref`/`long_ref`, 再按切片类型
//! 生成初始 RefPicList0/1, 最后套用 ref_pic_list_modification().
//! 列表项是 `Option<PictureId>`: 码流引用了不存在的参考时留空位,
//! 记录错误但不中断解码, 提交后端时列表在首个空位截断.

use lan_core::{LanError, LanResult};
use log::error;

use crate::backend::PictureStructure;

use super::H264Decoder;
use super::headers::{RefPicListMod, SliceHeader};
use super::picture::{Arena, Picture, PictureFlags, PictureId};

/// 按键值排序句柄列表 (稳定排序)
fn sorted(
    pictures: &Arena<Picture>,
    ids: impl IntoIterator<Item = PictureId>,
    key: impl Fn(&Picture) -> i64,
    descending: bool,
) -> Vec<PictureId> {
    let mut keyed: Vec<(i64, PictureId)> = ids
        .into_iter()
        .filter_map(|id| pictures.get(id).map(|pic| (key(pic), id)))
        .collect();
    keyed.sort_by_key(|&(k, _)| if descending { -k } else { k });
    keyed.into_iter().map(|(_, id)| id).collect()
}

/// 8.2.4.2.5 - 场模式下按当前场极性交替排列参考场
fn interleave_fields(
    pictures: &Arena<Picture>,
    structure: PictureStructure,
    ref_list: &[PictureId],
    out: &mut Vec<PictureId>,
) {
    let mut i = 0;
    let mut j = 0;
    while i < ref_list.len() || j < ref_list.len() {
        while i < ref_list.len() {
            let id = ref_list[i];
            i += 1;
            if pictures.get(id).is_some_and(|pic| pic.structure == structure) {
                out.push(id);
                break;
            }
        }
        while j < ref_list.len() {
            let id = ref_list[j];
            j += 1;
            if pictures.get(id).is_some_and(|pic| pic.structure != structure) {
                out.push(id);
                break;
            }
        }
    }
}

impl H264Decoder {
    /// 从 DPB 重建短期/长期参考集合
    pub(super) fn init_picture_ref_lists(&mut self, pic_id: PictureId) -> LanResult<()> {
        self.short_ref.clear();
        self.long_ref.clear();

        let is_frame = self.pic(pic_id)?.is_frame();
        let mut pairs: Vec<(PictureId, Option<PictureId>)> = Vec::new();
        if is_frame {
            for &fs_id in &self.dpb {
                let Some(fs) = self.stores.get(fs_id) else {
                    continue;
                };
                if !fs.has_frame() {
                    continue;
                }
                if let Some(first) = fs.first() {
                    pairs.push((first, fs.second()));
                }
            }
            for (id, other) in pairs {
                let Some(pic) = self.pictures.get_mut(id) else {
                    continue;
                };
                pic.structure = PictureStructure::Frame;
                pic.other_field = other;
                if pic.is_short_term() {
                    self.short_ref.push(id);
                } else if pic.is_long_term() {
                    self.long_ref.push(id);
                }
            }
        } else {
            for &fs_id in &self.dpb {
                let Some(fs) = self.stores.get(fs_id) else {
                    continue;
                };
                for id in fs.buffers() {
                    pairs.push((id, fs.other_of(id)));
                }
            }
            for (id, other) in pairs {
                let Some(pic) = self.pictures.get_mut(id) else {
                    continue;
                };
                pic.structure = pic.base_structure;
                pic.other_field = other;
                if pic.is_short_term() {
                    self.short_ref.push(id);
                } else if pic.is_long_term() {
                    self.long_ref.push(id);
                }
            }
        }
        Ok(())
    }

    /// 8.2.4.1 - 计算所有参考的 FrameNumWrap / PicNum / LongTermPicNum
    pub(super) fn init_picture_refs_pic_num(&mut self, pic_id: PictureId) -> LanResult<()> {
        let max_frame_num = self.active_sps()?.max_frame_num();
        let cur_frame_num = self.frame_num;
        let (cur_is_frame, cur_structure) = {
            let pic = self.pic(pic_id)?;
            (pic.is_frame(), pic.structure)
        };

        for id in self.short_ref.clone() {
            let Some(pic) = self.pictures.get_mut(id) else {
                continue;
            };
            // (8-27)
            let frame_num = pic.frame_num as i32;
            let frame_num_wrap = if frame_num > cur_frame_num {
                frame_num - max_frame_num
            } else {
                frame_num
            };
            pic.frame_num_wrap = frame_num_wrap;
            // (8-28, 8-30, 8-31)
            pic.pic_num = if cur_is_frame {
                frame_num_wrap
            } else if pic.structure == cur_structure {
                2 * frame_num_wrap + 1
            } else {
                2 * frame_num_wrap
            };
        }
        for id in self.long_ref.clone() {
            let Some(pic) = self.pictures.get_mut(id) else {
                continue;
            };
            // (8-29, 8-32, 8-33)
            pic.long_term_pic_num = if cur_is_frame {
                pic.long_term_frame_idx
            } else if pic.structure == cur_structure {
                2 * pic.long_term_frame_idx + 1
            } else {
                2 * pic.long_term_frame_idx
            };
        }
        Ok(())
    }

    /// 8.2.4.2.1 / 8.2.4.2.2 - P/SP 切片的初始 RefPicList0
    fn init_picture_refs_p_slice(&mut self, pic_id: PictureId) -> LanResult<()> {
        let pictures = &self.pictures;
        let mut list0: Vec<PictureId> = Vec::new();

        if self.pic(pic_id)?.is_frame() {
            // 短期按 PicNum 降序, 长期按 LongTermPicNum 升序
            list0 = sorted(
                pictures,
                self.short_ref.iter().copied(),
                |p| p.pic_num as i64,
                true,
            );
            list0.extend(sorted(
                pictures,
                self.long_ref.iter().copied(),
                |p| p.long_term_pic_num as i64,
                false,
            ));
        } else {
            // 8.2.4.2.5 - 先按帧序排序, 再按极性交替
            let short = sorted(
                pictures,
                self.short_ref.iter().copied(),
                |p| p.frame_num_wrap as i64,
                true,
            );
            let long = sorted(
                pictures,
                self.long_ref.iter().copied(),
                |p| p.long_term_frame_idx as i64,
                false,
            );
            let structure = self.pic(pic_id)?.structure;
            interleave_fields(pictures, structure, &short, &mut list0);
            interleave_fields(pictures, structure, &long, &mut list0);
        }

        self.ref_pic_list0 = list0.into_iter().map(Some).collect();
        self.ref_pic_list1.clear();
        Ok(())
    }

    /// 8.2.4.2.3 / 8.2.4.2.4 - B 切片的初始 RefPicList0/1
    fn init_picture_refs_b_slice(&mut self, pic_id: PictureId) -> LanResult<()> {
        let (is_frame, cur_poc, structure) = {
            let pic = self.pic(pic_id)?;
            (pic.is_frame(), pic.poc, pic.structure)
        };
        let pictures = &self.pictures;
        let poc_of = |id: &PictureId| pictures.get(*id).map(|p| p.poc);

        let mut list0: Vec<PictureId> = Vec::new();
        let mut list1: Vec<PictureId> = Vec::new();

        if is_frame {
            let before = |id: &&PictureId| poc_of(id).is_some_and(|poc| poc < cur_poc);
            let after = |id: &&PictureId| poc_of(id).is_some_and(|poc| poc >= cur_poc);
            let long = sorted(
                pictures,
                self.long_ref.iter().copied(),
                |p| p.long_term_pic_num as i64,
                false,
            );

            // L0: 过去帧 POC 降序, 未来帧 POC 升序, 长期殿后
            list0 = sorted(
                pictures,
                self.short_ref.iter().filter(before).copied(),
                |p| p.poc as i64,
                true,
            );
            list0.extend(sorted(
                pictures,
                self.short_ref.iter().filter(after).copied(),
                |p| p.poc as i64,
                false,
            ));
            list0.extend(long.iter().copied());

            // L1: 未来帧 POC 升序, 过去帧 POC 降序, 长期殿后
            list1 = sorted(
                pictures,
                self.short_ref.iter().filter(after).copied(),
                |p| p.poc as i64,
                false,
            );
            list1.extend(sorted(
                pictures,
                self.short_ref.iter().filter(before).copied(),
                |p| p.poc as i64,
                true,
            ));
            list1.extend(long);
        } else {
            // 场模式的分界是 <= / > (8.2.4.2.4)
            let not_after = |id: &&PictureId| poc_of(id).is_some_and(|poc| poc <= cur_poc);
            let after = |id: &&PictureId| poc_of(id).is_some_and(|poc| poc > cur_poc);

            let mut short0 = sorted(
                pictures,
                self.short_ref.iter().filter(not_after).copied(),
                |p| p.poc as i64,
                true,
            );
            short0.extend(sorted(
                pictures,
                self.short_ref.iter().filter(after).copied(),
                |p| p.poc as i64,
                false,
            ));

            let mut short1 = sorted(
                pictures,
                self.short_ref.iter().filter(after).copied(),
                |p| p.poc as i64,
                false,
            );
            short1.extend(sorted(
                pictures,
                self.short_ref.iter().filter(not_after).copied(),
                |p| p.poc as i64,
                true,
            ));

            let long = sorted(
                pictures,
                self.long_ref.iter().copied(),
                |p| p.long_term_frame_idx as i64,
                false,
            );

            interleave_fields(pictures, structure, &short0, &mut list0);
            interleave_fields(pictures, structure, &long, &mut list0);
            interleave_fields(pictures, structure, &short1, &mut list1);
            interleave_fields(pictures, structure, &long, &mut list1);
        }

        // 两个列表完全相同时交换 L1 前两项 (8.2.4.2.3)
        if list1.len() > 1 && list0 == list1 {
            list1.swap(0, 1);
        }

        self.ref_pic_list0 = list0.into_iter().map(Some).collect();
        self.ref_pic_list1 = list1.into_iter().map(Some).collect();
        Ok(())
    }

    /// 8.2.4 - 参考列表构建总入口, 每个切片调用一次
    pub(super) fn init_picture_refs(
        &mut self,
        pic_id: PictureId,
        hdr: &SliceHeader,
    ) -> LanResult<()> {
        self.init_picture_ref_lists(pic_id)?;
        self.init_picture_refs_pic_num(pic_id)?;

        self.ref_pic_list0.clear();
        self.ref_pic_list1.clear();
        if hdr.is_b_slice() {
            self.init_picture_refs_b_slice(pic_id)?;
        } else if hdr.is_p_slice() || hdr.is_sp_slice() {
            self.init_picture_refs_p_slice(pic_id)?;
        }

        if hdr.is_p_slice() || hdr.is_sp_slice() || hdr.is_b_slice() {
            let num_refs = hdr.num_ref_idx_l0_active_minus1 as usize + 1;
            self.ref_pic_list0.resize(num_refs, None);
            if hdr.is_b_slice() {
                let num_refs = hdr.num_ref_idx_l1_active_minus1 as usize + 1;
                self.ref_pic_list1.resize(num_refs, None);
            }
            self.exec_picture_refs_modification(pic_id, hdr)?;
        }

        self.mark_picture_refs(pic_id)
    }

    /// ref_pic_list_modification() 总入口
    fn exec_picture_refs_modification(
        &mut self,
        pic_id: PictureId,
        hdr: &SliceHeader,
    ) -> LanResult<()> {
        if !hdr.ref_pic_list_modification_l0.is_empty() {
            self.exec_picture_refs_modification_1(pic_id, hdr, 0)?;
        }
        if hdr.is_b_slice() && !hdr.ref_pic_list_modification_l1.is_empty() {
            self.exec_picture_refs_modification_1(pic_id, hdr, 1)?;
        }
        Ok(())
    }

    /// 8.2.4.3 - 对单个列表执行修改命令序列
    fn exec_picture_refs_modification_1(
        &mut self,
        pic_id: PictureId,
        hdr: &SliceHeader,
        list_index: usize,
    ) -> LanResult<()> {
        let max_frame_num = self.active_sps()?.max_frame_num();
        let is_frame = self.pic(pic_id)?.is_frame();

        // 场模式下 MaxPicNum 与 CurrPicNum 加倍 (8.2.4.3 注)
        let (max_pic_num, curr_pic_num) = if is_frame {
            (max_frame_num, self.frame_num)
        } else {
            (2 * max_frame_num, 2 * self.frame_num + 1)
        };

        let (mods, num_refs) = if list_index == 0 {
            (
                hdr.ref_pic_list_modification_l0.clone(),
                hdr.num_ref_idx_l0_active_minus1 as usize + 1,
            )
        } else {
            (
                hdr.ref_pic_list_modification_l1.clone(),
                hdr.num_ref_idx_l1_active_minus1 as usize + 1,
            )
        };

        let mut list = std::mem::take(if list_index == 0 {
            &mut self.ref_pic_list0
        } else {
            &mut self.ref_pic_list1
        });
        // 执行过程中列表比最终长度多一项 (8-37 注)
        list.resize(num_refs + 1, None);

        let mut pic_num_pred = curr_pic_num;
        let mut ref_list_idx = 0usize;

        for m in &mods {
            // 本次命令插入的图像与它的匹配判据
            let (found, matcher): (Option<PictureId>, Box<dyn Fn(&Picture) -> bool>) = match *m {
                RefPicListMod::ShortTermSub {
                    abs_diff_pic_num_minus1,
                }
                | RefPicListMod::ShortTermAdd {
                    abs_diff_pic_num_minus1,
                } => {
                    let abs_diff = abs_diff_pic_num_minus1 as i32 + 1;
                    // (8-34, 8-35)
                    let mut pic_num_no_wrap =
                        if matches!(m, RefPicListMod::ShortTermSub { .. }) {
                            let mut v = pic_num_pred - abs_diff;
                            if v < 0 {
                                v += max_pic_num;
                            }
                            v
                        } else {
                            let mut v = pic_num_pred + abs_diff;
                            if v >= max_pic_num {
                                v -= max_pic_num;
                            }
                            v
                        };
                    pic_num_pred = pic_num_no_wrap;
                    // (8-36)
                    if pic_num_no_wrap > curr_pic_num {
                        pic_num_no_wrap -= max_pic_num;
                    }
                    let pic_num = pic_num_no_wrap;
                    let found = self
                        .find_short_term_index(pic_num)
                        .map(|i| self.short_ref[i]);
                    // PicNumF (8-38): 未标记为短期参考的项视为 MaxPicNum
                    let keep = move |pic: &Picture| {
                        let pic_num_f = if pic.is_short_term() {
                            pic.pic_num
                        } else {
                            max_pic_num
                        };
                        pic_num_f != pic_num
                    };
                    (found, Box::new(keep))
                }
                RefPicListMod::LongTerm { long_term_pic_num } => {
                    let found = self
                        .find_long_term_index(long_term_pic_num)
                        .map(|i| self.long_ref[i]);
                    // LongTermPicNumF (8-39)
                    let keep = move |pic: &Picture| {
                        pic.is_long_term() && pic.long_term_pic_num != long_term_pic_num
                            || !pic.is_long_term()
                    };
                    (found, Box::new(keep))
                }
                RefPicListMod::InterView { idc, .. } => {
                    return Err(LanError::Unsupported(format!(
                        "MVC 视图间参考列表修改 (idc {})",
                        idc
                    )));
                }
            };

            // (8-38/8-39) 右移尾部, 插入, 再压实
            for j in (ref_list_idx + 1..=num_refs).rev() {
                list[j] = list[j - 1];
            }
            list[ref_list_idx] = found;
            ref_list_idx += 1;

            let mut n = ref_list_idx;
            for j in ref_list_idx..=num_refs {
                let Some(id) = list[j] else {
                    continue;
                };
                let keep = self.pictures.get(id).is_some_and(|pic| matcher(pic));
                if keep {
                    list[n] = Some(id);
                    n += 1;
                }
            }
        }

        for (i, slot) in list.iter().take(num_refs).enumerate() {
            if slot.is_none() {
                error!("参考列表 {} 第 {} 项为空", list_index, i);
            }
        }
        list.truncate(num_refs);

        if list_index == 0 {
            self.ref_pic_list0 = list;
        } else {
            self.ref_pic_list1 = list;
        }
        Ok(())
    }

    /// 参考链受损传播: 列表中有损坏或占位图像时当前图像记为损坏
    fn mark_picture_refs(&mut self, pic_id: PictureId) -> LanResult<()> {
        let bad = PictureFlags::CORRUPTED | PictureFlags::GHOST;
        let tainted = self
            .ref_pic_list0
            .iter()
            .chain(self.ref_pic_list1.iter())
            .flatten()
            .any(|&id| {
                self.pictures
                    .get(id)
                    .is_some_and(|pic| pic.flags.intersects(bad))
            });
        if tainted {
            self.pic_mut(pic_id)?.flags |= PictureFlags::CORRUPTED;
        }
        Ok(())
    }
}
