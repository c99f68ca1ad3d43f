//! 图像与帧槽模型.
//!
//! 所有图像对象集中存放在代际竞技场 ([`Arena`]) 中, 相互之间只用
//! [`PictureId`]/[`FrameStoreId`] 句柄引用, 不形成所有权环.
//! 句柄带代数, 槽位复用后旧句柄立即失效, 悬垂访问可以被检出.

use std::marker::PhantomData;

use bitflags::bitflags;
use lan_core::timestamp::NOPTS_VALUE;

use crate::backend::{PictureStructure, SurfaceId};

/// 竞技场句柄: 槽位下标 + 代数
pub struct Id<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Id<T> {}

impl<T> std::fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Id({}v{})", self.index, self.generation)
    }
}

pub type PictureId = Id<Picture>;
pub type FrameStoreId = Id<FrameStore>;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// 代际竞技场
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// 存入一个值, 返回句柄
    pub fn insert(&mut self, value: T) -> Id<T> {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].value = Some(value);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                });
                (self.slots.len() - 1) as u32
            }
        };
        Id {
            index,
            generation: self.slots[index as usize].generation,
            _marker: PhantomData,
        }
    }

    pub fn get(&self, id: Id<T>) -> Option<&T> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, id: Id<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// 取出并释放槽位, 句柄随即失效
    pub fn remove(&mut self, id: Id<T>) -> Option<T> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(value)
    }

    /// 当前存活的值个数
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空所有槽位, 使所有已发出的句柄失效
    pub fn clear(&mut self) {
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
            self.free.push(index as u32);
        }
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// 图像状态标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PictureFlags: u32 {
        /// IDR 图像
        const IDR          = 1 << 0;
        /// 间隙修复产生的占位图像, 不会被输出
        const GHOST        = 1 << 1;
        /// 互补场缺失, 按单场帧处理
        const ONEFIELD     = 1 << 2;
        /// 场编码图像
        const INTERLACED   = 1 << 3;
        /// 互补场对中后解码的那一场
        const SECOND_FIELD = 1 << 4;
        /// 顶场在前
        const TFF          = 1 << 5;
        /// 重复首场
        const RFF          = 1 << 6;
        /// 参考链受损
        const CORRUPTED    = 1 << 7;
        /// 表面已随输出帧移交给消费方
        const HANDED_OFF   = 1 << 8;
    }
}

/// 参考标记, 同一时刻只能处于一种状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReferenceKind {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

impl ReferenceKind {
    pub fn is_reference(self) -> bool {
        self != ReferenceKind::None
    }
}

/// 一个已编码的帧或场
#[derive(Debug)]
pub struct Picture {
    /// 当前结构 (参考列表构建会在帧视角/场视角间切换此值)
    pub structure: PictureStructure,
    /// 解码时的原始结构
    pub base_structure: PictureStructure,
    /// TopFieldOrderCnt / BottomFieldOrderCnt, 未赋值的一侧为 `i32::MAX`
    pub field_poc: [i32; 2],
    /// PicOrderCnt, 等于已赋值场 POC 的较小者
    pub poc: i32,
    /// slice_header() 中的 frame_num
    pub frame_num: u32,
    /// FrameNumWrap (8-27)
    pub frame_num_wrap: i32,
    /// PicNum (8-28/30/31)
    pub pic_num: i32,
    /// LongTermPicNum (8-29/32/33)
    pub long_term_pic_num: u32,
    /// LongTermFrameIdx
    pub long_term_frame_idx: u32,
    /// 参考标记状态
    pub reference: ReferenceKind,
    pub flags: PictureFlags,
    /// 互补场对中的另一场
    pub other_field: Option<PictureId>,
    /// 解码目标表面; 互补场对与占位图像共享表面
    pub surface: SurfaceId,
    /// 本图像是否持有表面所有权 (负责最终释放)
    pub owns_surface: bool,
    /// 是否参与输出 (Annex A 码流恒为真)
    pub output_flag: bool,
    /// 尚未被输出
    pub output_needed: bool,
    pub pts: i64,
}

impl Picture {
    /// 新建一个尚未初始化结构的图像, 持有表面所有权
    pub fn new(surface: SurfaceId) -> Self {
        Self {
            structure: PictureStructure::Frame,
            base_structure: PictureStructure::Frame,
            field_poc: [i32::MAX; 2],
            poc: 0,
            frame_num: 0,
            frame_num_wrap: 0,
            pic_num: 0,
            long_term_pic_num: 0,
            long_term_frame_idx: 0,
            reference: ReferenceKind::None,
            flags: PictureFlags::empty(),
            other_field: None,
            surface,
            owns_surface: true,
            output_flag: false,
            output_needed: false,
            pts: NOPTS_VALUE,
        }
    }

    /// 从首场派生互补场, 共享表面, 结构取反
    pub fn new_field_of(parent: &Picture) -> Self {
        let mut pic = Picture::new(parent.surface);
        pic.owns_surface = false;
        pic.structure = parent.base_structure.opposite();
        pic.base_structure = pic.structure;
        pic.flags = PictureFlags::INTERLACED | PictureFlags::SECOND_FIELD;
        pic.flags |= parent.flags
            & (PictureFlags::TFF
                | PictureFlags::RFF
                | PictureFlags::GHOST
                | PictureFlags::CORRUPTED);
        pic.pts = parent.pts;
        pic
    }

    /// 克隆出一个共享表面的占位图像 (frame_num 间隙修复用)
    pub fn new_ghost_of(parent: &Picture) -> Self {
        let mut pic = Picture::new(parent.surface);
        pic.owns_surface = false;
        pic.flags = PictureFlags::GHOST;
        pic
    }

    pub fn is_frame(&self) -> bool {
        self.structure == PictureStructure::Frame
    }

    pub fn is_idr(&self) -> bool {
        self.flags.contains(PictureFlags::IDR)
    }

    pub fn is_ghost(&self) -> bool {
        self.flags.contains(PictureFlags::GHOST)
    }

    pub fn is_reference(&self) -> bool {
        self.reference.is_reference()
    }

    pub fn is_short_term(&self) -> bool {
        self.reference == ReferenceKind::ShortTerm
    }

    pub fn is_long_term(&self) -> bool {
        self.reference == ReferenceKind::LongTerm
    }

    /// 互补场对中后解码的那一场
    pub fn is_second_field(&self) -> bool {
        self.flags.contains(PictureFlags::SECOND_FIELD)
    }

    /// 帧, 或互补场对中先解码的那一场
    pub fn is_first_field(&self) -> bool {
        !self.is_second_field()
    }

    /// 图像内容完整: 帧, 单场帧, 或已有首场在前的第二场
    pub fn is_complete(&self) -> bool {
        self.is_frame() || self.flags.contains(PictureFlags::ONEFIELD) || self.is_second_field()
    }

    /// 以已赋值的场 POC 刷新图像 POC
    pub fn update_poc(&mut self) {
        self.poc = self.field_poc[0].min(self.field_poc[1]);
    }
}

/// DPB 槽位: 一帧或一对互补场
#[derive(Debug)]
pub struct FrameStore {
    /// 槽位结构; 场对补齐后变为 `Frame`
    pub structure: PictureStructure,
    buffers: [Option<PictureId>; 2],
    /// 等待输出的图像个数
    pub output_needed: u32,
    /// 被请求输出但当时尚不完整的次数
    pub output_called: u32,
}

impl FrameStore {
    /// 以首个图像建槽; 调用方负责同步设置图像的 `output_needed`
    pub fn new(first: PictureId, pic: &mut Picture) -> Self {
        let mut fs = Self {
            structure: pic.structure,
            buffers: [Some(first), None],
            output_needed: 0,
            output_called: 0,
        };
        if pic.output_flag {
            pic.output_needed = true;
            fs.output_needed += 1;
        }
        fs
    }

    /// 追加第二个图像 (互补场或拆分出的场视图)
    pub fn push(&mut self, id: PictureId) {
        debug_assert!(self.buffers[1].is_none());
        self.buffers[1] = Some(id);
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.iter().flatten().count()
    }

    pub fn first(&self) -> Option<PictureId> {
        self.buffers[0]
    }

    pub fn second(&self) -> Option<PictureId> {
        self.buffers[1]
    }

    pub fn buffers(&self) -> impl Iterator<Item = PictureId> + '_ {
        self.buffers.iter().flatten().copied()
    }

    /// 另一个缓冲的句柄 (场对互查)
    pub fn other_of(&self, id: PictureId) -> Option<PictureId> {
        if self.buffers[0] == Some(id) {
            self.buffers[1]
        } else {
            self.buffers[0]
        }
    }

    /// 槽位是否已构成完整帧
    pub fn has_frame(&self) -> bool {
        self.structure == PictureStructure::Frame
    }

    /// 槽位内容是否完整 (帧, 或宣告单场的首场)
    pub fn is_complete(&self, pictures: &Arena<Picture>) -> bool {
        if self.has_frame() {
            return true;
        }
        self.buffers[0]
            .and_then(|id| pictures.get(id))
            .is_some_and(|pic| pic.flags.contains(PictureFlags::ONEFIELD))
    }

    /// 槽位中是否还有参考图像
    pub fn has_reference(&self, pictures: &Arena<Picture>) -> bool {
        self.buffers()
            .any(|id| pictures.get(id).is_some_and(|pic| pic.is_reference()))
    }
}
