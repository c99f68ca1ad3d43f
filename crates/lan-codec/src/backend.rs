//! 硬件解码后端抽象.
//!
//! 解码状态机与具体驱动 (VA-API, V4L2, 软件模拟等) 之间的接缝:
//! 状态机负责"喂什么", 后端负责"怎么解". 参数结构刻意贴近常见
//! 驱动 ABI 的形状, 便于后端做一对一填充.

use bytes::Bytes;
use lan_core::LanResult;

/// 硬件表面句柄
///
/// 由后端分配, 状态机只负责在图像生命周期内透传, 不解释其含义.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u32);

/// 图像结构: 帧或单场
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureStructure {
    /// 完整帧 (或互补场对)
    Frame,
    /// 顶场
    TopField,
    /// 底场
    BottomField,
}

impl PictureStructure {
    /// 是否为单场
    pub fn is_field(self) -> bool {
        self != PictureStructure::Frame
    }

    /// 相反极性的场; 帧返回自身
    pub fn opposite(self) -> PictureStructure {
        match self {
            PictureStructure::Frame => PictureStructure::Frame,
            PictureStructure::TopField => PictureStructure::BottomField,
            PictureStructure::BottomField => PictureStructure::TopField,
        }
    }
}

/// 表面分配请求
#[derive(Debug, Clone)]
pub struct SurfaceDescriptor {
    /// 宽度 (像素)
    pub width: u32,
    /// 高度 (像素)
    pub height: u32,
    /// chroma_format_idc (0=单色, 1=4:2:0, 2=4:2:2, 3=4:4:4)
    pub chroma_format_idc: u32,
}

/// 参考图像表项
///
/// 图像级 ReferenceFrames 和切片级 RefPicList0/1 共用此形状.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefPicEntry {
    /// 参考图像所在表面
    pub surface: SurfaceId,
    /// 长期参考: LongTermFrameIdx, 短期参考: frame_num
    pub frame_idx: u32,
    /// TopFieldOrderCnt (场图像只填自己的那一侧, 另一侧为 0)
    pub top_field_order_cnt: i32,
    /// BottomFieldOrderCnt
    pub bottom_field_order_cnt: i32,
    /// 帧或场
    pub structure: PictureStructure,
    /// 是否为长期参考
    pub is_long_term: bool,
}

/// 图像级解码参数
#[derive(Debug, Clone)]
pub struct PictureParams {
    /// 输出表面
    pub surface: SurfaceId,
    /// slice_header() 中的 frame_num
    pub frame_num: u32,
    /// 当前图像结构
    pub structure: PictureStructure,
    /// TopFieldOrderCnt
    pub top_field_order_cnt: i32,
    /// BottomFieldOrderCnt
    pub bottom_field_order_cnt: i32,
    /// 当前图像是否为参考图像
    pub is_reference: bool,
    /// 是否为 IDR 图像
    pub is_idr: bool,
    /// DPB 中所有参考帧 (驱动的 ReferenceFrames 表)
    pub reference_frames: Vec<RefPicEntry>,
}

/// 切片级解码参数
#[derive(Debug, Clone)]
pub struct SliceParams {
    /// slice_type (未对 5 取模)
    pub slice_type: u32,
    /// first_mb_in_slice
    pub first_mb_in_slice: u32,
    /// RefPicList0, 长度等于 num_ref_idx_l0_active; 缺失的参考为 None
    pub ref_pic_list0: Vec<Option<RefPicEntry>>,
    /// RefPicList1 (仅 B 切片非空)
    pub ref_pic_list1: Vec<Option<RefPicEntry>>,
}

/// 解码输出帧
#[derive(Debug, Clone)]
pub struct OutputFrame {
    /// 已解码内容所在表面, 所有权移交给消费方
    pub surface: SurfaceId,
    /// 图像序号, 按此顺序显示
    pub poc: i32,
    /// 显示时间戳, 未知时为 `lan_core::timestamp::NOPTS_VALUE`
    pub pts: i64,
    /// 参考链受损 (丢包恢复产物), 显示时可选择丢弃
    pub corrupted: bool,
}

/// 硬件解码后端
///
/// 调用顺序约定: 对每个图像, `begin_picture` 一次, `submit_slice` 若干次,
/// `end_picture` 一次. 表面在 `alloc_surface` 与 `release_surface` 之间有效;
/// 已随 [`OutputFrame`] 移交的表面由消费方负责释放.
pub trait DecodeBackend: Send {
    /// 分配一块解码表面
    fn alloc_surface(&mut self, desc: &SurfaceDescriptor) -> LanResult<SurfaceId>;

    /// 开始一个图像, 提交图像级参数
    fn begin_picture(&mut self, params: &PictureParams) -> LanResult<()>;

    /// 提交一个切片及其压缩数据
    fn submit_slice(&mut self, params: &SliceParams, data: Bytes) -> LanResult<()>;

    /// 结束当前图像, 触发实际解码
    fn end_picture(&mut self, surface: SurfaceId) -> LanResult<()>;

    /// 释放一块不再使用的表面
    fn release_surface(&mut self, surface: SurfaceId);
}
