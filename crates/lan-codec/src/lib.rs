//! # lan-codec
//!
//! Lan 视频解码框架编解码器库, 提供硬件加速解码的码流状态机.
//!
//! 本 crate 不做熵解码, 也不产生像素: 它消费上层解析器给出的参数集与
//! 切片记录, 维护解码图像缓冲区 (DPB)、图像序号 (POC)、参考图像标记与
//! 参考列表, 并驱动一个抽象的硬件后端 ([`backend::DecodeBackend`]) 完成
//! 实际解码.
//!
//! ## 支持的编解码器
//!
//! - **解码器**: H.264 (帧/场, 隐式与显式参考管理, frame_num 间隙修复)

pub mod backend;
pub mod decoders;

// 重导出常用类型
pub use backend::{
    DecodeBackend, OutputFrame, PictureParams, PictureStructure, RefPicEntry, SliceParams,
    SurfaceDescriptor, SurfaceId,
};
