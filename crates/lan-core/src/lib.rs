//! # lan-core
//!
//! Lan 视频解码框架核心库, 提供基础类型定义和错误处理.
//!
//! 为整个 Lan 框架提供底层基础设施: 统一错误类型与时间戳约定.

pub mod error;
pub mod timestamp;

// 重导出常用类型
pub use error::{LanError, LanResult};
