//! 时间戳约定.
//!
//! 解码器不解释时间戳, 只负责把输入切片上的 PTS 透传到输出帧.

/// 表示"未定义"的时间戳值
pub const NOPTS_VALUE: i64 = i64::MIN;

/// 判断时间戳是否有效 (非 NOPTS_VALUE)
#[inline]
pub const fn is_valid_pts(pts: i64) -> bool {
    pts != NOPTS_VALUE
}
