//! H.264 解码器测试.

mod helpers;

mod dpb;
mod marking;
mod ref_list;
