//! 已解析的码流头部记录.
//!
//! 本解码器不做 NAL/RBSP 解析, 由上层解析器填好这些结构后送入.
//! 字段命名与 ITU-T H.264 语法元素保持一致, 便于对照标准.

use bytes::Bytes;
use lan_core::timestamp::NOPTS_VALUE;

/// VUI 中与 DPB 行为相关的参数子集
#[derive(Debug, Clone, Default)]
pub struct VuiParameters {
    /// bitstream_restriction() 是否存在
    pub bitstream_restriction_flag: bool,
    /// 重排序深度上限
    pub max_num_reorder_frames: u32,
    /// DPB 帧数上限, 存在时覆盖按级别推导的值
    pub max_dec_frame_buffering: u32,
}

/// 序列参数集 (SPS)
#[derive(Debug, Clone)]
pub struct Sps {
    pub sps_id: u32,
    pub profile_idc: u8,
    /// constraint_set0..5_flag, 位 0 对应 constraint_set0_flag
    pub constraint_set_flags: u8,
    pub level_idc: u8,
    pub chroma_format_idc: u32,
    pub pic_width_in_mbs: u32,
    pub pic_height_in_map_units: u32,
    /// 为真时整个序列都是帧编码 (逐行)
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub num_ref_frames: u32,
    pub gaps_in_frame_num_value_allowed_flag: bool,
    pub log2_max_frame_num_minus4: u32,
    /// pic_order_cnt_type (0/1/2)
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    /// POC 类型 1 的参考帧偏移表
    pub offset_for_ref_frame: Vec<i32>,
    /// MVC 扩展的视图数, 单视图码流为 1
    pub num_views: u32,
    pub vui: Option<VuiParameters>,
}

impl Sps {
    /// MaxFrameNum (7-10)
    pub fn max_frame_num(&self) -> i32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// MaxPicOrderCntLsb (7-11)
    pub fn max_pic_order_cnt_lsb(&self) -> i32 {
        1 << (self.log2_max_pic_order_cnt_lsb_minus4 + 4)
    }

    /// PicSizeMbs, 场编码序列按帧高计
    pub fn pic_size_in_mbs(&self) -> u32 {
        self.pic_width_in_mbs
            * self.pic_height_in_map_units
            * if self.frame_mbs_only_flag { 1 } else { 2 }
    }

    /// 亮度宽度 (像素, 不含裁剪)
    pub fn width(&self) -> u32 {
        self.pic_width_in_mbs * 16
    }

    /// 亮度高度 (像素, 不含裁剪)
    pub fn height(&self) -> u32 {
        self.pic_height_in_map_units * 16 * if self.frame_mbs_only_flag { 1 } else { 2 }
    }

    /// constraint_set3_flag
    pub fn constraint_set3_flag(&self) -> bool {
        self.constraint_set_flags & (1 << 3) != 0
    }
}

/// 图像参数集 (PPS)
#[derive(Debug, Clone)]
pub struct Pps {
    pub pps_id: u32,
    pub sps_id: u32,
    /// bottom_field_pic_order_in_frame_present_flag
    pub pic_order_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u32,
    pub num_ref_idx_l1_default_active_minus1: u32,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub redundant_pic_cnt_present_flag: bool,
}

/// ref_pic_list_modification() 中的单个修改操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefPicListMod {
    /// idc 0: 短期参考, 按 PicNum 差值向前
    ShortTermSub { abs_diff_pic_num_minus1: u32 },
    /// idc 1: 短期参考, 按 PicNum 差值向后
    ShortTermAdd { abs_diff_pic_num_minus1: u32 },
    /// idc 2: 长期参考, 按 LongTermPicNum 直接指定
    LongTerm { long_term_pic_num: u32 },
    /// idc 4/5: MVC 视图间参考, 不支持
    InterView { idc: u32, abs_diff_view_idx_minus1: u32 },
}

/// 内存管理控制操作 (MMCO)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmcoOp {
    /// MMCO 1: 短期参考标记为"不用于参考"
    ForgetShort { difference_of_pic_nums_minus1: u32 },
    /// MMCO 2: 长期参考标记为"不用于参考"
    ForgetLong { long_term_pic_num: u32 },
    /// MMCO 3: 短期参考转为长期参考
    ConvertShortToLong {
        difference_of_pic_nums_minus1: u32,
        long_term_frame_idx: u32,
    },
    /// MMCO 4: 收紧长期帧序号上限, 超出者全部失效
    TrimLong { max_long_term_frame_idx_plus1: u32 },
    /// MMCO 5: 清空所有参考并重置帧序号/POC 基准
    ClearAll,
    /// MMCO 6: 当前图像标记为长期参考
    MarkCurrentLong { long_term_frame_idx: u32 },
    /// 保留值, 由上层解析器透传
    Unknown { id: u32 },
}

/// dec_ref_pic_marking() 语法结构
#[derive(Debug, Clone, Default)]
pub struct DecRefPicMarking {
    /// 仅 IDR: 输出前是否丢弃 DPB 中的旧图像
    pub no_output_of_prior_pics_flag: bool,
    /// 仅 IDR: IDR 自身标记为长期参考
    pub long_term_reference_flag: bool,
    /// 显式 MMCO 模式; 为假时走滑动窗口
    pub adaptive_ref_pic_marking_mode_flag: bool,
    /// MMCO 操作序列, 按码流顺序执行
    pub ops: Vec<MmcoOp>,
}

/// 切片头 (含所在 NAL 的 ref_idc / IDR 标志)
#[derive(Debug, Clone)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    /// slice_type, 未对 5 取模
    pub slice_type: u32,
    pub pps_id: u32,
    pub frame_num: u32,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u32,
    pub pic_order_cnt_lsb: u32,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u32,
    pub num_ref_idx_l0_active_minus1: u32,
    pub num_ref_idx_l1_active_minus1: u32,
    pub ref_pic_list_modification_l0: Vec<RefPicListMod>,
    pub ref_pic_list_modification_l1: Vec<RefPicListMod>,
    pub dec_ref_pic_marking: DecRefPicMarking,
    /// 所在 NAL 的 nal_ref_idc
    pub nal_ref_idc: u8,
    /// 所在 NAL 是否为 IDR
    pub is_idr: bool,
}

impl SliceHeader {
    pub fn is_p_slice(&self) -> bool {
        self.slice_type % 5 == 0
    }

    pub fn is_b_slice(&self) -> bool {
        self.slice_type % 5 == 1
    }

    pub fn is_i_slice(&self) -> bool {
        self.slice_type % 5 == 2
    }

    pub fn is_sp_slice(&self) -> bool {
        self.slice_type % 5 == 3
    }

    pub fn is_si_slice(&self) -> bool {
        self.slice_type % 5 == 4
    }

    /// 当前 NAL 是否为参考 (nal_ref_idc != 0)
    pub fn is_reference(&self) -> bool {
        self.nal_ref_idc != 0
    }
}

/// 一个切片: 头部 + 压缩数据
#[derive(Debug, Clone)]
pub struct Slice {
    pub header: SliceHeader,
    /// RBSP 负载, 原样提交给后端
    pub data: Bytes,
    /// 所属访问单元的显示时间戳
    pub pts: i64,
}

impl Slice {
    /// 由头部构造无数据切片 (测试与探测用)
    pub fn from_header(header: SliceHeader) -> Self {
        Self {
            header,
            data: Bytes::new(),
            pts: NOPTS_VALUE,
        }
    }
}
