//! 测试构造工具: 模拟后端与参数集/切片构造器.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use lan_core::LanResult;

use crate::backend::{
    DecodeBackend, OutputFrame, PictureParams, SliceParams, SurfaceDescriptor, SurfaceId,
};
use crate::decoders::h264::{H264Decoder, Pps, Slice, SliceHeader, Sps};

/// 记录后端收到的全部调用
#[derive(Default)]
pub struct BackendLog {
    pub allocated: u32,
    pub begun: Vec<PictureParams>,
    pub slices: Vec<SliceParams>,
    pub ended: Vec<SurfaceId>,
    pub released: Vec<SurfaceId>,
}

pub struct MockBackend {
    log: Arc<Mutex<BackendLog>>,
}

impl MockBackend {
    pub fn new() -> (Box<dyn DecodeBackend>, Arc<Mutex<BackendLog>>) {
        let log = Arc::new(Mutex::new(BackendLog::default()));
        let backend = MockBackend {
            log: Arc::clone(&log),
        };
        (Box::new(backend), log)
    }
}

impl DecodeBackend for MockBackend {
    fn alloc_surface(&mut self, _desc: &SurfaceDescriptor) -> LanResult<SurfaceId> {
        let mut log = self.log.lock().unwrap();
        let id = SurfaceId(log.allocated);
        log.allocated += 1;
        Ok(id)
    }

    fn begin_picture(&mut self, params: &PictureParams) -> LanResult<()> {
        self.log.lock().unwrap().begun.push(params.clone());
        Ok(())
    }

    fn submit_slice(&mut self, params: &SliceParams, _data: Bytes) -> LanResult<()> {
        self.log.lock().unwrap().slices.push(params.clone());
        Ok(())
    }

    fn end_picture(&mut self, surface: SurfaceId) -> LanResult<()> {
        self.log.lock().unwrap().ended.push(surface);
        Ok(())
    }

    fn release_surface(&mut self, surface: SurfaceId) {
        self.log.lock().unwrap().released.push(surface);
    }
}

/// 1280x720 逐行, POC 类型 0, level 3.1, 4 个参考帧
pub fn build_test_sps(sps_id: u32) -> Sps {
    Sps {
        sps_id,
        profile_idc: 100,
        constraint_set_flags: 0,
        level_idc: 31,
        chroma_format_idc: 1,
        pic_width_in_mbs: 80,
        pic_height_in_map_units: 45,
        frame_mbs_only_flag: true,
        mb_adaptive_frame_field_flag: false,
        num_ref_frames: 4,
        gaps_in_frame_num_value_allowed_flag: true,
        log2_max_frame_num_minus4: 4,
        pic_order_cnt_type: 0,
        log2_max_pic_order_cnt_lsb_minus4: 4,
        delta_pic_order_always_zero_flag: false,
        offset_for_non_ref_pic: 0,
        offset_for_top_to_bottom_field: 0,
        offset_for_ref_frame: Vec::new(),
        num_views: 1,
        vui: None,
    }
}

pub fn build_test_sps_with_poc_type(sps_id: u32, poc_type: u32) -> Sps {
    let mut sps = build_test_sps(sps_id);
    sps.pic_order_cnt_type = poc_type;
    if poc_type == 1 {
        sps.offset_for_ref_frame = vec![2];
    }
    sps
}

/// 1280x736 隔行 (场编码)
pub fn build_interlaced_sps(sps_id: u32) -> Sps {
    let mut sps = build_test_sps(sps_id);
    sps.frame_mbs_only_flag = false;
    sps.pic_height_in_map_units = 23;
    sps
}

pub fn build_test_pps(pps_id: u32, sps_id: u32) -> Pps {
    Pps {
        pps_id,
        sps_id,
        pic_order_present_flag: false,
        num_ref_idx_l0_default_active_minus1: 0,
        num_ref_idx_l1_default_active_minus1: 0,
        weighted_pred_flag: false,
        weighted_bipred_idc: 0,
        redundant_pic_cnt_present_flag: false,
    }
}

/// IDR 为 I 切片, 其余为 P 切片; 列表长度默认放宽到 4/2
pub fn build_slice_header(frame_num: u32, nal_ref_idc: u8, is_idr: bool, poc_lsb: u32) -> SliceHeader {
    SliceHeader {
        first_mb_in_slice: 0,
        slice_type: if is_idr { 2 } else { 0 },
        pps_id: 0,
        frame_num,
        field_pic_flag: false,
        bottom_field_flag: false,
        idr_pic_id: 0,
        pic_order_cnt_lsb: poc_lsb,
        delta_pic_order_cnt_bottom: 0,
        delta_pic_order_cnt: [0, 0],
        redundant_pic_cnt: 0,
        num_ref_idx_l0_active_minus1: 3,
        num_ref_idx_l1_active_minus1: 1,
        ref_pic_list_modification_l0: Vec::new(),
        ref_pic_list_modification_l1: Vec::new(),
        dec_ref_pic_marking: Default::default(),
        nal_ref_idc,
        is_idr,
    }
}

/// 非参考 B 切片
pub fn build_b_slice_header(frame_num: u32, poc_lsb: u32) -> SliceHeader {
    let mut hdr = build_slice_header(frame_num, 0, false, poc_lsb);
    hdr.slice_type = 1;
    hdr
}

/// 场编码切片头
pub fn build_field_header(
    frame_num: u32,
    nal_ref_idc: u8,
    is_idr: bool,
    poc_lsb: u32,
    bottom: bool,
) -> SliceHeader {
    let mut hdr = build_slice_header(frame_num, nal_ref_idc, is_idr, poc_lsb);
    hdr.field_pic_flag = true;
    hdr.bottom_field_flag = bottom;
    // 第二场不能是 IDR, 配对时退化为普通 I 切片
    if bottom && is_idr {
        hdr.is_idr = false;
        hdr.slice_type = 2;
    }
    hdr
}

pub fn build_test_decoder() -> (H264Decoder, Arc<Mutex<BackendLog>>) {
    build_decoder_with_sps(build_test_sps(0))
}

pub fn build_decoder_with_sps(sps: Sps) -> (H264Decoder, Arc<Mutex<BackendLog>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (backend, log) = MockBackend::new();
    let mut decoder = H264Decoder::new(backend);
    decoder.decode_sps(sps).unwrap();
    decoder.decode_pps(build_test_pps(0, 0)).unwrap();
    (decoder, log)
}

/// 送入一个单切片图像
pub fn send(decoder: &mut H264Decoder, hdr: SliceHeader) {
    decoder.decode_slice(&Slice::from_header(hdr)).unwrap();
}

/// 结束码流并取出所有输出帧
pub fn drain(decoder: &mut H264Decoder) -> Vec<OutputFrame> {
    decoder.end_of_sequence().unwrap();
    let mut frames = Vec::new();
    while let Ok(frame) = decoder.receive_frame() {
        frames.push(frame);
    }
    frames
}

/// 结束码流并按输出顺序收集 POC
pub fn drain_pocs(decoder: &mut H264Decoder) -> Vec<i32> {
    drain(decoder).iter().map(|frame| frame.poc).collect()
}
