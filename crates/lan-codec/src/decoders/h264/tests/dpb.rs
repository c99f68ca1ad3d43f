//! DPB 容量推导与输出调度测试 (Annex C).

use super::super::dpb::max_dec_frame_buffering;
use super::helpers::*;
use crate::decoders::h264::VuiParameters;
use lan_core::LanError;

#[test]
fn dpb_size_from_level_limits() {
    // level 3.1: MaxDpbMbs 18000, 80x45=3600 宏块 -> 5 帧
    assert_eq!(max_dec_frame_buffering(&build_test_sps(0)), 5);

    let mut sps = build_test_sps(0);
    sps.level_idc = 11;
    sps.pic_width_in_mbs = 11;
    sps.pic_height_in_map_units = 9;
    assert_eq!(max_dec_frame_buffering(&sps), 9, "level 1.1 应按 900 宏块计");

    // constraint_set3_flag 下 level 11 即 level 1b
    sps.constraint_set_flags = 1 << 3;
    assert_eq!(max_dec_frame_buffering(&sps), 4, "level 1b 应按 396 宏块计");
}

#[test]
fn dpb_size_unknown_level_defaults_to_16() {
    let mut sps = build_test_sps(0);
    sps.level_idc = 99;
    assert_eq!(max_dec_frame_buffering(&sps), 16);
}

#[test]
fn dpb_size_vui_override() {
    let mut sps = build_test_sps(0);
    sps.num_ref_frames = 2;
    sps.vui = Some(VuiParameters {
        bitstream_restriction_flag: true,
        max_num_reorder_frames: 2,
        max_dec_frame_buffering: 2,
    });
    assert_eq!(max_dec_frame_buffering(&sps), 2, "VUI 应覆盖按级别推导的值");

    // 不得低于 num_ref_frames
    sps.num_ref_frames = 4;
    assert_eq!(max_dec_frame_buffering(&sps), 4);
}

#[test]
fn dpb_size_intra_profile_without_buffering() {
    let mut sps = build_test_sps(0);
    sps.constraint_set_flags = 1 << 3;
    sps.num_ref_frames = 0;
    sps.vui = Some(VuiParameters::default());
    assert_eq!(max_dec_frame_buffering(&sps), 1, "纯帧内 profile 至少保留 1 帧");
}

#[test]
fn dpb_size_mvc_profile_doubles() {
    let mut sps = build_test_sps(0);
    sps.profile_idc = 118;
    sps.num_views = 2;
    assert_eq!(max_dec_frame_buffering(&sps), 10);
}

#[test]
fn output_reordered_by_poc() {
    let (mut decoder, _log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    send(&mut decoder, build_slice_header(1, 3, false, 8));
    send(&mut decoder, build_b_slice_header(2, 4));

    assert_eq!(
        drain_pocs(&mut decoder),
        vec![0, 4, 8],
        "输出应按 POC 升序而非解码顺序"
    );
}

#[test]
fn full_dpb_outputs_nonref_directly() {
    let mut sps = build_test_sps(0);
    sps.num_ref_frames = 1;
    sps.vui = Some(VuiParameters {
        bitstream_restriction_flag: true,
        max_num_reorder_frames: 0,
        max_dec_frame_buffering: 1,
    });
    let (mut decoder, _log) = build_decoder_with_sps(sps);

    send(&mut decoder, build_slice_header(0, 3, true, 0));
    send(&mut decoder, build_slice_header(1, 3, false, 8));
    assert_eq!(decoder.dpb_size, 1);

    // DPB 已满且等待中的帧 POC 更大: 非参考帧不占槽位, 直接显示
    send(&mut decoder, build_b_slice_header(2, 4));

    assert_eq!(drain_pocs(&mut decoder), vec![0, 4, 8]);
}

#[test]
fn idr_flushes_dpb() {
    let (mut decoder, _log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    send(&mut decoder, build_slice_header(1, 3, false, 2));
    send(&mut decoder, build_slice_header(2, 3, false, 4));
    send(&mut decoder, build_slice_header(0, 3, true, 0));

    assert_eq!(
        drain_pocs(&mut decoder),
        vec![0, 2, 4, 0],
        "IDR 应先排空 DPB 再开始新序列"
    );
}

#[test]
fn frame_num_gap_fills_ghost_references() {
    let (mut decoder, _log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    // frame_num 0 -> 3, 丢了 1 和 2
    send(&mut decoder, build_slice_header(3, 3, false, 6));

    assert_eq!(decoder.dpb.len(), 3, "间隙应以占位参考帧补齐");

    let frames = drain(&mut decoder);
    let pocs: Vec<i32> = frames.iter().map(|f| f.poc).collect();
    assert_eq!(pocs, vec![0, 6], "占位帧不参与输出");
    assert!(!frames[0].corrupted);
    assert!(
        frames[1].corrupted,
        "引用了占位帧的图像应标记为损坏"
    );
}

#[test]
fn low_latency_drops_out_of_sequence_frame() {
    let (mut decoder, _log) = build_test_decoder();
    decoder.set_low_latency(true);

    send(&mut decoder, build_slice_header(0, 3, true, 0));
    send(&mut decoder, build_slice_header(1, 3, false, 2));
    send(&mut decoder, build_slice_header(2, 3, false, 4));
    // POC 3 在 POC 4 已经输出之后才到, 只能丢弃
    send(&mut decoder, build_b_slice_header(3, 3));

    assert_eq!(drain_pocs(&mut decoder), vec![0, 2, 4]);
}

#[test]
fn low_latency_outputs_without_delay() {
    let (mut decoder, _log) = build_test_decoder();
    decoder.set_low_latency(true);

    send(&mut decoder, build_slice_header(0, 3, true, 0));
    assert!(matches!(
        decoder.receive_frame(),
        Err(LanError::NeedMoreData)
    ));

    // 下一帧开始时, 上一帧立即可取
    send(&mut decoder, build_slice_header(1, 3, false, 2));
    assert_eq!(decoder.receive_frame().unwrap().poc, 0);
}

#[test]
fn flush_discards_everything() {
    let (mut decoder, log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    send(&mut decoder, build_slice_header(1, 3, false, 2));

    decoder.flush().unwrap();
    assert!(decoder.dpb.is_empty());
    assert!(decoder.pictures.is_empty(), "图像对象应全部回收");
    assert!(matches!(
        decoder.receive_frame(),
        Err(LanError::NeedMoreData)
    ));
    assert_eq!(log.lock().unwrap().released.len(), 2, "表面应归还后端");

    // flush 幂等
    decoder.flush().unwrap();

    // flush 后可以继续解码
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    assert_eq!(drain_pocs(&mut decoder), vec![0]);
}

#[test]
fn end_of_sequence_then_restart() {
    let (mut decoder, _log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    assert_eq!(drain_pocs(&mut decoder), vec![0]);
    assert!(matches!(decoder.receive_frame(), Err(LanError::Eof)));

    send(&mut decoder, build_slice_header(0, 3, true, 0));
    assert_eq!(drain_pocs(&mut decoder), vec![0]);
}
