//! 参考图像标记测试 (8.2.5).

use super::helpers::*;
use crate::backend::RefPicEntry;
use crate::decoders::h264::MmcoOp;

/// 取第 index 个切片的 RefPicList0 的 frame_idx 序列
fn list0_frame_idx(log: &std::sync::Mutex<BackendLog>, index: usize) -> Vec<u32> {
    log.lock().unwrap().slices[index]
        .ref_pic_list0
        .iter()
        .flatten()
        .map(|entry| entry.frame_idx)
        .collect()
}

fn list0_entries(log: &std::sync::Mutex<BackendLog>, index: usize) -> Vec<RefPicEntry> {
    log.lock().unwrap().slices[index]
        .ref_pic_list0
        .iter()
        .flatten()
        .cloned()
        .collect()
}

#[test]
fn sliding_window_evicts_lowest_frame_num() {
    let mut sps = build_test_sps(0);
    sps.num_ref_frames = 2;
    let (mut decoder, log) = build_decoder_with_sps(sps);

    send(&mut decoder, build_slice_header(0, 3, true, 0));
    send(&mut decoder, build_slice_header(1, 3, false, 2));
    send(&mut decoder, build_slice_header(2, 3, false, 4));
    // 第 4 帧建列表时, frame_num 0 应已被滑动窗口移除
    send(&mut decoder, build_slice_header(3, 3, false, 6));

    assert_eq!(list0_frame_idx(&log, 2), vec![1, 0]);
    assert_eq!(
        list0_frame_idx(&log, 3),
        vec![2, 1],
        "滑动窗口应移除 FrameNumWrap 最小的短期参考"
    );
}

#[test]
fn mmco_1_forgets_short_term() {
    let (mut decoder, log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    send(&mut decoder, build_slice_header(1, 3, false, 2));

    // picNumX = 2 - 1 = 1: 移除 frame_num 1
    let mut hdr = build_slice_header(2, 3, false, 4);
    hdr.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
    hdr.dec_ref_pic_marking.ops = vec![MmcoOp::ForgetShort {
        difference_of_pic_nums_minus1: 0,
    }];
    send(&mut decoder, hdr);
    send(&mut decoder, build_slice_header(3, 3, false, 6));

    assert_eq!(list0_frame_idx(&log, 3), vec![2, 0]);
}

#[test]
fn mmco_3_converts_short_to_long() {
    let (mut decoder, log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));

    // picNumX = 1 - 1 = 0: IDR 转为长期参考
    let mut hdr = build_slice_header(1, 3, false, 2);
    hdr.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
    hdr.dec_ref_pic_marking.ops = vec![MmcoOp::ConvertShortToLong {
        difference_of_pic_nums_minus1: 0,
        long_term_frame_idx: 0,
    }];
    send(&mut decoder, hdr);
    send(&mut decoder, build_slice_header(2, 3, false, 4));

    let entries = list0_entries(&log, 2);
    assert_eq!(entries.len(), 2, "短期在前, 长期殿后");
    assert!(!entries[0].is_long_term);
    assert_eq!(entries[0].frame_idx, 1);
    assert!(entries[1].is_long_term);
    assert_eq!(entries[1].frame_idx, 0, "长期参考的 frame_idx 是 LongTermFrameIdx");
}

#[test]
fn mmco_2_forgets_long_term() {
    let (mut decoder, log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));

    let mut hdr = build_slice_header(1, 3, false, 2);
    hdr.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
    hdr.dec_ref_pic_marking.ops = vec![MmcoOp::ConvertShortToLong {
        difference_of_pic_nums_minus1: 0,
        long_term_frame_idx: 0,
    }];
    send(&mut decoder, hdr);

    let mut hdr = build_slice_header(2, 3, false, 4);
    hdr.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
    hdr.dec_ref_pic_marking.ops = vec![MmcoOp::ForgetLong {
        long_term_pic_num: 0,
    }];
    send(&mut decoder, hdr);
    send(&mut decoder, build_slice_header(3, 3, false, 6));

    assert_eq!(
        list0_frame_idx(&log, 3),
        vec![2, 1],
        "长期参考被 MMCO 2 移除后不再出现在列表中"
    );
}

#[test]
fn mmco_4_trims_long_term_by_idx() {
    let (mut decoder, log) = build_test_decoder();
    // IDR 以 long_term_reference_flag 直接成为长期参考
    let mut hdr = build_slice_header(0, 3, true, 0);
    hdr.dec_ref_pic_marking.long_term_reference_flag = true;
    send(&mut decoder, hdr);

    let mut hdr = build_slice_header(1, 3, false, 2);
    hdr.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
    hdr.dec_ref_pic_marking.ops = vec![MmcoOp::TrimLong {
        max_long_term_frame_idx_plus1: 0,
    }];
    send(&mut decoder, hdr);
    send(&mut decoder, build_slice_header(2, 3, false, 4));

    assert_eq!(
        list0_frame_idx(&log, 2),
        vec![1],
        "MaxLongTermFrameIdx 收紧后超出的长期参考应失效"
    );
}

#[test]
fn mmco_6_marks_current_long() {
    let (mut decoder, log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));

    let mut hdr = build_slice_header(1, 3, false, 2);
    hdr.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
    hdr.dec_ref_pic_marking.ops = vec![MmcoOp::MarkCurrentLong {
        long_term_frame_idx: 0,
    }];
    send(&mut decoder, hdr);
    send(&mut decoder, build_slice_header(2, 3, false, 4));

    let entries = list0_entries(&log, 2);
    assert_eq!(entries.len(), 2);
    assert!(!entries[0].is_long_term, "IDR 仍是短期参考");
    assert!(entries[1].is_long_term, "当前帧应被 MMCO 6 标记为长期参考");
}

#[test]
fn mmco_5_clears_all_references() {
    let (mut decoder, log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    send(&mut decoder, build_slice_header(1, 3, false, 2));

    let mut hdr = build_slice_header(2, 3, false, 4);
    hdr.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag = true;
    hdr.dec_ref_pic_marking.ops = vec![MmcoOp::ClearAll];
    send(&mut decoder, hdr);
    // MMCO 5 后 frame_num 归零, 下一帧只剩它一个参考
    send(&mut decoder, build_slice_header(1, 3, false, 6));

    assert_eq!(
        list0_frame_idx(&log, 3),
        vec![0],
        "MMCO 5 之后只剩重基为 0 的当前帧"
    );
}
