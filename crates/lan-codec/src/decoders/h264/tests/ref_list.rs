//! 参考列表构建与重排序测试 (8.2.4).

use super::helpers::*;
use crate::backend::{PictureStructure, RefPicEntry, SliceParams};
use crate::decoders::h264::RefPicListMod;

fn last_slice(log: &std::sync::Mutex<BackendLog>) -> SliceParams {
    log.lock().unwrap().slices.last().unwrap().clone()
}

fn frame_idx_of(list: &[Option<RefPicEntry>]) -> Vec<u32> {
    list.iter().flatten().map(|entry| entry.frame_idx).collect()
}

#[test]
fn p_list_sorted_by_pic_num_descending() {
    let (mut decoder, log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    send(&mut decoder, build_slice_header(1, 3, false, 2));
    send(&mut decoder, build_slice_header(2, 3, false, 4));
    send(&mut decoder, build_slice_header(3, 3, false, 6));

    let slice = last_slice(&log);
    assert_eq!(
        frame_idx_of(&slice.ref_pic_list0),
        vec![2, 1, 0],
        "P 列表应按 PicNum 降序"
    );
    assert!(slice.ref_pic_list1.is_empty(), "P 切片不应有 RefPicList1");
}

#[test]
fn b_lists_split_around_current_poc() {
    let (mut decoder, log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    send(&mut decoder, build_slice_header(1, 3, false, 8));
    // B 帧 POC 4 夹在两个参考之间
    send(&mut decoder, build_b_slice_header(2, 4));

    let slice = last_slice(&log);
    assert_eq!(
        frame_idx_of(&slice.ref_pic_list0),
        vec![0, 1],
        "L0 先取 POC 较小的参考"
    );
    assert_eq!(
        frame_idx_of(&slice.ref_pic_list1),
        vec![1, 0],
        "L1 先取 POC 较大的参考"
    );
}

#[test]
fn b_identical_lists_swap_first_two() {
    let (mut decoder, log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    send(&mut decoder, build_slice_header(1, 3, false, 2));
    // 两个参考都在当前 POC 之前, 初始 L0 和 L1 相同
    send(&mut decoder, build_b_slice_header(2, 8));

    let slice = last_slice(&log);
    assert_eq!(frame_idx_of(&slice.ref_pic_list0), vec![1, 0]);
    assert_eq!(
        frame_idx_of(&slice.ref_pic_list1),
        vec![0, 1],
        "两表相同时 L1 前两项应互换"
    );
}

#[test]
fn list_truncated_to_num_ref_idx_active() {
    let (mut decoder, log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    send(&mut decoder, build_slice_header(1, 3, false, 2));
    send(&mut decoder, build_slice_header(2, 3, false, 4));

    let mut hdr = build_slice_header(3, 3, false, 6);
    hdr.num_ref_idx_l0_active_minus1 = 0;
    send(&mut decoder, hdr);

    assert_eq!(frame_idx_of(&last_slice(&log).ref_pic_list0), vec![2]);
}

#[test]
fn short_list_padded_internally_truncated_for_backend() {
    let (mut decoder, log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    // 只有 1 个参考, 但声明了 4 个活动表项
    send(&mut decoder, build_slice_header(1, 3, false, 2));

    assert_eq!(decoder.ref_pic_list0.len(), 4, "内部列表补齐到活动长度");
    assert!(decoder.ref_pic_list0[0].is_some());
    assert!(decoder.ref_pic_list0[1..].iter().all(Option::is_none));

    assert_eq!(
        frame_idx_of(&last_slice(&log).ref_pic_list0),
        vec![0],
        "导出给后端的列表在第一个空槽处截断"
    );
}

#[test]
fn modification_moves_short_term_to_front() {
    let (mut decoder, log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));
    send(&mut decoder, build_slice_header(1, 3, false, 2));
    send(&mut decoder, build_slice_header(2, 3, false, 4));

    // picNum = CurrPicNum(3) - 3 = 0: 把最旧的参考提到表头
    let mut hdr = build_slice_header(3, 3, false, 6);
    hdr.ref_pic_list_modification_l0 = vec![RefPicListMod::ShortTermSub {
        abs_diff_pic_num_minus1: 2,
    }];
    send(&mut decoder, hdr);

    assert_eq!(
        frame_idx_of(&last_slice(&log).ref_pic_list0),
        vec![0, 2, 1],
        "重排序后其余表项应后移且不重复"
    );
}

#[test]
fn modification_to_missing_picture_leaves_hole() {
    let (mut decoder, log) = build_test_decoder();
    send(&mut decoder, build_slice_header(0, 3, true, 0));

    // picNum = 1 - 1 - 4 回绕到不存在的图像
    let mut hdr = build_slice_header(1, 3, false, 2);
    hdr.ref_pic_list_modification_l0 = vec![RefPicListMod::ShortTermSub {
        abs_diff_pic_num_minus1: 3,
    }];
    send(&mut decoder, hdr);

    assert!(
        last_slice(&log).ref_pic_list0.is_empty(),
        "表头空槽导致后端列表为空"
    );
    assert!(
        decoder.ref_pic_list0[0].is_none(),
        "缺失的图像在内部列表中留下空槽"
    );
}

#[test]
fn field_lists_alternate_parity() {
    let (mut decoder, log) = build_decoder_with_sps(build_interlaced_sps(0));
    send(&mut decoder, build_field_header(0, 3, true, 0, false));
    send(&mut decoder, build_field_header(0, 3, true, 1, true));
    send(&mut decoder, build_field_header(1, 3, false, 2, false));
    send(&mut decoder, build_field_header(1, 3, false, 3, true));
    send(&mut decoder, build_field_header(2, 3, false, 4, false));

    let slice = last_slice(&log);
    let entries: Vec<RefPicEntry> = slice.ref_pic_list0.iter().flatten().cloned().collect();
    let structures: Vec<PictureStructure> = entries.iter().map(|e| e.structure).collect();
    assert_eq!(
        structures,
        vec![
            PictureStructure::TopField,
            PictureStructure::BottomField,
            PictureStructure::TopField,
            PictureStructure::BottomField,
        ],
        "场列表应与当前场同极性开始交替"
    );
    assert_eq!(frame_idx_of(&slice.ref_pic_list0), vec![1, 1, 0, 0]);
}
