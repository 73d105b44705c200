use super::{fixed, tracing_init};
use crate::{Offset, VecHeader};

fn vec_data(pb: &crate::Region, hdr: Offset) -> Offset {
    pb.read_at::<VecHeader>(hdr).unwrap().data
}

#[test]
fn push_and_get() {
    tracing_init();
    let mut pb = fixed(4096);
    let hdr = pb.alloc_main_message(8).unwrap();

    pb.vec_push::<u32>(hdr, 0x1234_5678).unwrap();
    assert_eq!(pb.vec_len(hdr), 1);
    assert_eq!(pb.vec_get::<u32>(hdr, 0), Some(0x1234_5678));
    assert_eq!(pb.vec_get::<u32>(hdr, 1), None);
}

#[test]
fn growth_doubles_capacity() {
    let mut pb = fixed(8192);
    let hdr = pb.alloc_main_message(8).unwrap();

    for i in 0..100u32 {
        pb.vec_push::<u32>(hdr, i + 1).unwrap();
        assert_eq!(pb.vec_get::<u32>(hdr, i as usize), Some(i + 1));
    }
    for i in 0..100u32 {
        assert_eq!(pb.vec_get::<u32>(hdr, i as usize), Some(i + 1));
    }
    assert_eq!(pb.vec_len(hdr), 100);

    // Starting from two elements, 100 pushes double the data block six
    // times: 8, 16, 32, 64, 128, 256, 512 capacity bytes.
    assert_eq!(pb.block_capacity(vec_data(&pb, hdr)), 512);
    pb.verify_free_list().unwrap();
}

#[test]
fn out_of_range_get_is_absent() {
    let mut pb = fixed(4096);
    let hdr = pb.alloc_main_message(8).unwrap();
    assert_eq!(pb.vec_get::<u32>(hdr, 0), None);
    pb.vec_push::<u32>(hdr, 7).unwrap();
    assert_eq!(pb.vec_get::<u32>(hdr, 1), None);
    assert_eq!(pb.vec_get::<u32>(hdr, usize::MAX), None);
}

#[test]
fn reserve_pins_the_data_block() {
    let mut pb = fixed(8192);
    let hdr = pb.alloc_main_message(8).unwrap();

    pb.vec_reserve::<u64>(hdr, 16).unwrap();
    let data = vec_data(&pb, hdr);
    assert!(pb.block_capacity(data) >= 128);
    assert_eq!(pb.vec_len(hdr), 0);

    for i in 0..16u64 {
        pb.vec_push::<u64>(hdr, i).unwrap();
    }
    assert_eq!(vec_data(&pb, hdr), data, "no reallocation within reserve");
    for i in 0..16u64 {
        assert_eq!(pb.vec_get::<u64>(hdr, i as usize), Some(i));
    }
}

#[test]
fn resize_zeroes_new_elements() {
    let mut pb = fixed(4096);
    let hdr = pb.alloc_main_message(8).unwrap();

    pb.vec_push::<u32>(hdr, 9).unwrap();
    pb.vec_resize::<u32>(hdr, 10).unwrap();
    assert_eq!(pb.vec_len(hdr), 10);
    assert_eq!(pb.vec_get::<u32>(hdr, 0), Some(9));
    assert_eq!(pb.vec_get::<u32>(hdr, 9), Some(0));

    // Shrinking only moves the populated count.
    pb.vec_resize::<u32>(hdr, 2).unwrap();
    assert_eq!(pb.vec_len(hdr), 2);
    assert_eq!(pb.vec_get::<u32>(hdr, 2), None);
}

#[test]
fn clear_releases_the_data_block() {
    let mut pb = fixed(4096);
    let hdr = pb.alloc_main_message(8).unwrap();
    for i in 0..50u32 {
        pb.vec_push::<u32>(hdr, i).unwrap();
    }
    pb.vec_clear(hdr);
    assert_eq!(pb.vec_len(hdr), 0);
    assert_eq!(vec_data(&pb, hdr), 0);
    assert_eq!(pb.vec_get::<u32>(hdr, 0), None);
    pb.verify_free_list().unwrap();

    // The vector is usable again afterwards.
    pb.vec_push::<u32>(hdr, 1).unwrap();
    assert_eq!(pb.vec_get::<u32>(hdr, 0), Some(1));
}

#[test]
fn element_types_of_different_widths() {
    let mut pb = fixed(8192);
    let msg = pb.alloc_main_message(24).unwrap();
    let bytes_hdr = msg;
    let wide_hdr = msg + 8;
    let float_hdr = msg + 16;

    for i in 0..10u8 {
        pb.vec_push::<u8>(bytes_hdr, i).unwrap();
    }
    for i in 0..10u64 {
        pb.vec_push::<u64>(wide_hdr, i << 40).unwrap();
    }
    for i in 0..10u32 {
        pb.vec_push::<f64>(float_hdr, i as f64 / 3.0).unwrap();
    }
    for i in 0..10usize {
        assert_eq!(pb.vec_get::<u8>(bytes_hdr, i), Some(i as u8));
        assert_eq!(pb.vec_get::<u64>(wide_hdr, i), Some((i as u64) << 40));
        assert_eq!(pb.vec_get::<f64>(float_hdr, i), Some(i as f64 / 3.0));
    }
}
