use super::{fill, fixed, holds, tracing_init};

#[test]
fn set_get_replace() {
    tracing_init();
    let mut pb = fixed(4096);

    // The main message holds the string header in its first slot.
    let hdr = pb.alloc_main_message(32).unwrap();
    assert!(pb.str_view(hdr).is_none());
    assert_eq!(pb.str_len(hdr), 0);

    pb.set_string(hdr, b"foobar").unwrap();
    assert_eq!(pb.str_view(hdr).unwrap(), b"foobar");
    assert_eq!(pb.str_len(hdr), 6);

    // Keep a neighbour alive to catch corruption from the replacement.
    let guard = pb.alloc(24).unwrap();
    fill(&mut pb, guard, 24, 0x77);

    pb.set_string(hdr, b"foobar has been replaced").unwrap();
    assert_eq!(pb.str_view(hdr).unwrap(), b"foobar has been replaced");
    assert!(holds(&pb, guard, 24, 0x77));
    pb.verify_free_list().unwrap();
}

#[test]
fn clear_resets_the_header() {
    let mut pb = fixed(4096);
    let hdr = pb.alloc_main_message(8).unwrap();
    pb.set_string(hdr, b"transient").unwrap();
    assert!(pb.str_view(hdr).is_some());

    pb.clear_string(hdr);
    assert!(pb.str_view(hdr).is_none());
    assert!(pb.is_null_at(hdr));
    // Clearing twice is a no-op.
    pb.clear_string(hdr);
    assert!(pb.str_view(hdr).is_none());
}

#[test]
fn alloc_string_fills_in_place() {
    let mut pb = fixed(4096);
    let hdr = pb.alloc_main_message(8).unwrap();

    pb.alloc_string(hdr, 5, false)
        .unwrap()
        .copy_from_slice(b"hello");
    assert_eq!(pb.str_view(hdr).unwrap(), b"hello");

    // Growing through the same header keeps the bytes and zeroes the tail.
    pb.alloc_string(hdr, 8, true).unwrap();
    assert_eq!(pb.str_view(hdr).unwrap(), b"hello\0\0\0");
}

#[test]
fn empty_and_large_strings() {
    let mut pb = fixed(4096);
    let hdr = pb.alloc_main_message(8).unwrap();

    pb.set_string(hdr, b"").unwrap();
    assert_eq!(pb.str_view(hdr).unwrap(), b"");
    assert_eq!(pb.str_len(hdr), 0);

    let long: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    pb.set_string(hdr, &long).unwrap();
    assert_eq!(pb.str_view(hdr).unwrap(), &long[..]);
}

#[test]
fn two_headers_do_not_interfere() {
    let mut pb = fixed(4096);
    let msg = pb.alloc_main_message(16).unwrap();
    let h1 = msg;
    let h2 = msg + 4;

    pb.set_string(h1, b"first").unwrap();
    pb.set_string(h2, b"second").unwrap();
    assert_eq!(pb.str_view(h1).unwrap(), b"first");
    assert_eq!(pb.str_view(h2).unwrap(), b"second");

    pb.set_string(h1, b"first, but longer now").unwrap();
    assert_eq!(pb.str_view(h1).unwrap(), b"first, but longer now");
    assert_eq!(pb.str_view(h2).unwrap(), b"second");
}
