mod common;

use std::ptr;

use common::{runtime, ScriptService, EXIT_GLUE, ROOT};
use weft::value::{implode, next_power_of_two, str_buf, str_bytes, Str, Vector};

#[repr(C)]
struct FakeVec {
    hdr: Vector,
    data: [u32; 3],
}

#[test]
fn test_new_str_allocates_power_of_two_capacity() {
    let svc = ScriptService::new();
    let mut rt = runtime(svc, 71);
    let s = rt.new_str(b"abcde".as_ptr(), 5);
    unsafe {
        assert_eq!((*s).refcnt, 1);
        assert_eq!((*s).fill, 5);
        assert_eq!((*s).alloc, next_power_of_two(5));
        assert_eq!(str_bytes(s), b"abcde");
        rt.free(s as *mut u8);
    }
    assert_eq!(rt.teardown(), 0);
}

#[test]
fn test_implode_packs_unichars_into_a_string() {
    let svc = ScriptService::new();
    let mut rt = runtime(svc, 73);
    let p = rt.spawn(ptr::null_mut(), EXIT_GLUE, ROOT, 0).unwrap();

    let fake = Box::leak(Box::new(FakeVec {
        hdr: Vector {
            refcnt: 1,
            alloc: 12,
            fill: 12,
        },
        data: ['a' as u32, 'b' as u32, 'c' as u32],
    }));
    let v = &mut fake.hdr as *mut Vector;

    unsafe {
        let s: *mut Str = implode(p, v);
        assert_eq!((*s).fill, 3);
        assert_eq!(str_bytes(s), b"abc");

        let buf = str_buf(p, s);
        assert_eq!(*buf as u8, b'a');

        rt.free(s as *mut u8);
    }
    assert_eq!(rt.teardown(), 0);
}
