mod common;

use std::mem;
use std::ptr;

use common::{runtime, ScriptService, EXIT_GLUE, ROOT};
use weft::arch::WORD;
use weft::gc::{self, FrameGlueFns, GC_HEADER_BYTES};

/// A fake GC value: three header words followed by one payload word.
/// The public pointer addresses the third header word.
fn gc_val(refcnt: usize, sweep: usize) -> usize {
    let words: &'static mut [usize; 4] = Box::leak(Box::new([refcnt, sweep, 0, 0]));
    &mut words[2] as *mut usize as usize
}

#[test]
fn test_header_layout_is_three_words() {
    assert_eq!(GC_HEADER_BYTES, 3 * WORD);
    assert_eq!(mem::size_of::<FrameGlueFns>(), 3 * WORD);
}

#[test]
fn test_header_words_read_relative_to_public_pointer() {
    let val = gc_val(7, 0x4000);
    unsafe {
        assert_eq!(gc::refcount(val), 7);
        assert_eq!(gc::sweep_fn(val), 0x4000);
        assert!(!gc::is_marked(val));

        gc::set_mark(val, true);
        assert!(gc::is_marked(val));
        // The sweep address survives the mark bit.
        assert_eq!(gc::sweep_fn(val), 0x4000);
        gc::set_mark(val, false);
        assert!(!gc::is_marked(val));
    }
}

#[test]
fn test_allocation_chain_links_in_reverse_allocation_order() {
    let svc = ScriptService::new();
    let mut rt = runtime(svc, 61);
    let p = rt.spawn(ptr::null_mut(), EXIT_GLUE, ROOT, 0).unwrap();

    let first = gc_val(1, 0);
    let second = gc_val(1, 0);

    unsafe {
        assert_eq!((*p).gc_alloc_chain, 0);
        gc::link_allocation(p, first);
        gc::link_allocation(p, second);

        // The head is the most recent allocation; each third header word
        // links to the value allocated just before it.
        assert_eq!((*p).gc_alloc_chain, second);
        assert_eq!(gc::prev_alloc(second), first);
        assert_eq!(gc::prev_alloc(first), 0);
    }

    assert_eq!(rt.teardown(), 0);
}
