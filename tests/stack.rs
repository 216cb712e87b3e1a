mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{logs_matching, runtime, upcall_with, ScriptService, Step, EXIT_GLUE, ROOT};
use weft::upcall::codes;

const N_CALL: usize = 64;
const N_FRAME: usize = 4096;

#[test]
fn test_grow_splices_segment_and_transplants_call_region() {
    let mut svc = ScriptService::new();
    let logs = svc.logs.clone();

    let old_sp = Rc::new(RefCell::new(0usize));
    let old_seg = Rc::new(RefCell::new(0usize));
    let old_bytes = Rc::new(RefCell::new(Vec::new()));

    let before = {
        let (old_sp, old_seg, old_bytes) = (old_sp.clone(), old_seg.clone(), old_bytes.clone());
        upcall_with(move |p| unsafe {
            *old_sp.borrow_mut() = (*p).saved_sp;
            *old_seg.borrow_mut() = (*p).stk as usize;
            *old_bytes.borrow_mut() =
                std::slice::from_raw_parts((*p).saved_sp as *const u8, N_CALL).to_vec();
            (codes::GROW_PROC, vec![N_CALL, N_FRAME])
        })
    };

    let after: Step = {
        let (old_sp, old_seg, old_bytes) = (old_sp.clone(), old_seg.clone(), old_bytes.clone());
        Box::new(move |p| unsafe {
            let seg = (*p).stk;
            let sp = (*p).saved_sp;

            // A fresh segment of at least the requested frame size was
            // spliced in after the old one.
            assert!((*seg).usable() >= N_FRAME);
            assert_eq!((*seg).prev as usize, *old_seg.borrow());
            let old = *old_seg.borrow() as *mut weft::stack::StackSeg;
            assert_eq!((*old).next, seg);

            // The call region was transplanted to the top of the new
            // segment, byte for byte.
            assert_eq!(sp, (*seg).limit - N_CALL);
            let moved = std::slice::from_raw_parts(sp as *const u8, N_CALL);
            assert_eq!(moved, &old_bytes.borrow()[..]);
            assert_ne!(sp, *old_sp.borrow());

            common::Act::Exit
        })
    };

    svc.script(ROOT, vec![before, after]);
    let mut rt = runtime(svc, 41);
    rt.run(ROOT, EXIT_GLUE);
    assert_eq!(rt.live_allocs(), 0);
    assert!(logs_matching(&logs, "transplanted call region") >= 1);
}

#[test]
fn test_grow_reuses_existing_next_segment() {
    let mut svc = ScriptService::new();
    let logs = svc.logs.clone();

    let old_sp = Rc::new(RefCell::new(0usize));
    let old_seg = Rc::new(RefCell::new(0usize));
    let grown_seg = Rc::new(RefCell::new(0usize));

    let first = {
        let (old_sp, old_seg) = (old_sp.clone(), old_seg.clone());
        upcall_with(move |p| unsafe {
            *old_sp.borrow_mut() = (*p).saved_sp;
            *old_seg.borrow_mut() = (*p).stk as usize;
            (codes::GROW_PROC, vec![N_CALL, N_FRAME])
        })
    };

    // Simulate the grown function returning: hop back onto the first
    // segment, leaving the big segment chained after it.
    let rewind = {
        let (old_sp, old_seg, grown_seg) = (old_sp.clone(), old_seg.clone(), grown_seg.clone());
        upcall_with(move |p| unsafe {
            *grown_seg.borrow_mut() = (*p).stk as usize;
            (*p).stk = *old_seg.borrow() as *mut weft::stack::StackSeg;
            (*p).saved_sp = *old_sp.borrow();
            (codes::GROW_PROC, vec![16, 512])
        })
    };

    let check: Step = {
        let grown_seg = grown_seg.clone();
        Box::new(move |p| unsafe {
            // The big segment was big enough for the second growth, so
            // it was reused instead of allocating another one.
            assert_eq!((*p).stk as usize, *grown_seg.borrow());
            assert_eq!((*p).saved_sp, (*(*p).stk).limit - 16);
            common::Act::Exit
        })
    };

    svc.script(ROOT, vec![first, rewind, check]);
    let mut rt = runtime(svc, 43);
    rt.run(ROOT, EXIT_GLUE);

    // One segment at spawn, one on the first growth, none on the second.
    assert_eq!(logs_matching(&logs, "new stack segment"), 2);
    assert_eq!(rt.live_allocs(), 0);
}
