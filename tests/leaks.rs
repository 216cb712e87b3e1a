mod common;

use common::{cell, exit, logs_contain, runtime, upcall, upcall_with, read_cell, ScriptService, EXIT_GLUE, ROOT};
use weft::upcall::codes;
use weft::main_loop;

#[test]
#[should_panic(expected = "leaked memory")]
fn test_unfreed_guest_allocation_is_fatal_at_teardown() {
    let mut svc = ScriptService::new();
    let out = cell();
    svc.script(
        ROOT,
        vec![upcall(codes::MALLOC, &[out as usize, 64]), exit()],
    );
    main_loop(ROOT, EXIT_GLUE, Box::new(svc));
}

#[test]
fn test_malloc_free_balances_the_counter() {
    let mut svc = ScriptService::new();
    let logs = svc.logs.clone();
    let out = cell();
    svc.script(
        ROOT,
        vec![
            upcall(codes::MALLOC, &[out as usize, 128]),
            upcall_with(move |_| (codes::FREE, vec![read_cell(out)])),
            exit(),
        ],
    );
    let mut rt = runtime(svc, 51);
    rt.run(ROOT, EXIT_GLUE);

    assert_ne!(read_cell(out), 0);
    assert!(logs_contain(&logs, "upcall malloc(128)"));
    assert!(logs_contain(&logs, "upcall free"));
    assert_eq!(rt.live_allocs(), 0);
}

#[test]
fn test_clean_run_leaves_no_allocations() {
    let mut svc = ScriptService::new();
    svc.script(ROOT, vec![exit()]);
    let mut rt = runtime(svc, 53);
    rt.run(ROOT, EXIT_GLUE);
    assert_eq!(rt.live_allocs(), 0);
    assert_eq!(rt.n_live_procs(), 0);
}
