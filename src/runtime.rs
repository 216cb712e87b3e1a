use std::ptr;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::arch::{FrameLayout, X86};
use crate::log::LogBits;
use crate::port::PortTable;
use crate::proc::{Proc, ProcState};
use crate::service::{ActivateFn, Service, StdService};
use crate::slot_vec::SlotVec;
use crate::upcall::Disposition;

/// One cooperative runtime instance. Owns every proc, port, and channel
/// it hosts; one instance runs per native thread, and all internal calls
/// thread the instance through explicitly rather than via any global.
pub struct Runtime {
    pub(crate) srv: Box<dyn Service>,
    pub(crate) logbits: LogBits,
    pub(crate) running: SlotVec<Box<Proc>>,
    pub(crate) blocked: SlotVec<Box<Proc>>,
    pub(crate) rng: SmallRng,
    pub(crate) root: *mut Proc,
    pub(crate) ports: PortTable,
    pub(crate) live_allocs: usize,
    pub(crate) layout: FrameLayout,
}

impl Runtime {
    pub fn new(srv: Box<dyn Service>) -> Runtime {
        Runtime::build(srv, SmallRng::from_os_rng())
    }

    /// A runtime with a deterministic scheduler, for tests.
    pub fn with_seed(srv: Box<dyn Service>, seed: u64) -> Runtime {
        Runtime::build(srv, SmallRng::seed_from_u64(seed))
    }

    fn build(srv: Box<dyn Service>, rng: SmallRng) -> Runtime {
        Runtime {
            srv,
            logbits: LogBits::from_env(),
            running: SlotVec::new(),
            blocked: SlotVec::new(),
            rng,
            root: ptr::null_mut(),
            ports: PortTable::new(),
            live_allocs: 0,
            layout: X86,
        }
    }

    pub fn set_logbits(&mut self, bits: LogBits) {
        self.logbits = bits;
    }

    pub fn layout(&self) -> FrameLayout {
        self.layout
    }

    /// The root proc, or null before [`Runtime::run`] spawns it. The
    /// pointer outlives the proc itself; it is only an identity after
    /// teardown.
    pub fn root(&self) -> *mut Proc {
        self.root
    }

    pub fn live_allocs(&self) -> usize {
        self.live_allocs
    }

    /// Render and deliver a log line if any of `bits` is enabled.
    pub(crate) fn log(&mut self, bits: LogBits, msg: impl FnOnce() -> String) {
        if self.logbits.intersects(bits) {
            let line = msg();
            self.srv.log(&line);
        }
    }

    pub(crate) fn logptr(&mut self, msg: &str, val: usize) {
        if self.logbits.intersects(LogBits::MEM) {
            let line = format!("{} {:#x}", msg, val);
            self.srv.log(&line);
        }
    }

    pub(crate) fn invariant_failure(&mut self, expr: &str, file: &str, line: u32) -> ! {
        self.srv.fatal(expr, file, line)
    }

    /// Counted allocation through the host allocator. Every outstanding
    /// allocation must be returned through [`Runtime::free`] before the
    /// main loop ends.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let p = self.srv.alloc(size);
        if p.is_null() {
            self.invariant_failure("allocation failed", file!(), line!());
        }
        self.live_allocs += 1;
        self.log(LogBits::MEM, || {
            format!("malloc({}) -> {:#x}", size, p as usize)
        });
        p
    }

    /// Counted zeroed allocation.
    pub fn alloc_zeroed(&mut self, size: usize) -> *mut u8 {
        let p = self.alloc(size);
        unsafe { ptr::write_bytes(p, 0, size) };
        p
    }

    /// # Safety
    ///
    /// `p` must be null or a live allocation from this runtime.
    pub unsafe fn realloc(&mut self, p: *mut u8, size: usize) -> *mut u8 {
        let q = self.srv.realloc(p, size);
        if q.is_null() {
            self.invariant_failure("reallocation failed", file!(), line!());
        }
        if p.is_null() {
            self.live_allocs += 1;
        }
        self.log(LogBits::MEM, || {
            format!("realloc({:#x}, {}) -> {:#x}", p as usize, size, q as usize)
        });
        q
    }

    /// # Safety
    ///
    /// `p` must be a live allocation from this runtime.
    pub unsafe fn free(&mut self, p: *mut u8) {
        self.log(LogBits::MEM, || format!("free({:#x})", p as usize));
        if p.is_null() {
            self.invariant_failure("freeing a null pointer", file!(), line!());
        }
        self.srv.free(p);
        if self.live_allocs == 0 {
            self.invariant_failure("free with no outstanding allocations", file!(), line!());
        }
        self.live_allocs -= 1;
    }

    pub fn n_live_procs(&self) -> usize {
        self.running.len() + self.blocked.len()
    }

    /// Pick one runnable proc uniformly at random, or report that the
    /// loop is done.
    fn sched(&mut self) -> Option<*mut Proc> {
        if self.running.is_empty() {
            self.log(LogBits::RT | LogBits::PROC, || {
                "no schedulable procs".to_string()
            });
            return None;
        }
        let i = self.rng.random_range(0..self.running.len());
        self.running.get_mut(i).map(|b| &mut **b as *mut Proc)
    }

    /// Spawn the root proc and run the scheduling loop until no runnable
    /// procs remain, then tear everything down. A nonzero outstanding
    /// allocation count at that point is a leak and is fatal.
    pub fn run(&mut self, main_fn: usize, main_exit_proc_glue: usize) {
        self.log(LogBits::RT, || {
            "control is in the weft runtime".to_string()
        });
        self.logptr("main fn", main_fn);
        self.logptr("main exit-proc glue", main_exit_proc_glue);

        let root = match self.spawn(ptr::null_mut(), main_exit_proc_glue, main_fn, 0) {
            Ok(p) => p,
            Err(e) => {
                let msg = e.to_string();
                self.invariant_failure(&msg, file!(), line!());
            }
        };
        self.root = root;
        self.logptr("root proc", root as usize);

        while let Some(p) = self.sched() {
            self.log(LogBits::PROC, || {
                format!("activating proc {:#x}", p as usize)
            });
            unsafe {
                (*p).state = ProcState::Running;
                self.srv.activate(p);
            }

            let state = unsafe { (*p).state };
            self.log(LogBits::PROC, || {
                format!(
                    "returned from proc {:#x} in state '{}'",
                    p as usize,
                    state.name()
                )
            });

            let sp_ok = unsafe { (*(*p).stk).contains((*p).saved_sp) };
            if !sp_ok {
                self.invariant_failure(
                    "saved stack pointer outside the current segment",
                    file!(),
                    line!(),
                );
            }

            match state {
                ProcState::Running | ProcState::Failing => {}
                ProcState::CallingHost => {
                    match self.dispatch(p) {
                        Ok(Disposition::CurrentDeleted) => continue,
                        Ok(Disposition::Handled) => {}
                        Err(e) if e.is_recoverable() => {
                            self.log(LogBits::ERR | LogBits::COMM, || e.to_string());
                        }
                        Err(e) => {
                            let msg = e.to_string();
                            self.invariant_failure(&msg, file!(), line!());
                        }
                    }
                    // An upcall that did not block the proc leaves it
                    // runnable; no vector move is needed.
                    unsafe {
                        if (*p).state == ProcState::CallingHost {
                            (*p).state = ProcState::Running;
                        }
                    }
                }
                ProcState::BlockedExited => {
                    // A self-exited proc lingers, still owned by whoever
                    // holds its handle; move it to the blocked vector
                    // through the usual machinery.
                    unsafe {
                        (*p).state = ProcState::Running;
                    }
                    self.transition(p, ProcState::Running, ProcState::BlockedExited);
                    unsafe {
                        // Its own reference ends when it exits.
                        if (*p).refcnt > 0 {
                            (*p).refcnt -= 1;
                        }
                    }
                }
                ProcState::BlockedReading | ProcState::BlockedWriting => {
                    self.invariant_failure(
                        "activation glue returned a proc still blocked",
                        file!(),
                        line!(),
                    );
                }
            }
        }

        self.log(LogBits::RT, || "main loop finished".to_string());

        let leaked = self.teardown();
        if leaked != 0 {
            self.srv
                .fatal("leaked memory in main loop", file!(), line!());
        }
    }

    /// Destroy every proc and every surviving port, returning the number
    /// of outstanding allocations.
    pub fn teardown(&mut self) -> usize {
        self.log(LogBits::PROC, || "deleting all running procs".to_string());
        while let Some(mut b) = self.running.pop() {
            // Reclaiming a proc that never exited releases the reference
            // it held on itself.
            if b.refcnt > 0 {
                b.refcnt -= 1;
            }
            self.destroy_proc(b);
        }
        self.log(LogBits::PROC, || "deleting all blocked procs".to_string());
        while let Some(mut b) = self.blocked.pop() {
            if b.refcnt > 0 {
                b.refcnt -= 1;
            }
            self.destroy_proc(b);
        }
        self.log(LogBits::PROC, || "deleting all dangling ports".to_string());
        for h in self.ports.live_handles() {
            self.destroy_port(h);
        }
        self.live_allocs
    }
}

/// Run a complete runtime to completion on the current thread.
pub fn main_loop(main_fn: usize, main_exit_proc_glue: usize, srv: Box<dyn Service>) {
    let mut rt = Runtime::new(srv);
    rt.run(main_fn, main_exit_proc_glue);
}

/// Library entry point for compiled programs: wrap the activation glue
/// in the default host service and run the main loop. Returns the
/// process exit code.
pub fn start(main_fn: usize, main_exit_proc_glue: usize, activate: ActivateFn) -> i32 {
    let srv = Box::new(StdService::new(activate));
    main_loop(main_fn, main_exit_proc_glue, srv);
    0
}
