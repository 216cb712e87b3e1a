#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use weft::{LogBits, Proc, ProcState, Runtime, Service, Symbol, Ticket};

/// Fake entry-point and glue addresses for scripted procs. Nothing ever
/// jumps to these; they only key scripts and fill synthesized frames.
pub const ROOT: usize = 0x1000;
pub const PEER_A: usize = 0x1100;
pub const PEER_B: usize = 0x1200;
pub const EXIT_GLUE: usize = 0x2000;

/// What a scripted guest does on one activation.
pub enum Act {
    /// Write the upcall scratch and suspend into calling-host.
    Upcall { code: usize, args: [usize; 8] },
    /// Run off the end of the spawnee into the exit glue.
    Exit,
    /// Return in an arbitrary state (for glue-contract tests).
    SetState(ProcState),
}

pub type Step = Box<dyn FnOnce(*mut Proc) -> Act>;

/// A `Service` whose activation routine plays back scripted guest
/// steps, keyed by the proc's entry address. Log lines are captured;
/// fatal panics so tests can assert on it.
pub struct ScriptService {
    scripts: HashMap<usize, VecDeque<Step>>,
    pub logs: Rc<RefCell<Vec<String>>>,
    pub tickets: Rc<RefCell<Vec<Ticket>>>,
}

impl ScriptService {
    pub fn new() -> ScriptService {
        ScriptService {
            scripts: HashMap::new(),
            logs: Rc::new(RefCell::new(Vec::new())),
            tickets: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn script(&mut self, entry: usize, steps: Vec<Step>) {
        self.scripts.insert(entry, steps.into());
    }
}

impl Service for ScriptService {
    fn log(&mut self, msg: &str) {
        self.logs.borrow_mut().push(msg.to_string());
    }

    fn fatal(&mut self, expr: &str, file: &str, line: u32) -> ! {
        panic!("fatal, '{}' failed, {}:{}", expr, file, line);
    }

    fn alloc(&mut self, size: usize) -> *mut u8 {
        unsafe { libc::malloc(size) as *mut u8 }
    }

    unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        libc::realloc(ptr as *mut libc::c_void, size) as *mut u8
    }

    unsafe fn free(&mut self, ptr: *mut u8) {
        libc::free(ptr as *mut libc::c_void);
    }

    fn lookup(&mut self, _sym: &str) -> Option<Symbol> {
        None
    }

    unsafe fn activate(&mut self, p: *mut Proc) {
        let entry = (*p).entry;
        let act = match self.scripts.get_mut(&entry).and_then(|q| q.pop_front()) {
            Some(step) => step(p),
            None => Act::Exit,
        };
        match act {
            Act::Upcall { code, args } => {
                (*p).upcall_code = code;
                (*p).upcall_args = args;
                (*p).state = ProcState::CallingHost;
            }
            Act::Exit => (*p).state = ProcState::BlockedExited,
            Act::SetState(state) => (*p).state = state,
        }
    }

    fn spawn_runtime(&mut self, ticket: Ticket) {
        self.tickets.borrow_mut().push(ticket);
    }
}

/// A fixed-args upcall step.
pub fn upcall(code: usize, args: &[usize]) -> Step {
    let mut words = [0usize; 8];
    words[..args.len()].copy_from_slice(args);
    Box::new(move |_| Act::Upcall { code, args: words })
}

/// An upcall whose args are computed at activation time (e.g. from an
/// out-slot an earlier upcall filled).
pub fn upcall_with(f: impl FnOnce(*mut Proc) -> (usize, Vec<usize>) + 'static) -> Step {
    Box::new(move |p| {
        let (code, args) = f(p);
        let mut words = [0usize; 8];
        words[..args.len()].copy_from_slice(&args);
        Act::Upcall { code, args: words }
    })
}

pub fn exit() -> Step {
    Box::new(|_| Act::Exit)
}

/// Return from activation in an arbitrary state.
pub fn set_state(state: ProcState) -> Step {
    Box::new(move |_| Act::SetState(state))
}

/// A word-sized out-slot cell, leaked so scripted guests can write
/// through its address at any point in the run.
pub fn cell() -> *mut usize {
    Box::leak(Box::new(0usize))
}

pub fn read_cell(c: *mut usize) -> usize {
    unsafe { *c }
}

/// Build a deterministic runtime around a scripted service with all log
/// categories enabled.
pub fn runtime(svc: ScriptService, seed: u64) -> Runtime {
    let mut rt = Runtime::with_seed(Box::new(svc), seed);
    rt.set_logbits(LogBits::ALL);
    rt
}

pub fn logs_matching(logs: &Rc<RefCell<Vec<String>>>, pat: &str) -> usize {
    logs.borrow().iter().filter(|l| l.contains(pat)).count()
}

pub fn logs_contain(logs: &Rc<RefCell<Vec<String>>>, pat: &str) -> bool {
    logs_matching(logs, pat) > 0
}
