use std::collections::HashMap;
use std::ptr;

use crate::arch::WORD;
use crate::error::Error;
use crate::gc::FrameGlueFns;
use crate::log::LogBits;
use crate::port::{Chan, PortHandle};
use crate::runtime::Runtime;
use crate::slot_vec::{Indexed, SlotVec};
use crate::stack::StackSeg;

/// Number of argument words in the upcall scratch area.
pub const MAX_UPCALL_ARGS: usize = 8;

/// Proc states. The discriminant values are ABI: guest code stores them
/// into the state word directly.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Running = 0,
    CallingHost = 1,
    Failing = 2,
    BlockedExited = 3,
    BlockedReading = 4,
    BlockedWriting = 5,
}

impl ProcState {
    pub fn name(self) -> &'static str {
        match self {
            ProcState::Running => "running",
            ProcState::CallingHost => "calling_host",
            ProcState::Failing => "failing",
            ProcState::BlockedExited => "blocked_exited",
            ProcState::BlockedReading => "blocked_reading",
            ProcState::BlockedWriting => "blocked_writing",
        }
    }

    /// Whether procs in this state live in the blocked vector rather
    /// than the runnable one.
    pub fn is_blocked_class(self) -> bool {
        matches!(
            self,
            ProcState::BlockedExited | ProcState::BlockedReading | ProcState::BlockedWriting
        )
    }
}

/// A lightweight cooperative execution context.
///
/// The leading fields up to and including `gc_alloc_chain` are ABI:
/// compiled guest code and the activation glue address them by offset.
/// `saved_sp` holds the guest stack pointer while the proc is suspended;
/// `host_sp` is where the glue stashes the runtime-side stack pointer
/// while the proc runs. An upcall is requested by writing `upcall_code`
/// and `upcall_args`, storing [`ProcState::CallingHost`] into `state`,
/// and returning through the glue.
#[repr(C)]
pub struct Proc {
    pub saved_sp: usize,
    pub host_sp: usize,
    pub stk: *mut StackSeg,
    pub state: ProcState,
    pub upcall_code: usize,
    pub upcall_args: [usize; MAX_UPCALL_ARGS],
    pub gc_alloc_chain: usize,
    /// Spawnee entry point, kept for logging and debugging.
    pub entry: usize,
    pub(crate) rt: *mut Runtime,
    pub(crate) idx: usize,
    pub(crate) refcnt: usize,
    pub(crate) chans: HashMap<PortHandle, Box<Chan>>,
}

impl Indexed for Box<Proc> {
    fn index(&self) -> usize {
        self.idx
    }

    fn set_index(&mut self, idx: usize) {
        self.idx = idx;
    }
}

unsafe fn push_word(spp: &mut *mut usize, val: usize) {
    **spp = val;
    *spp = (*spp).sub(1);
}

impl Runtime {
    /// Spawn a proc: allocate its first stack segment and synthesize the
    /// two frames that make the spawnee believe it was called by the
    /// exit glue. The new proc starts runnable.
    ///
    /// `spawner` is null only for the root proc, which must pass
    /// `callsz == 0`; every other spawn carries at least the implicit
    /// proc and output words in its call region.
    pub fn spawn(
        &mut self,
        spawner: *mut Proc,
        exit_glue: usize,
        spawnee_fn: usize,
        callsz: usize,
    ) -> Result<*mut Proc, Error> {
        if spawner.is_null() {
            if callsz != 0 {
                self.invariant_failure("root proc spawned with a call region", file!(), line!());
            }
        } else if callsz < 2 * WORD {
            return Err(Error::SpawnCallRegion {
                got: callsz,
                min: 2 * WORD,
            });
        }

        let stk = self.new_stack(0);
        let mut b = Box::new(Proc {
            saved_sp: 0,
            host_sp: 0,
            stk,
            state: ProcState::Running,
            upcall_code: 0,
            upcall_args: [0; MAX_UPCALL_ARGS],
            gc_alloc_chain: 0,
            entry: spawnee_fn,
            rt: self as *mut Runtime,
            idx: 0,
            refcnt: 1,
            chans: HashMap::new(),
        });
        let p = &mut *b as *mut Proc;
        unsafe {
            self.synthesize_context(p, spawner, exit_glue, spawnee_fn, callsz);
        }
        self.logptr("new proc", p as usize);
        self.logptr("exit-proc glue", exit_glue);
        self.logptr("spawnee", spawnee_fn);
        self.push_state_vec(b);
        Ok(p)
    }

    /// Lay down the initial context on a fresh stack segment.
    ///
    /// Two frames are synthesized. The upper exit-glue frame pretends to
    /// be mid-execution: proc and output cells, a zeroed return pc, the
    /// glue's callee-saves, and a zeroed frame-glue word below them. The
    /// spawnee frame beneath it carries the implicit proc/output/retpc
    /// words (retpc aimed at the exit glue), the entry instruction, and
    /// callee-saves whose frame-pointer slot addresses the upper frame's
    /// last callee-save, so the spawnee's epilogue restores the exit
    /// frame's frame pointer. Spawner call-region words, minus the
    /// spawner's own proc and output cells, are copied between the two.
    unsafe fn synthesize_context(
        &mut self,
        p: *mut Proc,
        spawner: *mut Proc,
        exit_glue: usize,
        spawnee_fn: usize,
        callsz: usize,
    ) {
        let layout = self.layout;
        let stk = (*p).stk;

        // Top word of the segment, aligned down to 16.
        let mut sp = (*stk).limit;
        sp -= WORD;
        sp &= !0xf;
        let mut spp = sp as *mut usize;

        push_word(&mut spp, p as usize); // proc
        push_word(&mut spp, 0); // output
        push_word(&mut spp, 0); // retpc
        for _ in 0..layout.callee_saves {
            push_word(&mut spp, 0);
        }
        // The spawnee's frame-pointer save will address this word, the
        // last callee-save of the exit frame.
        let frame_base = spp as usize + WORD;
        push_word(&mut spp, 0); // frame_glue_fns

        if !spawner.is_null() {
            let src = ((*spawner).saved_sp as *const usize)
                .add(1) // upcall return pc
                .add(layout.callee_saves) // glue callee-saves
                .add(1) // spawn-call output slot
                .add(1); // spawn-call proc slot
            let copy = callsz - 2 * WORD;
            spp = (spp as usize - copy) as *mut usize;
            ptr::copy_nonoverlapping(src as *const u8, spp as *mut u8, copy);
            spp = spp.sub(1);
        }

        // The implicit incoming args of the spawnee frame.
        push_word(&mut spp, p as usize); // proc
        push_word(&mut spp, 0); // output addr
        push_word(&mut spp, exit_glue); // retpc

        // The context the activation glue restores.
        push_word(&mut spp, spawnee_fn); // instruction to resume at
        for j in 0..layout.callee_saves {
            push_word(&mut spp, if j == layout.fp_slot { frame_base } else { 0 });
        }

        // The loop overshot by one word.
        (*p).saved_sp = spp as usize + WORD;
    }

    /// Tear a proc down: log its frame chain, check the refcount
    /// invariant, release the stack chain, and drop every outgoing
    /// channel. Ports it owned are orphaned for the teardown sweep.
    pub(crate) fn destroy_proc(&mut self, b: Box<Proc>) {
        let p = &*b as *const Proc as *mut Proc;
        self.log(LogBits::MEM | LogBits::PROC, || {
            format!("~proc {:#x}, refcnt={}", p as usize, b.refcnt)
        });

        unsafe {
            let mut fp = self.layout.frame_ptr(b.saved_sp);
            while fp != 0 {
                let glue = self.layout.frame_glue_word(fp);
                self.log(LogBits::MEM | LogBits::PROC, || {
                    format!("~proc frame fp={:#x}, glue fns={:#x}", fp, glue)
                });
                if glue != 0 {
                    let fns = &*(glue as *const FrameGlueFns);
                    let (mark, drop, reloc) = (fns.mark_glue, fns.drop_glue, fns.reloc_glue);
                    self.log(LogBits::MEM | LogBits::PROC, || {
                        format!("~proc mark={:#x} drop={:#x} reloc={:#x}", mark, drop, reloc)
                    });
                }
                fp = self.layout.prev_frame_ptr(fp);
            }
        }

        // Every destruction path has already released the proc's own
        // reference: the exit branch of the main loop, del-proc, and the
        // teardown sweep.
        if b.refcnt != 0 {
            self.invariant_failure("destroying a proc that is still referenced", file!(), line!());
        }

        self.free_stack_chain(b.stk);

        let handles: Vec<PortHandle> = b.chans.keys().copied().collect();
        for h in handles {
            self.drop_chan(p, h);
        }

        self.ports.orphan_owned_by(p);
    }

    /// Move a proc between states, through the state vectors: remove by
    /// stored index, set the new state, push into the destination vector.
    pub(crate) fn transition(&mut self, p: *mut Proc, from: ProcState, to: ProcState) {
        self.log(LogBits::PROC, || {
            format!(
                "proc {:#x} state change '{}' -> '{}'",
                p as usize,
                from.name(),
                to.name()
            )
        });
        let cur = unsafe { (*p).state };
        if cur != from {
            self.invariant_failure("state transition from wrong source state", file!(), line!());
        }
        let mut b = self.remove_from_state_vec(p);
        b.state = to;
        self.push_state_vec(b);
    }

    pub(crate) fn push_state_vec(&mut self, b: Box<Proc>) {
        let state = b.state;
        let addr = &*b as *const Proc as usize;
        self.log(LogBits::MEM | LogBits::PROC, || {
            format!("adding proc {:#x} in state '{}'", addr, state.name())
        });
        self.vec_for(state).push(b);
    }

    pub(crate) fn remove_from_state_vec(&mut self, p: *mut Proc) -> Box<Proc> {
        let (state, idx) = unsafe { ((*p).state, (*p).idx) };
        self.log(LogBits::MEM | LogBits::PROC, || {
            format!("removing proc {:#x} in state '{}'", p as usize, state.name())
        });
        let holds = self
            .vec_for(state)
            .get(idx)
            .map(|b| &**b as *const Proc == p)
            .unwrap_or(false);
        if !holds {
            self.invariant_failure("state vector slot does not hold the proc", file!(), line!());
        }
        let b = self.vec_for(state).swap_delete(idx);
        let hint = self.n_live_procs();
        self.vec_for(state).trim(hint);
        b
    }

    fn vec_for(&mut self, state: ProcState) -> &mut SlotVec<Box<Proc>> {
        if state.is_blocked_class() {
            &mut self.blocked
        } else {
            &mut self.running
        }
    }

    /// Put a proc on the failing path. It stays in the runnable vector;
    /// the present design reaches the fatal path before the scheduler
    /// sees it again.
    pub(crate) fn fail_proc(&mut self, p: *mut Proc) {
        let (addr, refcnt, state) = unsafe { (p as usize, (*p).refcnt, (*p).state) };
        self.log(LogBits::PROC, || {
            format!("fail_proc({:#x}), refcnt={}", addr, refcnt)
        });
        if self.n_live_procs() == 0 {
            self.invariant_failure("failing a proc with no live procs", file!(), line!());
        }
        self.transition(p, state, ProcState::Failing);
    }
}
