use std::mem;
use std::ptr;

use crate::log::LogBits;
use crate::proc::Proc;
use crate::runtime::Runtime;

/// Smallest usable payload of a stack segment.
pub const MIN_STACK_BYTES: usize = 0x300;

/// One chunk of a proc's segmented stack. Segments are chained doubly;
/// the usable byte region starts immediately after this header and runs
/// up to `limit`.
#[repr(C)]
#[derive(Debug)]
pub struct StackSeg {
    pub prev: *mut StackSeg,
    pub next: *mut StackSeg,
    pub checker_token: usize,
    pub limit: usize,
}

impl StackSeg {
    pub fn data(&self) -> *mut u8 {
        unsafe { (self as *const StackSeg as *mut u8).add(mem::size_of::<StackSeg>()) }
    }

    pub fn usable(&self) -> usize {
        self.limit - self.data() as usize
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.data() as usize && addr < self.limit
    }
}

impl Runtime {
    /// Allocate a fresh, unchained segment of at least `minsz` usable
    /// bytes and register it with the host's stack-aware memory checker.
    pub(crate) fn new_stack(&mut self, minsz: usize) -> *mut StackSeg {
        let minsz = minsz.max(MIN_STACK_BYTES);
        let seg = self.alloc(mem::size_of::<StackSeg>() + minsz) as *mut StackSeg;
        unsafe {
            ptr::write(
                seg,
                StackSeg {
                    prev: ptr::null_mut(),
                    next: ptr::null_mut(),
                    checker_token: 0,
                    limit: 0,
                },
            );
            let data = (*seg).data();
            (*seg).limit = data as usize + minsz;
            (*seg).checker_token = self.srv.register_stack(data, (*seg).limit as *mut u8);
            self.logptr("new stack segment", seg as usize);
            self.logptr("segment limit", (*seg).limit);
        }
        seg
    }

    /// Free a proc's entire stack chain, from the bottom-most segment
    /// forwards.
    pub(crate) fn free_stack_chain(&mut self, mut stk: *mut StackSeg) {
        unsafe {
            while !(*stk).prev.is_null() {
                stk = (*stk).prev;
            }
            while !stk.is_null() {
                let nxt = (*stk).next;
                self.logptr("freeing stack segment", stk as usize);
                let token = (*stk).checker_token;
                self.srv.unregister_stack(token);
                self.free(stk as *mut u8);
                stk = nxt;
            }
        }
        self.log(LogBits::MEM, || "freed stack chain".to_string());
    }

    /// The stack-growth upcall: a function prologue found that its new
    /// frame of `n_frame_bytes` will not fit in the current segment, with
    /// `n_call_bytes` of caller-laid call region already sitting at the
    /// saved stack pointer.
    ///
    /// Reuses the segment after the current one when it is big enough,
    /// otherwise allocates a segment of `n_frame_bytes` and splices it in
    /// directly after the current segment, preserving any existing
    /// successor. Either way the call region is transplanted to the top
    /// of the new segment and the saved stack pointer moved to the
    /// transplanted copy's base; the prologue then retries.
    pub fn grow_stack(&mut self, p: *mut Proc, n_call_bytes: usize, n_frame_bytes: usize) {
        unsafe {
            let cur = (*p).stk;
            let mut nstk = (*cur).next;
            if !nstk.is_null() {
                if (*nstk).usable() < n_frame_bytes {
                    let fresh = self.new_stack(n_frame_bytes);
                    (*fresh).next = nstk;
                    (*nstk).prev = fresh;
                    nstk = fresh;
                }
            } else {
                nstk = self.new_stack(n_frame_bytes);
            }
            (*cur).next = nstk;
            (*nstk).prev = cur;

            let target = (*nstk).limit - n_call_bytes;
            ptr::copy_nonoverlapping((*p).saved_sp as *const u8, target as *mut u8, n_call_bytes);
            (*p).stk = nstk;
            (*p).saved_sp = target;
            self.logptr("transplanted call region to", target);
        }
    }
}
