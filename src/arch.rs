//! Activation-frame layout for the target the guest code was compiled
//! for.
//!
//! The runtime never executes a stack switch itself; the host's
//! activation glue does that. What the runtime does do is synthesize the
//! initial context a proc starts from and walk frame-pointer chains, and
//! both of those depend on how many callee-saved registers the glue
//! pushes and which slot carries the frame pointer. That knowledge lives
//! here so the rest of the crate is architecture-agnostic.

use crate::proc::Proc;

/// Machine word size in bytes.
pub const WORD: usize = std::mem::size_of::<usize>();

/// The host routine that restores a proc's saved context and jumps to
/// its resume address, returning when the proc next suspends.
pub type ActivateFn = unsafe extern "C" fn(*mut Proc);

/// Callee-save geometry of the activation glue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Number of callee-saved register slots the glue pushes.
    pub callee_saves: usize,
    /// Which of those slots (0-based, in push order) holds the frame
    /// pointer.
    pub fp_slot: usize,
}

/// Reference layout: frame pointer plus three other saves.
pub const X86: FrameLayout = FrameLayout {
    callee_saves: 4,
    fp_slot: 0,
};

impl FrameLayout {
    /// Read the saved frame pointer out of a block of callee-save words.
    /// `top` points at the last (lowest-addressed) callee-save.
    ///
    /// # Safety
    ///
    /// `top` must point at `callee_saves` readable words.
    pub unsafe fn callee_save_fp(&self, top: *const usize) -> usize {
        *top.add(self.callee_saves - (self.fp_slot + 1))
    }

    /// Current frame pointer of a suspended proc: its saved stack pointer
    /// points at the last callee-save on the proc stack.
    ///
    /// # Safety
    ///
    /// `sp` must be the saved stack pointer of a suspended proc.
    pub unsafe fn frame_ptr(&self, sp: usize) -> usize {
        self.callee_save_fp(sp as *const usize)
    }

    /// Previous frame pointer: a frame pointer also points at the last
    /// callee-save of the frame above it.
    ///
    /// # Safety
    ///
    /// `fp` must be a frame pointer produced by this layout.
    pub unsafe fn prev_frame_ptr(&self, fp: usize) -> usize {
        self.callee_save_fp(fp as *const usize)
    }

    /// Address of the frame-glue descriptor word, one word below the
    /// frame pointer.
    ///
    /// # Safety
    ///
    /// `fp` must be a frame pointer with a valid word below it.
    pub unsafe fn frame_glue_word(&self, fp: usize) -> usize {
        *((fp - WORD) as *const usize)
    }
}
