//! Ports, channels, and the buffered send/receive protocol.
//!
//! A port is a receive endpoint owned by one proc. Each sending proc
//! keeps at most one channel per destination port; the channel buffers
//! outbound units and remembers whether its sender is blocked waiting
//! for a drain. Transmission moves exactly one unit per attempt:
//!
//! - A reader blocks itself, then attempts transmission from one
//!   randomly chosen channel with pending data.
//! - A writer copies its unit into the channel, blocks itself, then
//!   attempts transmission; if data is still buffered the channel joins
//!   the port's writers vector.
//! - A completed transmission copies one unit to the reader's
//!   destination, wakes the channel's blocked writer if any, and wakes
//!   the reader.

use std::ptr;

use rand::Rng;

use crate::circ::CircBuf;
use crate::error::Error;
use crate::log::LogBits;
use crate::proc::{Proc, ProcState};
use crate::runtime::Runtime;
use crate::slot_vec::{Indexed, SlotVec};

const HALF_BITS: usize = usize::BITS as usize / 2;
const SLOT_MASK: usize = (1 << HALF_BITS) - 1;

/// Guest-visible port handle: a non-zero machine word encoding an arena
/// slot (plus one) in the low half and a generation in the high half.
/// Zero is the null port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle(usize);

impl PortHandle {
    fn encode(slot: usize, generation: usize) -> PortHandle {
        PortHandle(((generation & SLOT_MASK) << HALF_BITS) | (slot + 1))
    }

    pub fn from_word(word: usize) -> Option<PortHandle> {
        if word == 0 {
            None
        } else {
            Some(PortHandle(word))
        }
    }

    pub fn word(self) -> usize {
        self.0
    }

    /// The arena slot, or None for a word that was never a handle.
    fn slot(self) -> Option<usize> {
        (self.0 & SLOT_MASK).checked_sub(1)
    }

    fn generation(self) -> usize {
        self.0 >> HALF_BITS
    }
}

/// A receive endpoint. Live references come from guest handles, weak
/// references from channels naming the port; the port is destroyed when
/// both reach zero, or by the teardown sweep.
pub struct Port {
    pub(crate) owner: *mut Proc,
    pub(crate) live_refcnt: usize,
    pub(crate) weak_refcnt: usize,
    pub(crate) unit_sz: usize,
    pub(crate) writers: SlotVec<ChanRef>,
}

/// A per-sender buffered queue of unit-sized messages bound for one
/// port.
pub struct Chan {
    pub(crate) port: PortHandle,
    pub(crate) sender: *mut Proc,
    /// Whether this channel is in its port's writers vector.
    pub(crate) queued: bool,
    /// Position in the writers vector, maintained by swap-delete.
    pub(crate) idx: usize,
    /// Proc to wake on drain; null when no writer is blocked.
    pub(crate) blocked: *mut Proc,
    pub(crate) buf: CircBuf,
}

/// Writers-vector entry. Channels are boxed inside their sender's
/// channel table, so the pointer is stable for the channel's lifetime.
#[derive(Clone, Copy)]
pub(crate) struct ChanRef(pub *mut Chan);

impl Indexed for ChanRef {
    fn index(&self) -> usize {
        unsafe { (*self.0).idx }
    }

    fn set_index(&mut self, idx: usize) {
        unsafe { (*self.0).idx = idx }
    }
}

struct PortSlot {
    generation: usize,
    port: Option<Box<Port>>,
}

/// Runtime-owned port arena; doubles as the registry the teardown sweep
/// walks for ports that outlived their owner.
pub(crate) struct PortTable {
    slots: Vec<PortSlot>,
    free: Vec<usize>,
}

impl PortTable {
    pub fn new() -> PortTable {
        PortTable {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, port: Port) -> PortHandle {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot].port = Some(Box::new(port));
                PortHandle::encode(slot, self.slots[slot].generation)
            }
            None => {
                self.slots.push(PortSlot {
                    generation: 0,
                    port: Some(Box::new(port)),
                });
                PortHandle::encode(self.slots.len() - 1, 0)
            }
        }
    }

    pub fn get_ptr(&mut self, h: PortHandle) -> Option<*mut Port> {
        let slot = self.slots.get_mut(h.slot()?)?;
        if slot.generation != h.generation() {
            return None;
        }
        slot.port.as_mut().map(|b| &mut **b as *mut Port)
    }

    fn remove(&mut self, h: PortHandle) -> Option<Box<Port>> {
        let idx = h.slot()?;
        let slot = self.slots.get_mut(idx)?;
        if slot.generation != h.generation() {
            return None;
        }
        let port = slot.port.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(idx);
        Some(port)
    }

    pub fn live_handles(&self) -> Vec<PortHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.port.is_some())
            .map(|(i, s)| PortHandle::encode(i, s.generation))
            .collect()
    }

    /// Null the owner of every port the dying proc owned; such ports
    /// linger until their refcounts drain or the teardown sweep finds
    /// them.
    pub fn orphan_owned_by(&mut self, p: *mut Proc) {
        for slot in &mut self.slots {
            if let Some(port) = &mut slot.port {
                if port.owner == p {
                    port.owner = ptr::null_mut();
                }
            }
        }
    }
}

impl Runtime {
    /// Create a port owned by `owner`. The live refcount starts at zero;
    /// the caller bumps it when handing the handle to guest code.
    pub fn new_port(&mut self, owner: *mut Proc, unit_sz: usize) -> PortHandle {
        let h = self.ports.insert(Port {
            owner,
            live_refcnt: 0,
            weak_refcnt: 0,
            unit_sz,
            writers: SlotVec::new(),
        });
        self.log(LogBits::MEM | LogBits::COMM, || {
            format!(
                "new port(owner={:#x}, unit_sz={}) -> {:#x}",
                owner as usize,
                unit_sz,
                h.word()
            )
        });
        h
    }

    /// Guest-side drop of a port handle: decrement the live refcount and
    /// destroy the port once nothing references it.
    pub fn del_port(&mut self, h: PortHandle) -> Result<(), Error> {
        let port = self
            .ports
            .get_ptr(h)
            .ok_or(Error::PortUnknown(h.word()))?;
        unsafe {
            let (live, weak) = ((*port).live_refcnt, (*port).weak_refcnt);
            self.log(LogBits::UPCALL | LogBits::MEM | LogBits::COMM, || {
                format!(
                    "upcall del_port({:#x}), live refcnt={}, weak refcnt={}",
                    h.word(),
                    live,
                    weak
                )
            });
            if live == 0 {
                self.invariant_failure("dropping a port handle nobody holds", file!(), line!());
            }
            (*port).live_refcnt -= 1;
            if (*port).live_refcnt == 0 && (*port).weak_refcnt == 0 {
                self.destroy_port(h);
            }
        }
        Ok(())
    }

    /// Destroy a port outright, discarding every channel still queued in
    /// its writers vector and removing it from the registry.
    pub(crate) fn destroy_port(&mut self, h: PortHandle) {
        let Some(mut port) = self.ports.remove(h) else {
            return;
        };
        self.log(LogBits::COMM | LogBits::MEM, || {
            format!("~port {:#x}", h.word())
        });
        while let Some(cr) = port.writers.pop() {
            unsafe {
                let chan = cr.0;
                let sender = (*chan).sender;
                if !(*chan).blocked.is_null() {
                    self.log(LogBits::ERR | LogBits::COMM, || {
                        format!(
                            "discarding queued channel {:#x} with a blocked writer",
                            chan as usize
                        )
                    });
                }
                (*sender).chans.remove(&h);
            }
        }
    }

    /// Drop a sender's channel to `h`: unqueue it from the port's
    /// writers vector, release the weak reference, and destroy the port
    /// if that was the last reference. Buffered units are discarded.
    pub(crate) fn drop_chan(&mut self, sender: *mut Proc, h: PortHandle) {
        let Some(chan) = (unsafe { (*sender).chans.remove(&h) }) else {
            return;
        };
        self.log(LogBits::MEM | LogBits::COMM, || {
            format!("~chan {:#x}", &*chan as *const Chan as usize)
        });
        if let Some(port) = self.ports.get_ptr(h) {
            unsafe {
                if chan.queued {
                    (*port).writers.swap_delete(chan.idx);
                }
                if (*port).weak_refcnt == 0 {
                    self.invariant_failure("channel outlived its weak reference", file!(), line!());
                }
                (*port).weak_refcnt -= 1;
                if (*port).weak_refcnt == 0 && (*port).live_refcnt == 0 {
                    self.destroy_port(h);
                }
            }
        }
    }

    /// The send upcall: buffer one unit from `sptr` on the channel for
    /// (`src`, port), block the sender, attempt a transmission, and
    /// queue the channel on the port if data is still pending.
    pub fn send(&mut self, src: *mut Proc, port_word: usize, sptr: *const u8) -> Result<(), Error> {
        self.log(LogBits::UPCALL | LogBits::COMM, || {
            format!(
                "upcall send(proc={:#x}, port={:#x})",
                src as usize, port_word
            )
        });
        let h = PortHandle::from_word(port_word).ok_or(Error::NullPort)?;
        let port = self
            .ports
            .get_ptr(h)
            .ok_or(Error::PortUnknown(port_word))?;

        unsafe {
            let chan: *mut Chan = match (*src).chans.get_mut(&h) {
                Some(c) => &mut **c as *mut Chan,
                None => {
                    let mut c = Box::new(Chan {
                        port: h,
                        sender: src,
                        queued: false,
                        idx: 0,
                        blocked: ptr::null_mut(),
                        buf: CircBuf::new((*port).unit_sz),
                    });
                    let cp = &mut *c as *mut Chan;
                    (*src).chans.insert(h, c);
                    (*port).weak_refcnt += 1;
                    self.log(LogBits::MEM | LogBits::COMM, || {
                        format!("new chan {:#x} for port {:#x}", cp as usize, port_word)
                    });
                    cp
                }
            };
            if !((*chan).blocked.is_null() || (*chan).blocked == src) {
                self.invariant_failure("channel blocked on a foreign proc", file!(), line!());
            }
            debug_assert_eq!((*chan).port, h);

            let owner = (*port).owner;
            if owner.is_null() {
                return Err(Error::PortOrphaned);
            }

            (*chan).blocked = src;
            (*chan).buf.push_raw(sptr)?;
            self.transition(src, ProcState::CallingHost, ProcState::BlockedWriting);
            self.attempt_transmission(chan, owner);
            if !(*chan).buf.is_empty() && !(*chan).queued {
                (*chan).queued = true;
                (*port).writers.push(ChanRef(chan));
            }
        }
        Ok(())
    }

    /// The receive upcall: block the reader, then attempt a transmission
    /// from one uniformly chosen channel with pending data. The
    /// destination address sits in the reader's first upcall argument
    /// slot.
    pub fn recv(&mut self, dst: *mut Proc, port_word: usize) -> Result<(), Error> {
        self.log(LogBits::UPCALL | LogBits::COMM, || {
            format!(
                "upcall recv(proc={:#x}, port={:#x})",
                dst as usize, port_word
            )
        });
        let h = PortHandle::from_word(port_word).ok_or(Error::NullPort)?;
        let port = self
            .ports
            .get_ptr(h)
            .ok_or(Error::PortUnknown(port_word))?;

        unsafe {
            if (*port).owner != dst {
                self.invariant_failure("receive on a port the proc does not own", file!(), line!());
            }

            self.transition(dst, ProcState::CallingHost, ProcState::BlockedReading);

            if (*port).writers.is_empty() {
                self.log(LogBits::COMM, || {
                    format!("no writers sending to port {:#x}", port_word)
                });
                return Ok(());
            }
            let i = self.rng.random_range(0..(*port).writers.len());
            let cr = *(*port).writers.get(i).unwrap();
            let chan = cr.0;
            if (*chan).idx != i {
                self.invariant_failure("writers vector index out of sync", file!(), line!());
            }
            if self.attempt_transmission(chan, dst) {
                (*port).writers.swap_delete(i);
                let hint = (*port).writers.len();
                (*port).writers.trim(hint);
                (*chan).queued = false;
            }
        }
        Ok(())
    }

    /// Move at most one unit from `chan` to `dst`. Returns whether a
    /// unit was delivered; an incomplete attempt changes no state.
    pub(crate) fn attempt_transmission(&mut self, chan: *mut Chan, dst: *mut Proc) -> bool {
        unsafe {
            if (*dst).state != ProcState::BlockedReading {
                self.log(LogBits::COMM, || {
                    "dst in non-reading state, transmission incomplete".to_string()
                });
                return false;
            }

            if !(*chan).blocked.is_null() && (*(*chan).blocked).state != ProcState::BlockedWriting {
                self.invariant_failure("blocked sender not in blocked-writing", file!(), line!());
            }

            if (*chan).buf.is_empty() {
                self.log(LogBits::COMM, || {
                    "buffer empty, transmission incomplete".to_string()
                });
                return false;
            }

            let dptr = (*dst).upcall_args[0] as *mut u8;
            (*chan).buf.shift_raw(dptr);

            if !(*chan).blocked.is_null() {
                let writer = (*chan).blocked;
                self.transition(writer, ProcState::BlockedWriting, ProcState::Running);
                (*chan).blocked = ptr::null_mut();
            }

            self.transition(dst, ProcState::BlockedReading, ProcState::Running);
        }
        self.log(LogBits::COMM, || "transmission complete".to_string());
        true
    }
}
