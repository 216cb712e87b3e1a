use std::ffi::CStr;

use libc::c_char;

use crate::error::Error;
use crate::log::LogBits;
use crate::proc::{Proc, MAX_UPCALL_ARGS};
use crate::runtime::Runtime;
use crate::service::Ticket;
use crate::value::Str;

/// Upcall code words, as compiled guest code emits them.
pub mod codes {
    pub const LOG_INT: usize = 0;
    pub const LOG_STR: usize = 1;
    pub const NEW_PROC: usize = 2;
    pub const DEL_PROC: usize = 3;
    pub const FAIL: usize = 4;
    pub const MALLOC: usize = 5;
    pub const FREE: usize = 6;
    pub const NEW_PORT: usize = 7;
    pub const DEL_PORT: usize = 8;
    pub const SEND: usize = 9;
    pub const RECV: usize = 10;
    pub const NEW_STR: usize = 11;
    pub const GROW_PROC: usize = 12;
    pub const TRACE_WORD: usize = 13;
    pub const TRACE_STR: usize = 14;
    pub const NEW_THREAD: usize = 15;
}

/// An upcall decoded from a proc's scratch area. The word-array layout
/// is ABI; past this decoder the runtime only sees typed requests.
///
/// Upcalls that produce a value treat their first argument as a pointer
/// into the guest stack to write the result through.
#[derive(Debug)]
pub enum Upcall {
    LogInt {
        val: i32,
    },
    LogStr {
        s: *const Str,
    },
    NewProc {
        out: *mut usize,
        exit_glue: usize,
        spawnee_fn: usize,
        callsz: usize,
    },
    DelProc {
        target: *mut Proc,
    },
    Fail {
        expr: *const c_char,
        file: *const c_char,
        line: usize,
    },
    Malloc {
        out: *mut usize,
        size: usize,
    },
    Free {
        ptr: *mut u8,
    },
    NewPort {
        out: *mut usize,
        unit_sz: usize,
    },
    DelPort {
        port: usize,
    },
    Send {
        port: usize,
        src: *const u8,
    },
    Recv {
        port: usize,
    },
    NewStr {
        out: *mut usize,
        bytes: *const u8,
        fill: usize,
    },
    GrowProc {
        n_call_bytes: usize,
        n_frame_bytes: usize,
    },
    TraceWord {
        val: usize,
    },
    TraceStr {
        s: *const c_char,
    },
    NewThread {
        out: *mut usize,
        exit_glue: usize,
        spawnee_fn: usize,
    },
}

impl Upcall {
    pub fn decode(code: usize, args: &[usize; MAX_UPCALL_ARGS]) -> Result<Upcall, Error> {
        let upcall = match code {
            codes::LOG_INT => Upcall::LogInt {
                val: args[0] as i32,
            },
            codes::LOG_STR => Upcall::LogStr {
                s: args[0] as *const Str,
            },
            codes::NEW_PROC => Upcall::NewProc {
                out: args[0] as *mut usize,
                exit_glue: args[1],
                spawnee_fn: args[2],
                callsz: args[3],
            },
            codes::DEL_PROC => Upcall::DelProc {
                target: args[0] as *mut Proc,
            },
            codes::FAIL => Upcall::Fail {
                expr: args[0] as *const c_char,
                file: args[1] as *const c_char,
                line: args[2],
            },
            codes::MALLOC => Upcall::Malloc {
                out: args[0] as *mut usize,
                size: args[1],
            },
            codes::FREE => Upcall::Free {
                ptr: args[0] as *mut u8,
            },
            codes::NEW_PORT => Upcall::NewPort {
                out: args[0] as *mut usize,
                unit_sz: args[1],
            },
            codes::DEL_PORT => Upcall::DelPort { port: args[0] },
            codes::SEND => Upcall::Send {
                port: args[0],
                src: args[1] as *const u8,
            },
            // The compiler emits the port in the second slot for
            // receives; the first slot is the destination address the
            // transmission writes through.
            codes::RECV => Upcall::Recv { port: args[1] },
            codes::NEW_STR => Upcall::NewStr {
                out: args[0] as *mut usize,
                bytes: args[1] as *const u8,
                fill: args[2],
            },
            codes::GROW_PROC => Upcall::GrowProc {
                n_call_bytes: args[0],
                n_frame_bytes: args[1],
            },
            codes::TRACE_WORD => Upcall::TraceWord { val: args[0] },
            codes::TRACE_STR => Upcall::TraceStr {
                s: args[0] as *const c_char,
            },
            codes::NEW_THREAD => Upcall::NewThread {
                out: args[0] as *mut usize,
                exit_glue: args[1],
                spawnee_fn: args[2],
            },
            other => return Err(Error::UnknownUpcall(other)),
        };
        Ok(upcall)
    }
}

/// What the dispatcher did with the current proc.
pub(crate) enum Disposition {
    Handled,
    /// The upcall destroyed the proc that issued it; the scheduler must
    /// not touch it again.
    CurrentDeleted,
}

unsafe fn cstr_lossy(p: *const c_char) -> String {
    if p.is_null() {
        String::new()
    } else {
        CStr::from_ptr(p).to_string_lossy().into_owned()
    }
}

impl Runtime {
    /// Interpret and perform the upcall in `p`'s scratch area.
    pub(crate) fn dispatch(&mut self, p: *mut Proc) -> Result<Disposition, Error> {
        let (code, args) = unsafe { ((*p).upcall_code, (*p).upcall_args) };
        match Upcall::decode(code, &args)? {
            Upcall::LogInt { val } => {
                self.log(LogBits::UPCALL | LogBits::ULOG, || {
                    format!("upcall log_int({:#x} = {})", val as u32, val)
                });
            }
            Upcall::LogStr { s } => {
                let text = unsafe { String::from_utf8_lossy(crate::value::str_bytes(s)).into_owned() };
                self.log(LogBits::UPCALL | LogBits::ULOG, || {
                    format!("upcall log_str(\"{}\")", text)
                });
            }
            Upcall::TraceWord { val } => {
                self.log(LogBits::UPCALL | LogBits::TRACE, || {
                    format!("trace: {:#x}", val)
                });
            }
            Upcall::TraceStr { s } => {
                let text = unsafe { cstr_lossy(s) };
                self.log(LogBits::UPCALL | LogBits::TRACE, || format!("trace: {}", text));
            }
            Upcall::NewProc {
                out,
                exit_glue,
                spawnee_fn,
                callsz,
            } => {
                self.log(LogBits::UPCALL | LogBits::MEM | LogBits::PROC, || {
                    format!(
                        "upcall new_proc(exit_glue={:#x}, spawnee={:#x}, callsz={})",
                        exit_glue, spawnee_fn, callsz
                    )
                });
                let np = self.spawn(p, exit_glue, spawnee_fn, callsz)?;
                unsafe { *out = np as usize };
            }
            Upcall::DelProc { target } => {
                self.del_proc(target);
                if target == p {
                    return Ok(Disposition::CurrentDeleted);
                }
            }
            Upcall::Fail { expr, file, line } => {
                let (expr, file) = unsafe { (cstr_lossy(expr), cstr_lossy(file)) };
                self.log(LogBits::UPCALL, || {
                    format!("upcall fail '{}', {}:{}", expr, file, line)
                });
                self.fail_proc(p);
                // An unwinding path is planned; today guest failure is
                // terminal.
                self.fatal(&expr, &file, line as u32);
            }
            Upcall::Malloc { out, size } => {
                let q = self.alloc(size);
                self.log(LogBits::UPCALL | LogBits::MEM, || {
                    format!("upcall malloc({}) = {:#x}", size, q as usize)
                });
                unsafe { *out = q as usize };
            }
            Upcall::Free { ptr } => {
                self.log(LogBits::UPCALL | LogBits::MEM, || {
                    format!("upcall free({:#x})", ptr as usize)
                });
                unsafe { self.free(ptr) };
            }
            Upcall::NewPort { out, unit_sz } => {
                self.log(LogBits::UPCALL | LogBits::MEM | LogBits::COMM, || {
                    format!("upcall new_port(unit_sz={})", unit_sz)
                });
                let h = self.new_port(p, unit_sz);
                unsafe {
                    // The handle returned to the guest is a live
                    // reference.
                    let port = self.ports.get_ptr(h).unwrap();
                    (*port).live_refcnt = 1;
                    *out = h.word();
                }
            }
            Upcall::DelPort { port } => {
                let h = crate::port::PortHandle::from_word(port).ok_or(Error::NullPort)?;
                self.del_port(h)?;
            }
            Upcall::Send { port, src } => self.send(p, port, src)?,
            Upcall::Recv { port } => self.recv(p, port)?,
            Upcall::NewStr { out, bytes, fill } => {
                let s = self.new_str(bytes, fill);
                unsafe { *out = s as usize };
            }
            Upcall::GrowProc {
                n_call_bytes,
                n_frame_bytes,
            } => {
                self.log(LogBits::UPCALL | LogBits::MEM, || {
                    format!(
                        "upcall grow_proc(n_call_bytes={}, n_frame_bytes={})",
                        n_call_bytes, n_frame_bytes
                    )
                });
                self.grow_stack(p, n_call_bytes, n_frame_bytes);
            }
            Upcall::NewThread {
                out,
                exit_glue,
                spawnee_fn,
            } => {
                self.log(LogBits::UPCALL | LogBits::PROC, || {
                    format!(
                        "upcall new_thread(exit_glue={:#x}, spawnee={:#x})",
                        exit_glue, spawnee_fn
                    )
                });
                self.srv.spawn_runtime(Ticket {
                    spawnee_fn,
                    exit_glue,
                });
                // No proxy proc represents the new thread's runtime in
                // this one yet; the guest receives a null handle.
                unsafe { *out = 0 };
            }
        }
        Ok(Disposition::Handled)
    }

    /// The del-proc upcall: fail the target, then remove and destroy it
    /// immediately rather than letting the scheduler see the failing
    /// state.
    // TODO: route deletion through the failing state so the scheduler
    // can unwind the target's in-flight frames first.
    pub(crate) fn del_proc(&mut self, target: *mut Proc) {
        let refcnt = unsafe { (*target).refcnt };
        self.log(LogBits::UPCALL, || {
            format!("upcall del_proc({:#x}), refcnt={}", target as usize, refcnt)
        });
        self.fail_proc(target);
        unsafe {
            // The proc's own reference ends with it, unless it already
            // exited and gave it up.
            if (*target).refcnt > 0 {
                (*target).refcnt -= 1;
            }
        }
        let b = self.remove_from_state_vec(target);
        self.destroy_proc(b);
    }

    pub(crate) fn fatal(&mut self, expr: &str, file: &str, line: u32) -> ! {
        self.srv.fatal(expr, file, line)
    }
}
