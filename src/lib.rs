pub mod arch;
pub mod circ;
pub mod error;
pub mod gc;
pub mod log;
pub mod port;
pub mod proc;
pub mod runtime;
pub mod service;
pub mod slot_vec;
pub mod stack;
pub mod upcall;
pub mod value;

pub use error::Error;
pub use log::LogBits;
pub use port::PortHandle;
pub use proc::{Proc, ProcState};
pub use runtime::{main_loop, start, Runtime};
pub use service::{ActivateFn, Service, StdService, Symbol, Ticket};
pub use upcall::Upcall;
