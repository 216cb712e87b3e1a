use thiserror::Error;

/// Recoverable runtime errors.
///
/// Anything that can be reported and survived is an `Error`; genuine
/// invariant violations go straight to the service fatal hook instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("send or receive on null port")]
    NullPort,

    #[error("no port for handle {0:#x}")]
    PortUnknown(usize),

    #[error("port has no owning proc")]
    PortOrphaned,

    #[error("channel buffer would exceed {max} bytes")]
    ChannelOverflow { max: usize },

    #[error("unrecognised upcall code {0}")]
    UnknownUpcall(usize),

    #[error("spawn call region of {got} bytes is smaller than the {min} implicit bytes")]
    SpawnCallRegion { got: usize, min: usize },
}

impl Error {
    /// Errors the dispatcher logs and swallows rather than escalating to
    /// the fatal path. Port misuse is reported and ignored today.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NullPort | Error::PortUnknown(_) | Error::PortOrphaned
        )
    }
}
