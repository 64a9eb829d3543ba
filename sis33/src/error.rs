//! The error taxonomy shared by every control operation on a card

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Device or resource busy")]
    Busy,
    #[error("No data available in the requested segment")]
    NoData,
    #[error("Timed out waiting for the acquisition to finish")]
    TimedOut,
    #[error("Interrupted while waiting for the acquisition to finish")]
    Interrupted,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("No card slots left in the registry")]
    NoSlotsAvailable,
    #[error("Card slot {0} is already in use")]
    AlreadyInUse(usize),
    #[error("The card is not registered")]
    NoDevice,
    #[error("Unsupported control request {0:#010x}")]
    UnsupportedRequest(u32),
    #[error("Faulting copy from or to caller memory")]
    FaultingCopy(#[from] crate::memory::Fault),
    #[error(transparent)]
    Backend(#[from] crate::backend::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
