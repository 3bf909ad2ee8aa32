#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed header or data. The offending frame or block should be dropped.
    #[error("invalid: {0}")]
    Invalid(String),

    /// A recognized product type that has no presentation path.
    #[error("unsupported product type: {0}")]
    Unsupported(u8),

    /// An internal invariant was broken, e.g., a product started twice.
    #[error("logic error: {0}")]
    Logic(String),

    #[error("out of memory")]
    NoMemory,

    /// The deflate codec could not complete.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("system error: {0}")]
    System(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The frame queue was shut down. Normal end of a receive loop.
    #[error("shut down")]
    ShutDown,

    #[error("requested {requested} bytes exceeds queue capacity of {capacity}")]
    TooBig { requested: usize, capacity: usize },

    #[error("no space in queue")]
    NoSpace,

    #[error("released {released} bytes but only {reserved} were reserved")]
    Unreserved { released: usize, reserved: usize },
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub(crate) fn logic(msg: impl Into<String>) -> Self {
        Self::Logic(msg.into())
    }

    /// True for errors that only affect the current frame or block and after which
    /// processing of the stream may continue.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Invalid(_) | Self::Unsupported(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
