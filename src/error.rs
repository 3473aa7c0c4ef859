use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("ring table size {m} is unusable: {reason}")]
    InvalidRingSize { m: usize, reason: &'static str },

    #[error("cannot build an assignment from an empty backend set")]
    EmptyBackendSet,

    #[error("backend {0} already has a live registration")]
    DuplicateRegistration(String),

    #[error("coordination service error: {0}")]
    Coordination(#[from] redis::RedisError),

    #[error("membership watch failed: {0}")]
    Watch(String),

    #[error("vip sink write failed: {0}")]
    SinkWrite(#[source] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse failure classification. The top-level supervisor keys its
/// terminate-vs-retry decision off this, not off the error payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRingSize,
    EmptyBackendSet,
    DuplicateRegistration,
    Watch,
    SinkWrite,
    Config,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRingSize { .. } => ErrorKind::InvalidRingSize,
            Error::EmptyBackendSet => ErrorKind::EmptyBackendSet,
            Error::DuplicateRegistration(_) => ErrorKind::DuplicateRegistration,
            Error::Coordination(_) | Error::Watch(_) => ErrorKind::Watch,
            Error::SinkWrite(_) => ErrorKind::SinkWrite,
            Error::Config(_) => ErrorKind::Config,
        }
    }
}

impl ErrorKind {
    /// Watch and sink failures are environmental and worth another attempt.
    /// Everything else indicates misconfiguration and must stop the process.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::Watch | ErrorKind::SinkWrite)
    }
}
