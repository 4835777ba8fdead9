use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Workspace-wide error type.
///
/// Transport completions carry `Io` so errno-style codes stay observable via
/// `io::Error::raw_os_error`; `Closed` is the sentinel every operation fails
/// with after a handle was shut down.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("handle closed")]
    Closed,
    #[error("timed out")]
    Timeout,
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("config: {0}")]
    Config(String),
    #[error("rendezvous failed: code {0}")]
    Rendezvous(u32),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True when the underlying cause is a closed handle, however it was
    /// reported.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Closed => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotConnected,
            _ => false,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Io(e) => match e.raw_os_error() {
                Some(code) => Error::Io(std::io::Error::from_raw_os_error(code)),
                None => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            },
            Error::Closed => Error::Closed,
            Error::Timeout => Error::Timeout,
            Error::Protocol(s) => Error::Protocol(s.clone()),
            Error::Config(s) => Error::Config(s.clone()),
            Error::Rendezvous(c) => Error::Rendezvous(*c),
        }
    }
}
