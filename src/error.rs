use serde_derive::{Deserialize, Serialize};

/// A mechat error. All errors are serializable, since RPC handler results are
/// shipped back to callers as `Result<Response>` over the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid data, e.g. unexpected wire messages or corrupt log files.
    InvalidData(String),
    /// Invalid user input, e.g. malformed CLI arguments or bad credentials.
    InvalidInput(String),
    /// An IO error: dial timeouts, refused connections, marshaling failures.
    IO(String),
    /// No replica responded during leader rediscovery.
    NoLeader,
    /// The replica was asked to do something only a backup may do (accept
    /// replicated entries, erase its log) while it believes itself leader, or
    /// a backup was asked to accept a client write.
    NotAuthoritative,
    /// A local store or log write failed.
    Storage(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NoLeader => write!(f, "no leader found"),
            Error::NotAuthoritative => write!(f, "replica is not authoritative for this request"),
            Error::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData via format!() and wraps it in a Result.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidData(format!($($args)*))) };
}

/// Constructs an Error::InvalidInput via format!() and wraps it in a Result.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidInput(format!($($args)*))) };
}

/// A mechat result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<rustyline::error::ReadlineError> for Error {
    fn from(err: rustyline::error::ReadlineError) -> Self {
        Error::IO(err.to_string())
    }
}

// Don't try to recover from poisoned mutexes, just propagate the failure.
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
