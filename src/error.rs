use std::fmt::Display;

/// HorizonDB errors.
///
/// Errors are cloneable so that a single commit log failure can be fanned
/// out to every writer waiting on the same batch.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The named database does not exist.
    UnknownDatabase(String),
    /// The named time series does not exist within its database.
    UnknownTimeSeries(String),
    /// A database with the same name already exists.
    DuplicateDatabase(String),
    /// A time series with the same name already exists in the database.
    DuplicateTimeSeries(String),
    /// A stored checksum did not match the bytes it covers. Surfaced by the
    /// file header parser, the block decoder and commit log replay.
    ChecksumMismatch(String),
    /// Invalid on-disk or in-flight data, typically decoding errors or
    /// unexpected internal values.
    InvalidData(String),
    /// A record rejected before any state change: wrong arity or field
    /// types, timestamp outside the partition range, or a timestamp older
    /// than data already written.
    InvalidRecord(String),
    /// The slab allocator cannot satisfy an allocation. Signals that the
    /// current mem series is full and must rotate.
    OutOfSpace,
    /// An IO error.
    Io(String),
    /// The engine is shutting down; the commit log writer is gone.
    Shutdown,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::UnknownDatabase(name) => write!(f, "unknown database: {name}"),
            Error::UnknownTimeSeries(name) => write!(f, "unknown time series: {name}"),
            Error::DuplicateDatabase(name) => write!(f, "database already exists: {name}"),
            Error::DuplicateTimeSeries(name) => write!(f, "time series already exists: {name}"),
            Error::ChecksumMismatch(msg) => write!(f, "checksum mismatch: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidRecord(msg) => write!(f, "invalid record: {msg}"),
            Error::OutOfSpace => write!(f, "slab allocator out of space"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Shutdown => write!(f, "engine is shutting down"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)) };
}

/// Constructs an Error::ChecksumMismatch for the given format string.
#[macro_export]
macro_rules! errcrc {
    ($($args:tt)*) => { $crate::error::Error::ChecksumMismatch(format!($($args)*)) };
}

/// A HorizonDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<std::sync::mpsc::RecvError> for Error {
    fn from(_: std::sync::mpsc::RecvError) -> Self {
        Error::Shutdown
    }
}
