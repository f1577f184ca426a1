use crate::context::EntityID;
use crate::TableID;
use sspdb_row::Error as RowError;
use std::array::TryFromSliceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid format")]
    InvalidFormat,
    #[error("row error: {0}")]
    Row(#[from] RowError),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("IO Error")]
    IOError,
    #[error("thread panicked")]
    ThreadPanicked,
    #[error("clock participant not registered")]
    ClockNotRegistered,
    // transport errors
    #[error("endpoint {0} not found")]
    EndpointNotFound(EntityID),
    #[error("endpoint {0} already registered")]
    EndpointExists(EntityID),
    #[error("channel disconnected")]
    Disconnected,
    // table errors
    #[error("table {0} not found")]
    TableNotFound(TableID),
    #[error("table {0} already exists")]
    TableExists(TableID),
    // protocol violations
    #[error("oplog version gap from {sender}: expected {expected}, actual {actual}")]
    VersionGap {
        sender: EntityID,
        expected: u64,
        actual: u64,
    },
    #[error("unknown sender {0}")]
    UnknownSender(EntityID),
    #[error("unexpected message {0} from {1}")]
    UnexpectedMessage(&'static str, EntityID),
}

impl From<TryFromSliceError> for Error {
    #[inline]
    fn from(_src: TryFromSliceError) -> Error {
        Error::InvalidFormat
    }
}

impl From<std::io::Error> for Error {
    #[inline]
    fn from(_src: std::io::Error) -> Self {
        Error::IOError
    }
}

impl From<bincode::error::EncodeError> for Error {
    #[inline]
    fn from(src: bincode::error::EncodeError) -> Error {
        Error::Codec(src.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    #[inline]
    fn from(src: bincode::error::DecodeError) -> Error {
        Error::Codec(src.to_string())
    }
}
