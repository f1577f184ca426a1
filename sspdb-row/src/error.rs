use std::array::TryFromSliceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid format")]
    InvalidFormat,
    #[error("invalid update tag({0})")]
    InvalidUpdateTag(u8),
    #[error("column {0} out of bound")]
    ColumnOutOfBound(i32),
    #[error("payload size mismatch: expected {expected}, actual {actual}")]
    SizeMismatch { expected: usize, actual: usize },
}

impl From<TryFromSliceError> for Error {
    #[inline]
    fn from(_src: TryFromSliceError) -> Error {
        Error::InvalidFormat
    }
}
