use fusion_shm::ShmError;
use thiserror::Error;

pub type FusionResult<T> = Result<T, FusionError>;

#[derive(Debug, Error)]
pub enum FusionError {
    #[error("shared memory exhausted")]
    OutOfMemory,

    #[error("resource busy, retry later")]
    Busy,

    #[error("operation timed out")]
    Timeout,

    #[error("world, call or peer destroyed")]
    Destroyed,

    #[error("item not found")]
    ItemNotFound,

    #[error("object or pool is dead")]
    Dead,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("shared memory error: {0}")]
    Shm(#[source] ShmError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("peer failed to serve the request")]
    Failed,
}

impl From<ShmError> for FusionError {
    fn from(err: ShmError) -> Self {
        match err {
            ShmError::Destroyed => FusionError::Destroyed,
            ShmError::TimedOut => FusionError::Timeout,
            ShmError::OutOfSpace { .. } => FusionError::OutOfMemory,
            other => FusionError::Shm(other),
        }
    }
}

impl FusionError {
    pub fn config(msg: impl Into<String>) -> Self {
        FusionError::Config(msg.into())
    }

    /// Code carried across the process boundary for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            FusionError::OutOfMemory => ErrorCode::OutOfMemory,
            FusionError::Busy => ErrorCode::Busy,
            FusionError::Timeout => ErrorCode::Timeout,
            FusionError::Destroyed => ErrorCode::Destroyed,
            FusionError::ItemNotFound => ErrorCode::ItemNotFound,
            FusionError::Dead => ErrorCode::Dead,
            FusionError::Unsupported(_) => ErrorCode::Unsupported,
            FusionError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            FusionError::LimitExceeded(_) => ErrorCode::LimitExceeded,
            FusionError::Shm(_) | FusionError::Config(_) | FusionError::Failed => ErrorCode::Failure,
        }
    }
}

/// Wire form of the error taxonomy.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok = 0,
    OutOfMemory = 1,
    Busy = 2,
    Timeout = 3,
    Destroyed = 4,
    ItemNotFound = 5,
    Dead = 6,
    Unsupported = 7,
    InvalidArgument = 8,
    LimitExceeded = 9,
    Failure = 10,
}

impl ErrorCode {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => ErrorCode::Ok,
            1 => ErrorCode::OutOfMemory,
            2 => ErrorCode::Busy,
            3 => ErrorCode::Timeout,
            4 => ErrorCode::Destroyed,
            5 => ErrorCode::ItemNotFound,
            6 => ErrorCode::Dead,
            7 => ErrorCode::Unsupported,
            8 => ErrorCode::InvalidArgument,
            9 => ErrorCode::LimitExceeded,
            10 => ErrorCode::Failure,
            _ => return None,
        })
    }

    /// Result view of a code received from a peer. Detail strings do not
    /// travel, so the rebuilt error carries a generic description.
    pub fn into_result(self) -> FusionResult<()> {
        Err(match self {
            ErrorCode::Ok => return Ok(()),
            ErrorCode::OutOfMemory => FusionError::OutOfMemory,
            ErrorCode::Busy => FusionError::Busy,
            ErrorCode::Timeout => FusionError::Timeout,
            ErrorCode::Destroyed => FusionError::Destroyed,
            ErrorCode::ItemNotFound => FusionError::ItemNotFound,
            ErrorCode::Dead => FusionError::Dead,
            ErrorCode::Unsupported => FusionError::Unsupported("rejected by peer"),
            ErrorCode::InvalidArgument => FusionError::InvalidArgument("rejected by peer"),
            ErrorCode::LimitExceeded => FusionError::LimitExceeded("rejected by peer"),
            ErrorCode::Failure => FusionError::Failed,
        })
    }
}

impl<T> From<&FusionResult<T>> for ErrorCode {
    fn from(result: &FusionResult<T>) -> Self {
        match result {
            Ok(_) => ErrorCode::Ok,
            Err(err) => err.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_u32() {
        for raw in 0..=10 {
            let code = ErrorCode::from_u32(raw).expect("known code");
            assert_eq!(code as u32, raw);
            match code.into_result() {
                Ok(()) => assert_eq!(code, ErrorCode::Ok),
                Err(err) => assert_eq!(err.code(), code, "{err} must map back to {code:?}"),
            }
        }
        assert!(ErrorCode::from_u32(11).is_none());
    }

    #[test]
    fn shm_errors_fold_into_taxonomy() {
        assert!(matches!(
            FusionError::from(ShmError::OutOfSpace { requested: 8 }),
            FusionError::OutOfMemory
        ));
        assert!(matches!(
            FusionError::from(ShmError::Destroyed),
            FusionError::Destroyed
        ));
        assert_eq!(
            FusionError::from(ShmError::Corrupt("x")).code(),
            ErrorCode::Failure
        );
    }
}
