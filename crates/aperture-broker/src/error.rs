use aperture_protocol::Status;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

/// Error half of the broker's result-code taxonomy.
///
/// Every variant maps onto a wire [`Status`]; nothing unwinds across the
/// protocol boundary. Success sentinels (`Ok`, `ObjectGone`) are not errors
/// and live only in [`Status`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("not found: {0}")]
    NotFound(&'static str),

    #[error("busy: {0}")]
    Busy(&'static str),

    #[error("timed out: {0}")]
    Timeout(&'static str),

    #[error("fatal hardware condition: {0}")]
    Fatal(&'static str),
}

impl From<&ApiError> for Status {
    fn from(err: &ApiError) -> Status {
        match err {
            ApiError::NotSupported(_) => Status::NotSupported,
            ApiError::NotFound(_) => Status::NotFound,
            ApiError::Busy(_) => Status::Busy,
            ApiError::Timeout(_) => Status::Timeout,
            ApiError::Fatal(_) => Status::Fatal,
        }
    }
}

impl From<ApiError> for Status {
    fn from(err: ApiError) -> Status {
        Status::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_wire_status() {
        assert_eq!(Status::from(ApiError::NotFound("x")), Status::NotFound);
        assert_eq!(Status::from(ApiError::Busy("x")), Status::Busy);
        assert_eq!(Status::from(ApiError::Timeout("x")), Status::Timeout);
        assert_eq!(Status::from(ApiError::Fatal("x")), Status::Fatal);
        assert_eq!(
            Status::from(ApiError::NotSupported("x")),
            Status::NotSupported
        );
    }
}
