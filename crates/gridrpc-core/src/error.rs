use thiserror::Error;

use crate::message::{ErrorStatus, RemoteErrorCode};

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out: {0}")]
    TimedOut(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Already present: {0}")]
    AlreadyPresent(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("Remote error ({code:?}): {message}")]
    Remote {
        code: RemoteErrorCode,
        message: String,
    },

    #[error("Messenger is shutting down")]
    Shutdown,
}

impl RpcError {
    /// True for transport-level failures. Callers holding a proxy should
    /// drop it and reconnect on these.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            RpcError::Network(_) | RpcError::Io(_) | RpcError::Shutdown
        )
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, RpcError::TimedOut(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::NotFound(_))
    }

    /// True when the remote explicitly asked us to retry later.
    pub fn is_server_too_busy(&self) -> bool {
        matches!(
            self,
            RpcError::Remote {
                code: RemoteErrorCode::ServerTooBusy,
                ..
            }
        )
    }

    /// Wire-level code used when this error is sent as an error response.
    pub(crate) fn wire_code(&self) -> RemoteErrorCode {
        match self {
            RpcError::ServiceUnavailable(_) | RpcError::Shutdown => RemoteErrorCode::Unavailable,
            RpcError::InvalidArgument(_) => RemoteErrorCode::InvalidArgument,
            RpcError::AlreadyPresent(_) => RemoteErrorCode::AlreadyPresent,
            RpcError::NotFound(_) => RemoteErrorCode::NotFound,
            RpcError::InvalidFrame(_) | RpcError::Serialization(_) => RemoteErrorCode::InvalidRequest,
            RpcError::Remote { code, .. } => *code,
            _ => RemoteErrorCode::Application,
        }
    }

    /// Rebuild the typed error from a decoded error response.
    pub(crate) fn from_wire(status: ErrorStatus) -> RpcError {
        match status.code {
            RemoteErrorCode::InvalidArgument => RpcError::InvalidArgument(status.message),
            RemoteErrorCode::AlreadyPresent => RpcError::AlreadyPresent(status.message),
            RemoteErrorCode::NotFound => RpcError::NotFound(status.message),
            RemoteErrorCode::Unavailable => RpcError::ServiceUnavailable(status.message),
            code => RpcError::Remote {
                code,
                message: status.message,
            },
        }
    }

    /// Produce an equivalent error for fanning one failure out to several
    /// waiting calls. IO errors degrade to their message.
    pub(crate) fn replicate(&self) -> RpcError {
        match self {
            RpcError::Network(m) => RpcError::Network(m.clone()),
            RpcError::Io(e) => RpcError::Network(e.to_string()),
            RpcError::TimedOut(m) => RpcError::TimedOut(m.clone()),
            RpcError::ServiceUnavailable(m) => RpcError::ServiceUnavailable(m.clone()),
            RpcError::InvalidArgument(m) => RpcError::InvalidArgument(m.clone()),
            RpcError::AlreadyPresent(m) => RpcError::AlreadyPresent(m.clone()),
            RpcError::NotFound(m) => RpcError::NotFound(m.clone()),
            RpcError::InvalidFrame(m) => RpcError::InvalidFrame(m.clone()),
            RpcError::Serialization(e) => RpcError::InvalidFrame(e.to_string()),
            RpcError::Remote { code, message } => RpcError::Remote {
                code: *code,
                message: message.clone(),
            },
            RpcError::Shutdown => RpcError::Shutdown,
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_busy_round_trips_through_wire_code() {
        let err = RpcError::from_wire(ErrorStatus {
            code: RemoteErrorCode::ServerTooBusy,
            message: "queue full".to_string(),
        });
        assert!(err.is_server_too_busy());
        assert_eq!(err.wire_code(), RemoteErrorCode::ServerTooBusy);
    }

    #[test]
    fn test_typed_registration_errors_survive_the_wire() {
        let err = RpcError::AlreadyPresent("stale seqno".to_string());
        let rebuilt = RpcError::from_wire(ErrorStatus {
            code: err.wire_code(),
            message: "stale seqno".to_string(),
        });
        assert!(matches!(rebuilt, RpcError::AlreadyPresent(_)));

        let err = RpcError::InvalidArgument("bad registration".to_string());
        let rebuilt = RpcError::from_wire(ErrorStatus {
            code: err.wire_code(),
            message: "bad registration".to_string(),
        });
        assert!(matches!(rebuilt, RpcError::InvalidArgument(_)));
    }

    #[test]
    fn test_network_classification() {
        assert!(RpcError::Network("reset".to_string()).is_network());
        assert!(RpcError::Shutdown.is_network());
        assert!(!RpcError::TimedOut("deadline".to_string()).is_network());
    }
}
