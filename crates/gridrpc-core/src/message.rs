use std::fmt;

use serde::{Deserialize, Serialize};

/// Magic bytes at the head of every frame.
pub const MAGIC: [u8; 4] = *b"hrpc";

/// Current version of the RPC protocol.
pub const CURRENT_VERSION: u8 = 9;

/// Reserved call IDs. Application calls only ever receive IDs in
/// `0..=i32::MAX`; negative IDs mark connection-level traffic.
pub const INVALID_CALL_ID: i32 = -2;
pub const CONNECTION_CONTEXT_CALL_ID: i32 = -3;
pub const NEGOTIATE_CALL_ID: i32 = -33;

/// Feature-flag bits advertised during negotiation and carried on request
/// headers as `required_features`.
pub const FEATURE_SIDECARS: u32 = 1 << 0;

/// The feature set this build supports.
pub const SUPPORTED_FEATURES: u32 = FEATURE_SIDECARS;

/// Fully qualified name of a remote method: service name plus method name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteMethod {
    pub service: String,
    pub method: String,
}

impl RemoteMethod {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for RemoteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

/// Header of a request frame (client to server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    pub call_id: i32,
    pub method: RemoteMethod,
    pub required_features: u32,
    /// Client-side deadline for this call, in milliseconds from send time.
    /// Zero means no deadline was set.
    pub timeout_ms: u64,
    /// Lengths of the raw sidecar blocks trailing the body.
    pub sidecar_lens: Vec<u32>,
}

/// Header of a response frame (server to client).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub call_id: i32,
    /// When set, the body is a serialized [`ErrorStatus`] rather than the
    /// method's response payload.
    pub is_error: bool,
    pub sidecar_lens: Vec<u32>,
}

/// Header exchanged once in each direction when a connection is set up,
/// before any call is processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiateHeader {
    pub call_id: i32,
    pub version: u8,
    pub features: u32,
}

impl NegotiateHeader {
    pub fn new() -> Self {
        Self {
            call_id: NEGOTIATE_CALL_ID,
            version: CURRENT_VERSION,
            features: SUPPORTED_FEATURES,
        }
    }
}

impl Default for NegotiateHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire-level error codes carried in error responses.
///
/// `ServerTooBusy` is the distinguished "retry later" code consumed by the
/// retrier; the registration codes round-trip the master's typed rejections
/// back to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorCode {
    /// Application-level failure reported by the handler.
    Application,
    /// The service's dispatch queue is full; the caller should retry later.
    ServerTooBusy,
    UnknownService,
    UnknownMethod,
    InvalidRequest,
    InvalidArgument,
    AlreadyPresent,
    NotFound,
    /// The server is shutting down or the service is draining.
    Unavailable,
}

/// Body of an error response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorStatus {
    pub code: RemoteErrorCode,
    pub message: String,
}
