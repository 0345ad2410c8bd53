use thiserror::Error;

/// JSON-RPC error codes used on the host/client boundary.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const BACKEND_UNAVAILABLE: i64 = -32002;
}

/// Failures raised while answering a tool call inside the Tool Host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl HandlerError {
    pub fn code(&self) -> i64 {
        match self {
            HandlerError::InvalidArgument(_) => codes::INVALID_PARAMS,
            HandlerError::BackendUnavailable(_) => codes::BACKEND_UNAVAILABLE,
        }
    }
}

/// Failures seen by callers of the Client Proxy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to the tool host")]
    NotConnected,

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Remote error {code}: {message}")]
    RemoteError { code: i64, message: String },
}
