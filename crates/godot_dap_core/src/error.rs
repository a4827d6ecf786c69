use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DapError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout { operation: String, after: Duration },

    #[error("DAP request '{command}' failed: {message}")]
    Remote { command: String, message: String },

    #[error("Cannot {operation}: session is {state} (requires {required})")]
    Ordering {
        operation: String,
        state: String,
        required: String,
    },

    #[error("Malformed DAP frame: {0}")]
    ProtocolDecode(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Failed to encode DAP message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid response to '{command}': {reason}")]
    InvalidResponse { command: String, reason: String },

    #[error("Invalid {argument}: {reason}")]
    InvalidArgument { argument: String, reason: String },
}

impl DapError {
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn remote(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn ordering(
        operation: impl Into<String>,
        state: impl ToString,
        required: impl Into<String>,
    ) -> Self {
        Self::Ordering {
            operation: operation.into(),
            state: state.to_string(),
            required: required.into(),
        }
    }

    pub fn invalid_argument(argument: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument: argument.into(),
            reason: reason.into(),
        }
    }

    pub fn decode(reason: impl Into<String>) -> Self {
        Self::ProtocolDecode(reason.into())
    }

    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost(reason.into())
    }

    /// Stable discriminator for callers that cannot match on the enum (tool
    /// responses, audit lines).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect_error",
            Self::Timeout { .. } => "timeout_error",
            Self::Remote { .. } => "remote_error",
            Self::Ordering { .. } => "ordering_error",
            Self::ProtocolDecode(_) => "protocol_decode_error",
            Self::ConnectionLost(_) => "connection_lost_error",
            Self::Encode(_) => "encode_error",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::InvalidArgument { .. } => "invalid_argument",
        }
    }

    /// True when the error means the connection is gone and the session
    /// cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ProtocolDecode(_) | Self::ConnectionLost(_))
    }
}
