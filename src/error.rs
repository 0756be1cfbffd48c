//! Error types for walletcore.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level error type for the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}

/// Session and token authentication errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("No active session")]
    NoActiveSession,

    #[error("Failed to start session: {reason}")]
    SessionStartFailed { reason: String },

    #[error("Invalid token: {reason}")]
    InvalidToken { reason: String },
}

/// Provider bridge errors surfaced to page callers.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Request {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Request {method} rejected: {reason}")]
    Rejected { method: String, reason: String },

    #[error("Method {method} is not supported")]
    Unsupported { method: String },

    #[error("Bridge disconnected")]
    Disconnected,

    #[error("Internal bridge error for {method}: {reason}")]
    Internal { method: String, reason: String },
}

/// Signing authorization errors.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("Authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Signing rejected: {reason}")]
    Rejected { reason: String },

    #[error("Unsupported signing method: {method}")]
    UnsupportedMethod { method: String },

    #[error("Account not found: {address}")]
    AccountNotFound { address: String },

    #[error("Invalid signing parameters: {reason}")]
    InvalidParams { reason: String },

    #[error("Internal signing error: {reason}")]
    Internal { reason: String },
}

/// UI channel transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {channel_id}: {reason}")]
    SendFailed { channel_id: String, reason: String },

    #[error("Channel {channel_id} disconnected")]
    Disconnected { channel_id: String },
}

/// Settings persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Numeric error envelope crossing the page/UI boundary.
///
/// Codes follow the EIP-1193 convention so page-side providers can surface
/// them unchanged: 4001 user rejected, 4100 unauthorized, 4200 unsupported
/// method, 4902 timeout, -32602 invalid params, -32603 internal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub const USER_REJECTED: i64 = 4001;
    pub const UNAUTHORIZED: i64 = 4100;
    pub const UNSUPPORTED_METHOD: i64 = 4200;
    pub const TIMEOUT: i64 = 4902;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&SigningError> for RpcError {
    fn from(err: &SigningError) -> Self {
        let code = match err {
            SigningError::Rejected { .. } => Self::USER_REJECTED,
            SigningError::UnsupportedMethod { .. } => Self::UNSUPPORTED_METHOD,
            SigningError::Auth(_) | SigningError::AccountNotFound { .. } => Self::UNAUTHORIZED,
            SigningError::InvalidParams { .. } => Self::INVALID_PARAMS,
            SigningError::Internal { .. } => Self::INTERNAL,
        };
        Self::new(code, err.to_string())
    }
}

impl From<&BridgeError> for RpcError {
    fn from(err: &BridgeError) -> Self {
        let code = match err {
            BridgeError::Timeout { .. } => Self::TIMEOUT,
            BridgeError::Rejected { .. } => Self::USER_REJECTED,
            BridgeError::Unsupported { .. } => Self::UNSUPPORTED_METHOD,
            BridgeError::Disconnected | BridgeError::Internal { .. } => Self::INTERNAL,
        };
        Self::new(code, err.to_string())
    }
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;
