//! Gateway error type and its HTTP status mapping.
//!
//! Sensor application failures (app_fail_code) are not modeled here; each
//! route inspects the raw code and picks its own 404/409/500 response.
use actix_web::http::StatusCode;
use actix_web::ResponseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("frame too short: {got} bytes, need at least {need}")]
    ShortFrame { need: usize, got: usize },

    #[error("unknown inbound frame type {0:#06x}")]
    UnknownFrameType(u16),

    #[error("no parser for command {0:#06x}")]
    UnknownCommand(u16),

    #[error("truncated body for command {cmd:#06x}: {got} bytes, need {need}")]
    TruncatedBody { cmd: u16, need: usize, got: usize },

    #[error("trailing bytes after command {cmd:#06x} body: expected {expected}, got {got}")]
    TrailingBytes {
        cmd: u16,
        expected: usize,
        got: usize,
    },

    #[error("invalid {field} value {value} in command {cmd:#06x}")]
    BadField {
        cmd: u16,
        field: &'static str,
        value: u32,
    },

    #[error("encrypted frame received but no key is configured")]
    CryptoMissingKey,

    #[error("AES-GCM authentication failed")]
    CryptoAuthFail,

    #[error("key must be 16 or 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("template payload must be {expected} bytes, got {got}")]
    TemplateSize { expected: usize, got: usize },

    #[error("frame payload too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("another finite request is already running")]
    Busy,

    #[error("mqtt publish failed: {0}")]
    Transport(#[from] rumqttc::ClientError),

    #[error("timed out waiting for a sensor reply")]
    Timeout,

    #[error("sensor reply channel closed")]
    ChannelClosed,

    #[error("unexpected reply while {context}")]
    UnexpectedReply { context: &'static str },

    #[error("data chunk mismatch: requested {requested}, got {got} with {remaining} remaining")]
    ChunkMismatch {
        requested: u32,
        got: u32,
        remaining: u32,
    },
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::KeyLength(_) | GatewayError::TemplateSize { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
