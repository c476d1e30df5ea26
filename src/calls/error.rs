//! Call-related error types.

use crate::types::CallErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("signaling send failed: {0}")]
    Transport(String),

    #[error("rtc token fetch failed (code {code}): {message}")]
    Token { code: i32, message: String },

    #[error("rtc engine error (code {code}): {message}")]
    Engine { code: i32, message: String },

    #[error("roster fetch failed: {0}")]
    Roster(String),

    #[error("malformed signaling message: {0}")]
    Protocol(String),

    #[error("a call is already in progress")]
    Busy,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("no active call")]
    NoActiveCall,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("call coordinator has shut down")]
    Shutdown,
}

impl CallError {
    pub fn kind(&self) -> CallErrorKind {
        match self {
            Self::Transport(_) => CallErrorKind::Transport,
            Self::Token { .. } => CallErrorKind::Token,
            Self::Engine { .. } => CallErrorKind::Engine,
            Self::Roster(_) => CallErrorKind::Roster,
            Self::Protocol(_) => CallErrorKind::Protocol,
            Self::Busy
            | Self::InvalidTransition(_)
            | Self::NoActiveCall
            | Self::InvalidArgument(_)
            | Self::Config(_)
            | Self::Shutdown => CallErrorKind::Usage,
        }
    }

    /// Numeric code reported alongside the kind in `on_call_error`.
    pub fn code(&self) -> i32 {
        match self {
            Self::Token { code, .. } | Self::Engine { code, .. } => *code,
            Self::Transport(_) => 300,
            Self::Roster(_) => 400,
            Self::Protocol(_) => 500,
            Self::Busy => 601,
            Self::InvalidTransition(_) => 602,
            Self::NoActiveCall => 603,
            Self::Config(_) => 604,
            Self::Shutdown => 605,
            Self::InvalidArgument(_) => 606,
        }
    }

    pub fn token(code: i32, message: impl Into<String>) -> Self {
        Self::Token {
            code,
            message: message.into(),
        }
    }

    pub fn engine(code: i32, message: impl Into<String>) -> Self {
        Self::Engine {
            code,
            message: message.into(),
        }
    }
}
