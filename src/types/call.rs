use serde::{Deserialize, Serialize};
use std::fmt;

/// Application-level call identifier, stable for a session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh 32-char uppercase hex identifier.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of call. Immutable once a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    SingleAudio,
    SingleVideo,
    GroupVideo,
}

impl CallType {
    /// Numeric code carried on the wire.
    pub const fn code(&self) -> u8 {
        match self {
            Self::SingleAudio => 0,
            Self::SingleVideo => 1,
            Self::GroupVideo => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::SingleAudio),
            1 => Some(Self::SingleVideo),
            2 => Some(Self::GroupVideo),
            _ => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Self::GroupVideo)
    }

    pub fn has_video(&self) -> bool {
        !matches!(self, Self::SingleAudio)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SingleAudio => "single-audio",
            Self::SingleVideo => "single-video",
            Self::GroupVideo => "group-video",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Why a session reached its terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndCallReason {
    Hangup,
    NoResponse,
    Rejected,
    Busy,
    RemoteBusy,
    NetworkError,
    InternalError,
}

impl fmt::Display for EndCallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hangup => "hangup",
            Self::NoResponse => "no_response",
            Self::Rejected => "rejected",
            Self::Busy => "busy",
            Self::RemoteBusy => "remote_busy",
            Self::NetworkError => "network_error",
            Self::InternalError => "internal_error",
        };
        f.write_str(name)
    }
}

/// Error category reported through `on_call_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    Transport,
    Token,
    Engine,
    Roster,
    Protocol,
    /// API misuse: wrong state, busy, shut down.
    Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    #[default]
    Unknown,
    Good,
    Poor,
    Worse,
    None,
}
