//! Call signaling message definitions.
//!
//! Signals travel as custom messages over the chat transport. Every signal
//! carries the call id it belongs to, so a receiver can drop anything that no
//! longer matches its active session.

use crate::types::{CallId, CallType, UserInfo};
use serde_json::{Map, Value};
use std::fmt;

/// Opaque application payload attached to an invite.
pub type CallExt = Map<String, Value>;

/// Signaling message kinds used for call control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Call invitation from the caller to each invitee.
    Invite,
    /// Invitee answered.
    Accept,
    /// Invitee declined.
    Reject,
    /// Caller withdrew the invitation before it was answered.
    Cancel,
    /// Invitee is already in another call.
    Busy,
    /// Either party left a connected call.
    Hangup,
    /// Ring acknowledgment from invitee to caller.
    Alive,
}

impl SignalKind {
    pub const ALL: [SignalKind; 7] = [
        Self::Invite,
        Self::Accept,
        Self::Reject,
        Self::Cancel,
        Self::Busy,
        Self::Hangup,
        Self::Alive,
    ];

    /// Action name carried in the custom message.
    pub const fn tag_name(&self) -> &'static str {
        match self {
            Self::Invite => "invite",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
            Self::Busy => "busy",
            Self::Hangup => "hangup",
            Self::Alive => "alive",
        }
    }

    /// Parse from action name (case-insensitive).
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.to_lowercase().as_str() {
            "invite" => Some(Self::Invite),
            "accept" => Some(Self::Accept),
            "reject" => Some(Self::Reject),
            "cancel" => Some(Self::Cancel),
            "busy" => Some(Self::Busy),
            "hangup" => Some(Self::Hangup),
            "alive" | "heartbeat" => Some(Self::Alive),
            _ => None,
        }
    }

    /// Whether the sender also copies this signal to its own other devices.
    pub const fn syncs_own_devices(&self) -> bool {
        matches!(self, Self::Accept | Self::Reject | Self::Busy)
    }

    /// Whether a copy from another of our own devices must retract the call here.
    pub const fn reconciles(&self) -> bool {
        matches!(self, Self::Accept | Self::Reject | Self::Busy | Self::Cancel)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag_name().to_uppercase())
    }
}

/// Typed signaling envelope. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingMessage {
    pub kind: SignalKind,
    pub call_id: CallId,
    pub from_user: String,
    pub from_device: String,
    /// Recipient user id. Group invites still address each invitee directly.
    pub to_user: String,
    pub group_id: Option<String>,
    pub call_type: CallType,
    pub channel_name: String,
    /// Caller's presentation info, sent with invites.
    pub inviter: Option<UserInfo>,
    pub ext: CallExt,
}

impl SignalingMessage {
    pub fn new(
        kind: SignalKind,
        call_id: CallId,
        call_type: CallType,
        channel_name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            call_id,
            from_user: String::new(),
            from_device: String::new(),
            to_user: String::new(),
            group_id: None,
            call_type,
            channel_name: channel_name.into(),
            inviter: None,
            ext: CallExt::new(),
        }
    }

    pub fn from(mut self, user: impl Into<String>, device: impl Into<String>) -> Self {
        self.from_user = user.into();
        self.from_device = device.into();
        self
    }

    pub fn to(mut self, user: impl Into<String>) -> Self {
        self.to_user = user.into();
        self
    }

    pub fn group(mut self, group_id: Option<String>) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn inviter(mut self, info: UserInfo) -> Self {
        self.inviter = Some(info);
        self
    }

    pub fn ext(mut self, ext: CallExt) -> Self {
        self.ext = ext;
        self
    }

    /// Copy of this message addressed to someone else.
    pub fn readdressed(&self, user: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.to_user = user.into();
        copy
    }

    /// Key used to suppress retransmitted duplicates.
    pub fn dedup_key(&self) -> (CallId, SignalKind, String, String) {
        (
            self.call_id.clone(),
            self.kind,
            self.from_user.clone(),
            self.from_device.clone(),
        )
    }
}
