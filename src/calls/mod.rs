//! Call signaling and session coordination over a chat transport.
//!
//! Call control travels as custom messages on an existing instant-messaging
//! connection. Once a call is accepted, media is handled by a pluggable
//! real-time engine joined to a channel derived from the call id.
//!
//! # Architecture
//!
//! - [`SignalKind`] & [`SignalingMessage`]: The seven call-control signals
//! - [`CallState`] & [`CallSession`]: Call state machine for tracking call lifecycle
//! - [`SignalingAdapter`]: Typed signals to and from custom messages
//! - [`MediaSessionBinder`]: Token fetch and RTC engine lifecycle
//! - [`RosterResolver`]: Group member lookup with local-cache fallback
//! - [`InvitationTimer`]: Ring timeout per call
//! - `Coordinator`: Single task owning the active session
//!
//! # Protocol Overview
//!
//! The caller sends `invite` to every invitee. Each invitee acknowledges with
//! `alive` and then answers with `accept`, `reject` or `busy`. The caller may
//! withdraw with `cancel`; either side leaves a connected call with `hangup`.
//! `accept` and `reject` are also copied to the sender's own user id so its
//! other devices stop ringing.

mod coordinator;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod media;
mod messages;
pub mod roster;
pub mod signaling;
pub mod state;
pub mod timer;
pub mod transport;

pub(crate) use coordinator::{Coordinator, CoordinatorParts};
pub(crate) use messages::{Command, CoordinatorEvent};

pub use envelope::{CALL_EVENT, CustomMessage, build_custom_message, parse_custom_message};
pub use error::CallError;
pub use listener::{CallKitListener, NoopHooks, NoopListener, PlatformHooks, RingKind};
pub use media::{
    EngineConfig, EngineEvent, EngineEventSink, EngineHandle, MediaSessionBinder, RtcEngine,
    RtcEngineFactory, RtcToken, RtcTokenProvider,
};
pub use roster::{
    GroupDirectory, GroupProfile, MemberPage, Roster, RosterResolver, RosterResult, RosterSource,
    UserInfoProvider,
};
pub use signaling::{CallExt, SignalKind, SignalingMessage};
pub use state::{CallSession, CallState, CallTransition, InvalidTransition, channel_name_for};
pub use timer::InvitationTimer;
pub use transport::{ConnectionEvent, MessageTransport, SignalingAdapter};
