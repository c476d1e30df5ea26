//! Host-facing callbacks.

use super::media::RtcEngine;
use super::signaling::CallExt;
use super::state::{CallSession, CallState};
use super::transport::ConnectionEvent;
use crate::config::RingSource;
use crate::types::{CallErrorKind, CallId, CallMember, CallType, EndCallReason};
use async_trait::async_trait;
use std::sync::Arc;

/// Call lifecycle notifications.
///
/// All methods have empty defaults so hosts only implement what they show.
/// Callbacks are awaited in order on the coordinator task; a slow listener
/// delays the next event.
#[async_trait]
pub trait CallKitListener: Send + Sync {
    async fn on_received_call(&self, _user_id: &str, _call_type: CallType, _ext: &CallExt) {}

    async fn on_remote_user_joined(&self, _user_id: &str, _call_type: CallType, _channel: &str) {}

    async fn on_remote_user_left(&self, _user_id: &str, _call_type: CallType, _channel: &str) {}

    /// Raised exactly once per session, after resources are released.
    async fn on_end_call_with_reason(&self, _reason: EndCallReason, _call: &CallSession) {}

    async fn on_call_error(&self, _kind: CallErrorKind, _code: i32, _description: &str) {}

    async fn on_rtc_engine_created(&self, _engine: Arc<dyn RtcEngine>) {}

    async fn on_call_state_changed(&self, _call_id: &CallId, _state: CallState) {}

    async fn on_connection_state_changed(&self, _event: &ConnectionEvent) {}
}

/// Listener that ignores everything.
pub struct NoopListener;

#[async_trait]
impl CallKitListener for NoopListener {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    Outgoing,
    Incoming,
    /// Short tone when a connected call ends.
    Ding,
}

/// Platform telephony and sound hints. Fire-and-forget.
pub trait PlatformHooks: Send + Sync {
    fn show_incoming_call(&self, _call_id: &CallId, _caller: &CallMember) {}

    fn show_active_call(&self, _call_id: &CallId) {}

    fn dismiss_call(&self, _call_id: &CallId) {}

    /// `source` is the configured sound for `kind`, if any.
    fn play_ring(&self, _kind: RingKind, _source: Option<&RingSource>) {}

    fn stop_ring(&self) {}
}

pub struct NoopHooks;

impl PlatformHooks for NoopHooks {}
