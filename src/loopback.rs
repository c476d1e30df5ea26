//! In-memory collaborators.
//!
//! A loopback chat network, token provider and media server that let several
//! [`CallKit`] instances call each other inside one process. Used by the demo
//! binary and by the integration tests.

use crate::callkit::CallKit;
use crate::calls::{
    CallError, CallExt, CallKitListener, CallSession, CallState, ConnectionEvent, CustomMessage,
    EngineConfig, EngineEvent, EngineEventSink, GroupDirectory, GroupProfile, MemberPage,
    MessageTransport, PlatformHooks, RingKind, RtcEngine, RtcEngineFactory, RtcToken,
    RtcTokenProvider, SignalKind, UserInfoProvider,
};
use crate::config::RingSource;
use crate::types::{CallErrorKind, CallId, CallMember, CallType, EndCallReason, UserInfo};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// --- Chat transport ---

#[derive(Clone)]
struct Endpoint {
    device_id: String,
    kit: CallKit,
}

/// Routes custom messages to every device attached for the recipient.
#[derive(Default)]
pub struct LoopbackNetwork {
    endpoints: DashMap<String, Vec<Endpoint>>,
    unreachable: DashSet<String>,
    sent: Mutex<Vec<CustomMessage>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(self: &Arc<Self>) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            network: self.clone(),
        })
    }

    /// Start delivering messages for the kit's user to this device.
    pub fn attach(&self, kit: &CallKit) {
        let mut devices = self.endpoints.entry(kit.local_user().to_string()).or_default();
        devices.retain(|e| e.device_id != kit.device_id());
        devices.push(Endpoint {
            device_id: kit.device_id().to_string(),
            kit: kit.clone(),
        });
    }

    pub fn detach(&self, user_id: &str, device_id: &str) {
        if let Some(mut devices) = self.endpoints.get_mut(user_id) {
            devices.retain(|e| e.device_id != device_id);
        }
    }

    /// Make sends to `user_id` fail.
    pub fn set_unreachable(&self, user_id: &str, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(user_id.to_string());
        } else {
            self.unreachable.remove(user_id);
        }
    }

    /// Push a connection-state change to every attached device.
    pub fn broadcast_connection(&self, event: ConnectionEvent) {
        for devices in self.endpoints.iter() {
            for endpoint in devices.value() {
                endpoint.kit.connection_event(event.clone());
            }
        }
    }

    /// Inject a raw message as if it arrived from the server.
    pub fn inject(&self, message: CustomMessage) {
        self.route(message);
    }

    pub fn sent(&self) -> Vec<CustomMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Successfully sent call signals, as `(from, to, kind)`.
    pub fn signals(&self) -> Vec<(String, String, SignalKind)> {
        self.sent()
            .into_iter()
            .filter_map(|m| {
                let kind = SignalKind::from_tag(m.params.get("action")?)?;
                Some((m.from, m.to, kind))
            })
            .collect()
    }

    pub fn signals_of(&self, kind: SignalKind) -> Vec<(String, String)> {
        self.signals()
            .into_iter()
            .filter(|(_, _, k)| *k == kind)
            .map(|(from, to, _)| (from, to))
            .collect()
    }

    pub fn clear_sent(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }

    fn route(&self, message: CustomMessage) {
        let devices = self
            .endpoints
            .get(&message.to)
            .map(|d| d.value().clone())
            .unwrap_or_default();
        if devices.is_empty() {
            debug!("No device online for {}, message dropped", message.to);
        }
        for endpoint in devices {
            endpoint.kit.deliver_message(message.clone());
        }
    }
}

pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl MessageTransport for LoopbackTransport {
    async fn send(&self, message: CustomMessage) -> Result<(), anyhow::Error> {
        if self.network.unreachable.contains(&message.to) {
            anyhow::bail!("user {} is unreachable", message.to);
        }
        if let Ok(mut sent) = self.network.sent.lock() {
            sent.push(message.clone());
        }
        self.network.route(message);
        Ok(())
    }
}

// --- Tokens ---

#[derive(Default)]
pub struct LoopbackTokenProvider {
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
    requests: AtomicUsize,
}

impl LoopbackTokenProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut d) = self.delay.lock() {
            *d = delay;
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RtcTokenProvider for LoopbackTokenProvider {
    fn app_id(&self) -> String {
        "loopback".to_string()
    }

    async fn fetch_token(&self, channel: &str) -> Result<RtcToken, CallError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CallError::token(401, "token service rejected the request"));
        }
        Ok(RtcToken::new(format!("loopback:{channel}")))
    }
}

// --- Media ---

struct Participant {
    engine_id: usize,
    user_id: String,
    events: EngineEventSink,
}

/// Channels shared by all loopback engines.
#[derive(Default)]
pub struct LoopbackMediaServer {
    channels: DashMap<String, Vec<Participant>>,
    next_engine: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    fail_create: AtomicBool,
}

impl LoopbackMediaServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>) -> Arc<LoopbackEngineFactory> {
        Arc::new(LoopbackEngineFactory {
            server: self.clone(),
        })
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn engines_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn engines_destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn participants(&self, channel: &str) -> Vec<String> {
        self.channels
            .get(channel)
            .map(|p| p.iter().map(|p| p.user_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Raise an engine callback on `user_id`'s engine in `channel`.
    pub fn emit_to(&self, channel: &str, user_id: &str, event: EngineEvent) -> bool {
        let Some(participants) = self.channels.get(channel) else {
            return false;
        };
        match participants.iter().find(|p| p.user_id == user_id) {
            Some(p) => {
                p.events.emit(event);
                true
            }
            None => false,
        }
    }

    fn join(&self, engine_id: usize, channel: &str, user_id: &str, events: EngineEventSink) {
        let mut participants = self.channels.entry(channel.to_string()).or_default();
        for other in participants.iter() {
            events.emit(EngineEvent::RemoteJoined {
                user_id: other.user_id.clone(),
            });
            other.events.emit(EngineEvent::RemoteJoined {
                user_id: user_id.to_string(),
            });
        }
        participants.push(Participant {
            engine_id,
            user_id: user_id.to_string(),
            events,
        });
    }

    fn leave(&self, engine_id: usize, channel: &str) {
        let Some(mut participants) = self.channels.get_mut(channel) else {
            return;
        };
        let Some(pos) = participants.iter().position(|p| p.engine_id == engine_id) else {
            return;
        };
        let left = participants.remove(pos);
        for other in participants.iter() {
            other.events.emit(EngineEvent::RemoteLeft {
                user_id: left.user_id.clone(),
            });
        }
    }
}

pub struct LoopbackEngineFactory {
    server: Arc<LoopbackMediaServer>,
}

impl RtcEngineFactory for LoopbackEngineFactory {
    fn create_engine(
        &self,
        config: &EngineConfig,
        events: EngineEventSink,
    ) -> Result<Arc<dyn RtcEngine>, CallError> {
        if self.server.fail_create.load(Ordering::SeqCst) {
            return Err(CallError::engine(110, "engine initialization failed"));
        }
        let id = self.server.next_engine.fetch_add(1, Ordering::SeqCst);
        self.server.created.fetch_add(1, Ordering::SeqCst);
        debug!("Loopback engine {id} created for app {}", config.app_id);
        Ok(Arc::new(LoopbackEngine {
            id,
            server: self.server.clone(),
            events,
            channel: Mutex::new(None),
        }))
    }
}

pub struct LoopbackEngine {
    id: usize,
    server: Arc<LoopbackMediaServer>,
    events: EngineEventSink,
    channel: Mutex<Option<String>>,
}

impl RtcEngine for LoopbackEngine {
    fn join_channel(&self, channel: &str, token: &str, user_id: &str) -> Result<(), CallError> {
        if !token.ends_with(channel) {
            return Err(CallError::engine(109, "token does not match channel"));
        }
        let mut current = self
            .channel
            .lock()
            .map_err(|_| CallError::engine(-1, "engine state poisoned"))?;
        if current.is_some() {
            return Err(CallError::engine(17, "already in a channel"));
        }
        *current = Some(channel.to_string());
        drop(current);
        self.server.join(self.id, channel, user_id, self.events.clone());
        Ok(())
    }

    fn leave_channel(&self) -> Result<(), CallError> {
        let channel = self
            .channel
            .lock()
            .map_err(|_| CallError::engine(-1, "engine state poisoned"))?
            .take();
        if let Some(channel) = channel {
            self.server.leave(self.id, &channel);
        }
        Ok(())
    }

    fn destroy(&self) {
        let _ = self.leave_channel();
        self.server.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

// --- Directories ---

/// Group directory backed by fixed data.
pub struct StaticGroupDirectory {
    server: DashMap<String, GroupProfile>,
    local: DashMap<String, GroupProfile>,
    failing: AtomicBool,
    page_requests: AtomicUsize,
}

impl StaticGroupDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            server: DashMap::new(),
            local: DashMap::new(),
            failing: AtomicBool::new(false),
            page_requests: AtomicUsize::new(0),
        })
    }

    /// Group as the server knows it.
    pub fn insert_group(&self, profile: GroupProfile) {
        self.server.insert(profile.group_id.clone(), profile);
    }

    /// Group as the local cache knows it.
    pub fn insert_local(&self, profile: GroupProfile) {
        self.local.insert(profile.group_id.clone(), profile);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn page_requests(&self) -> usize {
        self.page_requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GroupDirectory for StaticGroupDirectory {
    async fn fetch_member_page(
        &self,
        group_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<MemberPage, anyhow::Error> {
        self.page_requests.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("group service unavailable");
        }
        let profile = self
            .server
            .get(group_id)
            .ok_or_else(|| anyhow::anyhow!("unknown group {group_id}"))?;
        let start = cursor.map(str::parse::<usize>).transpose()?.unwrap_or(0);
        let end = (start + limit).min(profile.members.len());
        let user_ids = profile.members.get(start..end).unwrap_or_default().to_vec();
        let cursor = (end < profile.members.len()).then(|| end.to_string());
        Ok(MemberPage { user_ids, cursor })
    }

    async fn fetch_group(&self, group_id: &str) -> Result<GroupProfile, anyhow::Error> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("group service unavailable");
        }
        self.server
            .get(group_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| anyhow::anyhow!("unknown group {group_id}"))
    }

    fn local_group(&self, group_id: &str) -> Option<GroupProfile> {
        self.local.get(group_id).map(|p| p.value().clone())
    }
}

#[derive(Default)]
pub struct StaticUserDirectory {
    users: DashMap<String, UserInfo>,
    /// Ids only resolvable through the batch lookup.
    remote_only: DashSet<String>,
}

impl StaticUserDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, info: UserInfo) {
        self.users.insert(info.user_id.clone(), info);
    }

    pub fn insert_remote_only(&self, info: UserInfo) {
        self.remote_only.insert(info.user_id.clone());
        self.insert(info);
    }
}

#[async_trait]
impl UserInfoProvider for StaticUserDirectory {
    fn get_user(&self, user_id: &str) -> Option<UserInfo> {
        if self.remote_only.contains(user_id) {
            return None;
        }
        self.users.get(user_id).map(|u| u.value().clone())
    }

    async fn fetch_users(&self, user_ids: &[String]) -> Result<Vec<UserInfo>, anyhow::Error> {
        Ok(user_ids
            .iter()
            .filter_map(|id| self.users.get(id).map(|u| u.value().clone()))
            .collect())
    }
}

// --- Recording listener and hooks ---

#[derive(Debug, Clone)]
pub enum ListenerEvent {
    ReceivedCall { user_id: String, call_type: CallType },
    RemoteJoined { user_id: String },
    RemoteLeft { user_id: String },
    Ended { reason: EndCallReason, call: Box<CallSession> },
    Error { kind: CallErrorKind, code: i32 },
    EngineCreated,
    StateChanged { call_id: CallId, state: CallState },
    Connection(ConnectionEvent),
}

/// Listener that keeps every callback for later inspection.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: ListenerEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn end_reasons(&self) -> Vec<EndCallReason> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ListenerEvent::Ended { reason, .. } => Some(reason),
                _ => None,
            })
            .collect()
    }

    pub fn ended_calls(&self) -> Vec<CallSession> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ListenerEvent::Ended { call, .. } => Some(*call),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<(CallErrorKind, i32)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ListenerEvent::Error { kind, code } => Some((kind, code)),
                _ => None,
            })
            .collect()
    }

    pub fn states(&self) -> Vec<CallState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ListenerEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn received_calls(&self) -> Vec<(String, CallType)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ListenerEvent::ReceivedCall { user_id, call_type } => Some((user_id, call_type)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&ListenerEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

#[async_trait]
impl CallKitListener for RecordingListener {
    async fn on_received_call(&self, user_id: &str, call_type: CallType, _ext: &CallExt) {
        self.push(ListenerEvent::ReceivedCall {
            user_id: user_id.to_string(),
            call_type,
        });
    }

    async fn on_remote_user_joined(&self, user_id: &str, _call_type: CallType, _channel: &str) {
        self.push(ListenerEvent::RemoteJoined {
            user_id: user_id.to_string(),
        });
    }

    async fn on_remote_user_left(&self, user_id: &str, _call_type: CallType, _channel: &str) {
        self.push(ListenerEvent::RemoteLeft {
            user_id: user_id.to_string(),
        });
    }

    async fn on_end_call_with_reason(&self, reason: EndCallReason, call: &CallSession) {
        self.push(ListenerEvent::Ended {
            reason,
            call: Box::new(call.clone()),
        });
    }

    async fn on_call_error(&self, kind: CallErrorKind, code: i32, _description: &str) {
        self.push(ListenerEvent::Error { kind, code });
    }

    async fn on_rtc_engine_created(&self, _engine: Arc<dyn RtcEngine>) {
        self.push(ListenerEvent::EngineCreated);
    }

    async fn on_call_state_changed(&self, call_id: &CallId, state: CallState) {
        self.push(ListenerEvent::StateChanged {
            call_id: call_id.clone(),
            state,
        });
    }

    async fn on_connection_state_changed(&self, event: &ConnectionEvent) {
        self.push(ListenerEvent::Connection(event.clone()));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    ShowIncoming { call_id: CallId, caller: String },
    ShowActive(CallId),
    Dismiss(CallId),
    PlayRing(RingKind, Option<RingSource>),
    StopRing,
}

#[derive(Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<HookEvent>>,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, event: HookEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn rings(&self) -> Vec<RingKind> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                HookEvent::PlayRing(kind, _) => Some(kind),
                _ => None,
            })
            .collect()
    }
}

impl PlatformHooks for RecordingHooks {
    fn show_incoming_call(&self, call_id: &CallId, caller: &CallMember) {
        self.push(HookEvent::ShowIncoming {
            call_id: call_id.clone(),
            caller: caller.display_name.clone(),
        });
    }

    fn show_active_call(&self, call_id: &CallId) {
        self.push(HookEvent::ShowActive(call_id.clone()));
    }

    fn dismiss_call(&self, call_id: &CallId) {
        self.push(HookEvent::Dismiss(call_id.clone()));
    }

    fn play_ring(&self, kind: RingKind, source: Option<&RingSource>) {
        self.push(HookEvent::PlayRing(kind, source.cloned()));
    }

    fn stop_ring(&self) {
        self.push(HookEvent::StopRing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_directory_pages() {
        let dir = StaticGroupDirectory::new();
        dir.insert_group(GroupProfile {
            group_id: "g1".into(),
            owner: Some("o".into()),
            admins: vec![],
            members: (0..5).map(|i| format!("u{i}")).collect(),
        });

        let first = dir.fetch_member_page("g1", None, 2).await.unwrap();
        assert_eq!(first.user_ids, vec!["u0", "u1"]);
        assert_eq!(first.cursor.as_deref(), Some("2"));

        let last = dir.fetch_member_page("g1", Some("4"), 2).await.unwrap();
        assert_eq!(last.user_ids, vec!["u4"]);
        assert!(last.cursor.is_none());

        assert!(dir.fetch_member_page("nope", None, 2).await.is_err());
    }

    #[test]
    fn test_media_server_pairs_participants() {
        let server = LoopbackMediaServer::new();
        let factory = server.factory();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mk = |user: &'static str| {
            let seen = seen.clone();
            let sink = EngineEventSink::new(CallId::new("C1"), move |_, ev| {
                seen.lock().unwrap().push((user, ev));
            });
            let config = EngineConfig {
                app_id: "loopback".into(),
                call_type: CallType::SingleAudio,
            };
            factory.create_engine(&config, sink).unwrap()
        };

        let a = mk("a");
        let b = mk("b");
        a.join_channel("ch", "loopback:ch", "u1").unwrap();
        b.join_channel("ch", "loopback:ch", "u2").unwrap();
        assert_eq!(server.participants("ch"), vec!["u1", "u2"]);

        b.destroy();
        a.destroy();
        a.destroy();

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&(
            "a",
            EngineEvent::RemoteJoined {
                user_id: "u2".into()
            }
        )));
        assert!(seen.contains(&(
            "b",
            EngineEvent::RemoteJoined {
                user_id: "u1".into()
            }
        )));
        assert!(seen.contains(&(
            "a",
            EngineEvent::RemoteLeft {
                user_id: "u2".into()
            }
        )));
        assert!(server.participants("ch").is_empty());
    }

    #[test]
    fn test_join_rejects_foreign_token() {
        let server = LoopbackMediaServer::new();
        let engine = server
            .factory()
            .create_engine(
                &EngineConfig {
                    app_id: "loopback".into(),
                    call_type: CallType::SingleAudio,
                },
                EngineEventSink::new(CallId::new("C1"), |_, _| {}),
            )
            .unwrap();
        assert!(engine.join_channel("ch", "loopback:other", "u1").is_err());
    }
}
