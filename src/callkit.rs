//! Public handle to the call coordinator.

use crate::calls::{
    CallError, CallExt, CallKitListener, CallSession, CallState, Command, ConnectionEvent,
    Coordinator, CoordinatorEvent, CoordinatorParts, CustomMessage, GroupDirectory,
    MediaSessionBinder, MessageTransport, NoopHooks, NoopListener, PlatformHooks, RosterResolver,
    RosterResult, RtcEngineFactory, RtcTokenProvider, SignalingAdapter, UserInfoProvider,
};
use crate::config::CallKitConfig;
use crate::types::{CallId, CallType};
use log::warn;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Cheap, cloneable handle. Every call is forwarded to the coordinator task;
/// dropping the last handle stops it.
#[derive(Clone)]
pub struct CallKit {
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
    roster: Option<Arc<RosterResolver>>,
    local_user: Arc<str>,
    device_id: Arc<str>,
}

impl CallKit {
    pub fn builder(local_user: impl Into<String>, device_id: impl Into<String>) -> CallKitBuilder {
        CallKitBuilder::new(local_user.into(), device_id.into())
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordinatorEvent::Command(make(reply_tx)))
            .map_err(|_| CallError::Shutdown)?;
        reply_rx.await.map_err(|_| CallError::Shutdown)
    }

    pub async fn start_single_call(
        &self,
        peer_id: impl Into<String>,
        call_type: CallType,
        ext: CallExt,
    ) -> Result<CallId, CallError> {
        let peer_id = peer_id.into();
        self.request(|reply| Command::StartSingle {
            peer_id,
            call_type,
            ext,
            reply,
        })
        .await?
    }

    pub async fn start_group_call(
        &self,
        group_id: impl Into<String>,
        invitees: Vec<String>,
        ext: CallExt,
    ) -> Result<CallId, CallError> {
        let group_id = group_id.into();
        self.request(|reply| Command::StartGroup {
            group_id,
            invitees,
            ext,
            reply,
        })
        .await?
    }

    pub async fn answer_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Answer { reply }).await?
    }

    pub async fn refuse_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Refuse { reply }).await?
    }

    /// End the current call. Succeeds as a no-op when idle.
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await?
    }

    /// Resolve a group's members. Does not touch the active call.
    pub async fn fetch_group_members(&self, group_id: &str) -> Result<RosterResult, CallError> {
        let resolver = self
            .roster
            .as_ref()
            .ok_or_else(|| CallError::Config("no group directory configured".to_string()))?;
        Ok(resolver.fetch_group_members(group_id).await)
    }

    pub async fn current_call(&self) -> Option<CallSession> {
        self.request(|reply| Command::Snapshot { reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn state(&self) -> CallState {
        self.current_call()
            .await
            .map(|session| session.state)
            .unwrap_or_default()
    }

    /// Entry point for custom messages received from the chat transport.
    pub fn deliver_message(&self, message: CustomMessage) {
        if self.tx.send(CoordinatorEvent::Inbound(message)).is_err() {
            warn!("Call coordinator is gone, dropping inbound message");
        }
    }

    pub fn connection_event(&self, event: ConnectionEvent) {
        if self.tx.send(CoordinatorEvent::Connection(event)).is_err() {
            warn!("Call coordinator is gone, dropping connection event");
        }
    }

    /// Stop the coordinator. An active call is ended first.
    pub fn shutdown(&self) {
        let _ = self.tx.send(CoordinatorEvent::Command(Command::Shutdown));
    }

    /// Whether the coordinator task is still accepting events.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl std::fmt::Debug for CallKit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallKit")
            .field("local_user", &self.local_user)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

pub struct CallKitBuilder {
    local_user: String,
    device_id: String,
    config: CallKitConfig,
    transport: Option<Arc<dyn MessageTransport>>,
    tokens: Option<Arc<dyn RtcTokenProvider>>,
    engines: Option<Arc<dyn RtcEngineFactory>>,
    directory: Option<Arc<dyn GroupDirectory>>,
    users: Option<Arc<dyn UserInfoProvider>>,
    listener: Option<Arc<dyn CallKitListener>>,
    hooks: Option<Arc<dyn PlatformHooks>>,
}

impl CallKitBuilder {
    fn new(local_user: String, device_id: String) -> Self {
        Self {
            local_user,
            device_id,
            config: CallKitConfig::default(),
            transport: None,
            tokens: None,
            engines: None,
            directory: None,
            users: None,
            listener: None,
            hooks: None,
        }
    }

    pub fn config(mut self, config: CallKitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn token_provider(mut self, tokens: Arc<dyn RtcTokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn engine_factory(mut self, engines: Arc<dyn RtcEngineFactory>) -> Self {
        self.engines = Some(engines);
        self
    }

    pub fn group_directory(mut self, directory: Arc<dyn GroupDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn user_info_provider(mut self, users: Arc<dyn UserInfoProvider>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn CallKitListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn platform_hooks(mut self, hooks: Arc<dyn PlatformHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Spawn the coordinator. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<CallKit, CallError> {
        self.config.validate()?;
        if self.local_user.is_empty() || self.device_id.is_empty() {
            return Err(CallError::Config("user id and device id are required".into()));
        }
        let transport = self
            .transport
            .ok_or_else(|| CallError::Config("message transport is required".into()))?;
        let tokens = self
            .tokens
            .ok_or_else(|| CallError::Config("rtc token provider is required".into()))?;
        let engines = self
            .engines
            .ok_or_else(|| CallError::Config("rtc engine factory is required".into()))?;

        let roster = self.directory.map(|directory| {
            Arc::new(
                RosterResolver::new(directory, self.users.clone()).with_limits(
                    self.config.roster_page_size,
                    self.config.roster_max_members,
                ),
            )
        });

        let adapter = Arc::new(SignalingAdapter::new(
            transport,
            self.local_user.clone(),
            self.device_id.clone(),
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        let parts = CoordinatorParts {
            config: self.config,
            adapter,
            binder: MediaSessionBinder::new(tokens, engines),
            roster: roster.clone(),
            users: self.users,
            listener: self.listener.unwrap_or_else(|| Arc::new(NoopListener)),
            hooks: self.hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
        };
        let coordinator = Coordinator::new(rx, tx.downgrade(), parts);
        tokio::spawn(coordinator.run());

        Ok(CallKit {
            tx,
            roster,
            local_user: self.local_user.into(),
            device_id: self.device_id.into(),
        })
    }
}
