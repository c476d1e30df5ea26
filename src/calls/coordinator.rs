//! Session coordinator.
//!
//! The coordinator is the only owner of the active [`CallSession`]. API calls,
//! inbound signals, engine callbacks, timer fires and the results of spawned
//! token/roster tasks all arrive through one mailbox and are handled one at a
//! time, so no session state is ever shared.

use super::envelope::CustomMessage;
use super::error::CallError;
use super::listener::{CallKitListener, PlatformHooks, RingKind};
use super::media::{EngineEvent, EngineEventSink, EngineHandle, MediaSessionBinder, RtcToken};
use super::messages::{Command, CoordinatorEvent};
use super::roster::{RosterResolver, RosterResult, UserInfoProvider};
use super::signaling::{CallExt, SignalKind, SignalingMessage};
use super::state::{CallSession, CallState, CallTransition, InvalidTransition};
use super::timer::InvitationTimer;
use super::transport::{ConnectionEvent, Outbox, SignalingAdapter};
use crate::config::CallKitConfig;
use crate::types::{CallId, CallMember, CallType, EndCallReason, InviteState, UserInfo};
use log::{debug, info, warn};
use moka::future::Cache;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const TARGET: &str = "CallKit/Coordinator";

type DedupKey = (CallId, SignalKind, String, String);

fn post(tx: &mpsc::WeakUnboundedSender<CoordinatorEvent>, event: CoordinatorEvent) {
    if let Some(tx) = tx.upgrade() {
        let _ = tx.send(event);
    }
}

/// Remember `key` in the recent-signal cache. Returns false if it was already seen.
async fn remember(seen: &Cache<DedupKey, ()>, key: DedupKey) -> bool {
    if seen.contains_key(&key) {
        return false;
    }
    seen.insert(key, ()).await;
    true
}

/// Collaborators handed to the coordinator at spawn time.
pub(crate) struct CoordinatorParts {
    pub config: CallKitConfig,
    pub adapter: Arc<SignalingAdapter>,
    pub binder: MediaSessionBinder,
    pub roster: Option<Arc<RosterResolver>>,
    pub users: Option<Arc<dyn UserInfoProvider>>,
    pub listener: Arc<dyn CallKitListener>,
    pub hooks: Arc<dyn PlatformHooks>,
}

pub(crate) struct Coordinator {
    mailbox: mpsc::UnboundedReceiver<CoordinatorEvent>,
    self_tx: mpsc::WeakUnboundedSender<CoordinatorEvent>,
    config: CallKitConfig,
    session: Option<CallSession>,
    engine: Option<EngineHandle>,
    token_task: Option<JoinHandle<()>>,
    roster_task: Option<JoinHandle<()>>,
    timer: InvitationTimer,
    outbox: Outbox,
    binder: MediaSessionBinder,
    roster: Option<Arc<RosterResolver>>,
    users: Option<Arc<dyn UserInfoProvider>>,
    listener: Arc<dyn CallKitListener>,
    hooks: Arc<dyn PlatformHooks>,
    // Recently handled signals, for duplicate suppression.
    seen: Cache<DedupKey, ()>,
    /// When the caller stops waiting for invitees that have not answered.
    invite_deadline: Option<Instant>,
}

impl Coordinator {
    pub(crate) fn new(
        mailbox: mpsc::UnboundedReceiver<CoordinatorEvent>,
        self_tx: mpsc::WeakUnboundedSender<CoordinatorEvent>,
        parts: CoordinatorParts,
    ) -> Self {
        let timer_tx = self_tx.clone();
        let timer = InvitationTimer::new(move |call_id, generation| {
            post(&timer_tx, CoordinatorEvent::InviteTimeout { call_id, generation });
        });

        let outbox_tx = self_tx.clone();
        let outbox = Outbox::spawn(parts.adapter, move |message, error| {
            post(&outbox_tx, CoordinatorEvent::SendFailed { message, error });
        });

        Self {
            mailbox,
            self_tx,
            seen: Cache::builder()
                .max_capacity(parts.config.dedup_window as u64)
                .build(),
            invite_deadline: None,
            config: parts.config,
            session: None,
            engine: None,
            token_task: None,
            roster_task: None,
            timer,
            outbox,
            binder: parts.binder,
            roster: parts.roster,
            users: parts.users,
            listener: parts.listener,
            hooks: parts.hooks,
        }
    }

    fn local_user(&self) -> &str {
        self.outbox.adapter().local_user()
    }

    pub(crate) async fn run(mut self) {
        info!(
            target: TARGET,
            "Call coordinator started for {}/{}",
            self.local_user(),
            self.outbox.adapter().device_id()
        );
        while let Some(event) = self.mailbox.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
        if self.session.is_some() {
            self.teardown(EndCallReason::Hangup, true).await;
        }
        info!(target: TARGET, "Call coordinator stopped");
    }

    /// Returns false when the coordinator should stop.
    async fn handle_event(&mut self, event: CoordinatorEvent) -> bool {
        match event {
            CoordinatorEvent::Command(Command::Shutdown) => return false,
            CoordinatorEvent::Command(command) => self.handle_command(command).await,
            CoordinatorEvent::Inbound(raw) => self.handle_inbound(raw).await,
            CoordinatorEvent::Connection(event) => self.handle_connection(event).await,
            CoordinatorEvent::Engine { call_id, event } => {
                self.handle_engine_event(call_id, event).await
            }
            CoordinatorEvent::TokenReady { call_id, result } => {
                self.handle_token(call_id, result).await
            }
            CoordinatorEvent::RosterReady { call_id, result } => {
                self.handle_roster(call_id, result).await
            }
            CoordinatorEvent::InviteTimeout {
                call_id,
                generation,
            } => self.handle_timeout(call_id, generation).await,
            CoordinatorEvent::SendFailed { message, error } => {
                self.handle_send_failure(message, error).await
            }
        }
        true
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartSingle {
                peer_id,
                call_type,
                ext,
                reply,
            } => {
                let result = if call_type.is_group() {
                    Err(CallError::InvalidArgument(
                        "group calls need a group id".to_string(),
                    ))
                } else {
                    self.start_call(call_type, None, vec![peer_id], ext).await
                };
                let _ = reply.send(result);
            }
            Command::StartGroup {
                group_id,
                invitees,
                ext,
                reply,
            } => {
                let result = if group_id.is_empty() {
                    Err(CallError::InvalidArgument("empty group id".to_string()))
                } else {
                    self.start_call(CallType::GroupVideo, Some(group_id), invitees, ext)
                        .await
                };
                let _ = reply.send(result);
            }
            Command::Answer { reply } => {
                let _ = reply.send(self.answer_call().await);
            }
            Command::Refuse { reply } => {
                let _ = reply.send(self.refuse_call().await);
            }
            Command::End { reply } => {
                let _ = reply.send(self.end_call().await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.session.clone());
            }
            Command::Shutdown => {}
        }
    }

    // --- Local intents ---

    async fn start_call(
        &mut self,
        call_type: CallType,
        group_id: Option<String>,
        invitees: Vec<String>,
        ext: CallExt,
    ) -> Result<CallId, CallError> {
        if let Some(session) = &self.session {
            debug!(target: TARGET, "Start refused, call {} is {:?}", session.call_id, session.state);
            return Err(CallError::Busy);
        }

        let local_user = self.local_user().to_string();
        let mut seen = HashSet::new();
        let targets: Vec<String> = invitees
            .into_iter()
            .filter(|id| !id.is_empty() && *id != local_user)
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if targets.is_empty() {
            return Err(CallError::InvalidArgument("no one to invite".to_string()));
        }

        let call_id = CallId::generate();
        let mut session = CallSession::new_outgoing(
            call_id.clone(),
            call_type,
            local_user.clone(),
            group_id.clone(),
            ext.clone(),
        );
        let local_info = self.lookup_user(&local_user);
        let mut local_member = CallMember::from_user_info(local_info.clone());
        local_member.invite_state = InviteState::Accepted;
        session.add_member(local_member);
        for target in &targets {
            session.add_member(CallMember::from_user_info(self.lookup_user(target)));
        }
        session.apply_transition(CallTransition::InviteSent)?;

        info!(
            target: TARGET,
            "Starting {call_type} call {call_id} to {}",
            targets.join(",")
        );

        for target in &targets {
            let invite = self
                .compose(&session, SignalKind::Invite, target)
                .inviter(local_info.clone())
                .ext(ext.clone());
            self.outbox.send(invite);
        }

        self.timer.arm(call_id.clone(), self.config.invite_timeout());
        self.invite_deadline = Some(Instant::now() + self.config.invite_timeout());
        self.spawn_token_fetch(call_id.clone(), session.channel_name.clone());
        self.hooks
            .play_ring(RingKind::Outgoing, self.config.outgoing_ring_file.as_ref());

        let state = session.state;
        self.session = Some(session);
        if let Some(group_id) = group_id {
            self.spawn_roster_refresh(call_id.clone(), group_id);
        }
        self.listener.on_call_state_changed(&call_id, state).await;
        Ok(call_id)
    }

    async fn answer_call(&mut self) -> Result<(), CallError> {
        let session = self.session.as_mut().ok_or(CallError::NoActiveCall)?;
        session.apply_transition(CallTransition::LocalAccepted)?;

        let call_id = session.call_id.clone();
        let channel = session.channel_name.clone();
        let inviter = session.inviter.clone();
        if let Some(member) = session.member_mut(&inviter) {
            member.invite_state = InviteState::Accepted;
        }
        let state = session.state;

        self.timer.arm(call_id.clone(), self.config.connect_timeout());
        info!(target: TARGET, "Answering call {call_id} from {inviter}");
        if let Some(session) = &self.session {
            let accept = self.compose(session, SignalKind::Accept, &inviter);
            self.outbox.send(accept);
        }
        self.spawn_token_fetch(call_id.clone(), channel);
        self.hooks.stop_ring();
        self.listener.on_call_state_changed(&call_id, state).await;
        Ok(())
    }

    async fn refuse_call(&mut self) -> Result<(), CallError> {
        let session = self.session.as_ref().ok_or(CallError::NoActiveCall)?;
        if !session.state.can_refuse() {
            return Err(InvalidTransition {
                current_state: format!("{:?}", session.state),
                attempted: "Refuse".to_string(),
            }
            .into());
        }
        let reason = Self::local_exit_reason(session.state);
        self.teardown(reason, true).await;
        Ok(())
    }

    async fn end_call(&mut self) -> Result<(), CallError> {
        let Some(session) = &self.session else {
            debug!(target: TARGET, "End requested with no active call");
            return Ok(());
        };
        let reason = Self::local_exit_reason(session.state);
        self.teardown(reason, true).await;
        Ok(())
    }

    fn local_exit_reason(state: CallState) -> EndCallReason {
        match state {
            CallState::Ringing => EndCallReason::Rejected,
            _ => EndCallReason::Hangup,
        }
    }

    // --- Inbound signaling ---

    async fn handle_inbound(&mut self, raw: CustomMessage) {
        let adapter = self.outbox.adapter();
        let msg = match adapter.decode(&raw) {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(e) => {
                warn!(target: TARGET, "Dropping call signal from {}: {e}", raw.from);
                return;
            }
        };
        if msg.from_user == adapter.local_user() && msg.from_device == adapter.device_id() {
            return;
        }
        if !remember(&self.seen, msg.dedup_key()).await {
            debug!(
                target: TARGET,
                "Duplicate {} for call {} from {}/{}",
                msg.kind, msg.call_id, msg.from_user, msg.from_device
            );
            return;
        }

        debug!(
            target: TARGET,
            "Received {} for call {} from {}/{}",
            msg.kind, msg.call_id, msg.from_user, msg.from_device
        );

        match msg.kind {
            SignalKind::Invite => self.handle_invite(msg).await,
            _ => self.handle_call_signal(msg).await,
        }
    }

    async fn handle_invite(&mut self, msg: SignalingMessage) {
        let local_user = self.local_user().to_string();
        if msg.from_user == local_user {
            debug!(target: TARGET, "Ignoring invite {} from own device", msg.call_id);
            return;
        }
        if let Some(session) = &self.session {
            if session.call_id == msg.call_id {
                return;
            }
            info!(
                target: TARGET,
                "Busy with {}, declining call {} from {}",
                session.call_id, msg.call_id, msg.from_user
            );
            let busy = self
                .outbox
                .adapter()
                .compose(SignalKind::Busy, &msg.call_id, msg.call_type, &msg.channel_name)
                .to(msg.from_user.clone())
                .group(msg.group_id.clone());
            self.outbox.send(busy);
            return;
        }

        let mut session = CallSession::new_incoming(
            msg.call_id.clone(),
            msg.call_type,
            msg.channel_name.clone(),
            local_user.clone(),
            msg.from_user.clone(),
            msg.group_id.clone(),
            msg.ext.clone(),
        );

        let mut local_member = CallMember::from_user_info(self.lookup_user(&local_user));
        local_member.invite_state = InviteState::Accepted;
        session.add_member(local_member);

        let mut inviter = CallMember::from_user_info(self.lookup_user(&msg.from_user));
        if let Some(info) = &msg.inviter
            && info.nickname.is_some()
        {
            inviter.apply_user_info(info);
        }
        inviter.invite_state = InviteState::Accepted;
        session.add_member(inviter.clone());

        if let Err(e) = session.apply_transition(CallTransition::InviteReceived) {
            warn!(target: TARGET, "Cannot ring for call {}: {e}", msg.call_id);
            return;
        }

        let call_id = session.call_id.clone();
        info!(
            target: TARGET,
            "Incoming {} call {call_id} from {}",
            msg.call_type, msg.from_user
        );

        let alive = self.compose(&session, SignalKind::Alive, &msg.from_user);
        self.outbox.send(alive);
        self.timer.arm(call_id.clone(), self.config.invite_timeout());
        self.hooks
            .play_ring(RingKind::Incoming, self.config.incoming_ring_file.as_ref());
        self.hooks.show_incoming_call(&call_id, &inviter);

        let state = session.state;
        self.session = Some(session);
        if let Some(group_id) = msg.group_id.clone() {
            self.spawn_roster_refresh(call_id.clone(), group_id);
        }
        self.listener.on_call_state_changed(&call_id, state).await;
        self.listener
            .on_received_call(&msg.from_user, msg.call_type, &msg.ext)
            .await;
    }

    async fn handle_call_signal(&mut self, msg: SignalingMessage) {
        let Some(session) = &self.session else {
            debug!(target: TARGET, "Stale {} for call {}, no active call", msg.kind, msg.call_id);
            return;
        };
        if session.call_id != msg.call_id {
            debug!(
                target: TARGET,
                "Stale {} for call {}, active call is {}",
                msg.kind, msg.call_id, session.call_id
            );
            return;
        }

        if msg.from_user == session.local_user {
            if msg.kind.reconciles() {
                self.handle_own_device_signal(msg).await;
            }
            return;
        }

        match msg.kind {
            SignalKind::Accept => self.handle_remote_accept(msg).await,
            SignalKind::Reject | SignalKind::Busy => self.handle_remote_decline(msg).await,
            SignalKind::Cancel => self.handle_remote_cancel(msg).await,
            SignalKind::Hangup => self.handle_remote_hangup(msg).await,
            SignalKind::Alive => self.handle_alive(msg),
            SignalKind::Invite => {}
        }
    }

    /// Another device of the local user answered, declined, was busy or withdrew.
    async fn handle_own_device_signal(&mut self, msg: SignalingMessage) {
        let Some(session) = &self.session else {
            return;
        };
        if session.state != CallState::Ringing {
            return;
        }
        let reason = match msg.kind {
            SignalKind::Accept | SignalKind::Busy => EndCallReason::Busy,
            SignalKind::Reject => EndCallReason::Rejected,
            _ => EndCallReason::Hangup,
        };
        info!(
            target: TARGET,
            "Call {} handled on device {} ({})",
            msg.call_id, msg.from_device, msg.kind
        );
        self.teardown(reason, false).await;
    }

    async fn handle_remote_accept(&mut self, msg: SignalingMessage) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.is_outgoing() {
            return;
        }
        let Some(member) = session.member_mut(&msg.from_user) else {
            debug!(target: TARGET, "Accept from {} who was not invited", msg.from_user);
            return;
        };
        member.invite_state = InviteState::Accepted;

        if session.state != CallState::Inviting {
            return;
        }
        let call_id = session.call_id.clone();
        let mut states = Vec::new();
        if let Err(e) = session.apply_transition(CallTransition::RemoteAccepted) {
            warn!(target: TARGET, "Accept for call {call_id} ignored: {e}");
            return;
        }
        states.push(session.state);
        if session.connected_remote_count() > 0
            && session.apply_transition(CallTransition::MediaConnected).is_ok()
        {
            states.push(session.state);
        }

        info!(target: TARGET, "Call {call_id} accepted by {}", msg.from_user);
        self.timer.arm(call_id.clone(), self.config.connect_timeout());
        self.after_transitions(&call_id, states).await;
    }

    async fn handle_remote_decline(&mut self, msg: SignalingMessage) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.is_outgoing() {
            return;
        }
        match session.member(&msg.from_user) {
            Some(member) if member.invite_state != InviteState::Accepted => {}
            // Declined on one device after accepting on another.
            _ => return,
        }
        session.remove_member(&msg.from_user);
        let ends = !session.call_type.is_group() || !session.has_remote_members();

        let reason = if msg.kind == SignalKind::Busy {
            EndCallReason::RemoteBusy
        } else {
            EndCallReason::Rejected
        };
        info!(target: TARGET, "{} declined call {} ({reason})", msg.from_user, msg.call_id);

        // Other devices of a busy user may still be ringing.
        if msg.kind == SignalKind::Busy
            && let Some(session) = &self.session
        {
            let retract = self.compose(session, SignalKind::Cancel, &msg.from_user);
            self.outbox.send(retract);
        }
        if ends {
            self.teardown(reason, false).await;
        }
    }

    async fn handle_remote_cancel(&mut self, msg: SignalingMessage) {
        let Some(session) = &self.session else {
            return;
        };
        if session.is_outgoing() || msg.from_user != session.inviter {
            return;
        }
        if !session.state.can_refuse() {
            return;
        }
        info!(target: TARGET, "Call {} cancelled by {}", msg.call_id, msg.from_user);
        self.teardown(EndCallReason::Hangup, false).await;
    }

    async fn handle_remote_hangup(&mut self, msg: SignalingMessage) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.remove_member(&msg.from_user).is_none() {
            return;
        }
        info!(target: TARGET, "{} hung up call {}", msg.from_user, msg.call_id);
        if !session.call_type.is_group() || !session.has_remote_members() {
            self.teardown(EndCallReason::Hangup, false).await;
        }
    }

    fn handle_alive(&mut self, msg: SignalingMessage) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(member) = session.member_mut(&msg.from_user)
            && member.invite_state == InviteState::Pending
        {
            member.invite_state = InviteState::Ringing;
        }
    }

    // --- Media engine ---

    async fn handle_engine_event(&mut self, call_id: CallId, event: EngineEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.call_id != call_id {
            debug!(target: TARGET, "Engine event for stale call {call_id}: {event:?}");
            return;
        }

        match event {
            EngineEvent::RemoteJoined { user_id } => self.on_remote_joined(user_id).await,
            EngineEvent::RemoteLeft { user_id } => self.on_remote_left(user_id).await,
            EngineEvent::AudioMuted { user_id, muted } => {
                if let Some(member) = session.member_mut(&user_id) {
                    member.mic_enabled = !muted;
                }
            }
            EngineEvent::VideoEnabled { user_id, enabled } => {
                if let Some(member) = session.member_mut(&user_id) {
                    member.video_enabled = enabled;
                }
            }
            EngineEvent::Speaking { user_ids } => {
                for member in session.members_mut() {
                    member.speaking = user_ids.contains(&member.user_id);
                }
            }
            EngineEvent::NetworkQuality { user_id, quality } => {
                if let Some(member) = session.member_mut(&user_id) {
                    member.network_quality = quality;
                }
            }
            EngineEvent::Error { code, message } => {
                let err = CallError::engine(code, message);
                warn!(target: TARGET, "Engine failure in call {call_id}: {err}");
                self.fail(err, EndCallReason::InternalError, true).await;
            }
        }
    }

    async fn on_remote_joined(&mut self, user_id: String) {
        let info = self.lookup_user(&user_id);
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.is_remote(&user_id) {
            return;
        }
        if session.member(&user_id).is_none() {
            session.add_member(CallMember::from_user_info(info));
        }
        if let Some(member) = session.member_mut(&user_id) {
            member.connected = true;
            member.invite_state = InviteState::Accepted;
        }

        let call_id = session.call_id.clone();
        let call_type = session.call_type;
        let channel = session.channel_name.clone();
        let mut states = Vec::new();
        if session.state == CallState::Inviting
            && session.apply_transition(CallTransition::RemoteAccepted).is_ok()
        {
            states.push(session.state);
        }
        if session.state == CallState::Connecting
            && session.apply_transition(CallTransition::MediaConnected).is_ok()
        {
            states.push(session.state);
        }

        debug!(target: TARGET, "{user_id} joined channel {channel}");
        self.listener
            .on_remote_user_joined(&user_id, call_type, &channel)
            .await;
        self.after_transitions(&call_id, states).await;
    }

    async fn on_remote_left(&mut self, user_id: String) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(member) = session.member_mut(&user_id) else {
            return;
        };
        member.connected = false;
        let call_type = session.call_type;
        let channel = session.channel_name.clone();
        if call_type.is_group() {
            session.remove_member(&user_id);
        }
        let ends = !call_type.is_group() || !session.has_remote_members();

        debug!(target: TARGET, "{user_id} left channel {channel}");
        self.listener
            .on_remote_user_left(&user_id, call_type, &channel)
            .await;
        if ends {
            self.teardown(EndCallReason::Hangup, true).await;
        }
    }

    /// Report state changes and, on first connect, switch the platform UI.
    async fn after_transitions(&mut self, call_id: &CallId, states: Vec<CallState>) {
        for state in states {
            if state == CallState::Active {
                info!(target: TARGET, "Call {call_id} connected");
                self.rearm_for_invitees(call_id);
                self.hooks.stop_ring();
                self.hooks.show_active_call(call_id);
            }
            self.listener.on_call_state_changed(call_id, state).await;
        }
    }

    async fn handle_token(&mut self, call_id: CallId, result: Result<RtcToken, CallError>) {
        let Some(session) = &self.session else {
            debug!(target: TARGET, "Discarding token for ended call {call_id}");
            return;
        };
        if session.call_id != call_id {
            debug!(target: TARGET, "Discarding token for stale call {call_id}");
            return;
        }
        self.token_task = None;

        let token = match result {
            Ok(token) => token,
            Err(e) => {
                warn!(target: TARGET, "Token fetch for call {call_id} failed: {e}");
                self.fail(e, EndCallReason::NetworkError, true).await;
                return;
            }
        };

        let channel = session.channel_name.clone();
        let call_type = session.call_type;
        let local_user = session.local_user.clone();

        let sink_tx = self.self_tx.clone();
        let sink = EngineEventSink::new(call_id.clone(), move |call_id, event| {
            post(&sink_tx, CoordinatorEvent::Engine { call_id, event });
        });
        let mut handle = match self.binder.create_engine(call_type, sink) {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(e, EndCallReason::InternalError, true).await;
                return;
            }
        };
        self.listener.on_rtc_engine_created(handle.engine()).await;

        if let Err(e) = self.binder.join(&mut handle, &channel, &token, &local_user) {
            self.binder.destroy(&mut handle);
            self.fail(e, EndCallReason::InternalError, true).await;
            return;
        }
        debug!(target: TARGET, "Joined channel {channel} for call {call_id}");
        self.engine = Some(handle);
    }

    async fn handle_roster(&mut self, call_id: CallId, result: RosterResult) {
        let Some(session) = &self.session else {
            return;
        };
        if session.call_id != call_id {
            return;
        }
        self.roster_task = None;

        if let Some(err) = result.error() {
            self.listener
                .on_call_error(err.kind(), err.code(), &err.to_string())
                .await;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let mut refreshed = 0usize;
        for resolved in result.roster() {
            if let Some(member) = session.member_mut(&resolved.user_id)
                && resolved.display_name != resolved.user_id
            {
                member.display_name = resolved.display_name;
                if resolved.avatar_ref.is_some() {
                    member.avatar_ref = resolved.avatar_ref;
                }
                refreshed += 1;
            }
        }
        debug!(target: TARGET, "Roster refresh updated {refreshed} members of call {call_id}");
    }

    async fn handle_timeout(&mut self, call_id: CallId, generation: u64) {
        if !self.timer.claim(&call_id, generation) {
            return;
        }
        let Some(session) = &self.session else {
            return;
        };
        if session.call_id != call_id {
            return;
        }
        let state = session.state;
        match state {
            CallState::Inviting | CallState::Ringing => {
                info!(target: TARGET, "Call {call_id} not answered in time");
                self.teardown(EndCallReason::NoResponse, false).await;
            }
            CallState::Connecting => {
                warn!(target: TARGET, "Media for call {call_id} did not connect in time");
                self.teardown(EndCallReason::NetworkError, true).await;
            }
            CallState::Active => self.drop_unanswered_invitees(),
            CallState::Idle | CallState::Ending => {}
        }
    }

    /// Once connected, the timer only tracks the ring window of invitees that
    /// have not answered yet.
    fn rearm_for_invitees(&mut self, call_id: &CallId) {
        let pending = self
            .session
            .as_ref()
            .is_some_and(|s| s.is_outgoing() && !s.pending_invitees().is_empty());
        match self.invite_deadline {
            Some(deadline) if pending => {
                let left = deadline.saturating_duration_since(Instant::now());
                self.timer.arm(call_id.clone(), left);
            }
            _ => {
                self.timer.cancel(call_id);
            }
        }
    }

    /// Invitees' own ring timers have expired by now; stop listing them.
    fn drop_unanswered_invitees(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        for user_id in session.pending_invitees() {
            debug!(target: TARGET, "{user_id} never answered call {}", session.call_id);
            session.remove_member(&user_id);
        }
    }

    async fn handle_send_failure(&mut self, message: SignalingMessage, error: CallError) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.call_id != message.call_id {
            return;
        }
        match message.kind {
            SignalKind::Invite => {
                if session.state == CallState::Inviting || session.state == CallState::Connecting
                {
                    session.remove_member(&message.to_user);
                    if !session.has_remote_members() {
                        self.fail(error, EndCallReason::NetworkError, false).await;
                    }
                }
            }
            SignalKind::Accept => {
                self.fail(error, EndCallReason::NetworkError, false).await;
            }
            _ => {}
        }
    }

    async fn handle_connection(&mut self, event: ConnectionEvent) {
        info!(target: TARGET, "Connection state: {event:?}");
        let live = self.session.as_ref().is_some_and(|s| s.state.is_live());
        if event.is_session_fatal() && live {
            let err = CallError::Transport(format!("chat session lost: {event:?}"));
            self.fail(err, EndCallReason::NetworkError, false).await;
        }
        self.listener.on_connection_state_changed(&event).await;
    }

    // --- Teardown ---

    /// Report a critical error and end the call.
    async fn fail(&mut self, error: CallError, reason: EndCallReason, notify_peers: bool) {
        self.listener
            .on_call_error(error.kind(), error.code(), &error.to_string())
            .await;
        self.teardown(reason, notify_peers).await;
    }

    /// End the active session. `notify_peers` sends the signals that tell the
    /// other side we are leaving.
    async fn teardown(&mut self, reason: EndCallReason, notify_peers: bool) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let call_id = session.call_id.clone();
        let signals = if notify_peers {
            self.exit_signals(&session)
        } else {
            Vec::new()
        };

        self.timer.cancel(&call_id);
        self.invite_deadline = None;
        if let Some(task) = self.token_task.take() {
            task.abort();
        }
        if let Some(task) = self.roster_task.take() {
            task.abort();
        }

        if let Err(e) = session.apply_transition(CallTransition::Terminate { reason }) {
            warn!(target: TARGET, "Terminating call {call_id}: {e}");
        }
        self.listener.on_call_state_changed(&call_id, session.state).await;

        for signal in signals {
            self.outbox.send(signal);
        }
        if let Some(mut engine) = self.engine.take() {
            self.binder.destroy(&mut engine);
        }

        self.hooks.stop_ring();
        if session.connected_at().is_some() {
            self.hooks
                .play_ring(RingKind::Ding, self.config.ding_file.as_ref());
        }
        self.hooks.dismiss_call(&call_id);

        info!(
            target: TARGET,
            "Call {call_id} ended: {reason} (duration {:?}s)",
            session.duration_secs()
        );
        self.listener.on_end_call_with_reason(reason, &session).await;

        if let Err(e) = session.apply_transition(CallTransition::Released) {
            warn!(target: TARGET, "Releasing call {call_id}: {e}");
        }
        self.listener.on_call_state_changed(&call_id, session.state).await;
    }

    /// Signals owed to the other parties when this side leaves the call.
    fn exit_signals(&self, session: &CallSession) -> Vec<SignalingMessage> {
        match session.state {
            CallState::Ringing => {
                vec![self.compose(session, SignalKind::Reject, &session.inviter)]
            }
            CallState::Inviting | CallState::Connecting | CallState::Active => session
                .remote_members()
                .map(|m| {
                    let kind = if m.invite_state == InviteState::Accepted {
                        SignalKind::Hangup
                    } else {
                        SignalKind::Cancel
                    };
                    self.compose(session, kind, &m.user_id)
                })
                .collect(),
            CallState::Idle | CallState::Ending => Vec::new(),
        }
    }

    // --- Helpers ---

    fn compose(&self, session: &CallSession, kind: SignalKind, to: &str) -> SignalingMessage {
        self.outbox
            .adapter()
            .compose(kind, &session.call_id, session.call_type, &session.channel_name)
            .to(to)
            .group(session.group_id.clone())
    }

    fn lookup_user(&self, user_id: &str) -> UserInfo {
        self.users
            .as_ref()
            .and_then(|users| users.get_user(user_id))
            .unwrap_or_else(|| UserInfo::new(user_id))
    }

    fn spawn_token_fetch(&mut self, call_id: CallId, channel: String) {
        if let Some(previous) = self.token_task.take() {
            previous.abort();
        }
        let fetch = self.binder.acquire_token(channel);
        let tx = self.self_tx.clone();
        self.token_task = Some(tokio::spawn(async move {
            let result = fetch.await;
            post(&tx, CoordinatorEvent::TokenReady { call_id, result });
        }));
    }

    fn spawn_roster_refresh(&mut self, call_id: CallId, group_id: String) {
        let Some(resolver) = self.roster.clone() else {
            return;
        };
        let tx = self.self_tx.clone();
        self.roster_task = Some(tokio::spawn(async move {
            let result = resolver.fetch_group_members(&group_id).await;
            post(&tx, CoordinatorEvent::RosterReady { call_id, result });
        }));
    }
}
