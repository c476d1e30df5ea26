//! Call state machine implementation.

use super::signaling::CallExt;
use crate::types::{
    CallDirection, CallId, CallMember, CallType, EndCallReason, InviteState,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle state of the coordinator's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    #[default]
    Idle,
    /// Outgoing: invites sent, nobody has accepted yet.
    Inviting,
    /// Incoming: ringing locally.
    Ringing,
    /// Accepted, waiting for the first remote member in the channel.
    Connecting,
    /// At least one remote member is in the channel.
    Active,
    /// Terminal decision taken, resources being released.
    Ending,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Inviting | Self::Ringing)
    }

    pub fn can_answer(&self) -> bool {
        matches!(self, Self::Ringing)
    }

    pub fn can_refuse(&self) -> bool {
        matches!(self, Self::Inviting | Self::Ringing | Self::Connecting)
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Idle | Self::Ending)
    }
}

/// State transitions for a session.
#[derive(Debug, Clone)]
pub enum CallTransition {
    InviteSent,
    InviteReceived,
    LocalAccepted,
    RemoteAccepted,
    MediaConnected,
    Terminate { reason: EndCallReason },
    Released,
}

/// Channel name handed to the media engine.
pub fn channel_name_for(call_id: &CallId, group_id: Option<&str>) -> String {
    match group_id {
        Some(group_id) => format!("callkit_{group_id}_{call_id}"),
        None => format!("callkit_{call_id}"),
    }
}

/// The unit of lifecycle. Owned and mutated only by the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub call_id: CallId,
    pub call_type: CallType,
    pub channel_name: String,
    pub direction: CallDirection,
    pub state: CallState,
    pub group_id: Option<String>,
    /// User who sent the invitation.
    pub inviter: String,
    pub local_user: String,
    pub ext: CallExt,
    members: Vec<CallMember>,
    started_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    end_reason: Option<EndCallReason>,
}

impl CallSession {
    pub fn new_outgoing(
        call_id: CallId,
        call_type: CallType,
        local_user: impl Into<String>,
        group_id: Option<String>,
        ext: CallExt,
    ) -> Self {
        let local_user = local_user.into();
        let channel_name = channel_name_for(&call_id, group_id.as_deref());
        Self {
            call_id,
            call_type,
            channel_name,
            direction: CallDirection::Outgoing,
            state: CallState::Idle,
            group_id,
            inviter: local_user.clone(),
            local_user,
            ext,
            members: Vec::new(),
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn new_incoming(
        call_id: CallId,
        call_type: CallType,
        channel_name: impl Into<String>,
        local_user: impl Into<String>,
        inviter: impl Into<String>,
        group_id: Option<String>,
        ext: CallExt,
    ) -> Self {
        Self {
            call_id,
            call_type,
            channel_name: channel_name.into(),
            direction: CallDirection::Incoming,
            state: CallState::Idle,
            group_id,
            inviter: inviter.into(),
            local_user: local_user.into(),
            ext,
            members: Vec::new(),
            started_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn end_reason(&self) -> Option<EndCallReason> {
        self.end_reason
    }

    /// Seconds spent in a connected call, if it ever connected.
    pub fn duration_secs(&self) -> Option<i64> {
        let connected_at = self.connected_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        Some(end.signed_duration_since(connected_at).num_seconds())
    }

    pub fn members(&self) -> &[CallMember] {
        &self.members
    }

    pub fn member(&self, user_id: &str) -> Option<&CallMember> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    pub fn members_mut(&mut self) -> impl Iterator<Item = &mut CallMember> {
        self.members.iter_mut()
    }

    pub fn member_mut(&mut self, user_id: &str) -> Option<&mut CallMember> {
        self.members.iter_mut().find(|m| m.user_id == user_id)
    }

    /// Insert a member unless one with the same user id exists. Returns
    /// whether the member was inserted.
    pub fn add_member(&mut self, member: CallMember) -> bool {
        if self.member(&member.user_id).is_some() {
            return false;
        }
        self.members.push(member);
        true
    }

    pub fn remove_member(&mut self, user_id: &str) -> Option<CallMember> {
        let pos = self.members.iter().position(|m| m.user_id == user_id)?;
        Some(self.members.remove(pos))
    }

    pub fn is_remote(&self, user_id: &str) -> bool {
        user_id != self.local_user
    }

    pub fn remote_members(&self) -> impl Iterator<Item = &CallMember> {
        self.members.iter().filter(|m| m.user_id != self.local_user)
    }

    pub fn has_remote_members(&self) -> bool {
        self.remote_members().next().is_some()
    }

    pub fn connected_remote_count(&self) -> usize {
        self.remote_members().filter(|m| m.connected).count()
    }

    /// Remote members that have not accepted yet.
    pub fn pending_invitees(&self) -> Vec<String> {
        self.remote_members()
            .filter(|m| m.invite_state != InviteState::Accepted)
            .map(|m| m.user_id.clone())
            .collect()
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_state = match (self.state, &transition) {
            (CallState::Idle, CallTransition::InviteSent) => CallState::Inviting,
            (CallState::Idle, CallTransition::InviteReceived) => CallState::Ringing,
            (CallState::Ringing, CallTransition::LocalAccepted) => CallState::Connecting,
            (CallState::Inviting, CallTransition::RemoteAccepted) => CallState::Connecting,
            (CallState::Connecting, CallTransition::MediaConnected) => {
                if self.connected_at.is_none() {
                    self.connected_at = Some(Utc::now());
                }
                CallState::Active
            }
            (
                CallState::Inviting | CallState::Ringing | CallState::Connecting | CallState::Active,
                CallTransition::Terminate { reason },
            ) => {
                if self.end_reason.is_none() {
                    self.end_reason = Some(*reason);
                }
                if self.ended_at.is_none() {
                    self.ended_at = Some(Utc::now());
                }
                CallState::Ending
            }
            (CallState::Ending, CallTransition::Released) => CallState::Idle,
            (current, _) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_outgoing_call() -> CallSession {
        let mut call = CallSession::new_outgoing(
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            CallType::SingleAudio,
            "u1",
            None,
            CallExt::new(),
        );
        call.add_member(CallMember::placeholder("u1"));
        call.add_member(CallMember::placeholder("u2"));
        call
    }

    fn make_incoming_call() -> CallSession {
        CallSession::new_incoming(
            CallId::new("BC5BD1EDE9BBE601F408EF3795479E93"),
            CallType::SingleVideo,
            "callkit_BC5BD1EDE9BBE601F408EF3795479E93",
            "u2",
            "u1",
            None,
            CallExt::new(),
        )
    }

    /// Flow: Idle → Inviting → Connecting → Active → Ending → Idle
    #[test]
    fn test_outgoing_call_flow() {
        let mut call = make_outgoing_call();
        assert_eq!(call.state, CallState::Idle);

        call.apply_transition(CallTransition::InviteSent).unwrap();
        assert_eq!(call.state, CallState::Inviting);

        call.apply_transition(CallTransition::RemoteAccepted).unwrap();
        assert_eq!(call.state, CallState::Connecting);
        assert!(call.connected_at().is_none());

        call.apply_transition(CallTransition::MediaConnected).unwrap();
        assert_eq!(call.state, CallState::Active);
        assert!(call.connected_at().is_some());

        call.apply_transition(CallTransition::Terminate {
            reason: EndCallReason::Hangup,
        })
        .unwrap();
        assert_eq!(call.state, CallState::Ending);
        assert_eq!(call.end_reason(), Some(EndCallReason::Hangup));
        assert!(call.duration_secs().is_some());

        call.apply_transition(CallTransition::Released).unwrap();
        assert!(call.state.is_idle());
    }

    /// Flow: Idle → Ringing → Connecting
    #[test]
    fn test_incoming_call_flow() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::InviteReceived).unwrap();
        assert!(call.state.can_answer());

        call.apply_transition(CallTransition::LocalAccepted).unwrap();
        assert_eq!(call.state, CallState::Connecting);
        assert!(!call.is_outgoing());
    }

    #[test]
    fn test_end_reason_is_set_once() {
        let mut call = make_incoming_call();
        call.apply_transition(CallTransition::InviteReceived).unwrap();
        assert!(call.state.is_live());
        call.apply_transition(CallTransition::Terminate {
            reason: EndCallReason::NoResponse,
        })
        .unwrap();
        assert!(!call.state.is_live());
        let ended_at = call.ended_at();

        // A second terminal decision is rejected and changes nothing.
        assert!(
            call.apply_transition(CallTransition::Terminate {
                reason: EndCallReason::Hangup,
            })
            .is_err()
        );
        assert_eq!(call.end_reason(), Some(EndCallReason::NoResponse));
        assert_eq!(call.ended_at(), ended_at);
    }

    #[test]
    fn test_invalid_transitions() {
        let mut call = make_outgoing_call();

        assert!(call.apply_transition(CallTransition::RemoteAccepted).is_err());
        assert!(call.apply_transition(CallTransition::MediaConnected).is_err());
        assert!(call.apply_transition(CallTransition::Released).is_err());

        call.apply_transition(CallTransition::InviteSent).unwrap();
        // Only the callee accepts locally.
        assert!(call.apply_transition(CallTransition::LocalAccepted).is_err());
    }

    #[test]
    fn test_idle_cannot_terminate() {
        let mut call = make_outgoing_call();
        let err = call
            .apply_transition(CallTransition::Terminate {
                reason: EndCallReason::Hangup,
            })
            .unwrap_err();
        assert!(err.to_string().contains("Idle"));
        assert!(call.end_reason().is_none());
    }

    #[test]
    fn test_members_are_unique_per_user() {
        let mut call = make_outgoing_call();
        assert!(!call.add_member(CallMember::placeholder("u2")));
        assert_eq!(call.members().len(), 2);
        assert_eq!(call.remote_members().count(), 1);
        assert_eq!(call.pending_invitees(), vec!["u2".to_string()]);

        call.member_mut("u2").unwrap().connected = true;
        assert_eq!(call.connected_remote_count(), 1);

        assert!(call.remove_member("u2").is_some());
        assert!(!call.has_remote_members());
    }

    #[test]
    fn test_channel_name_is_deterministic() {
        let id = CallId::new("ABC");
        assert_eq!(channel_name_for(&id, None), "callkit_ABC");
        assert_eq!(channel_name_for(&id, Some("g1")), "callkit_g1_ABC");
    }
}
