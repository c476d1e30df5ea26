//! Custom-message envelope parsing and building.
//!
//! Call signals ride on the chat transport as custom messages whose event
//! name is [`CALL_EVENT`]. All call fields live in the string parameter map:
//!
//! ```text
//! event  = "rtc_call"
//! params = { action, call-id, call-type, channel, device,
//!            group-id?, inviter-name?, inviter-avatar?, ext? }
//! ```

use super::error::CallError;
use super::signaling::{CallExt, SignalKind, SignalingMessage};
use crate::types::{CallId, CallType, UserInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Custom-message event name reserved for call signaling.
pub const CALL_EVENT: &str = "rtc_call";

const KEY_ACTION: &str = "action";
const KEY_CALL_ID: &str = "call-id";
const KEY_CALL_TYPE: &str = "call-type";
const KEY_CHANNEL: &str = "channel";
const KEY_DEVICE: &str = "device";
const KEY_GROUP_ID: &str = "group-id";
const KEY_INVITER_NAME: &str = "inviter-name";
const KEY_INVITER_AVATAR: &str = "inviter-avatar";
const KEY_EXT: &str = "ext";

/// A custom message as exchanged with the chat transport.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CustomMessage {
    pub from: String,
    pub to: String,
    pub event: String,
    pub params: HashMap<String, String>,
}

impl CustomMessage {
    pub fn is_call_signal(&self) -> bool {
        self.event == CALL_EVENT
    }
}

/// Build the custom message carrying `msg`.
pub fn build_custom_message(msg: &SignalingMessage) -> CustomMessage {
    let mut params = HashMap::new();
    params.insert(KEY_ACTION.to_string(), msg.kind.tag_name().to_string());
    params.insert(KEY_CALL_ID.to_string(), msg.call_id.to_string());
    params.insert(KEY_CALL_TYPE.to_string(), msg.call_type.code().to_string());
    params.insert(KEY_CHANNEL.to_string(), msg.channel_name.clone());
    params.insert(KEY_DEVICE.to_string(), msg.from_device.clone());

    if let Some(group_id) = &msg.group_id {
        params.insert(KEY_GROUP_ID.to_string(), group_id.clone());
    }
    if let Some(inviter) = &msg.inviter {
        if let Some(name) = &inviter.nickname {
            params.insert(KEY_INVITER_NAME.to_string(), name.clone());
        }
        if let Some(avatar) = &inviter.avatar {
            params.insert(KEY_INVITER_AVATAR.to_string(), avatar.clone());
        }
    }
    if !msg.ext.is_empty() {
        // A JSON map always serializes.
        if let Ok(ext) = serde_json::to_string(&msg.ext) {
            params.insert(KEY_EXT.to_string(), ext);
        }
    }

    CustomMessage {
        from: msg.from_user.clone(),
        to: msg.to_user.clone(),
        event: CALL_EVENT.to_string(),
        params,
    }
}

/// Parse a custom message into a signal.
///
/// Returns `Ok(None)` for messages that are not call signals at all, and a
/// protocol error for call signals that are malformed.
pub fn parse_custom_message(raw: &CustomMessage) -> Result<Option<SignalingMessage>, CallError> {
    if !raw.is_call_signal() {
        return Ok(None);
    }

    let param = |key: &str| raw.params.get(key).map(String::as_str).unwrap_or_default();

    let action = param(KEY_ACTION);
    let kind = SignalKind::from_tag(action)
        .ok_or_else(|| CallError::Protocol(format!("unknown action '{action}'")))?;

    let call_id = param(KEY_CALL_ID);
    if call_id.is_empty() {
        return Err(CallError::Protocol("missing call-id".to_string()));
    }
    if raw.from.is_empty() {
        return Err(CallError::Protocol("missing sender".to_string()));
    }

    let call_type_raw = param(KEY_CALL_TYPE);
    let call_type = call_type_raw
        .parse::<u8>()
        .ok()
        .and_then(CallType::from_code)
        .ok_or_else(|| CallError::Protocol(format!("invalid call-type '{call_type_raw}'")))?;

    let channel = param(KEY_CHANNEL);
    if kind == SignalKind::Invite && channel.is_empty() {
        return Err(CallError::Protocol("invite without channel".to_string()));
    }

    let group_id = raw
        .params
        .get(KEY_GROUP_ID)
        .filter(|g| !g.is_empty())
        .cloned();
    if call_type.is_group() && group_id.is_none() {
        return Err(CallError::Protocol("group call without group-id".to_string()));
    }

    let ext = match raw.params.get(KEY_EXT) {
        Some(json) => serde_json::from_str::<CallExt>(json)
            .map_err(|e| CallError::Protocol(format!("ext is not a JSON object: {e}")))?,
        None => CallExt::new(),
    };

    let mut msg = SignalingMessage::new(kind, CallId::new(call_id), call_type, channel)
        .from(raw.from.clone(), param(KEY_DEVICE))
        .to(raw.to.clone())
        .group(group_id)
        .ext(ext);

    if kind == SignalKind::Invite {
        let mut inviter = UserInfo::new(raw.from.clone());
        inviter.nickname = raw.params.get(KEY_INVITER_NAME).cloned();
        inviter.avatar = raw.params.get(KEY_INVITER_AVATAR).cloned();
        msg = msg.inviter(inviter);
    }

    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invite() -> SignalingMessage {
        let mut ext = CallExt::new();
        ext.insert("topic".to_string(), json!("standup"));
        SignalingMessage::new(
            SignalKind::Invite,
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            CallType::GroupVideo,
            "callkit_g1_AC90CFD09DF712D981142B172706F9F2",
        )
        .from("alice", "phone")
        .to("bob")
        .group(Some("g1".to_string()))
        .inviter(UserInfo::new("alice").with_nickname("Alice"))
        .ext(ext)
    }

    #[test]
    fn test_invite_survives_the_wire() {
        let msg = invite();
        let raw = build_custom_message(&msg);
        assert_eq!(raw.event, CALL_EVENT);
        assert_eq!(raw.params["action"], "invite");
        assert_eq!(raw.params["call-type"], "2");

        let parsed = parse_custom_message(&raw).unwrap().unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_non_call_messages_are_skipped() {
        let raw = CustomMessage {
            from: "alice".into(),
            to: "bob".into(),
            event: "typing".into(),
            params: HashMap::new(),
        };
        assert!(parse_custom_message(&raw).unwrap().is_none());
    }

    #[test]
    fn test_malformed_signals_are_protocol_errors() {
        let good = build_custom_message(&invite());

        let mut raw = good.clone();
        raw.params.insert("action".into(), "transfer".into());
        assert!(matches!(parse_custom_message(&raw), Err(CallError::Protocol(_))));

        let mut raw = good.clone();
        raw.params.remove("call-id");
        assert!(matches!(parse_custom_message(&raw), Err(CallError::Protocol(_))));

        let mut raw = good.clone();
        raw.params.insert("call-type".into(), "7".into());
        assert!(matches!(parse_custom_message(&raw), Err(CallError::Protocol(_))));

        let mut raw = good.clone();
        raw.params.remove("group-id");
        assert!(matches!(parse_custom_message(&raw), Err(CallError::Protocol(_))));

        let mut raw = good;
        raw.params.insert("ext".into(), "[1,2]".into());
        assert!(matches!(parse_custom_message(&raw), Err(CallError::Protocol(_))));
    }

    #[test]
    fn test_inviter_info_only_on_invites() {
        let accept = SignalingMessage::new(
            SignalKind::Accept,
            CallId::new("C1"),
            CallType::SingleAudio,
            "callkit_C1",
        )
        .from("bob", "tablet")
        .to("alice");
        let parsed = parse_custom_message(&build_custom_message(&accept))
            .unwrap()
            .unwrap();
        assert_eq!(parsed.kind, SignalKind::Accept);
        assert_eq!(parsed.from_device, "tablet");
        assert!(parsed.inviter.is_none());
    }
}
