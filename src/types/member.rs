use super::call::NetworkQuality;
use serde::{Deserialize, Serialize};

/// Presentable user record, as returned by a user-info provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    pub nickname: Option<String>,
    pub avatar: Option<String>,
}

impl UserInfo {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    /// Nickname if known, otherwise the raw user id.
    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or(&self.user_id)
    }
}

/// How far a member has progressed through the invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteState {
    /// Invite sent, nothing heard back.
    #[default]
    Pending,
    /// Invitee acknowledged the invite with `alive`.
    Ringing,
    /// Invitee accepted, or this is a member already in the call.
    Accepted,
}

/// A participant's call-relevant state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMember {
    pub user_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub mic_enabled: bool,
    pub video_enabled: bool,
    pub speaking: bool,
    pub network_quality: NetworkQuality,
    pub connected: bool,
    pub invite_state: InviteState,
}

impl CallMember {
    /// Record carrying only the user id.
    pub fn placeholder(user_id: impl Into<String>) -> Self {
        Self::from_user_info(UserInfo::new(user_id))
    }

    pub fn from_user_info(info: UserInfo) -> Self {
        Self {
            display_name: info.display_name().to_string(),
            user_id: info.user_id,
            avatar_ref: info.avatar,
            mic_enabled: true,
            video_enabled: false,
            speaking: false,
            network_quality: NetworkQuality::Unknown,
            connected: false,
            invite_state: InviteState::Pending,
        }
    }

    /// Refresh presentation fields without touching media state.
    pub fn apply_user_info(&mut self, info: &UserInfo) {
        if info.user_id != self.user_id {
            return;
        }
        self.display_name = info.display_name().to_string();
        if info.avatar.is_some() {
            self.avatar_ref.clone_from(&info.avatar);
        }
    }
}
