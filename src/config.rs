//! Call kit configuration.

use crate::calls::error::CallError;
use crate::calls::roster::{DEFAULT_MAX_MEMBERS, DEFAULT_PAGE_SIZE};
use crate::calls::timer::DEFAULT_INVITE_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const ASSET_SCHEME: &str = "assets://";
const RAW_SCHEME: &str = "raw://";

/// Where a ring sound is loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RingSource {
    /// Bundled application asset, `assets://name`.
    Asset(String),
    /// Platform raw resource, `raw://name`.
    Raw(String),
    /// Plain file system path.
    File(PathBuf),
}

impl FromStr for RingSource {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(name) = s.strip_prefix(ASSET_SCHEME) {
            non_empty(name, s).map(|n| Self::Asset(n.to_string()))
        } else if let Some(name) = s.strip_prefix(RAW_SCHEME) {
            non_empty(name, s).map(|n| Self::Raw(n.to_string()))
        } else {
            non_empty(s, s).map(|p| Self::File(PathBuf::from(p)))
        }
    }
}

fn non_empty<'a>(name: &'a str, full: &str) -> Result<&'a str, CallError> {
    if name.is_empty() {
        Err(CallError::Config(format!("empty ring source '{full}'")))
    } else {
        Ok(name)
    }
}

impl TryFrom<String> for RingSource {
    type Error = CallError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RingSource> for String {
    fn from(value: RingSource) -> Self {
        value.to_string()
    }
}

impl fmt::Display for RingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Asset(name) => write!(f, "{ASSET_SCHEME}{name}"),
            Self::Raw(name) => write!(f, "{RAW_SCHEME}{name}"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallKitConfig {
    /// Ring timeout for pending invitations.
    pub invite_timeout_secs: u64,
    /// How long an answered call may wait for media before it is dropped.
    pub connect_timeout_secs: u64,
    pub outgoing_ring_file: Option<RingSource>,
    pub incoming_ring_file: Option<RingSource>,
    /// Played when a connected call ends.
    pub ding_file: Option<RingSource>,
    /// Whether the host should log in to the chat transport on start.
    pub auto_login: bool,
    pub roster_page_size: usize,
    pub roster_max_members: usize,
    /// How many recent signals are remembered for duplicate suppression.
    pub dedup_window: usize,
}

impl Default for CallKitConfig {
    fn default() -> Self {
        Self {
            invite_timeout_secs: DEFAULT_INVITE_TIMEOUT.as_secs(),
            connect_timeout_secs: DEFAULT_INVITE_TIMEOUT.as_secs(),
            outgoing_ring_file: None,
            incoming_ring_file: None,
            ding_file: None,
            auto_login: true,
            roster_page_size: DEFAULT_PAGE_SIZE,
            roster_max_members: DEFAULT_MAX_MEMBERS,
            dedup_window: 256,
        }
    }
}

impl CallKitConfig {
    pub fn from_json_str(json: &str) -> Result<Self, CallError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CallError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CallError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| CallError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), CallError> {
        if self.invite_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(CallError::Config("call timeouts must be positive".into()));
        }
        if self.roster_page_size == 0 || self.roster_max_members == 0 {
            return Err(CallError::Config("roster limits must be positive".into()));
        }
        if self.dedup_window == 0 {
            return Err(CallError::Config("dedup_window must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_ring_source_schemes() {
        assert_eq!(
            "assets://ring.mp3".parse::<RingSource>().unwrap(),
            RingSource::Asset("ring.mp3".into())
        );
        assert_eq!(
            "raw://ding".parse::<RingSource>().unwrap(),
            RingSource::Raw("ding".into())
        );
        assert_eq!(
            "/sdcard/ring.ogg".parse::<RingSource>().unwrap(),
            RingSource::File("/sdcard/ring.ogg".into())
        );
        assert!("assets://".parse::<RingSource>().is_err());
        assert!("".parse::<RingSource>().is_err());
        assert_eq!(RingSource::Raw("ding".into()).to_string(), "raw://ding");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CallKitConfig::from_json_str(
            r#"{ "invite_timeout_secs": 45, "ding_file": "raw://ding" }"#,
        )
        .unwrap();
        assert_eq!(config.invite_timeout(), Duration::from_secs(45));
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.ding_file, Some(RingSource::Raw("ding".into())));
        assert_eq!(config.roster_page_size, 50);
        assert_eq!(config.roster_max_members, 1000);
        assert!(config.auto_login);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(matches!(
            CallKitConfig::from_json_str(r#"{ "invite_timeout_secs": 0 }"#),
            Err(CallError::Config(_))
        ));
        assert!(matches!(
            CallKitConfig::from_json_str(r#"{ "connect_timeout_secs": 0 }"#),
            Err(CallError::Config(_))
        ));
        assert!(matches!(
            CallKitConfig::from_json_str(r#"{ "outgoing_ring_file": "raw://" }"#),
            Err(CallError::Config(_))
        ));
        assert!(CallKitConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "incoming_ring_file": "assets://incoming.mp3", "dedup_window": 16 }}"#
        )
        .unwrap();

        let config = CallKitConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.dedup_window, 16);
        assert_eq!(
            config.incoming_ring_file,
            Some(RingSource::Asset("incoming.mp3".into()))
        );

        assert!(CallKitConfig::from_json_file("/definitely/missing.json").is_err());
    }
}
