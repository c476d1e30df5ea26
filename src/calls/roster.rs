//! Group roster resolution.
//!
//! Members are fetched from the server page by page. If the server path fails
//! at any point, the resolver falls back to what the local cache knows about
//! the group, and the result says so.

use super::error::CallError;
use crate::types::{CallMember, UserInfo};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_MAX_MEMBERS: usize = 1000;

/// One page of a group's member list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberPage {
    pub user_ids: Vec<String>,
    /// Cursor for the next page. `None` or empty when this was the last one.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupProfile {
    pub group_id: String,
    pub owner: Option<String>,
    pub admins: Vec<String>,
    pub members: Vec<String>,
}

impl GroupProfile {
    /// Owner and admins, in that order.
    fn staff(&self) -> impl Iterator<Item = &String> {
        self.owner.iter().chain(self.admins.iter())
    }
}

#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn fetch_member_page(
        &self,
        group_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<MemberPage, anyhow::Error>;

    /// Group metadata from the server.
    async fn fetch_group(&self, group_id: &str) -> Result<GroupProfile, anyhow::Error>;

    /// Group as known to the local cache.
    fn local_group(&self, group_id: &str) -> Option<GroupProfile>;
}

#[async_trait]
pub trait UserInfoProvider: Send + Sync {
    fn get_user(&self, user_id: &str) -> Option<UserInfo>;

    async fn fetch_users(&self, user_ids: &[String]) -> Result<Vec<UserInfo>, anyhow::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterSource {
    Server,
    LocalCache,
}

/// Lazily resolved member sequence. Consumed once.
pub struct Roster {
    source: RosterSource,
    ids: VecDeque<String>,
    prefetched: HashMap<String, UserInfo>,
    users: Option<Arc<dyn UserInfoProvider>>,
}

impl Roster {
    pub fn source(&self) -> RosterSource {
        self.source
    }

    /// Number of members not yet yielded.
    pub fn remaining(&self) -> usize {
        self.ids.len()
    }

    /// Remaining user ids, in order, without resolving them.
    pub fn user_ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    fn resolve(&mut self, user_id: String) -> CallMember {
        if let Some(info) = self.prefetched.remove(&user_id) {
            return CallMember::from_user_info(info);
        }
        if let Some(info) = self.users.as_ref().and_then(|u| u.get_user(&user_id)) {
            return CallMember::from_user_info(info);
        }
        CallMember::placeholder(user_id)
    }
}

impl Iterator for Roster {
    type Item = CallMember;

    fn next(&mut self) -> Option<Self::Item> {
        let user_id = self.ids.pop_front()?;
        Some(self.resolve(user_id))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.ids.len(), Some(self.ids.len()))
    }
}

impl std::fmt::Debug for Roster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Roster")
            .field("source", &self.source)
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}

/// Outcome of a roster fetch. The degraded variant still carries a usable
/// roster built from the local cache.
#[derive(Debug)]
pub enum RosterResult {
    Fresh(Roster),
    Degraded { roster: Roster, error: CallError },
}

impl RosterResult {
    pub fn roster(self) -> Roster {
        match self {
            Self::Fresh(roster) | Self::Degraded { roster, .. } => roster,
        }
    }

    pub fn error(&self) -> Option<&CallError> {
        match self {
            Self::Fresh(_) => None,
            Self::Degraded { error, .. } => Some(error),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

pub struct RosterResolver {
    directory: Arc<dyn GroupDirectory>,
    users: Option<Arc<dyn UserInfoProvider>>,
    page_size: usize,
    max_members: usize,
}

impl RosterResolver {
    pub fn new(directory: Arc<dyn GroupDirectory>, users: Option<Arc<dyn UserInfoProvider>>) -> Self {
        Self {
            directory,
            users,
            page_size: DEFAULT_PAGE_SIZE,
            max_members: DEFAULT_MAX_MEMBERS,
        }
    }

    pub fn with_limits(mut self, page_size: usize, max_members: usize) -> Self {
        self.page_size = page_size.max(1);
        self.max_members = max_members.max(1);
        self
    }

    pub async fn fetch_group_members(&self, group_id: &str) -> RosterResult {
        match self.fetch_from_server(group_id).await {
            Ok(ids) => {
                debug!("Fetched {} members of group {group_id}", ids.len());
                RosterResult::Fresh(self.build(RosterSource::Server, ids).await)
            }
            Err(e) => {
                warn!("Roster fetch for group {group_id} failed, using local cache: {e}");
                let ids = self.local_ids(group_id);
                RosterResult::Degraded {
                    roster: self.build(RosterSource::LocalCache, ids).await,
                    error: CallError::Roster(e.to_string()),
                }
            }
        }
    }

    async fn fetch_from_server(&self, group_id: &str) -> Result<Vec<String>, anyhow::Error> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .directory
                .fetch_member_page(group_id, cursor.as_deref(), self.page_size)
                .await?;
            for id in page.user_ids {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
            cursor = page.cursor.filter(|c| !c.is_empty());
            if cursor.is_none() || ids.len() >= self.max_members {
                break;
            }
        }
        ids.truncate(self.max_members);

        let profile = match self.directory.local_group(group_id) {
            Some(profile) => profile,
            None => self.directory.fetch_group(group_id).await?,
        };
        for id in profile.staff() {
            if seen.insert(id.clone()) {
                ids.push(id.clone());
            }
        }
        Ok(ids)
    }

    fn local_ids(&self, group_id: &str) -> Vec<String> {
        let Some(profile) = self.directory.local_group(group_id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        profile
            .members
            .iter()
            .chain(profile.staff())
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }

    async fn build(&self, source: RosterSource, ids: Vec<String>) -> Roster {
        let mut prefetched = HashMap::new();
        if let Some(users) = &self.users
            && !ids.is_empty()
        {
            match users.fetch_users(&ids).await {
                Ok(infos) => {
                    prefetched.extend(infos.into_iter().map(|i| (i.user_id.clone(), i)));
                }
                Err(e) => debug!("Batch user info lookup failed: {e}"),
            }
        }
        Roster {
            source,
            ids: ids.into(),
            prefetched,
            users: self.users.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Directory {
        pages: Vec<MemberPage>,
        fail_after: Option<usize>,
        local: Option<GroupProfile>,
        remote: Option<GroupProfile>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl GroupDirectory for Directory {
        async fn fetch_member_page(
            &self,
            _group_id: &str,
            cursor: Option<&str>,
            _limit: usize,
        ) -> Result<MemberPage, anyhow::Error> {
            let mut calls = self.calls.lock().unwrap();
            if self.fail_after == Some(*calls) {
                anyhow::bail!("server unavailable");
            }
            *calls += 1;
            let index = cursor.map(|c| c.parse::<usize>().unwrap()).unwrap_or(0);
            Ok(self.pages.get(index).cloned().unwrap_or_default())
        }

        async fn fetch_group(&self, _group_id: &str) -> Result<GroupProfile, anyhow::Error> {
            self.remote
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no such group"))
        }

        fn local_group(&self, _group_id: &str) -> Option<GroupProfile> {
            self.local.clone()
        }
    }

    struct Users;

    #[async_trait]
    impl UserInfoProvider for Users {
        fn get_user(&self, user_id: &str) -> Option<UserInfo> {
            (user_id == "u3").then(|| UserInfo::new("u3").with_nickname("Carol"))
        }

        async fn fetch_users(&self, user_ids: &[String]) -> Result<Vec<UserInfo>, anyhow::Error> {
            Ok(user_ids
                .iter()
                .filter(|id| id.as_str() == "u1")
                .map(|id| UserInfo::new(id.clone()).with_nickname("Alice"))
                .collect())
        }
    }

    fn page(ids: &[&str], cursor: Option<&str>) -> MemberPage {
        MemberPage {
            user_ids: ids.iter().map(|s| s.to_string()).collect(),
            cursor: cursor.map(str::to_string),
        }
    }

    fn profile(members: &[&str], owner: &str, admins: &[&str]) -> GroupProfile {
        GroupProfile {
            group_id: "g1".into(),
            owner: Some(owner.into()),
            admins: admins.iter().map(|s| s.to_string()).collect(),
            members: members.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_pages_then_staff_deduplicated() {
        let dir = Directory {
            pages: vec![page(&["u1", "u2"], Some("1")), page(&["u2", "u3"], Some(""))],
            remote: Some(profile(&[], "u4", &["u1", "u5"])),
            ..Default::default()
        };
        let resolver = RosterResolver::new(Arc::new(dir), Some(Arc::new(Users)));
        let result = resolver.fetch_group_members("g1").await;
        assert!(!result.is_degraded());

        let members: Vec<_> = result.roster().collect();
        let ids: Vec<_> = members.iter().map(|m| m.user_id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2", "u3", "u4", "u5"]);
        assert_eq!(members[0].display_name, "Alice");
        assert_eq!(members[1].display_name, "u2");
        assert_eq!(members[2].display_name, "Carol");
    }

    #[tokio::test]
    async fn test_member_cap_stops_paging() {
        let dir = Directory {
            pages: vec![
                page(&["a", "b", "c"], Some("1")),
                page(&["d", "e", "f"], Some("2")),
                page(&["g"], None),
            ],
            local: Some(profile(&[], "a", &[])),
            ..Default::default()
        };
        let dir = Arc::new(dir);
        let resolver = RosterResolver::new(dir.clone(), None).with_limits(3, 4);
        let roster = resolver.fetch_group_members("g1").await.roster();
        assert_eq!(roster.user_ids().collect::<Vec<_>>(), vec!["a", "b", "c", "d"]);
        assert_eq!(*dir.calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_server_failure_falls_back_to_local_cache() {
        let dir = Directory {
            fail_after: Some(0),
            local: Some(profile(&["u1", "u2", "u1"], "u2", &["u3", "u6"])),
            ..Default::default()
        };
        let resolver = RosterResolver::new(Arc::new(dir), None);
        let result = resolver.fetch_group_members("g1").await;

        assert!(matches!(result.error(), Some(CallError::Roster(_))));
        let roster = result.roster();
        assert_eq!(roster.source(), RosterSource::LocalCache);
        let ids: Vec<_> = roster.map(|m| m.user_id).collect();
        assert_eq!(ids, vec!["u1", "u2", "u3", "u6"]);
    }

    #[tokio::test]
    async fn test_failure_on_later_page_discards_partial_result() {
        let dir = Directory {
            pages: vec![page(&["u1", "u9"], Some("1"))],
            fail_after: Some(1),
            local: Some(profile(&["u1"], "u2", &[])),
            ..Default::default()
        };
        let resolver = RosterResolver::new(Arc::new(dir), None);
        let roster = resolver.fetch_group_members("g1").await.roster();
        assert_eq!(roster.user_ids().collect::<Vec<_>>(), vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_unknown_group_yields_empty_degraded_roster() {
        let dir = Directory {
            fail_after: Some(0),
            ..Default::default()
        };
        let resolver = RosterResolver::new(Arc::new(dir), None);
        let result = resolver.fetch_group_members("nope").await;
        assert!(result.is_degraded());
        assert_eq!(result.roster().count(), 0);
    }
}
