#![allow(dead_code)]

use chat_callkit::loopback::{
    LoopbackMediaServer, LoopbackNetwork, LoopbackTokenProvider, RecordingHooks,
    RecordingListener, StaticGroupDirectory, StaticUserDirectory,
};
use chat_callkit::{CallKit, CallKitConfig};
use std::sync::Arc;
use std::time::Duration;

/// Shared loopback world for one test.
pub struct Harness {
    pub network: Arc<LoopbackNetwork>,
    pub media: Arc<LoopbackMediaServer>,
    pub tokens: Arc<LoopbackTokenProvider>,
    pub groups: Arc<StaticGroupDirectory>,
    pub users: Arc<StaticUserDirectory>,
    pub config: CallKitConfig,
}

/// One logged-in device.
pub struct Party {
    pub kit: CallKit,
    pub listener: Arc<RecordingListener>,
    pub hooks: Arc<RecordingHooks>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CallKitConfig::default())
    }

    pub fn with_config(config: CallKitConfig) -> Self {
        Self {
            network: LoopbackNetwork::new(),
            media: LoopbackMediaServer::new(),
            tokens: LoopbackTokenProvider::new(),
            groups: StaticGroupDirectory::new(),
            users: StaticUserDirectory::new(),
            config,
        }
    }

    pub fn party(&self, user: &str, device: &str) -> Party {
        let listener = RecordingListener::new();
        let hooks = RecordingHooks::new();
        let kit = CallKit::builder(user, device)
            .config(self.config.clone())
            .transport(self.network.transport())
            .token_provider(self.tokens.clone())
            .engine_factory(self.media.factory())
            .group_directory(self.groups.clone())
            .user_info_provider(self.users.clone())
            .listener(listener.clone())
            .platform_hooks(hooks.clone())
            .build()
            .expect("call kit should build");
        self.network.attach(&kit);
        Party {
            kit,
            listener,
            hooks,
        }
    }
}

/// Let every queued message, signal and engine callback run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
