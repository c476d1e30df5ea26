//! Media session binder.
//!
//! Wraps the pluggable RTC token provider and engine factory. The binder keeps
//! no session state of its own; the coordinator holds the [`EngineHandle`] for
//! the active session and drops it on teardown.

use super::error::CallError;
use crate::types::{CallId, CallType, NetworkQuality};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;

/// Channel credential issued by the token provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RtcToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }
}

#[async_trait]
pub trait RtcTokenProvider: Send + Sync {
    /// Application id the engine is created with.
    fn app_id(&self) -> String;

    /// Fetch a token for `channel`. Called once per session; not retried.
    async fn fetch_token(&self, channel: &str) -> Result<RtcToken, CallError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub app_id: String,
    pub call_type: CallType,
}

/// Callbacks raised by the engine, forwarded to the coordinator as they come.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    RemoteJoined { user_id: String },
    RemoteLeft { user_id: String },
    AudioMuted { user_id: String, muted: bool },
    VideoEnabled { user_id: String, enabled: bool },
    Speaking { user_ids: Vec<String> },
    NetworkQuality { user_id: String, quality: NetworkQuality },
    Error { code: i32, message: String },
}

/// Where an engine reports its callbacks. Bound to one session.
#[derive(Clone)]
pub struct EngineEventSink {
    call_id: CallId,
    deliver: Arc<dyn Fn(CallId, EngineEvent) + Send + Sync>,
}

impl EngineEventSink {
    pub fn new<F>(call_id: CallId, deliver: F) -> Self
    where
        F: Fn(CallId, EngineEvent) + Send + Sync + 'static,
    {
        Self {
            call_id,
            deliver: Arc::new(deliver),
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn emit(&self, event: EngineEvent) {
        (self.deliver)(self.call_id.clone(), event);
    }
}

impl std::fmt::Debug for EngineEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineEventSink")
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

/// A real-time media engine instance.
pub trait RtcEngine: Send + Sync {
    fn join_channel(&self, channel: &str, token: &str, user_id: &str) -> Result<(), CallError>;
    fn leave_channel(&self) -> Result<(), CallError>;
    fn destroy(&self);
}

pub trait RtcEngineFactory: Send + Sync {
    fn create_engine(
        &self,
        config: &EngineConfig,
        events: EngineEventSink,
    ) -> Result<Arc<dyn RtcEngine>, CallError>;
}

/// Owned engine of the active session.
pub struct EngineHandle {
    engine: Arc<dyn RtcEngine>,
    joined: bool,
    destroyed: bool,
}

impl EngineHandle {
    fn new(engine: Arc<dyn RtcEngine>) -> Self {
        Self {
            engine,
            joined: false,
            destroyed: false,
        }
    }

    pub fn engine(&self) -> Arc<dyn RtcEngine> {
        self.engine.clone()
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if !self.destroyed {
            debug!("Engine handle dropped without destroy, releasing");
            MediaSessionBinder::release(self);
        }
    }
}

pub struct MediaSessionBinder {
    tokens: Arc<dyn RtcTokenProvider>,
    factory: Arc<dyn RtcEngineFactory>,
}

impl MediaSessionBinder {
    pub fn new(tokens: Arc<dyn RtcTokenProvider>, factory: Arc<dyn RtcEngineFactory>) -> Self {
        Self { tokens, factory }
    }

    /// Future resolving to the channel token. Owns everything it needs so it
    /// can be spawned and aborted independently of the binder.
    pub fn acquire_token(
        &self,
        channel: String,
    ) -> impl Future<Output = Result<RtcToken, CallError>> + Send + 'static {
        let tokens = self.tokens.clone();
        async move { tokens.fetch_token(&channel).await }
    }

    pub fn create_engine(
        &self,
        call_type: CallType,
        events: EngineEventSink,
    ) -> Result<EngineHandle, CallError> {
        let config = EngineConfig {
            app_id: self.tokens.app_id(),
            call_type,
        };
        let engine = self.factory.create_engine(&config, events)?;
        debug!("Created RTC engine for {call_type} call");
        Ok(EngineHandle::new(engine))
    }

    pub fn join(
        &self,
        handle: &mut EngineHandle,
        channel: &str,
        token: &RtcToken,
        user_id: &str,
    ) -> Result<(), CallError> {
        if handle.destroyed {
            return Err(CallError::engine(-1, "engine already destroyed"));
        }
        handle.engine.join_channel(channel, &token.token, user_id)?;
        handle.joined = true;
        Ok(())
    }

    /// Leave the channel. No-op if never joined.
    pub fn leave(&self, handle: &mut EngineHandle) {
        Self::leave_inner(handle);
    }

    /// Leave if needed and destroy. Safe to call more than once.
    pub fn destroy(&self, handle: &mut EngineHandle) {
        Self::release(handle);
    }

    fn leave_inner(handle: &mut EngineHandle) {
        if !handle.joined || handle.destroyed {
            return;
        }
        if let Err(e) = handle.engine.leave_channel() {
            warn!("Leaving RTC channel failed: {e}");
        }
        handle.joined = false;
    }

    fn release(handle: &mut EngineHandle) {
        if handle.destroyed {
            return;
        }
        Self::leave_inner(handle);
        handle.engine.destroy();
        handle.destroyed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingEngine {
        joins: AtomicUsize,
        leaves: AtomicUsize,
        destroys: AtomicUsize,
    }

    impl RtcEngine for CountingEngine {
        fn join_channel(&self, _channel: &str, _token: &str, _user_id: &str) -> Result<(), CallError> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn leave_channel(&self) -> Result<(), CallError> {
            self.leaves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn destroy(&self) {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Factory {
        engine: Arc<CountingEngine>,
        configs: Mutex<Vec<EngineConfig>>,
    }

    impl RtcEngineFactory for Factory {
        fn create_engine(
            &self,
            config: &EngineConfig,
            _events: EngineEventSink,
        ) -> Result<Arc<dyn RtcEngine>, CallError> {
            self.configs.lock().unwrap().push(config.clone());
            Ok(self.engine.clone())
        }
    }

    struct Tokens;

    #[async_trait]
    impl RtcTokenProvider for Tokens {
        fn app_id(&self) -> String {
            "app-1".into()
        }

        async fn fetch_token(&self, channel: &str) -> Result<RtcToken, CallError> {
            if channel.is_empty() {
                return Err(CallError::token(1, "empty channel"));
            }
            Ok(RtcToken::new(format!("tok:{channel}")))
        }
    }

    fn binder() -> (MediaSessionBinder, Arc<CountingEngine>, Arc<Factory>) {
        let engine = Arc::new(CountingEngine::default());
        let factory = Arc::new(Factory {
            engine: engine.clone(),
            configs: Mutex::new(Vec::new()),
        });
        (
            MediaSessionBinder::new(Arc::new(Tokens), factory.clone()),
            engine,
            factory,
        )
    }

    fn sink() -> EngineEventSink {
        EngineEventSink::new(CallId::new("C1"), |_, _| {})
    }

    #[tokio::test]
    async fn test_acquire_token() {
        let (binder, _, _) = binder();
        let token = binder.acquire_token("ch".into()).await.unwrap();
        assert_eq!(token.token, "tok:ch");
        let err = binder.acquire_token(String::new()).await.unwrap_err();
        assert!(matches!(err, CallError::Token { code: 1, .. }));
    }

    #[test]
    fn test_engine_config_carries_app_id() {
        let (binder, _, factory) = binder();
        let _handle = binder.create_engine(CallType::SingleVideo, sink()).unwrap();
        let configs = factory.configs.lock().unwrap();
        assert_eq!(configs[0].app_id, "app-1");
        assert_eq!(configs[0].call_type, CallType::SingleVideo);
    }

    #[test]
    fn test_leave_and_destroy_are_idempotent() {
        let (binder, engine, _) = binder();
        let mut handle = binder.create_engine(CallType::SingleAudio, sink()).unwrap();

        binder.leave(&mut handle);
        assert_eq!(engine.leaves.load(Ordering::SeqCst), 0);

        binder
            .join(&mut handle, "ch", &RtcToken::new("t"), "u1")
            .unwrap();
        assert!(handle.is_joined());

        binder.destroy(&mut handle);
        assert!(handle.is_destroyed());
        binder.destroy(&mut handle);
        binder.leave(&mut handle);
        drop(handle);

        assert_eq!(engine.joins.load(Ordering::SeqCst), 1);
        assert_eq!(engine.leaves.load(Ordering::SeqCst), 1);
        assert_eq!(engine.destroys.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_handle_releases_engine() {
        let (binder, engine, _) = binder();
        let handle = binder.create_engine(CallType::SingleAudio, sink()).unwrap();
        drop(handle);
        assert_eq!(engine.destroys.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_join_after_destroy_fails() {
        let (binder, _, _) = binder();
        let mut handle = binder.create_engine(CallType::SingleAudio, sink()).unwrap();
        binder.destroy(&mut handle);
        assert!(
            binder
                .join(&mut handle, "ch", &RtcToken::new("t"), "u1")
                .is_err()
        );
    }

    #[test]
    fn test_sink_tags_events_with_call_id() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink = EngineEventSink::new(CallId::new("C9"), move |id, ev| {
            seen_clone.lock().unwrap().push((id, ev));
        });
        sink.emit(EngineEvent::RemoteJoined {
            user_id: "u2".into(),
        });
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, CallId::new("C9"));
    }
}
