//! Signaling transport adapter.
//!
//! Turns typed [`SignalingMessage`]s into custom messages on the chat
//! transport and back. The adapter owns no call state. Outbound signals are
//! funneled through a single [`Outbox`] task so that signals for one call leave
//! in the order the coordinator produced them.

use super::envelope::{CustomMessage, build_custom_message, parse_custom_message};
use super::error::CallError;
use super::signaling::{SignalKind, SignalingMessage};
use crate::types::{CallId, CallType};
use async_trait::async_trait;
use log::{debug, error, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The chat transport signals are carried over.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Sends one custom message. No retries are expected from the transport.
    async fn send(&self, message: CustomMessage) -> Result<(), anyhow::Error>;
}

/// Connection-state callbacks of the chat transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { code: i32 },
    LoggedOut { code: i32 },
    TokenWillExpire,
    TokenExpired,
}

impl ConnectionEvent {
    /// Whether signaling is gone for good until the host logs in again.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::LoggedOut { .. } | Self::TokenExpired)
    }
}

pub struct SignalingAdapter {
    transport: Arc<dyn MessageTransport>,
    local_user: String,
    device_id: String,
}

impl SignalingAdapter {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        local_user: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            local_user: local_user.into(),
            device_id: device_id.into(),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Start a signal stamped with this device as sender.
    pub fn compose(
        &self,
        kind: SignalKind,
        call_id: &CallId,
        call_type: CallType,
        channel_name: &str,
    ) -> SignalingMessage {
        SignalingMessage::new(kind, call_id.clone(), call_type, channel_name)
            .from(self.local_user.clone(), self.device_id.clone())
    }

    /// Send a signal. Accept, reject and busy are also copied to our own user
    /// id so the other logged-in devices can retract their ringing session; a
    /// failed copy is only logged.
    pub async fn send(&self, message: &SignalingMessage) -> Result<(), CallError> {
        if message.kind.syncs_own_devices() && message.to_user != self.local_user {
            let copy = message.readdressed(self.local_user.clone());
            let (primary, copy_result) =
                futures_util::future::join(self.send_one(message), self.send_one(&copy)).await;
            if let Err(e) = copy_result {
                warn!(
                    "Failed to sync {} for call {} to own devices: {}",
                    message.kind, message.call_id, e
                );
            }
            primary
        } else {
            self.send_one(message).await
        }
    }

    async fn send_one(&self, message: &SignalingMessage) -> Result<(), CallError> {
        let raw = build_custom_message(message);
        debug!(
            "Sending {} for call {} to {}",
            message.kind, message.call_id, message.to_user
        );
        self.transport
            .send(raw)
            .await
            .map_err(|e| CallError::Transport(e.to_string()))
    }

    /// Decode an inbound custom message.
    pub fn decode(&self, raw: &CustomMessage) -> Result<Option<SignalingMessage>, CallError> {
        parse_custom_message(raw)
    }
}

/// Sequential sender for outbound signals.
pub(crate) struct Outbox {
    tx: mpsc::UnboundedSender<SignalingMessage>,
    adapter: Arc<SignalingAdapter>,
}

impl Outbox {
    /// Spawn the sender task. `on_failure` receives every signal the
    /// transport refused, together with the error.
    pub(crate) fn spawn<F>(adapter: Arc<SignalingAdapter>, on_failure: F) -> Self
    where
        F: Fn(SignalingMessage, CallError) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let task_adapter = adapter.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = task_adapter.send(&message).await {
                    warn!(
                        "Signal {} for call {} to {} failed: {}",
                        message.kind, message.call_id, message.to_user, e
                    );
                    on_failure(message, e);
                }
            }
            debug!("Signaling outbox drained");
        });
        Self { tx, adapter }
    }

    pub(crate) fn adapter(&self) -> &SignalingAdapter {
        &self.adapter
    }

    pub(crate) fn send(&self, message: SignalingMessage) {
        if let Err(e) = self.tx.send(message) {
            error!(
                "Signaling outbox closed, dropping {} for call {}",
                e.0.kind, e.0.call_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<CustomMessage>>,
        fail_to: Option<String>,
    }

    #[async_trait]
    impl MessageTransport for RecordingTransport {
        async fn send(&self, message: CustomMessage) -> Result<(), anyhow::Error> {
            if self.fail_to.as_deref() == Some(message.to.as_str()) {
                return Err(anyhow::anyhow!("peer unreachable"));
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn adapter(transport: Arc<RecordingTransport>) -> SignalingAdapter {
        SignalingAdapter::new(transport, "alice", "phone")
    }

    #[tokio::test]
    async fn test_accept_is_copied_to_own_devices() {
        let transport = Arc::new(RecordingTransport::default());
        let adapter = adapter(transport.clone());
        let msg = adapter
            .compose(SignalKind::Accept, &CallId::new("C1"), CallType::SingleAudio, "ch")
            .to("bob");

        adapter.send(&msg).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        let mut recipients: Vec<_> = sent.iter().map(|m| m.to.as_str()).collect();
        recipients.sort();
        assert_eq!(recipients, vec!["alice", "bob"]);
        assert!(sent.iter().all(|m| m.params["device"] == "phone"));
    }

    #[tokio::test]
    async fn test_hangup_goes_only_to_peer() {
        let transport = Arc::new(RecordingTransport::default());
        let adapter = adapter(transport.clone());
        let msg = adapter
            .compose(SignalKind::Hangup, &CallId::new("C1"), CallType::SingleAudio, "ch")
            .to("bob");

        adapter.send(&msg).await.unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_maps_to_transport_error() {
        let transport = Arc::new(RecordingTransport {
            fail_to: Some("bob".into()),
            ..Default::default()
        });
        let adapter = adapter(transport.clone());
        let msg = adapter
            .compose(SignalKind::Invite, &CallId::new("C1"), CallType::SingleAudio, "ch")
            .to("bob");

        let err = adapter.send(&msg).await.unwrap_err();
        assert!(matches!(err, CallError::Transport(_)));
    }

    #[tokio::test]
    async fn test_outbox_reports_failures_in_order() {
        let transport = Arc::new(RecordingTransport {
            fail_to: Some("carol".into()),
            ..Default::default()
        });
        let adapter = Arc::new(adapter(transport.clone()));
        let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
        let outbox = Outbox::spawn(adapter.clone(), move |msg, _err| {
            let _ = fail_tx.send(msg.to_user);
        });

        let call_id = CallId::new("C1");
        for to in ["bob", "carol", "dave"] {
            outbox.send(
                adapter
                    .compose(SignalKind::Invite, &call_id, CallType::GroupVideo, "ch")
                    .to(to),
            );
        }

        assert_eq!(fail_rx.recv().await.as_deref(), Some("carol"));
        drop(outbox);
        // Give the task a chance to finish the last send.
        tokio::task::yield_now().await;
        let sent: Vec<_> = transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.to.clone())
            .collect();
        assert_eq!(sent.first().map(String::as_str), Some("bob"));
    }
}
