//! Ring timeout for pending invitations, reused as the connect timeout once
//! a call is accepted.
//!
//! Each arm gets a generation number. The timer task only reports
//! `(call_id, generation)`; the owner must [`InvitationTimer::claim`] it before
//! acting, so a fire that raced with a cancel or re-arm is ignored.

use crate::types::CallId;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingTimer {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct InvitationTimer {
    pending: HashMap<CallId, PendingTimer>,
    next_generation: u64,
    on_timeout: Arc<dyn Fn(CallId, u64) + Send + Sync>,
}

impl InvitationTimer {
    pub fn new<F>(on_timeout: F) -> Self
    where
        F: Fn(CallId, u64) + Send + Sync + 'static,
    {
        Self {
            pending: HashMap::new(),
            next_generation: 1,
            on_timeout: Arc::new(on_timeout),
        }
    }

    /// Arm the timer for `call_id`, replacing any pending one.
    pub fn arm(&mut self, call_id: CallId, duration: Duration) -> u64 {
        self.cancel(&call_id);

        let generation = self.next_generation;
        self.next_generation += 1;

        let on_timeout = self.on_timeout.clone();
        let fire_id = call_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            on_timeout(fire_id, generation);
        });

        debug!("Armed invitation timer for {call_id} ({duration:?}, gen {generation})");
        self.pending.insert(call_id, PendingTimer { generation, task });
        generation
    }

    /// Cancel the pending timer. Returns whether one was armed.
    pub fn cancel(&mut self, call_id: &CallId) -> bool {
        match self.pending.remove(call_id) {
            Some(timer) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, call_id: &CallId) -> bool {
        self.pending.contains_key(call_id)
    }

    /// Accept a fire report. True only for the live generation, which is
    /// then consumed.
    pub fn claim(&mut self, call_id: &CallId, generation: u64) -> bool {
        match self.pending.get(call_id) {
            Some(timer) if timer.generation == generation => {
                self.pending.remove(call_id);
                true
            }
            _ => false,
        }
    }
}

impl Drop for InvitationTimer {
    fn drop(&mut self) {
        for (_, timer) in self.pending.drain() {
            timer.task.abort();
        }
    }
}
