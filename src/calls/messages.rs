use super::envelope::CustomMessage;
use super::error::CallError;
use super::media::{EngineEvent, RtcToken};
use super::roster::RosterResult;
use super::signaling::{CallExt, SignalingMessage};
use super::state::CallSession;
use super::transport::ConnectionEvent;
use crate::types::{CallId, CallType};
use tokio::sync::oneshot;

// --- API calls into the coordinator ---
#[derive(Debug)]
pub(crate) enum Command {
    StartSingle {
        peer_id: String,
        call_type: CallType,
        ext: CallExt,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    StartGroup {
        group_id: String,
        invitees: Vec<String>,
        ext: CallExt,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Answer {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Refuse {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    End {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Snapshot {
        reply: oneshot::Sender<Option<CallSession>>,
    },
    Shutdown,
}

// --- Everything the coordinator reacts to ---
#[derive(Debug)]
pub(crate) enum CoordinatorEvent {
    Command(Command),
    Inbound(CustomMessage),
    Connection(ConnectionEvent),
    Engine {
        call_id: CallId,
        event: EngineEvent,
    },
    TokenReady {
        call_id: CallId,
        result: Result<RtcToken, CallError>,
    },
    RosterReady {
        call_id: CallId,
        result: RosterResult,
    },
    InviteTimeout {
        call_id: CallId,
        generation: u64,
    },
    SendFailed {
        message: SignalingMessage,
        error: CallError,
    },
}
