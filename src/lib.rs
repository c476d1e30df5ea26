//! Call signaling and session coordination over an instant-messaging
//! transport, with a pluggable real-time media engine.

pub mod callkit;
pub mod calls;
pub mod config;
pub mod loopback;
pub mod types;

pub use callkit::{CallKit, CallKitBuilder};
pub use calls::{
    CallError, CallExt, CallKitListener, CallSession, CallState, ConnectionEvent, CustomMessage,
    PlatformHooks,
};
pub use config::{CallKitConfig, RingSource};
