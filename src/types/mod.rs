pub mod call;
pub mod member;

pub use call::{CallDirection, CallErrorKind, CallId, CallType, EndCallReason, NetworkQuality};
pub use member::{CallMember, InviteState, UserInfo};
