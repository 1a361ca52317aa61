//! Peer wire protocol and session state machine (spec.md §4.4, §4.5).

pub(crate) mod codec;
pub(crate) mod session;

pub(crate) use session::{Command, PeerSession, Sender};
