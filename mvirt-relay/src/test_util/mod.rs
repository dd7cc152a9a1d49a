//! Test utilities for relay tests
//!
//! Packet builders, a recording transport and a static interface table, so the
//! relay engines can be driven end to end without sockets.

pub mod mock;
pub mod packets;

pub use mock::{MockTransport, RecordingMembership, Sent, StaticLinks};
