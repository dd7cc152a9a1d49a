pub mod config;
pub mod control;
pub mod daemon;
pub mod dump;
pub mod error;
pub mod links;
pub mod registry;
pub mod relay;
pub mod socket;
pub mod stats;
pub mod sync;
pub mod test_util;
pub mod wire;

pub use error::{RelayError, Result};
