//! Wire formats handled by the relay.
//!
//! Views in this module borrow the receive buffer and never copy it. Mutating
//! accessors are only available when the underlying buffer is mutable.

pub mod dhcpv4;
pub mod dhcpv6;
pub mod ipv4;
pub mod options;

use thiserror::Error;

pub use dhcpv4::{DhcpPacket, decode_dhcpv4};
pub use dhcpv6::{Dhcpv6MessageType, RelayMessage, decode_dhcpv6_relay};
pub use ipv4::{Ipv4UdpHeader, Ipv4UdpView, decode_ipv4_udp, encode_ipv4_udp};
pub use options::{Overload, Tlv, TlvCursor, TlvError};

/// Errors produced while decoding or encoding packets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    #[error("not a DHCP packet (magic cookie absent)")]
    NotDhcp,

    #[error("option truncated at offset {0}")]
    TruncatedOption(usize),

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

impl From<TlvError> for WireError {
    fn from(e: TlvError) -> Self {
        match e {
            TlvError::Truncated { offset } => WireError::TruncatedOption(offset),
        }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
