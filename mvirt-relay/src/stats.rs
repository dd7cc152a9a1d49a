//! Per-interface relay counters.

use crate::config::GlobalConfig;
use chrono::{DateTime, Utc};
use dhcproto::v4::MessageType;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

/// Key used for packets whose ingress interface could not be resolved
pub const UNKNOWN_INTERFACE: &str = "-";

macro_rules! counters {
    ($($field:ident),* $(,)?) => {
        /// Counters of one interface.
        #[derive(Debug, Default)]
        pub struct InterfaceCounters {
            $(pub $field: AtomicU64,)*
        }

        /// Point-in-time copy of [`InterfaceCounters`].
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct CountersSnapshot {
            $(pub $field: u64,)*
        }

        impl InterfaceCounters {
            pub fn snapshot(&self) -> CountersSnapshot {
                CountersSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters!(
    v4_client_relayed,
    v4_client_dropped,
    v4_server_relayed,
    v4_server_dropped,
    discover,
    request,
    inform,
    release,
    decline,
    bootp_request,
    offer,
    ack,
    nak,
    bootp_reply,
    bad_packets,
    udp_forwarded,
    udp_dropped,
    v6_client_relayed,
    v6_client_dropped,
    v6_server_relayed,
    v6_server_dropped,
    send_failures,
);

/// Bump a counter by one.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl InterfaceCounters {
    /// Count a received DHCPv4 message by its type.
    ///
    /// Messages without a message-type option are BOOTP.
    pub fn record_v4_message(&self, op: u8, message_type: Option<u8>) {
        let counter = match message_type.map(MessageType::from) {
            Some(MessageType::Discover) => &self.discover,
            Some(MessageType::Request) => &self.request,
            Some(MessageType::Inform) => &self.inform,
            Some(MessageType::Release) => &self.release,
            Some(MessageType::Decline) => &self.decline,
            Some(MessageType::Offer) => &self.offer,
            Some(MessageType::Ack) => &self.ack,
            Some(MessageType::Nak) => &self.nak,
            Some(_) => return,
            None if op == 1 => &self.bootp_request,
            None => &self.bootp_reply,
        };
        inc(counter);
    }
}

/// Counters of every interface the relay has seen traffic on.
#[derive(Debug, Default)]
pub struct RelayStats {
    interfaces: RwLock<HashMap<String, Arc<InterfaceCounters>>>,
}

/// Serializable view of [`RelayStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub interfaces: BTreeMap<String, CountersSnapshot>,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters of `interface`, created on first use.
    pub fn counters(&self, interface: &str) -> Arc<InterfaceCounters> {
        if let Some(c) = self
            .interfaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(interface)
        {
            return Arc::clone(c);
        }

        let mut map = self
            .interfaces
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(interface.to_string()).or_default())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let map = self
            .interfaces
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        StatsSnapshot {
            timestamp: Utc::now(),
            interfaces: map
                .iter()
                .map(|(name, c)| (name.clone(), c.snapshot()))
                .collect(),
        }
    }

    /// Log a summary line per interface every `stats_update_interval` seconds.
    ///
    /// The interval is re-read on every round, so configuration changes take
    /// effect without restarting the task.
    pub fn spawn_logger(self: Arc<Self>, config: Arc<GlobalConfig>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(config.stats_interval()).await;
                for (name, c) in self.snapshot().interfaces {
                    info!(
                        iface = %name,
                        v4_client_relayed = c.v4_client_relayed,
                        v4_client_dropped = c.v4_client_dropped,
                        v4_server_relayed = c.v4_server_relayed,
                        v4_server_dropped = c.v4_server_dropped,
                        udp_forwarded = c.udp_forwarded,
                        v6_client_relayed = c.v6_client_relayed,
                        v6_server_relayed = c.v6_server_relayed,
                        send_failures = c.send_failures,
                        "Relay statistics"
                    );
                }
            }
        })
    }
}
