//! Relay daemon assembly.
//!
//! Opens the sockets, builds the shared [`RelayState`], applies the initial
//! configuration and starts the receiver threads and control-plane tasks.

use crate::config::{ConfigDocument, GlobalConfig};
use crate::control::ControlServer;
use crate::error::{RelayError, Result};
use crate::links::{REFRESH_INTERVAL, SystemLinks};
use crate::relay::RelayState;
use crate::socket::{
    MulticastMembership, SocketTransport, open_v4_listener, open_v6_socket, spawn_v4_receiver,
    spawn_v6_receiver,
};
use crate::sync::{ConfigSync, SyncReport};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// Default configuration file
pub const CONFIG_PATH: &str = "/etc/mvirt/relay.json";

/// Default control socket
pub const CONTROL_PATH: &str = "/run/mvirt/relay.sock";

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub config_path: PathBuf,
    pub control_path: PathBuf,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(CONFIG_PATH),
            control_path: PathBuf::from(CONTROL_PATH),
        }
    }
}

/// A running relay daemon.
pub struct Daemon {
    state: Arc<RelayState>,
    sync: ConfigSync,
    config_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    receivers: Vec<std::thread::JoinHandle<()>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Daemon {
    /// Start the daemon. Must be called from within a tokio runtime.
    pub fn start(options: &DaemonOptions) -> Result<Self> {
        let doc = ConfigDocument::load(&options.config_path)?;

        let links = Arc::new(SystemLinks::load().map_err(RelayError::socket("interface table"))?);
        let v6_socket = Arc::new(open_v6_socket().map_err(RelayError::socket("DHCPv6 socket"))?);
        let v4_listener = open_v4_listener().map_err(RelayError::socket("DHCPv4 listener"))?;
        let transport = SocketTransport::open(v6_socket.clone())
            .map_err(RelayError::socket("DHCPv4 senders"))?;
        let membership = MulticastMembership::new(v6_socket.clone(), links.clone());

        let config = Arc::new(GlobalConfig::new());
        let state = Arc::new(RelayState::new(
            config.clone(),
            links.clone(),
            Arc::new(transport),
            Arc::new(membership),
        ));

        let mut sync = ConfigSync::new(
            config.clone(),
            state.v4_servers.clone(),
            state.v6_servers.clone(),
        );
        let report = sync.apply(&doc)?;
        info!(
            path = %options.config_path.display(),
            interfaces = report.changes.len(),
            skipped = report.skipped.len(),
            "Configuration loaded"
        );

        let control = ControlServer::bind(&options.control_path)
            .map_err(RelayError::socket("control socket"))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let receivers = vec![
            spawn_v4_receiver(v4_listener, state.clone(), shutdown.clone())?,
            spawn_v6_receiver(v6_socket, state.clone(), shutdown.clone())?,
        ];
        let tasks = vec![
            tokio::spawn(control.serve(state.clone())),
            links.spawn_refresh(REFRESH_INTERVAL),
            state.stats.clone().spawn_logger(config),
        ];

        info!("Relay started");
        Ok(Self {
            state,
            sync,
            config_path: options.config_path.clone(),
            shutdown,
            receivers,
            tasks,
        })
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Re-read the configuration file and apply the differences.
    pub fn reload(&mut self) -> Result<SyncReport> {
        let doc = ConfigDocument::load(&self.config_path)?;
        Ok(self.sync.apply(&doc)?)
    }

    /// Stop the receivers and background tasks.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for task in &self.tasks {
            task.abort();
        }
        for receiver in self.receivers {
            if receiver.join().is_err() {
                error!("Receiver thread panicked");
            }
        }
        info!("Relay stopped");
    }
}
