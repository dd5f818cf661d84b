// ABOUTME: Public facade of the sync engine
// ABOUTME: Bridge handle, configuration, introspection, and subscriptions

mod align;
mod clock;
mod connection;
mod listeners;
mod state;
mod sync;
mod tempo;

pub use clock::monotonic_micros;
pub use listeners::{DisconnectionListener, StatusListener, VersionListener};
pub use state::{StateSnapshot, SyncMode};
pub use tempo::valid_tempo;

use crate::djlink::{DjLink, MasterListener};
use crate::error::Error;
use crate::Result;
use listeners::ListenerSet;
use parking_lot::{Mutex, RwLock};
use state::ClientState;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Pre-connect configuration for a [`Bridge`].
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// TCP port of the Carabiner daemon on localhost
    pub port: u16,
    /// Estimated delay between a CDJ beat and the bridge seeing it, in
    /// milliseconds
    pub latency_ms: i64,
    /// Align at bar boundaries (every four beats) instead of single beats
    pub bar_align: bool,
}

impl BridgeConfig {
    /// Create a configuration with the default port, latency, and alignment
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the daemon port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the estimated beat-packet latency in milliseconds
    pub fn latency_ms(mut self, latency_ms: i64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Align at bar boundaries instead of single beats
    pub fn bar_align(mut self, bar_align: bool) -> Self {
        self.bar_align = bar_align;
        self
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: state::DEFAULT_PORT,
            latency_ms: state::DEFAULT_LATENCY_MS,
            bar_align: false,
        }
    }
}

/// Everything a [`Bridge`] handle points at.
pub(crate) struct Shared {
    pub(crate) state: RwLock<ClientState>,
    pub(crate) djlink: Arc<dyn DjLink>,
    pub(crate) runtime: Handle,
    pub(crate) status_listeners: ListenerSet<StateSnapshot>,
    pub(crate) version_listeners: ListenerSet<str>,
    pub(crate) disconnection_listeners: ListenerSet<bool>,
    /// Currently registered master-listener adapter; the option doubles as
    /// the subscription guard so the DJ-Link registration stays set-valued
    pub(crate) master_listener: Mutex<Option<Arc<dyn MasterListener>>>,
}

/// Handle to the sync engine.
///
/// Cheap to clone; all clones share the same state, session, and listener
/// registries. Host threads and DJ-Link callback threads may call any
/// method concurrently.
pub struct Bridge {
    pub(crate) shared: Arc<Shared>,
}

impl Clone for Bridge {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Bridge {
    /// Create a bridge around the given DJ-Link engine with defaults.
    ///
    /// Must be called from within a tokio runtime: the bridge captures the
    /// runtime handle so DJ-Link callback threads can schedule work on it.
    pub fn new(djlink: Arc<dyn DjLink>) -> Self {
        Self::with_config(djlink, BridgeConfig::default())
    }

    /// Create a bridge around the given DJ-Link engine.
    ///
    /// Must be called from within a tokio runtime; see [`Bridge::new`].
    pub fn with_config(djlink: Arc<dyn DjLink>, config: BridgeConfig) -> Self {
        let state = ClientState {
            port: config.port,
            latency_ms: config.latency_ms,
            bar_align: config.bar_align,
            ..ClientState::default()
        };
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(state),
                djlink,
                runtime: Handle::current(),
                status_listeners: ListenerSet::new(),
                version_listeners: ListenerSet::new(),
                disconnection_listeners: ListenerSet::new(),
                master_listener: Mutex::new(None),
            }),
        }
    }

    /// Snapshot of the public engine state.
    pub fn state(&self) -> StateSnapshot {
        let running = self.shared.djlink.is_running();
        StateSnapshot::capture(&self.shared.state.read(), running)
    }

    /// Whether a Carabiner session is currently established.
    pub fn is_active(&self) -> bool {
        self.shared.state.read().connection.is_some()
    }

    /// Whether any direction of sync is enabled.
    pub fn sync_enabled(&self) -> bool {
        self.shared.state.read().sync_mode != SyncMode::Off
    }

    /// Whether `bpm` is a tempo Ableton Link can work with.
    pub fn valid_tempo(&self, bpm: f64) -> bool {
        valid_tempo(bpm)
    }

    /// Change the daemon port. Rejected while a session is active.
    pub fn set_carabiner_port(&self, port: u16) -> Result<()> {
        let mut state = self.shared.state.write();
        if state.connection.is_some() {
            return Err(Error::InvalidState(
                "cannot change the Carabiner port while connected".into(),
            ));
        }
        state.port = port;
        Ok(())
    }

    /// Update the estimated beat-packet latency in milliseconds.
    pub fn set_latency(&self, latency_ms: i64) {
        self.shared.state.write().latency_ms = latency_ms;
    }

    /// Align at bar boundaries (every four beats) instead of single beats.
    pub fn set_sync_bars(&self, bar_align: bool) {
        self.shared.state.write().bar_align = bar_align;
    }

    /// Subscribe to engine state snapshots.
    pub fn add_status_listener(&self, listener: StatusListener) {
        self.shared.status_listeners.add(listener);
    }

    /// Unsubscribe a status listener.
    pub fn remove_status_listener(&self, listener: &StatusListener) {
        self.shared.status_listeners.remove(listener);
    }

    /// Subscribe to daemon-version warnings.
    pub fn add_version_listener(&self, listener: VersionListener) {
        self.shared.version_listeners.add(listener);
    }

    /// Unsubscribe a version listener.
    pub fn remove_version_listener(&self, listener: &VersionListener) {
        self.shared.version_listeners.remove(listener);
    }

    /// Subscribe to end-of-session notifications.
    pub fn add_disconnection_listener(&self, listener: DisconnectionListener) {
        self.shared.disconnection_listeners.add(listener);
    }

    /// Unsubscribe a disconnection listener.
    pub fn remove_disconnection_listener(&self, listener: &DisconnectionListener) {
        self.shared.disconnection_listeners.remove(listener);
    }

    pub(crate) fn notify_status(&self) {
        let snapshot = self.state();
        self.shared.status_listeners.notify(&snapshot);
    }

    pub(crate) fn warn_bad_version(&self, message: &str) {
        log::warn!("{message}");
        self.shared.version_listeners.notify(message);
    }
}
