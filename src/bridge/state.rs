// ABOUTME: Shared client state for the sync engine
// ABOUTME: Connection record, probe correlators, sync mode, public snapshot

use crate::djlink::PlaybackPosition;
use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// Default TCP port of the Carabiner daemon.
pub const DEFAULT_PORT: u16 = 17000;

/// Default estimate of the delay between a CDJ beat and the moment the
/// bridge sees the beat packet, in milliseconds.
pub const DEFAULT_LATENCY_MS: i64 = 1;

/// Direction(s) in which the two timelines are tied together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// The timelines run free
    Off,
    /// The Link session follows the DJ-Link tempo master
    Passive,
    /// Sync can flow in either direction
    Full,
}

impl SyncMode {
    /// Lowercase name of the mode, as used in configuration surfaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Off => "off",
            SyncMode::Passive => "passive",
            SyncMode::Full => "full",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to the live Carabiner session.
#[derive(Debug, Clone)]
pub(crate) struct Connection {
    /// Monotonic id stamped on the session's read loop so that leftover
    /// tasks from a previous session can detect they are stale and exit
    pub(crate) run_id: u64,
    /// Outbound line channel drained by the session's writer task
    pub(crate) tx: mpsc::UnboundedSender<String>,
}

/// Correlator for an outstanding `beat-at-time` query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BeatProbe {
    /// Latency-adjusted query timestamp, echoed back by the daemon
    pub(crate) when: i64,
    /// Beat-within-bar the probed beat should land on when bar-aligning
    pub(crate) beat_number: Option<i32>,
}

/// Correlator for an outstanding `phase-at-time` query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PhaseProbe {
    /// Query timestamp, echoed back by the daemon
    pub(crate) when: i64,
    /// DJ-Link playback position captured when the probe was sent
    pub(crate) position: PlaybackPosition,
}

/// The process-wide engine state record.
#[derive(Debug, Clone)]
pub(crate) struct ClientState {
    pub(crate) port: u16,
    pub(crate) latency_ms: i64,
    pub(crate) sync_mode: SyncMode,
    pub(crate) bar_align: bool,
    pub(crate) connection: Option<Connection>,
    /// Highest run id ever assigned; never reused
    pub(crate) last_run_id: u64,
    pub(crate) link_bpm: Option<f64>,
    pub(crate) link_peers: Option<u64>,
    /// When present, the Link session is being forced to this tempo
    pub(crate) target_bpm: Option<f64>,
    pub(crate) beat_probe: Option<BeatProbe>,
    pub(crate) phase_probe: Option<PhaseProbe>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            latency_ms: DEFAULT_LATENCY_MS,
            sync_mode: SyncMode::Off,
            bar_align: false,
            connection: None,
            last_run_id: 0,
            link_bpm: None,
            link_peers: None,
            target_bpm: None,
            beat_probe: None,
            phase_probe: None,
        }
    }
}

/// Read-only view of the engine state handed to status listeners and hosts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    /// TCP port of the Carabiner daemon
    pub port: u16,
    /// Estimated beat-packet latency in milliseconds
    pub latency_ms: i64,
    /// Current sync mode
    pub sync_mode: SyncMode,
    /// Whether alignment happens at bar boundaries
    pub bar_align: bool,
    /// Whether the DJ-Link engine reports itself running
    pub running: bool,
    /// Last tempo reported by the daemon, while connected
    pub link_bpm: Option<f64>,
    /// Last peer count reported by the daemon, while connected
    pub link_peers: Option<u64>,
    /// Tempo the Link session is locked to, if any
    pub target_bpm: Option<f64>,
}

impl StateSnapshot {
    pub(crate) fn capture(state: &ClientState, running: bool) -> Self {
        Self {
            port: state.port,
            latency_ms: state.latency_ms,
            sync_mode: state.sync_mode,
            bar_align: state.bar_align,
            running,
            link_bpm: state.link_bpm,
            link_peers: state.link_peers,
            target_bpm: state.target_bpm,
        }
    }
}
