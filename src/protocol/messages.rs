// ABOUTME: Carabiner protocol message type definitions
// ABOUTME: Outbound commands as LF-terminated lines, inbound daemon events

use std::fmt;

/// Beats per bar used for all Link phase math (the Pioneer DJ convention).
pub const QUANTUM: f64 = 4.0;

/// Outbound command for the Carabiner daemon.
///
/// Each command renders as a single LF-terminated ASCII line with
/// space-separated arguments. Tempo and quantum fields always carry a
/// decimal point.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Probe the daemon version
    Version,
    /// Set the Link session tempo
    Bpm(f64),
    /// Ask which beat of the Link timeline falls at the given microsecond
    BeatAtTime {
        /// Timestamp on the monotonic microsecond clock
        time: i64,
        /// Beats per bar for the phase math
        quantum: f64,
    },
    /// Ask for the Link phase at the given microsecond
    PhaseAtTime {
        /// Timestamp on the monotonic microsecond clock
        time: i64,
        /// Beats per bar for the phase math
        quantum: f64,
    },
    /// Shift the Link timeline so `beat` lands at `time`
    ForceBeatAtTime {
        /// Beat index that should land at `time`
        beat: i64,
        /// Timestamp on the monotonic microsecond clock
        time: i64,
        /// Beats per bar for the phase math
        quantum: f64,
    },
    /// Start the Link transport at the given microsecond
    StartPlaying {
        /// Timestamp on the monotonic microsecond clock
        time: i64,
    },
    /// Stop the Link transport at the given microsecond
    StopPlaying {
        /// Timestamp on the monotonic microsecond clock
        time: i64,
    },
    /// Ask the daemon to honor Link start/stop sync
    EnableStartStopSync,
    /// Force an immediate status push
    Status,
}

impl Command {
    /// Render the command as the LF-terminated line sent on the wire.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Version => write!(f, "version"),
            Command::Bpm(bpm) => write!(f, "bpm {bpm:?}"),
            Command::BeatAtTime { time, quantum } => {
                write!(f, "beat-at-time {time} {quantum:?}")
            }
            Command::PhaseAtTime { time, quantum } => {
                write!(f, "phase-at-time {time} {quantum:?}")
            }
            Command::ForceBeatAtTime {
                beat,
                time,
                quantum,
            } => write!(f, "force-beat-at-time {beat} {time} {quantum:?}"),
            Command::StartPlaying { time } => write!(f, "start-playing {time}"),
            Command::StopPlaying { time } => write!(f, "stop-playing {time}"),
            Command::EnableStartStopSync => write!(f, "enable-start-stop-sync"),
            Command::Status => write!(f, "status"),
        }
    }
}

/// Inbound message from the Carabiner daemon.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Session status push (periodic, and in response to `status`)
    Status {
        /// Current Link session tempo
        bpm: f64,
        /// Number of other Link peers on the network
        peers: u64,
    },
    /// Response to a `beat-at-time` query
    BeatAtTime {
        /// Beat index on the Link timeline, fractional when off-grid
        beat: f64,
        /// Echo of the queried timestamp
        when: i64,
    },
    /// Response to a `phase-at-time` query
    PhaseAtTime {
        /// Link phase at the queried time, in beats within the quantum
        phase: f64,
        /// Echo of the queried timestamp
        when: i64,
    },
    /// Daemon version announcement
    Version(String),
    /// The daemon did not recognize one of our commands
    Unsupported(String),
}
