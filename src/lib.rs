// ABOUTME: Main library entry point for beatbridge
// ABOUTME: Exports the sync engine, protocol codec, and DJ-Link surface

//! # beatbridge
//!
//! Bidirectional tempo and phase bridge between a Pro DJ Link network and an
//! Ableton Link session.
//!
//! The DJ-Link side is reached through an engine the host application injects
//! (see [`djlink::DjLink`]); the Link side is reached through the Carabiner
//! daemon's line-oriented TCP protocol on localhost. The bridge keeps one
//! consistent beat grid across the two clock domains: it negotiates who is
//! tempo master, mirrors tempo changes in either direction, and decides on
//! each beat packet whether a phase correction is musically safe to apply.
//!
//! ## Example: following the DJ-Link tempo master
//!
//! ```no_run
//! use std::sync::Arc;
//! use beatbridge::djlink::DjLink;
//! use beatbridge::{Bridge, BridgeConfig, SyncMode};
//!
//! # async fn run(engine: Arc<dyn DjLink>) -> beatbridge::Result<()> {
//! let bridge = Bridge::with_config(engine, BridgeConfig::new().latency_ms(20));
//! let _connected = bridge.connect(|message| eprintln!("carabiner: {message}")).await;
//! bridge.set_sync_mode(SyncMode::Passive)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Sync engine: connection supervision, tempo parity, beat/phase alignment
pub mod bridge;
/// Surface of the external Pro DJ Link engine collaborator
pub mod djlink;
/// Protocol codec for the Carabiner daemon's line protocol
pub mod protocol;

pub use bridge::{
    monotonic_micros, valid_tempo, Bridge, BridgeConfig, DisconnectionListener, StateSnapshot,
    StatusListener, SyncMode, VersionListener,
};
pub use protocol::{Command, Event};

/// Result type for beatbridge operations
pub type Result<T> = std::result::Result<T, error::Error>;

/// Error types for beatbridge
pub mod error {
    use thiserror::Error;

    /// Error types for beatbridge operations
    #[derive(Error, Debug)]
    pub enum Error {
        /// A precondition on engine or connection state was violated
        #[error("invalid state: {0}")]
        InvalidState(String),

        /// A caller-supplied value was out of range
        #[error("invalid argument: {0}")]
        InvalidArgument(String),

        /// The Carabiner session is missing or unusable
        #[error("connection error: {0}")]
        Connection(String),

        /// A daemon message could not be understood
        #[error("protocol error: {0}")]
        Protocol(String),
    }
}
