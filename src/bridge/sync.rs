// ABOUTME: Sync-mode state machine and tempo-master handoff choreography
// ABOUTME: Ties/frees each sync direction and adapts DJ-Link master callbacks

use super::state::SyncMode;
use super::{tempo, Bridge};
use crate::djlink::{Beat, MasterListener};
use crate::error::Error;
use crate::protocol::Command;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// Delay before the post-handoff status probe; the outgoing tempo master
/// may perturb the session tempo while handing over.
const HANDOFF_PROBE_DELAY: Duration = Duration::from_millis(1);

/// Adapter that forwards DJ-Link master callbacks into the engine.
struct MasterBridge {
    bridge: Bridge,
}

impl MasterListener for MasterBridge {
    fn master_changed(&self) {}

    fn tempo_changed(&self, tempo: f64) {
        if tempo::valid_tempo(tempo) {
            if let Err(e) = self.bridge.lock_tempo(tempo) {
                log::warn!("Failed to follow master tempo {tempo}: {e}");
            }
        } else {
            self.bridge.unlock_tempo();
        }
    }

    fn new_beat(&self, beat: Beat) {
        if !beat.tempo_master || !self.bridge.shared.djlink.is_running() {
            return;
        }
        let bar_align = self.bridge.shared.state.read().bar_align;
        let beat_number = if bar_align {
            Some(beat.beat_within_bar)
        } else {
            None
        };
        if let Err(e) = self
            .bridge
            .beat_at_time(beat.timestamp_ns / 1000, beat_number)
        {
            log::warn!("Failed to probe the Link beat for a master beat packet: {e}");
        }
    }
}

impl Bridge {
    /// Change the sync mode, validating against DJ-Link engine state.
    ///
    /// Any mode other than [`SyncMode::Off`] requires an active Carabiner
    /// connection and a running DJ-Link engine; [`SyncMode::Full`]
    /// additionally requires the virtual participant to be sending status
    /// packets.
    pub fn set_sync_mode(&self, mode: SyncMode) -> Result<()> {
        if mode != SyncMode::Off {
            if !self.is_active() {
                return Err(Error::InvalidState(
                    "cannot sync without an active Carabiner connection".into(),
                ));
            }
            if !self.shared.djlink.is_running() {
                return Err(Error::InvalidState(
                    "cannot sync while the DJ-Link engine is not running".into(),
                ));
            }
            if mode == SyncMode::Full && !self.shared.djlink.is_sending_status() {
                return Err(Error::InvalidState(
                    "full sync requires the virtual participant to be sending status packets"
                        .into(),
                ));
            }
        }
        self.shared.state.write().sync_mode = mode;
        log::info!("Sync mode set to {mode}");
        if mode == SyncMode::Off {
            self.free_ableton_from_pioneer();
            self.free_pioneer_from_ableton();
        } else {
            self.subscribe_master_listener();
            self.sync_link(self.shared.djlink.is_synced());
            if mode == SyncMode::Full && self.shared.djlink.is_tempo_master() {
                self.tie_pioneer_to_ableton();
            }
        }
        Ok(())
    }

    /// Reflect `synced` to the virtual participant, and tie or free the
    /// Link session accordingly while a sync mode is engaged.
    pub fn sync_link(&self, synced: bool) {
        self.shared.djlink.set_synced(synced);
        let mode = self.shared.state.read().sync_mode;
        if mode != SyncMode::Off && !self.shared.djlink.is_tempo_master() {
            if synced {
                self.tie_ableton_to_pioneer();
            } else {
                self.free_ableton_from_pioneer();
            }
        }
    }

    /// Hand tempo-master duty to, or take it back from, the Link session.
    pub fn link_master(&self, master: bool) {
        if master {
            let mode = self.shared.state.read().sync_mode;
            if mode == SyncMode::Full {
                self.tie_pioneer_to_ableton();
            } else {
                log::warn!("Ignoring a Link master request outside full sync mode");
            }
        } else {
            self.free_pioneer_from_ableton();
        }
    }

    fn subscribe_master_listener(&self) {
        let mut registered = self.shared.master_listener.lock();
        if registered.is_none() {
            let listener: Arc<dyn MasterListener> = Arc::new(MasterBridge {
                bridge: self.clone(),
            });
            self.shared.djlink.add_master_listener(Arc::clone(&listener));
            *registered = Some(listener);
        }
    }

    fn unsubscribe_master_listener(&self) {
        let registered = self.shared.master_listener.lock().take();
        if let Some(listener) = registered {
            self.shared.djlink.remove_master_listener(&listener);
        }
    }

    /// Make the Link session follow the DJ-Link tempo master.
    pub(crate) fn tie_ableton_to_pioneer(&self) {
        self.subscribe_master_listener();
        let tempo = self.shared.djlink.master_tempo();
        if tempo::valid_tempo(tempo) {
            if let Err(e) = self.lock_tempo(tempo) {
                log::warn!("Failed to push the master tempo into Link: {e}");
            }
        } else {
            self.unlock_tempo();
        }
    }

    /// Stop the Link session from following the DJ-Link tempo master.
    pub(crate) fn free_ableton_from_pioneer(&self) {
        self.unsubscribe_master_listener();
        self.unlock_tempo();
    }

    /// Make the virtual participant follow the Link session as master.
    pub(crate) fn tie_pioneer_to_ableton(&self) {
        self.free_ableton_from_pioneer();
        if let Err(e) = self.align_pioneer_phase_to_ableton() {
            log::warn!("Could not align the Pioneer phase to Link: {e}");
        }
        let link_bpm = self.shared.state.read().link_bpm;
        if let Some(bpm) = link_bpm {
            self.shared.djlink.set_tempo(bpm);
        }
        self.shared.djlink.become_tempo_master();
        self.shared.djlink.set_playing(true);
        let bridge = self.clone();
        self.shared.runtime.spawn(async move {
            tokio::time::sleep(HANDOFF_PROBE_DELAY).await;
            if let Err(e) = bridge.send_command(&Command::Status) {
                log::warn!("Failed to send the post-handoff status probe: {e}");
            }
        });
    }

    /// Stop the virtual participant from following the Link session.
    pub(crate) fn free_pioneer_from_ableton(&self) {
        self.shared.djlink.set_playing(false);
        let mode = self.shared.state.read().sync_mode;
        if mode != SyncMode::Off && self.shared.djlink.is_synced() {
            self.tie_ableton_to_pioneer();
        }
    }
}
