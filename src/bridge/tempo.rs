// ABOUTME: Tempo parity between the Link session and the DJ-Link network
// ABOUTME: Tempo locking, the parity controller, and tempo validation

use super::Bridge;
use crate::error::Error;
use crate::protocol::Command;
use crate::Result;

/// Tempos outside this open interval are meaningless to Ableton Link.
const MIN_TEMPO: f64 = 20.0;
const MAX_TEMPO: f64 = 999.0;

/// Link reports tempos at micro-BPM resolution; differences at or below
/// this count as parity with the locked target.
const LOCK_TOLERANCE: f64 = 1e-5;

/// Smallest tempo change worth pushing into the session.
const SET_TOLERANCE: f64 = 0.005;

/// Whether `bpm` is strictly inside the tempo range Ableton Link accepts.
pub fn valid_tempo(bpm: f64) -> bool {
    bpm > MIN_TEMPO && bpm < MAX_TEMPO
}

impl Bridge {
    /// Force the Link session to `bpm` until [`Bridge::unlock_tempo`].
    pub fn lock_tempo(&self, bpm: f64) -> Result<()> {
        if !valid_tempo(bpm) {
            return Err(Error::InvalidArgument(format!(
                "tempo {bpm} is outside the supported range ({MIN_TEMPO}, {MAX_TEMPO})"
            )));
        }
        self.shared.state.write().target_bpm = Some(bpm);
        self.notify_status();
        self.maintain_tempo();
        Ok(())
    }

    /// Stop forcing the Link session tempo.
    pub fn unlock_tempo(&self) {
        self.shared.state.write().target_bpm = None;
        self.notify_status();
        self.maintain_tempo();
    }

    /// Set the Link session tempo, if it differs from `bpm`.
    pub fn set_link_tempo(&self, bpm: f64) -> Result<()> {
        let link_bpm = self.shared.state.read().link_bpm;
        if link_bpm.map_or(true, |current| (bpm - current).abs() > SET_TOLERANCE) {
            self.send_command(&Command::Bpm(bpm))?;
        }
        Ok(())
    }

    /// Re-establish tempo parity after a status update or a lock change.
    ///
    /// When a target tempo is locked, the session is nudged back onto it;
    /// otherwise, when the virtual participant is tempo master, the session
    /// tempo is pushed into the DJ-Link network.
    pub(crate) fn maintain_tempo(&self) {
        let (target_bpm, link_bpm) = {
            let state = self.shared.state.read();
            (state.target_bpm, state.link_bpm)
        };
        if let Some(target) = target_bpm {
            let in_parity = link_bpm.is_some_and(|bpm| (bpm - target).abs() <= LOCK_TOLERANCE);
            if !in_parity {
                if let Err(e) = self.send_command(&Command::Bpm(target)) {
                    log::debug!("Cannot push the locked tempo yet: {e}");
                }
            }
        } else if self.shared.djlink.is_tempo_master() {
            if let Some(bpm) = link_bpm {
                if bpm > 0.0 {
                    self.shared.djlink.set_tempo(bpm);
                }
            }
        }
    }
}
