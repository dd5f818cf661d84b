// ABOUTME: Beat and phase alignment between the two timelines
// ABOUTME: Probe bookkeeping, bar rotation, and the audibility gate on shifts

use super::state::{BeatProbe, PhaseProbe};
use super::{clock, Bridge};
use crate::djlink::closest_delta;
use crate::error::Error;
use crate::protocol::{Command, QUANTUM};
use crate::Result;

/// Fractional-beat skew above which the Link grid is snapped back into
/// place (≈ 1/60 beat, just above expected beat-packet jitter).
const SKEW_TOLERANCE: f64 = 0.0166;

/// Beats of slack added to forward shifts for transmission lag.
const SHIFT_LAG_BEATS: f64 = 0.1;

/// Shifts larger than this many beats are already audible, so deferring
/// them buys nothing.
const AUDIBLE_SHIFT_BEATS: f64 = 0.2;

impl Bridge {
    /// Ask the daemon which Link beat falls at `time_us` and realign the
    /// session grid if the answer is off.
    ///
    /// `beat_number` is the beat-within-bar (1 through 4) the probed beat
    /// should land on; pass `None` to align individual beats only.
    pub fn beat_at_time(&self, time_us: i64, beat_number: Option<i32>) -> Result<()> {
        let adjusted = {
            let mut state = self.shared.state.write();
            let adjusted = time_us - state.latency_ms * 1000;
            state.beat_probe = Some(BeatProbe {
                when: adjusted,
                beat_number,
            });
            adjusted
        };
        self.send_command(&Command::BeatAtTime {
            time: adjusted,
            quantum: QUANTUM,
        })
    }

    pub(crate) fn handle_beat_response(&self, beat: f64, when: i64) {
        let raw = beat.round() as i64;
        let skew = beat - raw as f64;
        let probe = self.shared.state.read().beat_probe;
        let candidate = match probe {
            Some(BeatProbe {
                when: probe_when,
                beat_number: Some(number),
            }) if probe_when == when => bar_aligned(raw, i64::from(number)),
            _ => raw,
        };
        let target = epoch_clamped(candidate);
        if needs_realignment(skew, raw, target) {
            log::info!("Realigning Link beat {beat} at {when} to land on beat {target}");
            if let Err(e) = self.send_command(&Command::ForceBeatAtTime {
                beat: target,
                time: when,
                quantum: QUANTUM,
            }) {
                log::warn!("Failed to realign the Link beat grid: {e}");
            }
        }
    }

    /// Probe the Link phase so the Pioneer timeline can be nudged onto it.
    ///
    /// Captures the DJ-Link playback position alongside the probe time;
    /// the daemon's response is matched against both.
    pub fn align_pioneer_phase_to_ableton(&self) -> Result<()> {
        let position = self.shared.djlink.playback_position().ok_or_else(|| {
            Error::InvalidState("the DJ-Link engine has no playback position to align".into())
        })?;
        let when = {
            let mut state = self.shared.state.write();
            let when = clock::monotonic_micros() + state.latency_ms * 1000;
            state.phase_probe = Some(PhaseProbe { when, position });
            when
        };
        self.send_command(&Command::PhaseAtTime {
            time: when,
            quantum: QUANTUM,
        })
    }

    pub(crate) fn handle_phase_response(&self, phase: f64, when: i64) {
        let (probe, bar_align) = {
            let state = self.shared.state.read();
            (state.phase_probe, state.bar_align)
        };
        let probe = match probe {
            Some(probe) if probe.when == when => probe,
            _ => {
                log::warn!("Ignoring stale phase-at-time response for {when}");
                return;
            }
        };
        let desired = if bar_align {
            phase / QUANTUM
        } else {
            phase - phase.floor()
        };
        let actual = if bar_align {
            probe.position.bar_phase
        } else {
            probe.position.beat_phase
        };
        let delta = closest_delta(desired - actual);
        let interval = if bar_align {
            probe.position.bar_interval_ms
        } else {
            probe.position.beat_interval_ms
        };
        let ms_delta = (delta * interval).floor() as i64;
        if ms_delta == 0 {
            return;
        }
        // The audibility check wants the phase as it is right now, not the
        // snapshot from when the probe went out
        let Some(live) = self.shared.djlink.playback_position() else {
            log::warn!("Playback position disappeared; skipping the phase shift");
            return;
        };
        let beat_delta = lag_compensated(delta, bar_align);
        if shift_is_safe(live.beat_phase, beat_delta) {
            log::info!("Shifting Pioneer playback by {ms_delta}ms to match the Link phase");
            self.shared.djlink.adjust_playback_position(ms_delta);
        } else {
            log::debug!("Deferring a {ms_delta}ms phase shift; it would skip or repeat a beat");
        }
    }

    /// Start the Link transport, at `time_us` or now.
    pub fn start_transport(&self, time_us: Option<i64>) -> Result<()> {
        let time = time_us.unwrap_or_else(clock::monotonic_micros);
        self.send_command(&Command::StartPlaying { time })
    }

    /// Stop the Link transport, at `time_us` or now.
    pub fn stop_transport(&self, time_us: Option<i64>) -> Result<()> {
        let time = time_us.unwrap_or_else(clock::monotonic_micros);
        self.send_command(&Command::StopPlaying { time })
    }
}

/// Rotate `raw` so it lands on `beat_within_bar`, taking the shortest path.
///
/// The rotation is kept in `[-1, 2]`: a skew of -2 or -3 beats becomes +2
/// or +1 instead.
fn bar_aligned(raw: i64, beat_within_bar: i64) -> i64 {
    let mut bar_skew = (beat_within_bar - 1) - raw.rem_euclid(4);
    if bar_skew <= -2 {
        bar_skew += 4;
    }
    raw + bar_skew
}

/// Link rejects negative beats near the session epoch; pick the same spot
/// one bar later.
fn epoch_clamped(beat: i64) -> i64 {
    if beat < 0 {
        beat + 4
    } else {
        beat
    }
}

fn needs_realignment(skew: f64, raw: i64, target: i64) -> bool {
    skew.abs() > SKEW_TOLERANCE || target != raw
}

/// Beat-denominated shift, padded on the forward side for transmission lag.
fn lag_compensated(delta: f64, bar_align: bool) -> f64 {
    let beat_delta = if bar_align { delta * QUANTUM } else { delta };
    if beat_delta > 0.0 {
        beat_delta + SHIFT_LAG_BEATS
    } else {
        beat_delta
    }
}

/// A shift is safe when it stays within the current beat, or is already so
/// large that the drift itself is audible.
fn shift_is_safe(beat_phase_now: f64, beat_delta: f64) -> bool {
    (beat_phase_now + beat_delta).floor() == 0.0 || beat_delta.abs() > AUDIBLE_SHIFT_BEATS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_alignment_rotates_to_requested_beat() {
        // Probe said beat 8, wanted beat-within-bar 3: rotate up two beats
        assert_eq!(bar_aligned(8, 3), 10);
        // Already on the right beat of the bar
        assert_eq!(bar_aligned(10, 3), 10);
    }

    #[test]
    fn test_bar_skew_rotates_shortest_path() {
        // A -3 rotation becomes +1
        assert_eq!(bar_aligned(3, 1), 4);
        // A -2 rotation becomes +2
        assert_eq!(bar_aligned(3, 2), 5);
        // -1 stays -1
        assert_eq!(bar_aligned(2, 2), 1);
    }

    #[test]
    fn test_negative_beats_move_up_a_bar() {
        assert_eq!(epoch_clamped(bar_aligned(-1, 4)), 3);
        assert_eq!(epoch_clamped(-1), 3);
        assert_eq!(epoch_clamped(0), 0);
        assert_eq!(epoch_clamped(7), 7);
    }

    #[test]
    fn test_skew_threshold_is_strict() {
        assert!(!needs_realignment(0.0166, 5, 5));
        assert!(needs_realignment(0.0167, 5, 5));
        assert!(needs_realignment(-0.0167, 5, 5));
        // A bar rotation forces realignment even on a clean grid
        assert!(needs_realignment(0.0, 5, 6));
    }

    #[test]
    fn test_lag_compensation_only_pads_forward_shifts() {
        assert!((lag_compensated(0.05, false) - 0.15).abs() < 1e-12);
        assert_eq!(lag_compensated(-0.05, false), -0.05);
        // Bar-aligned deltas are denominated in bars; scale up first
        assert!((lag_compensated(0.05, true) - 0.3).abs() < 1e-12);
        assert_eq!(lag_compensated(-0.05, true), -0.2);
    }

    #[test]
    fn test_shift_safety_gate() {
        // Stays inside the current beat: safe
        assert!(shift_is_safe(0.10, 0.15));
        // Crosses into the next beat and is small: defer
        assert!(!shift_is_safe(0.95, 0.15));
        // Crosses backwards and is small: defer
        assert!(!shift_is_safe(0.10, -0.15));
        // Large shifts are applied regardless
        assert!(shift_is_safe(0.95, 0.25));
        assert!(shift_is_safe(0.10, -0.25));
    }
}
