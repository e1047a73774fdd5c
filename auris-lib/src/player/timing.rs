//! Playback position and track-change timing.
//!
//! The reported position is derived from samples consumed by the decoder,
//! corrected by the sink's buffered latency, and advanced by a wall-clock
//! timer between recomputations. A finished track keeps a countdown of the
//! milliseconds still buffered inside the sink; when it reaches zero the
//! track has audibly ended and the pipeline head moves on.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::event_loop::TimerSpec;

use super::state::PlayerCore;

/// Monotonic milliseconds since the first call in this process.
pub(super) fn mono_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

impl PlayerCore {
    /// Recompute the audible position and re-arm the position timer.
    ///
    /// `seeked` permits a backwards jump in the emitted second; otherwise
    /// the reported value only moves forward within a track.
    pub(super) fn timing_update(&mut self, seeked: bool) {
        let head_active = self
            .inputs
            .front()
            .is_some_and(|input| input.stream.is_some());

        if !head_active {
            self.pos_msec = 0;
            self.pos_sec = Some(0);
        }

        if self.paused || !head_active || self.sink.is_none() {
            self.pos_timer.disable();
            self.events.position_changed(self.pos_sec.unwrap_or(0));
            return;
        }

        self.pos_update_time = mono_ms();
        let (pos_samples, sample_rate, eof, remaining_ms) = {
            let input = self.inputs.front().unwrap();
            let stream = input.stream.as_ref().unwrap();
            (
                input.pos_samples,
                stream.format().sample_rate,
                input.eof,
                input.remaining_ms,
            )
        };
        self.pos_msec = (1000 * pos_samples / u64::from(sample_rate)) as u32;

        // While the head drains out of the sink, its countdown is the
        // remaining latency; otherwise ask the sink directly.
        let latency = if eof {
            let elapsed = self.pos_update_time - self.track_change_update_time;
            let remaining = remaining_ms.max(0) as u64;
            remaining.saturating_sub(elapsed) as u32
        } else {
            self.sink.as_ref().unwrap().latency_ms()
        };
        self.pos_msec = self.pos_msec.saturating_sub(latency);

        let new_sec = self.pos_msec / 1000;
        let emit = match self.pos_sec {
            None => seeked,
            Some(current) => new_sec != current && (new_sec > current || seeked),
        };
        if emit {
            self.pos_sec = Some(new_sec);
            self.events.position_changed(new_sec);
        }

        // Arm the timer for the next whole-second boundary of the reported
        // position, then every second. When the reported second is ahead of
        // the raw one, the first tick waits until the clock catches up.
        let mut rem_msec = 1000 - self.pos_msec % 1000;
        if rem_msec == 1000 {
            rem_msec = 0;
        }
        let ahead = self.pos_sec.unwrap_or(new_sec).saturating_sub(new_sec);
        let rem_sec = ahead + u32::from(rem_msec == 0);
        self.pos_timer.set(
            TimerSpec::repeating(
                Duration::from_secs(u64::from(rem_sec)) + Duration::from_millis(u64::from(rem_msec)),
                Duration::from_secs(1),
            ),
            false,
        );
    }

    /// Position timer tick: advance by wall-clock time and emit when the
    /// whole-second part moved.
    pub(super) fn pos_tick(&mut self) {
        if self.paused {
            return;
        }
        let now = mono_ms();
        let delta = now - self.pos_update_time;
        self.pos_update_time = now;
        self.pos_msec = self.pos_msec.wrapping_add(delta as u32);
        let new_sec = self.pos_msec / 1000;
        if Some(new_sec) != self.pos_sec {
            self.pos_sec = Some(new_sec);
            self.events.position_changed(new_sec);
        }
    }

    /// Drop the drained head and announce whatever is audible now.
    fn finish_head_track(&mut self) {
        self.inputs.pop_front();
        let cookie = self.inputs.front().and_then(|input| input.cookie);
        self.events.track_changed(cookie);
        self.timing_update(true);
    }

    fn continue_track_change_timer(&mut self) {
        if self.paused {
            return;
        }
        loop {
            let (eof, remaining) = match self.inputs.front() {
                Some(input) => (input.eof, input.remaining_ms),
                None => return,
            };
            if !eof {
                return;
            }
            if remaining <= 0 {
                self.finish_head_track();
            } else {
                break;
            }
        }
        let remaining = self.inputs.front().unwrap().remaining_ms as u64;
        self.track_change_timer
            .set(TimerSpec::one_shot(Duration::from_millis(remaining)), false);
    }

    /// Track-change timer tick: charge the elapsed wall clock against every
    /// input's countdown, pop the heads that finished draining, re-arm.
    pub(super) fn track_change_tick(&mut self) {
        let now = mono_ms();
        let elapsed = (now - self.track_change_update_time) as i64;
        self.track_change_update_time = now;

        for input in &mut self.inputs {
            input.remaining_ms -= elapsed;
        }

        while let Some(first) = self.inputs.front() {
            if first.remaining_ms > 0 || !first.eof {
                break;
            }
            self.finish_head_track();
        }

        self.continue_track_change_timer();
    }

    /// Freeze the countdown: disarm the timer after charging the time that
    /// already passed.
    pub(super) fn pause_track_change_timer(&mut self) {
        self.track_change_timer.disable();
        self.track_change_tick();
    }

    pub(super) fn start_track_change_timer(&mut self) {
        self.track_change_update_time = mono_ms();
        self.continue_track_change_timer();
    }
}
