//! Musical Clock
//!
//! The single transport every layer and stinger is aligned to.
//!
//! ## Time Units
//! - Seconds: transport time since engine start
//! - Frames: audio frames at the render sample rate (absolute counter)
//! - Cycles: one repetition of the musical grid (`beats_per_cycle` beats)
//!
//! Phase is never accumulated. It is always derived from the distance
//! between transport time and the anchor of the current tempo segment,
//! so long sessions keep the cycle grid exact.

use serde::{Deserialize, Serialize};
use std::ops::Range;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Minimum tempo
pub const MIN_TEMPO: f64 = 20.0;

/// Maximum tempo
pub const MAX_TEMPO: f64 = 400.0;

/// Minimum beats per cycle
pub const MIN_BEATS_PER_CYCLE: u32 = 1;

/// Maximum beats per cycle
pub const MAX_BEATS_PER_CYCLE: u32 = 32;

/// Tolerance (seconds) below which a boundary counts as reached
const BOUNDARY_EPSILON: f64 = 1e-9;

// ═══════════════════════════════════════════════════════════════════════════════
// TEMPO
// ═══════════════════════════════════════════════════════════════════════════════

/// Tempo and grid size of the transport
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tempo {
    /// Tempo in BPM
    pub bpm: f64,
    /// Beats in one cycle
    pub beats_per_cycle: u32,
}

impl Default for Tempo {
    fn default() -> Self {
        Self {
            bpm: 85.0,
            beats_per_cycle: 4,
        }
    }
}

impl Tempo {
    pub fn new(bpm: f64, beats_per_cycle: u32) -> Self {
        Self {
            bpm,
            beats_per_cycle,
        }
    }

    /// Clamp to the supported range, reporting whether anything changed
    pub fn clamped(self) -> (Self, bool) {
        let bpm = if self.bpm.is_finite() {
            self.bpm.clamp(MIN_TEMPO, MAX_TEMPO)
        } else {
            Tempo::default().bpm
        };
        let beats_per_cycle = self
            .beats_per_cycle
            .clamp(MIN_BEATS_PER_CYCLE, MAX_BEATS_PER_CYCLE);
        let clamped = Self {
            bpm,
            beats_per_cycle,
        };
        (clamped, clamped != self)
    }

    /// Beat duration in seconds
    #[inline]
    pub fn beat_duration_seconds(&self) -> f64 {
        60.0 / self.bpm
    }

    /// Cycle duration in seconds
    #[inline]
    pub fn cycle_duration_seconds(&self) -> f64 {
        self.beat_duration_seconds() * self.beats_per_cycle as f64
    }

    /// Cycles per second (the unit the authoring tool calls "cps")
    #[inline]
    pub fn cycles_per_second(&self) -> f64 {
        1.0 / self.cycle_duration_seconds()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLOCK ADVANCE
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of moving the transport forward
#[derive(Debug, Clone, PartialEq)]
pub struct ClockAdvance {
    /// Cycle indices entered during this advance, each reported once
    pub crossed: Range<u64>,
    /// Tempo that took effect at one of the crossed boundaries
    pub tempo_applied: Option<Tempo>,
}

impl ClockAdvance {
    fn none(next_cycle: u64) -> Self {
        Self {
            crossed: next_cycle..next_cycle,
            tempo_applied: None,
        }
    }

    /// Whether at least one boundary was crossed
    #[inline]
    pub fn crossed_boundary(&self) -> bool {
        !self.crossed.is_empty()
    }

    /// Index of the last cycle entered
    #[inline]
    pub fn last_boundary(&self) -> Option<u64> {
        if self.crossed.is_empty() {
            None
        } else {
            Some(self.crossed.end - 1)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLOCK SOURCE
// ═══════════════════════════════════════════════════════════════════════════════

/// Authoritative musical transport
#[derive(Debug, Clone)]
pub struct ClockSource {
    tempo: Tempo,
    pending_tempo: Option<Tempo>,
    cycle_duration: f64,
    /// Transport time at which `anchor_cycle` started
    anchor_time: f64,
    anchor_cycle: u64,
    cycle_index: u64,
    /// Transport time (seconds)
    now: f64,
    /// Transport time at which the frame counter was zero
    frame_base_time: f64,
    frames: u64,
    frame_rate: u32,
}

impl Default for ClockSource {
    fn default() -> Self {
        Self::new(Tempo::default())
    }
}

impl ClockSource {
    /// Create a clock at cycle 0, phase 0
    pub fn new(tempo: Tempo) -> Self {
        let (tempo, clamped) = tempo.clamped();
        if clamped {
            log::warn!(
                "Clock tempo clamped to {:.2} BPM / {} beats per cycle",
                tempo.bpm,
                tempo.beats_per_cycle
            );
        }

        Self {
            tempo,
            pending_tempo: None,
            cycle_duration: tempo.cycle_duration_seconds(),
            anchor_time: 0.0,
            anchor_cycle: 0,
            cycle_index: 0,
            now: 0.0,
            frame_base_time: 0.0,
            frames: 0,
            frame_rate: 0,
        }
    }

    /// Advance by a wall-clock delta. Negative or non-finite deltas count as zero.
    pub fn tick(&mut self, delta_seconds: f64) -> ClockAdvance {
        let delta = if delta_seconds.is_finite() {
            delta_seconds.max(0.0)
        } else {
            0.0
        };

        let target = self.now + delta;
        let advance = self.advance_to(target);

        // The frame path continues from here
        self.frame_base_time = self.now;
        self.frames = 0;

        advance
    }

    /// Advance by a number of audio frames (audio-thread path)
    pub fn tick_frames(&mut self, frames: u64, sample_rate: u32) -> ClockAdvance {
        if sample_rate == 0 {
            return ClockAdvance::none(self.cycle_index + 1);
        }

        if sample_rate != self.frame_rate {
            self.frame_base_time = self.now;
            self.frames = 0;
            self.frame_rate = sample_rate;
        }

        self.frames += frames;
        let target = self.frame_base_time + self.frames as f64 / sample_rate as f64;
        self.advance_to(target)
    }

    /// Re-anchor transport time to an external absolute time base.
    ///
    /// Moving backwards never un-crosses a boundary: the transport is held
    /// at the start of the current cycle at the earliest.
    pub fn resync(&mut self, absolute_seconds: f64) -> ClockAdvance {
        if !absolute_seconds.is_finite() {
            return ClockAdvance::none(self.cycle_index + 1);
        }

        let advance = if absolute_seconds >= self.now {
            self.advance_to(absolute_seconds)
        } else {
            self.now = absolute_seconds.max(self.cycle_start_time());
            ClockAdvance::none(self.cycle_index + 1)
        };

        self.frame_base_time = self.now;
        self.frames = 0;

        advance
    }

    /// Request a tempo change. Takes effect at the next boundary.
    pub fn set_tempo(&mut self, bpm: f64, beats_per_cycle: u32) -> Tempo {
        let (tempo, clamped) = Tempo::new(bpm, beats_per_cycle).clamped();
        if clamped {
            log::warn!(
                "Tempo request {:.2} BPM / {} beats clamped to {:.2} / {}",
                bpm,
                beats_per_cycle,
                tempo.bpm,
                tempo.beats_per_cycle
            );
        }
        self.pending_tempo = Some(tempo);
        tempo
    }

    /// Frames until the next boundary at the given rate (at least 1)
    pub fn frames_until_boundary(&self, sample_rate: u32) -> u64 {
        let remaining = self.boundary_time(self.cycle_index + 1) - self.now;
        if remaining <= BOUNDARY_EPSILON || sample_rate == 0 {
            return 1;
        }
        let frames = (remaining * sample_rate as f64 - 1e-6).ceil();
        (frames as u64).max(1)
    }

    /// Seconds until the next boundary at the current tempo
    pub fn seconds_until_boundary(&self) -> f64 {
        (self.boundary_time(self.cycle_index + 1) - self.now).max(0.0)
    }

    /// Return to cycle 0 with the given tempo
    pub fn reset(&mut self, tempo: Tempo) {
        *self = Self::new(tempo);
    }

    fn advance_to(&mut self, target: f64) -> ClockAdvance {
        let first = self.cycle_index + 1;
        let mut tempo_applied = None;

        self.now = target;

        loop {
            let next_boundary = self.boundary_time(self.cycle_index + 1);
            if self.now + BOUNDARY_EPSILON < next_boundary {
                break;
            }

            self.cycle_index += 1;

            if let Some(tempo) = self.pending_tempo.take() {
                self.anchor_time = next_boundary;
                self.anchor_cycle = self.cycle_index;
                self.tempo = tempo;
                self.cycle_duration = tempo.cycle_duration_seconds();
                tempo_applied = Some(tempo);

                log::debug!(
                    "Tempo {:.2} BPM / {} beats applied at cycle {}",
                    tempo.bpm,
                    tempo.beats_per_cycle,
                    self.cycle_index
                );
            }
        }

        ClockAdvance {
            crossed: first..self.cycle_index + 1,
            tempo_applied,
        }
    }

    #[inline]
    fn boundary_time(&self, cycle: u64) -> f64 {
        self.anchor_time + (cycle - self.anchor_cycle) as f64 * self.cycle_duration
    }

    #[inline]
    fn cycle_start_time(&self) -> f64 {
        self.boundary_time(self.cycle_index)
    }

    // Getters

    /// Current tempo
    #[inline]
    pub fn tempo(&self) -> Tempo {
        self.tempo
    }

    /// Tempo waiting for the next boundary
    #[inline]
    pub fn pending_tempo(&self) -> Option<Tempo> {
        self.pending_tempo
    }

    /// Current cycle duration in seconds
    #[inline]
    pub fn cycle_duration_seconds(&self) -> f64 {
        self.cycle_duration
    }

    /// Index of the current cycle (monotonic)
    #[inline]
    pub fn cycle_index(&self) -> u64 {
        self.cycle_index
    }

    /// Phase within the current cycle, in [0, 1)
    #[inline]
    pub fn phase(&self) -> f64 {
        let phase = (self.now - self.cycle_start_time()) / self.cycle_duration;
        phase.clamp(0.0, 1.0 - f64::EPSILON)
    }

    /// Musical position in cycles (`cycle_index + phase`)
    #[inline]
    pub fn position(&self) -> f64 {
        self.cycle_index as f64 + self.phase()
    }

    /// Transport time in seconds
    #[inline]
    pub fn now_seconds(&self) -> f64 {
        self.now
    }
}
