//! Fade curves and gain ramps
//!
//! Ramps are measured on the clock's position axis (cycles), so a fade
//! always lasts the same musical length regardless of block size.

use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_PI_2;

/// Fade curve type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeCurve {
    /// Linear fade
    Linear,
    /// Constant-power (sine/cosine quarter wave)
    EqualPower,
    /// S-curve (cosine half wave)
    #[default]
    SCurve,
    /// Quadratic ease-in (slow start)
    EaseInQuad,
    /// Quadratic ease-out (slow end)
    EaseOutQuad,
}

impl FadeCurve {
    /// Apply the curve to a linear progress value (0.0-1.0)
    #[inline]
    pub fn apply(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);

        match self {
            FadeCurve::Linear => t,
            FadeCurve::EqualPower => (t * FRAC_PI_2).sin(),
            FadeCurve::SCurve => 0.5 - 0.5 * (t * std::f32::consts::PI).cos(),
            FadeCurve::EaseInQuad => t * t,
            FadeCurve::EaseOutQuad => 1.0 - (1.0 - t) * (1.0 - t),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FadeCurve::Linear => "linear",
            FadeCurve::EqualPower => "equal_power",
            FadeCurve::SCurve => "s_curve",
            FadeCurve::EaseInQuad => "ease_in_quad",
            FadeCurve::EaseOutQuad => "ease_out_quad",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FADE RAMP
// ═══════════════════════════════════════════════════════════════════════════════

/// A gain ramp in progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadeRamp {
    pub from: f32,
    pub to: f32,
    /// Clock position (cycles) where the ramp starts
    pub start_position: f64,
    /// Ramp length in cycles
    pub duration_cycles: f64,
    pub curve: FadeCurve,
}

impl FadeRamp {
    pub fn new(
        from: f32,
        to: f32,
        start_position: f64,
        duration_cycles: f64,
        curve: FadeCurve,
    ) -> Self {
        Self {
            from,
            to,
            start_position,
            duration_cycles: duration_cycles.max(0.0),
            curve,
        }
    }

    /// Ramp whose length is proportional to the distance it has to cover.
    ///
    /// `full_span` is the gain distance that takes `full_duration` cycles;
    /// a fade reversed halfway therefore takes half as long.
    pub fn proportional(
        from: f32,
        to: f32,
        full_span: f32,
        start_position: f64,
        full_duration: f64,
        curve: FadeCurve,
    ) -> Self {
        let fraction = if full_span > f32::EPSILON {
            ((to - from).abs() / full_span).clamp(0.0, 1.0)
        } else {
            1.0
        };
        Self::new(from, to, start_position, full_duration * fraction as f64, curve)
    }

    /// Linear progress at a position (0.0-1.0)
    #[inline]
    pub fn progress(&self, position: f64) -> f32 {
        if self.duration_cycles <= 0.0 {
            return 1.0;
        }
        ((position - self.start_position) / self.duration_cycles).clamp(0.0, 1.0) as f32
    }

    /// Gain at a clock position
    #[inline]
    pub fn gain_at(&self, position: f64) -> f32 {
        let t = self.progress(position);
        if self.to >= self.from {
            self.from + (self.to - self.from) * self.curve.apply(t)
        } else {
            // Mirrored so fade-outs keep the curve's shape (cosine for equal power)
            self.to + (self.from - self.to) * self.curve.apply(1.0 - t)
        }
    }

    #[inline]
    pub fn is_complete(&self, position: f64) -> bool {
        self.progress(position) >= 1.0
    }

    /// Position where the ramp reaches its target
    #[inline]
    pub fn end_position(&self) -> f64 {
        self.start_position + self.duration_cycles
    }

    #[inline]
    pub fn is_fade_in(&self) -> bool {
        self.to > self.from
    }
}
