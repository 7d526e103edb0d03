//! Layer tracks
//!
//! Five persistent loop slots. Each runs the state machine
//! `Stopped → FadingIn → Sustaining → FadingOut → Stopped`, with
//! `FadingOut → FadingIn` as the reversal path. Fades only ever start
//! from [`LayerTrack::on_boundary`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::source::AudioSource;
use crate::transitions::{FadeCurve, FadeRamp};

/// Layer slot identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LayerId {
    /// Drums and bass, the arena bed
    Foundation = 0,
    /// Riff layer while fighting
    Combat = 1,
    /// Lead/dissonance on low health
    Intensity = 2,
    /// Chord pad for the last players standing
    Finale = 3,
    /// Lobby theme
    Menu = 4,
}

impl LayerId {
    pub const ALL: [LayerId; crate::LAYER_COUNT] = [
        LayerId::Foundation,
        LayerId::Combat,
        LayerId::Intensity,
        LayerId::Finale,
        LayerId::Menu,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            LayerId::Foundation => "foundation",
            LayerId::Combat => "combat",
            LayerId::Intensity => "intensity",
            LayerId::Finale => "finale",
            LayerId::Menu => "menu",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.name() == name)
    }

    /// Layers that must be silent while the menu plays
    #[inline]
    pub fn is_combat_context(self) -> bool {
        matches!(self, LayerId::Combat | LayerId::Intensity | LayerId::Finale)
    }

    /// Declared mix gain of the slot
    pub fn default_gain(self) -> f32 {
        match self {
            LayerId::Foundation => 0.8,
            LayerId::Combat => 0.6,
            LayerId::Intensity => 0.5,
            LayerId::Finale => 0.45,
            LayerId::Menu => 0.4,
        }
    }
}

impl std::fmt::Display for LayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-layer playback state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerState {
    #[default]
    Stopped,
    FadingIn,
    Sustaining,
    FadingOut,
}

impl LayerState {
    pub fn name(&self) -> &'static str {
        match self {
            LayerState::Stopped => "stopped",
            LayerState::FadingIn => "fading_in",
            LayerState::Sustaining => "sustaining",
            LayerState::FadingOut => "fading_out",
        }
    }

    #[inline]
    pub fn is_fading(&self) -> bool {
        matches!(self, LayerState::FadingIn | LayerState::FadingOut)
    }
}

/// A state change, reported as telemetry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerTransition {
    pub layer: LayerId,
    pub from: LayerState,
    pub to: LayerState,
    /// Clock position where the change happened
    pub position: f64,
    /// Gain at the moment of the change
    pub gain: f32,
}

/// Source handle of a track
#[derive(Default)]
pub enum SourceSlot {
    #[default]
    Empty,
    /// Asked the broker, not delivered yet
    Requested,
    Ready(Box<dyn AudioSource>),
    /// Last load failed; retried on the next activation attempt
    Failed,
}

impl SourceSlot {
    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self, SourceSlot::Ready(_))
    }

    /// Needs a (new) request
    #[inline]
    pub fn needs_request(&self) -> bool {
        matches!(self, SourceSlot::Empty | SourceSlot::Failed)
    }
}

impl std::fmt::Debug for SourceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceSlot::Empty => f.write_str("Empty"),
            SourceSlot::Requested => f.write_str("Requested"),
            SourceSlot::Ready(_) => f.write_str("Ready"),
            SourceSlot::Failed => f.write_str("Failed"),
        }
    }
}

/// What a boundary did to a track
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundaryAction {
    None,
    Transition(LayerTransition),
    /// Wanted to start but the source is not ready; stays stopped
    SourceNotReady,
}

// ═══════════════════════════════════════════════════════════════════════════════
// LAYER TRACK
// ═══════════════════════════════════════════════════════════════════════════════

/// One persistent loop slot
#[derive(Debug)]
pub struct LayerTrack {
    id: LayerId,
    asset: Arc<str>,
    state: LayerState,
    target_gain: f32,
    current_gain: f32,
    fade_cycles: f64,
    curve: FadeCurve,
    ramp: Option<FadeRamp>,
    source: SourceSlot,
}

impl LayerTrack {
    pub fn new(
        id: LayerId,
        asset: impl Into<Arc<str>>,
        target_gain: f32,
        fade_cycles: f64,
        curve: FadeCurve,
    ) -> Self {
        Self {
            id,
            asset: asset.into(),
            state: LayerState::Stopped,
            target_gain: target_gain.clamp(0.0, 1.0),
            current_gain: 0.0,
            fade_cycles: fade_cycles.max(0.0),
            curve,
            ramp: None,
            source: SourceSlot::Empty,
        }
    }

    /// Apply the desired activation at a cycle boundary
    pub fn on_boundary(&mut self, desired: bool, position: f64) -> BoundaryAction {
        let next = match (self.state, desired) {
            (LayerState::Stopped, true) => {
                if !self.source.is_ready() {
                    return BoundaryAction::SourceNotReady;
                }
                if let SourceSlot::Ready(source) = &mut self.source {
                    // Loops start on the grid
                    source.rewind();
                }
                LayerState::FadingIn
            }
            (LayerState::FadingOut, true) => {
                return self
                    .reverse(position)
                    .map_or(BoundaryAction::None, BoundaryAction::Transition);
            }
            (LayerState::FadingIn | LayerState::Sustaining, false) => LayerState::FadingOut,
            _ => return BoundaryAction::None,
        };

        let to = if next == LayerState::FadingIn {
            self.target_gain
        } else {
            0.0
        };
        let ramp = FadeRamp::proportional(
            self.current_gain,
            to,
            self.target_gain,
            position,
            self.fade_cycles,
            self.curve,
        );
        self.ramp = Some(ramp);

        BoundaryAction::Transition(self.set_state(next, position))
    }

    /// Turn a fade-out back into a fade-in, continuing from the gain at
    /// `position`. Not boundary-gated: the source is still playing.
    pub fn reverse(&mut self, position: f64) -> Option<LayerTransition> {
        if self.state != LayerState::FadingOut {
            return None;
        }

        self.current_gain = self.gain_at(position);
        self.ramp = Some(FadeRamp::proportional(
            self.current_gain,
            self.target_gain,
            self.target_gain,
            position,
            self.fade_cycles,
            self.curve,
        ));

        Some(self.set_state(LayerState::FadingIn, position))
    }

    /// Move the current gain to `position`; completes finished fades
    pub fn advance(&mut self, position: f64) -> Option<LayerTransition> {
        let ramp = self.ramp?;
        self.current_gain = ramp.gain_at(position);

        if !ramp.is_complete(position) {
            return None;
        }

        self.current_gain = ramp.to;
        self.ramp = None;

        let next = match self.state {
            LayerState::FadingIn => LayerState::Sustaining,
            LayerState::FadingOut => LayerState::Stopped,
            _ => return None,
        };
        Some(self.set_state(next, position))
    }

    /// Gain the track will have at `position` without mutating it
    #[inline]
    pub fn gain_at(&self, position: f64) -> f32 {
        match &self.ramp {
            Some(ramp) => ramp.gain_at(position),
            None => self.current_gain,
        }
    }

    fn set_state(&mut self, next: LayerState, position: f64) -> LayerTransition {
        let transition = LayerTransition {
            layer: self.id,
            from: self.state,
            to: next,
            position,
            gain: self.current_gain,
        };
        log::debug!(
            "Layer {} {} -> {} at {:.3} (gain {:.3})",
            self.id,
            self.state.name(),
            next.name(),
            position,
            self.current_gain
        );
        self.state = next;
        transition
    }

    /// Force the track back to stopped and hand back its source
    pub fn stop_now(&mut self) -> Option<Box<dyn AudioSource>> {
        self.state = LayerState::Stopped;
        self.current_gain = 0.0;
        self.ramp = None;
        self.take_source()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SOURCE SLOT
    // ═══════════════════════════════════════════════════════════════════════

    pub fn source_slot(&self) -> &SourceSlot {
        &self.source
    }

    pub fn mark_requested(&mut self) {
        self.source = SourceSlot::Requested;
    }

    pub fn mark_failed(&mut self) {
        self.source = SourceSlot::Failed;
    }

    /// Install a delivered source. Returns the previous one, if any.
    pub fn install_source(&mut self, source: Box<dyn AudioSource>) -> Option<Box<dyn AudioSource>> {
        match std::mem::replace(&mut self.source, SourceSlot::Ready(source)) {
            SourceSlot::Ready(old) => Some(old),
            _ => None,
        }
    }

    /// Take the source out, leaving the slot empty
    pub fn take_source(&mut self) -> Option<Box<dyn AudioSource>> {
        match std::mem::take(&mut self.source) {
            SourceSlot::Ready(source) => Some(source),
            SourceSlot::Failed => {
                self.source = SourceSlot::Failed;
                None
            }
            _ => None,
        }
    }

    /// Source to render from, when audible
    pub fn audible_source(&mut self) -> Option<&mut (dyn AudioSource + 'static)> {
        if self.state == LayerState::Stopped {
            return None;
        }
        match &mut self.source {
            SourceSlot::Ready(source) => Some(source.as_mut()),
            _ => None,
        }
    }

    // Getters

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn asset(&self) -> &Arc<str> {
        &self.asset
    }

    pub fn state(&self) -> LayerState {
        self.state
    }

    /// Playing or fading
    pub fn is_active(&self) -> bool {
        self.state != LayerState::Stopped
    }

    pub fn target_gain(&self) -> f32 {
        self.target_gain
    }

    pub fn current_gain(&self) -> f32 {
        self.current_gain
    }

    pub fn fade_cycles(&self) -> f64 {
        self.fade_cycles
    }

    pub fn ramp(&self) -> Option<&FadeRamp> {
        self.ramp.as_ref()
    }
}
