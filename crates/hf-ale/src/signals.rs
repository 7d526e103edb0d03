//! Signal System
//!
//! Discrete game-state signals and the snapshot they fold into.
//! Signals are transient: each one is consumed once by the reducer.
//! The snapshot is the only state the activation predicates ever see.

use serde::{Deserialize, Serialize};

/// Signal from the game state machine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StateSignal {
    /// A fight started
    CombatEntered,
    /// The fight ended (the arena is still running)
    CombatExited,
    /// Health fraction reported below the game's threshold
    HealthBelowThreshold(f32),
    /// Health reported back above the game's threshold
    HealthAboveThreshold,
    /// Raw health fraction sample (0.0 - 1.0)
    HealthChanged(f32),
    /// Players still alive in the match
    PlayersRemaining(u32),
    /// A round finished
    RoundEnded,
    /// Main menu or lobby opened
    MenuEntered,
    /// Main menu or lobby closed
    MenuExited,
}

/// Fieldless mirror of [`StateSignal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SignalKind {
    CombatEntered = 0,
    CombatExited = 1,
    HealthBelowThreshold = 2,
    HealthAboveThreshold = 3,
    HealthChanged = 4,
    PlayersRemaining = 5,
    RoundEnded = 6,
    MenuEntered = 7,
    MenuExited = 8,
}

impl SignalKind {
    /// Number of signal kinds
    pub const COUNT: usize = 9;

    /// All kinds in index order
    pub const ALL: [SignalKind; Self::COUNT] = [
        SignalKind::CombatEntered,
        SignalKind::CombatExited,
        SignalKind::HealthBelowThreshold,
        SignalKind::HealthAboveThreshold,
        SignalKind::HealthChanged,
        SignalKind::PlayersRemaining,
        SignalKind::RoundEnded,
        SignalKind::MenuEntered,
        SignalKind::MenuExited,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            SignalKind::CombatEntered => "combat_entered",
            SignalKind::CombatExited => "combat_exited",
            SignalKind::HealthBelowThreshold => "health_below_threshold",
            SignalKind::HealthAboveThreshold => "health_above_threshold",
            SignalKind::HealthChanged => "health_changed",
            SignalKind::PlayersRemaining => "players_remaining",
            SignalKind::RoundEnded => "round_ended",
            SignalKind::MenuEntered => "menu_entered",
            SignalKind::MenuExited => "menu_exited",
        }
    }
}

impl StateSignal {
    /// Kind of this signal
    #[inline]
    pub fn kind(&self) -> SignalKind {
        match self {
            StateSignal::CombatEntered => SignalKind::CombatEntered,
            StateSignal::CombatExited => SignalKind::CombatExited,
            StateSignal::HealthBelowThreshold(_) => SignalKind::HealthBelowThreshold,
            StateSignal::HealthAboveThreshold => SignalKind::HealthAboveThreshold,
            StateSignal::HealthChanged(_) => SignalKind::HealthChanged,
            StateSignal::PlayersRemaining(_) => SignalKind::PlayersRemaining,
            StateSignal::RoundEnded => SignalKind::RoundEnded,
            StateSignal::MenuEntered => SignalKind::MenuEntered,
            StateSignal::MenuExited => SignalKind::MenuExited,
        }
    }

    /// Same kind and same payload. Float payloads compare bitwise.
    #[inline]
    pub fn same_as(&self, other: &StateSignal) -> bool {
        match (self, other) {
            (StateSignal::HealthBelowThreshold(a), StateSignal::HealthBelowThreshold(b))
            | (StateSignal::HealthChanged(a), StateSignal::HealthChanged(b)) => {
                a.to_bits() == b.to_bits()
            }
            (StateSignal::PlayersRemaining(a), StateSignal::PlayersRemaining(b)) => a == b,
            _ => self.kind() == other.kind(),
        }
    }

    /// Check payload sanity
    pub fn validate(&self) -> crate::AleResult<()> {
        match self {
            StateSignal::HealthBelowThreshold(v) | StateSignal::HealthChanged(v)
                if !v.is_finite() =>
            {
                Err(crate::AleError::InvalidSignal(format!(
                    "{} carries non-finite health {}",
                    self.kind().name(),
                    v
                )))
            }
            _ => Ok(()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HEALTH HYSTERESIS
// ═══════════════════════════════════════════════════════════════════════════════

/// Schmitt trigger for the low-health latch.
///
/// Latches on below `threshold`, releases above `threshold + band`.
/// Values inside the band leave the latch unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthHysteresis {
    /// Health fraction below which the latch engages
    pub threshold: f32,
    /// Width of the dead zone above the threshold
    pub band: f32,
}

impl Default for HealthHysteresis {
    fn default() -> Self {
        Self {
            threshold: 0.30,
            band: 0.05,
        }
    }
}

impl HealthHysteresis {
    pub fn new(threshold: f32, band: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            band: band.clamp(0.0, 1.0),
        }
    }

    /// Health fraction above which the latch releases
    #[inline]
    pub fn release_level(&self) -> f32 {
        self.threshold + self.band
    }

    /// Next latch state for a reported health value
    #[inline]
    pub fn apply(&self, latched: bool, health: f32) -> bool {
        if health < self.threshold {
            true
        } else if health > self.release_level() {
            false
        } else {
            latched
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GAME SNAPSHOT
// ═══════════════════════════════════════════════════════════════════════════════

/// Latest known game state
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GameSnapshot {
    /// A match is running (set on first combat, cleared by the menu)
    pub arena_active: bool,
    /// A fight is in progress
    pub in_combat: bool,
    /// Menu or lobby is showing
    pub in_menu: bool,
    /// Last reported health fraction
    pub health: Option<f32>,
    /// Low-health latch (after hysteresis)
    pub low_health: bool,
    /// Players still alive, if reported
    pub players_remaining: Option<u32>,
}

impl GameSnapshot {
    /// Snapshot of a game sitting in its main menu
    pub fn menu() -> Self {
        Self {
            in_menu: true,
            ..Default::default()
        }
    }

    /// Fold a signal into the snapshot. Returns whether anything changed.
    pub fn apply(&mut self, signal: &StateSignal, hysteresis: &HealthHysteresis) -> bool {
        let before = *self;

        match *signal {
            StateSignal::CombatEntered => {
                self.in_combat = true;
                self.arena_active = true;
                self.in_menu = false;
            }
            StateSignal::CombatExited => {
                self.in_combat = false;
            }
            StateSignal::HealthChanged(value) => {
                let value = value.clamp(0.0, 1.0);
                self.health = Some(value);
                self.low_health = hysteresis.apply(self.low_health, value);
            }
            // Edges: the producer already applied its own threshold
            StateSignal::HealthBelowThreshold(value) => {
                self.health = Some(value.clamp(0.0, 1.0));
                self.low_health = true;
            }
            StateSignal::HealthAboveThreshold => {
                self.low_health = false;
            }
            StateSignal::PlayersRemaining(count) => {
                self.players_remaining = Some(count);
            }
            StateSignal::RoundEnded => {}
            StateSignal::MenuEntered => {
                self.in_menu = true;
                self.in_combat = false;
                self.arena_active = false;
                self.low_health = false;
                self.health = None;
                self.players_remaining = None;
            }
            StateSignal::MenuExited => {
                self.in_menu = false;
            }
        }

        *self != before
    }
}
