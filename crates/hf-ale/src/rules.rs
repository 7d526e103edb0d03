//! Activation Predicates
//!
//! Each layer is bound to a [`Condition`] over the latest [`GameSnapshot`].
//! Conditions are plain data so profiles can describe them in JSON.
//! Evaluation is pure and total: every condition yields a boolean for
//! every snapshot.

use serde::{Deserialize, Serialize};

use crate::LAYER_COUNT;
use crate::layers::LayerId;
use crate::signals::GameSnapshot;

/// Activation condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Never,
    /// A match is running
    ArenaActive,
    /// A fight is in progress
    InCombat,
    /// Menu or lobby is showing
    InMenu,
    /// Low-health latch is set
    LowHealth,
    /// Players remaining is known and at most `count`
    PlayersAtMost { count: u32 },
    /// All sub-conditions hold (true when empty)
    All { conditions: Vec<Condition> },
    /// Any sub-condition holds (false when empty)
    Any { conditions: Vec<Condition> },
    /// Negation
    Not { condition: Box<Condition> },
}

impl Condition {
    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::All { conditions }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Any { conditions }
    }

    pub fn negate(condition: Condition) -> Self {
        Condition::Not {
            condition: Box::new(condition),
        }
    }

    /// Evaluate against a snapshot
    pub fn evaluate(&self, snapshot: &GameSnapshot) -> bool {
        match self {
            Condition::Always => true,
            Condition::Never => false,
            Condition::ArenaActive => snapshot.arena_active,
            Condition::InCombat => snapshot.in_combat,
            Condition::InMenu => snapshot.in_menu,
            Condition::LowHealth => snapshot.low_health,
            Condition::PlayersAtMost { count } => {
                snapshot.players_remaining.is_some_and(|n| n <= *count)
            }
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(snapshot)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(snapshot)),
            Condition::Not { condition } => !condition.evaluate(snapshot),
        }
    }

    /// Largest `players_at_most` count used anywhere in this condition
    fn max_player_count(&self) -> Option<u32> {
        match self {
            Condition::PlayersAtMost { count } => Some(*count),
            Condition::All { conditions } | Condition::Any { conditions } => {
                conditions.iter().filter_map(Condition::max_player_count).max()
            }
            Condition::Not { condition } => condition.max_player_count(),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LAYER MASK
// ═══════════════════════════════════════════════════════════════════════════════

/// Desired activation per layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LayerMask([bool; LAYER_COUNT]);

impl LayerMask {
    #[inline]
    pub fn get(&self, layer: LayerId) -> bool {
        self.0[layer.index()]
    }

    #[inline]
    pub fn set(&mut self, layer: LayerId, active: bool) {
        self.0[layer.index()] = active;
    }

    /// Any combat-context layer requested
    pub fn any_combat(&self) -> bool {
        LayerId::ALL
            .iter()
            .any(|l| l.is_combat_context() && self.get(*l))
    }

    /// Number of requested layers
    pub fn count(&self) -> usize {
        self.0.iter().filter(|a| **a).count()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// POLICY TABLE
// ═══════════════════════════════════════════════════════════════════════════════

/// One activation condition per layer
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyTable {
    conditions: [Condition; LAYER_COUNT],
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::with_finale_players(2)
    }
}

impl PolicyTable {
    /// Default layer bindings with the given finale threshold
    pub fn with_finale_players(finale_players: u32) -> Self {
        Self {
            conditions: LayerId::ALL.map(|layer| default_condition(layer, finale_players)),
        }
    }

    pub fn condition(&self, layer: LayerId) -> &Condition {
        &self.conditions[layer.index()]
    }

    pub fn set_condition(&mut self, layer: LayerId, condition: Condition) {
        self.conditions[layer.index()] = condition;
    }

    /// Evaluate every layer's condition
    pub fn evaluate(&self, snapshot: &GameSnapshot) -> LayerMask {
        let mut mask = LayerMask::default();
        for layer in LayerId::ALL {
            mask.set(layer, self.conditions[layer.index()].evaluate(snapshot));
        }
        mask
    }

    /// Check that no reachable snapshot activates the menu layer together
    /// with a combat-context layer. Returns a counterexample on failure.
    pub fn check_exclusive(&self) -> Result<(), GameSnapshot> {
        let max_count = self
            .conditions
            .iter()
            .filter_map(Condition::max_player_count)
            .max()
            .unwrap_or(0);

        for snapshot in reachable_snapshots(max_count) {
            let mask = self.evaluate(&snapshot);
            if mask.get(LayerId::Menu) && mask.any_combat() {
                return Err(snapshot);
            }
        }
        Ok(())
    }
}

/// Default activation condition of a layer
pub fn default_condition(layer: LayerId, finale_players: u32) -> Condition {
    match layer {
        LayerId::Foundation => Condition::ArenaActive,
        LayerId::Combat => Condition::InCombat,
        LayerId::Intensity => Condition::all(vec![Condition::InCombat, Condition::LowHealth]),
        LayerId::Finale => Condition::all(vec![
            Condition::ArenaActive,
            Condition::PlayersAtMost {
                count: finale_players,
            },
        ]),
        LayerId::Menu => Condition::all(vec![
            Condition::InMenu,
            Condition::negate(Condition::ArenaActive),
        ]),
    }
}

/// Every snapshot the signal reducer can produce, with player counts
/// sampled up to one past the largest threshold in use.
///
/// Combat implies an active arena, and the menu never coexists with one.
fn reachable_snapshots(max_count: u32) -> Vec<GameSnapshot> {
    let mut players: Vec<Option<u32>> = vec![None];
    players.extend((0..=max_count.saturating_add(1)).map(Some));

    let mut out = Vec::new();
    for (arena_active, in_combat, in_menu) in [
        (false, false, false),
        (false, false, true),
        (true, false, false),
        (true, true, false),
    ] {
        for low_health in [false, true] {
            for players_remaining in &players {
                out.push(GameSnapshot {
                    arena_active,
                    in_combat,
                    in_menu,
                    health: None,
                    low_health,
                    players_remaining: *players_remaining,
                });
            }
        }
    }
    out
}
