//! Layer Director
//!
//! Maps the latest snapshot to a desired activation per layer and drives the
//! five [`LayerTrack`]s toward it. Desire is re-evaluated whenever signals
//! arrive. Starts and fade-outs wait for a cycle boundary; only a reversal
//! of a fade-out takes effect at once.

use crate::LAYER_COUNT;
use crate::engine::TelemetryEvent;
use crate::layers::{BoundaryAction, LayerId, LayerState, LayerTrack, SourceSlot};
use crate::loader::{Delivery, SlotKey, SourceBroker};
use crate::rules::{LayerMask, PolicyTable};
use crate::signals::GameSnapshot;

/// Policy engine over the layer tracks
#[derive(Debug)]
pub struct LayerDirector {
    policy: PolicyTable,
    tracks: [LayerTrack; LAYER_COUNT],
    desired: LayerMask,
}

impl LayerDirector {
    /// All tracks start stopped with nothing desired
    pub fn new(policy: PolicyTable, tracks: [LayerTrack; LAYER_COUNT]) -> Self {
        Self {
            policy,
            tracks,
            desired: LayerMask::default(),
        }
    }

    /// Re-evaluate the policy table. Returns whether the desired mask changed.
    ///
    /// Layers that just became desired get their sources requested here so
    /// they are ready by the next boundary. A layer still fading out is
    /// reversed at `position` right away.
    pub fn evaluate(
        &mut self,
        snapshot: &GameSnapshot,
        position: f64,
        broker: &mut dyn SourceBroker,
        emit: &mut dyn FnMut(TelemetryEvent),
    ) -> bool {
        let mut mask = self.policy.evaluate(snapshot);

        // Menu wins over combat-context layers
        if mask.get(LayerId::Menu) && mask.any_combat() {
            log::warn!("Policy activates menu together with combat layers; muting combat layers");
            for layer in LayerId::ALL {
                if layer.is_combat_context() {
                    mask.set(layer, false);
                }
            }
        }

        let changed = mask != self.desired;
        if changed {
            log::debug!("Desired layers changed: {:?}", mask);
        }
        self.desired = mask;

        for layer in LayerId::ALL {
            if !mask.get(layer) || self.blocked_by_exclusion(layer) {
                continue;
            }
            if let Some(transition) = self.tracks[layer.index()].reverse(position) {
                emit(TelemetryEvent::LayerTransition(transition));
            }
        }

        self.request_missing(broker, false);

        changed
    }

    /// Menu and combat-context layers never rise together between
    /// boundaries; the other side has to start fading first.
    fn blocked_by_exclusion(&self, layer: LayerId) -> bool {
        let rising = |track: &LayerTrack| {
            matches!(track.state(), LayerState::FadingIn | LayerState::Sustaining)
        };

        if layer == LayerId::Menu {
            self.tracks
                .iter()
                .any(|track| track.id().is_combat_context() && rising(track))
        } else if layer.is_combat_context() {
            rising(&self.tracks[LayerId::Menu.index()])
        } else {
            false
        }
    }

    /// Apply desired activation at a boundary
    pub fn on_boundary(
        &mut self,
        position: f64,
        broker: &mut dyn SourceBroker,
        emit: &mut dyn FnMut(TelemetryEvent),
    ) {
        for track in self.tracks.iter_mut() {
            let id = track.id();
            let desired = self.desired.get(id);

            match track.on_boundary(desired, position) {
                BoundaryAction::Transition(transition) => {
                    emit(TelemetryEvent::LayerTransition(transition));
                }
                BoundaryAction::SourceNotReady => {
                    log::warn!(
                        "Layer {} not ready at {:.3}, holding at stopped",
                        id,
                        position
                    );
                    emit(TelemetryEvent::AssetNotReady {
                        key: SlotKey::Layer(id),
                        position,
                    });
                }
                BoundaryAction::None => {
                    // A stopped, undesired track frees its source
                    if !desired && track.state() == LayerState::Stopped {
                        if let Some(source) = track.take_source() {
                            broker.release(source);
                        }
                    }
                }
            }
        }

        self.request_missing(broker, true);
    }

    /// Advance every track's gain to `position`
    pub fn advance(
        &mut self,
        position: f64,
        broker: &mut dyn SourceBroker,
        emit: &mut dyn FnMut(TelemetryEvent),
    ) {
        for track in self.tracks.iter_mut() {
            if let Some(transition) = track.advance(position) {
                emit(TelemetryEvent::LayerTransition(transition));

                if transition.to == LayerState::Stopped && !self.desired.get(track.id()) {
                    if let Some(source) = track.take_source() {
                        broker.release(source);
                    }
                }
            }
        }
    }

    /// Install a broker delivery for a layer slot
    pub fn deliver(
        &mut self,
        delivery: Delivery,
        broker: &mut dyn SourceBroker,
        emit: &mut dyn FnMut(TelemetryEvent),
    ) {
        match delivery {
            Delivery::Ready(SlotKey::Layer(id), source) => {
                let track = &mut self.tracks[id.index()];
                if let Some(old) = track.install_source(source) {
                    broker.release(old);
                }
            }
            Delivery::Failed(SlotKey::Layer(id)) => {
                self.tracks[id.index()].mark_failed();
                emit(TelemetryEvent::AssetFailed {
                    key: SlotKey::Layer(id),
                });
            }
            other => {
                log::warn!("Director got a delivery for {:?}", other.key());
                if let Delivery::Ready(_, source) = other {
                    broker.release(source);
                }
            }
        }
    }

    fn request_missing(&mut self, broker: &mut dyn SourceBroker, retry_failed: bool) {
        for track in self.tracks.iter_mut() {
            let id = track.id();
            if !self.desired.get(id) || !track.source_slot().needs_request() {
                continue;
            }
            if !retry_failed && !matches!(track.source_slot(), SourceSlot::Empty) {
                continue;
            }
            if broker.request(SlotKey::Layer(id), track.asset(), true) {
                track.mark_requested();
            }
        }
    }

    /// Stop everything immediately, releasing sources
    pub fn reset(&mut self, broker: &mut dyn SourceBroker) {
        self.desired = LayerMask::default();
        for track in self.tracks.iter_mut() {
            if let Some(source) = track.stop_now() {
                broker.release(source);
            }
        }
    }

    // Getters

    /// Current gain per layer
    pub fn gains(&self) -> [f32; LAYER_COUNT] {
        LayerId::ALL.map(|layer| self.tracks[layer.index()].current_gain())
    }

    pub fn desired(&self) -> LayerMask {
        self.desired
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    pub fn track(&self, layer: LayerId) -> &LayerTrack {
        &self.tracks[layer.index()]
    }

    pub fn track_mut(&mut self, layer: LayerId) -> &mut LayerTrack {
        &mut self.tracks[layer.index()]
    }
}
