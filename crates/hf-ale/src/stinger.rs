//! Stingers
//!
//! One-shot cues. A [`StingerBank`] owns one configured stinger: its queue
//! flag, its prefetched source and at most one playing [`StingerTrack`].
//! A track is single use and is destroyed when its source runs out.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::layers::SourceSlot;
use crate::source::AudioSource;

/// Result of a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// Will start at the next boundary
    Queued,
    /// Already waiting for a boundary
    AlreadyQueued,
    /// An instance is playing; the trigger is discarded
    Dropped,
}

/// What a boundary did to a bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StingerBoundary {
    None,
    Started,
    /// Queued but the source is not ready; stays queued
    SourceNotReady,
}

/// A playing one-shot instance
pub struct StingerTrack {
    source: Box<dyn AudioSource>,
    /// Clock position it started at
    started_at: f64,
}

impl StingerTrack {
    pub fn started_at(&self) -> f64 {
        self.started_at
    }

    pub fn source_mut(&mut self) -> &mut (dyn AudioSource + 'static) {
        self.source.as_mut()
    }

    pub fn is_finished(&self) -> bool {
        self.source.is_finished()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STINGER BANK
// ═══════════════════════════════════════════════════════════════════════════════

/// One configured stinger
pub struct StingerBank {
    id: String,
    asset: Arc<str>,
    gain: f32,
    queued: bool,
    source: SourceSlot,
    instance: Option<StingerTrack>,
    fired: u32,
}

impl StingerBank {
    pub fn new(id: impl Into<String>, asset: impl Into<Arc<str>>, gain: f32) -> Self {
        Self {
            id: id.into(),
            asset: asset.into(),
            gain: gain.clamp(0.0, 1.0),
            queued: false,
            source: SourceSlot::Empty,
            instance: None,
            fired: 0,
        }
    }

    /// Request playback at the next boundary
    pub fn trigger(&mut self) -> TriggerOutcome {
        if self.instance.is_some() {
            log::debug!("Stinger '{}' still playing, trigger dropped", self.id);
            return TriggerOutcome::Dropped;
        }
        if self.queued {
            return TriggerOutcome::AlreadyQueued;
        }
        self.queued = true;
        TriggerOutcome::Queued
    }

    /// Start a queued stinger if its source is ready
    pub fn on_boundary(&mut self, position: f64) -> StingerBoundary {
        if !self.queued || self.instance.is_some() {
            return StingerBoundary::None;
        }

        match std::mem::take(&mut self.source) {
            SourceSlot::Ready(mut source) => {
                source.rewind();
                self.instance = Some(StingerTrack {
                    source,
                    started_at: position,
                });
                self.queued = false;
                self.fired += 1;
                log::debug!("Stinger '{}' started at {:.3}", self.id, position);
                StingerBoundary::Started
            }
            other => {
                self.source = other;
                StingerBoundary::SourceNotReady
            }
        }
    }

    /// Destroy a finished instance, handing back its source
    pub fn reap(&mut self) -> Option<Box<dyn AudioSource>> {
        if self.instance.as_ref().is_some_and(StingerTrack::is_finished) {
            self.instance.take().map(|track| track.source)
        } else {
            None
        }
    }

    /// Drop queue and instance, handing back any held sources
    pub fn clear(&mut self) -> (Option<Box<dyn AudioSource>>, Option<Box<dyn AudioSource>>) {
        self.queued = false;
        let playing = self.instance.take().map(|track| track.source);
        let spare = match std::mem::take(&mut self.source) {
            SourceSlot::Ready(source) => Some(source),
            _ => None,
        };
        (playing, spare)
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

    // Getters

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn asset(&self) -> &Arc<str> {
        &self.asset
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub fn is_playing(&self) -> bool {
        self.instance.is_some()
    }

    pub fn instance_mut(&mut self) -> Option<&mut StingerTrack> {
        self.instance.as_mut()
    }

    /// Instances started so far
    pub fn fired(&self) -> u32 {
        self.fired
    }
}

impl std::fmt::Debug for StingerBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StingerBank")
            .field("id", &self.id)
            .field("queued", &self.queued)
            .field("playing", &self.is_playing())
            .field("source", &self.source)
            .finish()
    }
}
