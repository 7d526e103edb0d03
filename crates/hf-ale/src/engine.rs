//! Music Engine
//!
//! Ties the clock, the state bus, the layer director, the stinger banks and
//! the mixer together. The engine itself lives on the audio thread; the
//! game talks to it through a cloneable [`EngineHandle`] and observes it
//! through a [`TelemetryReceiver`].
//!
//! Per callback the engine drains commands and signals exactly once, then
//! renders the block in segments split at every cycle boundary so that
//! fades and stingers start on the exact boundary frame.

use std::sync::Arc;

use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::bus::{StateBusHandle, StateBusReceiver, state_bus};
use crate::clock::{ClockAdvance, ClockSource, Tempo};
use crate::director::LayerDirector;
use crate::layers::{LayerId, LayerState, LayerTrack, LayerTransition, SourceSlot};
use crate::loader::{Delivery, SlotKey, SourceBroker};
use crate::mixer::Mixer;
use crate::profile::MusicProfile;
use crate::signals::{GameSnapshot, StateSignal};
use crate::stinger::{StingerBank, StingerBoundary, TriggerOutcome};
use crate::{AleError, AleResult, COMMAND_QUEUE_CAPACITY, LAYER_COUNT};

/// Commands from the game thread to the engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineCommand {
    /// Change tempo at the next boundary
    SetTempo { bpm: f64, beats_per_cycle: u32 },
    /// Queue a stinger by bank index
    TriggerStinger(u8),
    /// Stop everything and return to cycle 0
    Reset,
}

/// Observability events from the engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryEvent {
    LayerTransition(LayerTransition),
    StingerFired { stinger: u8, position: f64 },
    StingerDropped { stinger: u8, position: f64 },
    StingerFinished { stinger: u8, position: f64 },
    /// Source missing at a boundary where it was needed
    AssetNotReady { key: SlotKey, position: f64 },
    AssetFailed { key: SlotKey },
    TempoChanged { bpm: f64, beats_per_cycle: u32, cycle: u64 },
    SignalsCoalesced { count: u32 },
}

/// Gain and state of every layer (for hosts that mix themselves)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LayerGains {
    pub gains: [f32; LAYER_COUNT],
    pub states: [LayerState; LAYER_COUNT],
    /// Stingers currently playing
    pub stingers_playing: u8,
    /// Clock position (cycles)
    pub position: f64,
}

impl LayerGains {
    #[inline]
    pub fn gain(&self, layer: LayerId) -> f32 {
        self.gains[layer.index()]
    }

    #[inline]
    pub fn state(&self, layer: LayerId) -> LayerState {
        self.states[layer.index()]
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLE (game thread)
// ═══════════════════════════════════════════════════════════════════════════════

struct HandleShared {
    /// Command producer (protected by Mutex for thread-safe access)
    command_tx: Mutex<Producer<EngineCommand>>,
    stinger_ids: Arc<[String]>,
}

/// Thread-safe control handle
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<HandleShared>,
    bus: StateBusHandle,
}

impl EngineHandle {
    /// Deliver a game-state signal
    pub fn send_signal(&self, signal: StateSignal) -> AleResult<()> {
        signal.validate()?;
        self.bus.send(signal);
        Ok(())
    }

    /// Request a tempo change (applied at the next boundary)
    pub fn set_tempo(&self, bpm: f64, beats_per_cycle: u32) -> AleResult<()> {
        self.push(EngineCommand::SetTempo {
            bpm,
            beats_per_cycle,
        })
    }

    /// Queue a stinger by id
    pub fn trigger_stinger(&self, id: &str) -> AleResult<()> {
        let index = self
            .shared
            .stinger_ids
            .iter()
            .position(|s| s == id)
            .ok_or_else(|| AleError::UnknownStinger(id.to_string()))?;
        self.push(EngineCommand::TriggerStinger(index as u8))
    }

    /// Stop everything and return to cycle 0. Signals sent before the reset
    /// are discarded with the snapshot.
    pub fn reset(&self) -> AleResult<()> {
        self.push(EngineCommand::Reset)
    }

    /// Configured stinger ids, in bank order
    pub fn stinger_ids(&self) -> &[String] {
        &self.shared.stinger_ids
    }

    fn push(&self, command: EngineCommand) -> AleResult<()> {
        self.shared
            .command_tx
            .lock()
            .push(command)
            .map_err(|_| AleError::QueueFull("engine commands"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TELEMETRY
// ═══════════════════════════════════════════════════════════════════════════════

/// Observer side of the telemetry ring
pub struct TelemetryReceiver {
    rx: Consumer<TelemetryEvent>,
    stinger_ids: Arc<[String]>,
}

impl TelemetryReceiver {
    pub fn pop(&mut self) -> Option<TelemetryEvent> {
        self.rx.pop().ok()
    }

    /// Everything pending
    pub fn drain(&mut self) -> Vec<TelemetryEvent> {
        let mut events = Vec::with_capacity(self.rx.slots());
        while let Ok(event) = self.rx.pop() {
            events.push(event);
        }
        events
    }

    /// Id of a stinger bank index
    pub fn stinger_name(&self, index: u8) -> &str {
        self.stinger_ids
            .get(index as usize)
            .map(String::as_str)
            .unwrap_or("?")
    }
}

/// Engine side of the telemetry ring
struct Telemetry {
    tx: Producer<TelemetryEvent>,
    dropped: u64,
}

impl Telemetry {
    #[inline]
    fn emit(&mut self, event: TelemetryEvent) {
        if self.tx.push(event).is_err() {
            self.dropped += 1;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE (audio thread)
// ═══════════════════════════════════════════════════════════════════════════════

/// Adaptive layered music engine
pub struct MusicEngine {
    sample_rate: u32,
    channels: usize,
    base_tempo: Tempo,
    round_end: Option<u8>,

    clock: ClockSource,
    bus: StateBusReceiver,
    director: LayerDirector,
    stingers: Vec<StingerBank>,
    mixer: Mixer,
    broker: Box<dyn SourceBroker>,

    command_rx: Consumer<EngineCommand>,
    telemetry: Telemetry,
}

impl MusicEngine {
    /// Build an engine from a profile.
    ///
    /// The profile is sanitized (out-of-range values clamped with a warning)
    /// and validated; structural errors are fatal.
    pub fn new(
        mut profile: MusicProfile,
        broker: Box<dyn SourceBroker>,
    ) -> AleResult<(MusicEngine, EngineHandle, TelemetryReceiver)> {
        profile.sanitize();
        profile.validate().map_err(|errors| AleError::ProfileError(errors.join("; ")))?;

        let curve = profile.fade_curve;
        let tracks = LayerId::ALL.map(|layer| {
            let config = profile.layer_config(layer);
            LayerTrack::new(layer, config.asset, config.gain, config.fade_cycles, curve)
        });
        let director = LayerDirector::new(profile.policy_table(), tracks);

        let stingers: Vec<StingerBank> = profile
            .stingers
            .iter()
            .map(|s| StingerBank::new(s.id.clone(), s.asset.as_str(), s.gain))
            .collect();
        let stinger_ids: Arc<[String]> = profile.stingers.iter().map(|s| s.id.clone()).collect();

        let (bus_handle, bus) = state_bus(profile.signal_queue_capacity, profile.hysteresis());
        let (command_tx, command_rx) = RingBuffer::new(COMMAND_QUEUE_CAPACITY);
        let (telemetry_tx, telemetry_rx) = RingBuffer::new(profile.telemetry_capacity);

        let mut engine = MusicEngine {
            sample_rate: profile.sample_rate,
            channels: profile.channels,
            base_tempo: profile.tempo(),
            round_end: profile.round_end_index().map(|i| i as u8),
            clock: ClockSource::new(profile.tempo()),
            bus,
            director,
            stingers,
            mixer: Mixer::new(profile.block_size, profile.channels),
            broker,
            command_rx,
            telemetry: Telemetry {
                tx: telemetry_tx,
                dropped: 0,
            },
        };

        // Stingers fire with less than a cycle of notice
        engine.prefetch_stingers();

        let handle = EngineHandle {
            shared: Arc::new(HandleShared {
                command_tx: Mutex::new(command_tx),
                stinger_ids: Arc::clone(&stinger_ids),
            }),
            bus: bus_handle,
        };
        let receiver = TelemetryReceiver {
            rx: telemetry_rx,
            stinger_ids,
        };

        log::info!(
            "Music engine ready: {:.2} BPM, {} beats/cycle, {} Hz, {} ch, {} stingers",
            profile.tempo_bpm,
            profile.beats_per_cycle,
            profile.sample_rate,
            profile.channels,
            engine.stingers.len()
        );

        Ok((engine, handle, receiver))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // AUDIO PATH
    // ═══════════════════════════════════════════════════════════════════════

    /// Audio callback: render one interleaved block
    pub fn render(&mut self, out: &mut [f32]) {
        Mixer::clear(out);
        self.process_control();

        let channels = self.channels;
        let total = out.len() / channels;
        let mut offset = 0;

        while offset < total {
            // Gains are sampled at segment edges, so segments stay mixer-sized
            let until = self.clock.frames_until_boundary(self.sample_rate) as usize;
            let frames = until.min(total - offset).min(self.mixer.max_frames());

            let start = self.clock.position();
            let end = start
                + frames as f64 / self.sample_rate as f64 / self.clock.cycle_duration_seconds();

            let segment = &mut out[offset * channels..(offset + frames) * channels];
            self.mix_segment(segment, start, end);

            let advance = self.clock.tick_frames(frames as u64, self.sample_rate);
            self.after_advance(advance);

            offset += frames;
        }
    }

    fn mix_segment(&mut self, segment: &mut [f32], start: f64, end: f64) {
        for layer in LayerId::ALL {
            let track = self.director.track_mut(layer);
            let gain_start = track.gain_at(start);
            let gain_end = track.gain_at(end);
            if let Some(source) = track.audible_source() {
                self.mixer.mix_layer(segment, source, gain_start, gain_end);
            }
        }

        for bank in self.stingers.iter_mut() {
            let gain = bank.gain();
            if let Some(track) = bank.instance_mut() {
                self.mixer.mix_stinger(segment, track.source_mut(), gain);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CONTROL PATH
    // ═══════════════════════════════════════════════════════════════════════

    /// Control-rate update for hosts that play the layer sources themselves.
    /// Runs the same state machine as [`render`](Self::render) without mixing.
    pub fn tick(&mut self, delta_seconds: f64) -> LayerGains {
        self.process_control();

        let mut remaining = if delta_seconds.is_finite() {
            delta_seconds.max(0.0)
        } else {
            0.0
        };

        while remaining > 0.0 {
            let step = self.clock.seconds_until_boundary().min(remaining);
            let frames = (step * self.sample_rate as f64).round() as usize;

            for bank in self.stingers.iter_mut() {
                if let Some(track) = bank.instance_mut() {
                    self.mixer.skip(track.source_mut(), frames);
                }
            }

            let advance = self.clock.tick(step);
            self.after_advance(advance);

            if step <= 0.0 {
                break;
            }
            remaining -= step;
        }

        self.gains()
    }

    /// Drain commands and signals, re-evaluate, collect deliveries
    fn process_control(&mut self) {
        // Signals before commands: a reset clears everything sent ahead of it
        let mut update = self.bus.drain();
        if update.coalesced > 0 {
            self.telemetry.emit(TelemetryEvent::SignalsCoalesced {
                count: update.coalesced,
            });
        }

        while let Ok(command) = self.command_rx.pop() {
            if matches!(command, EngineCommand::Reset) {
                update.round_end_count = 0;
            }
            self.handle_command(command);
        }

        // Always evaluated: retries requests for layers still waiting
        let snapshot = *self.bus.snapshot();
        let position = self.clock.position();
        let telemetry = &mut self.telemetry;
        self.director.evaluate(&snapshot, position, self.broker.as_mut(), &mut |e| {
            telemetry.emit(e)
        });

        for _ in 0..update.round_end_count {
            match self.round_end {
                Some(index) => self.trigger_stinger(index),
                None => log::debug!("RoundEnded with no stinger configured"),
            }
        }

        self.collect_deliveries();
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SetTempo {
                bpm,
                beats_per_cycle,
            } => {
                let tempo = self.clock.set_tempo(bpm, beats_per_cycle);
                log::debug!(
                    "Tempo {:.2} BPM / {} beats pending",
                    tempo.bpm,
                    tempo.beats_per_cycle
                );
            }
            EngineCommand::TriggerStinger(index) => self.trigger_stinger(index),
            EngineCommand::Reset => self.reset(),
        }
    }

    fn trigger_stinger(&mut self, index: u8) {
        let position = self.clock.position();
        let Some(bank) = self.stingers.get_mut(index as usize) else {
            log::warn!("Trigger for unknown stinger #{}", index);
            return;
        };

        match bank.trigger() {
            TriggerOutcome::Queued => {
                if bank.source_slot().needs_request()
                    && self
                        .broker
                        .request(SlotKey::Stinger(index), bank.asset(), false)
                {
                    bank.mark_requested();
                }
            }
            TriggerOutcome::AlreadyQueued => {}
            TriggerOutcome::Dropped => {
                self.telemetry
                    .emit(TelemetryEvent::StingerDropped { stinger: index, position });
            }
        }
    }

    fn collect_deliveries(&mut self) {
        while let Some(delivery) = self.broker.poll() {
            match delivery {
                Delivery::Ready(SlotKey::Stinger(index), source) => {
                    match self.stingers.get_mut(index as usize) {
                        Some(bank) => {
                            if let Some(old) = bank.install_source(source) {
                                self.broker.release(old);
                            }
                        }
                        None => self.broker.release(source),
                    }
                }
                Delivery::Failed(SlotKey::Stinger(index)) => {
                    if let Some(bank) = self.stingers.get_mut(index as usize) {
                        bank.mark_failed();
                    }
                    self.telemetry.emit(TelemetryEvent::AssetFailed {
                        key: SlotKey::Stinger(index),
                    });
                }
                layer => {
                    let telemetry = &mut self.telemetry;
                    self.director
                        .deliver(layer, self.broker.as_mut(), &mut |e| telemetry.emit(e));
                }
            }
        }
    }

    /// Gains, stinger completion and boundary work after the clock moved
    fn after_advance(&mut self, advance: ClockAdvance) {
        let position = self.clock.position();
        let telemetry = &mut self.telemetry;

        self.director
            .advance(position, self.broker.as_mut(), &mut |e| telemetry.emit(e));

        for (index, bank) in self.stingers.iter_mut().enumerate() {
            if let Some(source) = bank.reap() {
                self.broker.release(source);
                telemetry.emit(TelemetryEvent::StingerFinished {
                    stinger: index as u8,
                    position,
                });
                log::debug!("Stinger '{}' finished", bank.id());
            }
        }

        if let Some(tempo) = advance.tempo_applied {
            telemetry.emit(TelemetryEvent::TempoChanged {
                bpm: tempo.bpm,
                beats_per_cycle: tempo.beats_per_cycle,
                cycle: self.clock.cycle_index(),
            });
        }

        if advance.crossed_boundary() {
            self.on_boundary(position);
        }

        // Finished stingers get a fresh source for their next trigger
        self.prefetch_stingers();
    }

    fn on_boundary(&mut self, position: f64) {
        let telemetry = &mut self.telemetry;
        self.director
            .on_boundary(position, self.broker.as_mut(), &mut |e| telemetry.emit(e));

        for (index, bank) in self.stingers.iter_mut().enumerate() {
            let stinger = index as u8;
            match bank.on_boundary(position) {
                StingerBoundary::Started => {
                    telemetry.emit(TelemetryEvent::StingerFired { stinger, position });
                }
                StingerBoundary::SourceNotReady => {
                    log::warn!("Stinger '{}' not ready at {:.3}", bank.id(), position);
                    telemetry.emit(TelemetryEvent::AssetNotReady {
                        key: SlotKey::Stinger(stinger),
                        position,
                    });
                    if bank.source_slot().needs_request()
                        && self
                            .broker
                            .request(SlotKey::Stinger(stinger), bank.asset(), false)
                    {
                        bank.mark_requested();
                    }
                }
                StingerBoundary::None => {}
            }
        }
    }

    /// Request sources for idle stingers that have none
    fn prefetch_stingers(&mut self) {
        for (index, bank) in self.stingers.iter_mut().enumerate() {
            if !bank.is_playing()
                && matches!(bank.source_slot(), SourceSlot::Empty)
                && self
                    .broker
                    .request(SlotKey::Stinger(index as u8), bank.asset(), false)
            {
                bank.mark_requested();
            }
        }
    }

    fn reset(&mut self) {
        self.director.reset(self.broker.as_mut());
        for bank in self.stingers.iter_mut() {
            let (playing, spare) = bank.clear();
            for source in playing.into_iter().chain(spare) {
                self.broker.release(source);
            }
        }
        self.clock.reset(self.base_tempo);
        self.bus.reset(GameSnapshot::default());
        self.prefetch_stingers();
        log::info!("Music engine reset");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STATE
    // ═══════════════════════════════════════════════════════════════════════

    /// Gains and states of all layers
    pub fn gains(&self) -> LayerGains {
        let mut gains = LayerGains {
            gains: self.director.gains(),
            position: self.clock.position(),
            ..Default::default()
        };
        for layer in LayerId::ALL {
            gains.states[layer.index()] = self.director.track(layer).state();
        }
        gains.stingers_playing = self.stingers.iter().filter(|b| b.is_playing()).count() as u8;
        gains
    }

    pub fn layer_state(&self, layer: LayerId) -> LayerState {
        self.director.track(layer).state()
    }

    pub fn layer_gain(&self, layer: LayerId) -> f32 {
        self.director.track(layer).current_gain()
    }

    /// Clock position in cycles
    pub fn position(&self) -> f64 {
        self.clock.position()
    }

    pub fn clock(&self) -> &ClockSource {
        &self.clock
    }

    pub fn snapshot(&self) -> &GameSnapshot {
        self.bus.snapshot()
    }

    pub fn director(&self) -> &LayerDirector {
        &self.director
    }

    pub fn stinger(&self, id: &str) -> Option<&StingerBank> {
        self.stingers.iter().find(|b| b.id() == id)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Telemetry events lost to a full ring
    pub fn telemetry_dropped(&self) -> u64 {
        self.telemetry.dropped
    }

    /// Re-anchor the transport to an external absolute time base
    pub fn resync(&mut self, absolute_seconds: f64) {
        let advance = self.clock.resync(absolute_seconds);
        self.after_advance(advance);
    }
}
