//! Engine Scenario Tests
//!
//! Drives the full engine (bus, director, clock, stingers, mixer) through
//! game-like signal sequences. Layer assets are constant 1.0 loops so the
//! rendered output equals the sum of the layer gains.
//!
//! 120 BPM with 4 beats per cycle at 8 kHz: one cycle = 2 s = 16000 frames.

use std::sync::Arc;

use approx::assert_abs_diff_eq;
use hf_ale::{
    EngineHandle, FadeCurve, ImmediateBroker, LayerId, LayerState, MemoryLibrary, MusicEngine,
    ProfileBuilder, SlotKey, StateSignal, TelemetryEvent, TelemetryReceiver, default_asset,
};

const RATE: u32 = 8000;
const CYCLE_FRAMES: usize = 16000;
const CYCLE_SECONDS: f64 = 2.0;
const STINGER_FRAMES: usize = 4000;

fn library() -> Arc<MemoryLibrary> {
    let library = MemoryLibrary::new();
    for layer in LayerId::ALL {
        library.insert(default_asset(layer), vec![1.0f32; 160], 1);
    }
    library.insert("round_end_stinger", vec![1.0f32; STINGER_FRAMES], 1);
    Arc::new(library)
}

fn build_with(
    builder: ProfileBuilder,
    library: Arc<MemoryLibrary>,
) -> (MusicEngine, EngineHandle, TelemetryReceiver) {
    let profile = builder.tempo(120.0, 4).audio(RATE, 1, 256).build();
    MusicEngine::new(profile, Box::new(ImmediateBroker::new(library))).unwrap()
}

fn build() -> (MusicEngine, EngineHandle, TelemetryReceiver) {
    build_with(ProfileBuilder::new(), library())
}

fn render(engine: &mut MusicEngine, frames: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; frames];
    engine.render(&mut out);
    out
}

fn max_step(samples: &[f32]) -> f32 {
    samples
        .windows(2)
        .map(|w| (w[1] - w[0]).abs())
        .fold(0.0, f32::max)
}

fn transitions(events: &[TelemetryEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TelemetryEvent::LayerTransition(_)))
        .count()
}

const COMBAT_CONTEXT: [LayerId; 3] = [LayerId::Combat, LayerId::Intensity, LayerId::Finale];

// ═══════════════════════════════════════════════════════════════════════════════
// MENU → COMBAT
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_menu_to_combat_crossfade() {
    let (mut engine, handle, _telemetry) = build();
    let mut output = Vec::new();

    handle.send_signal(StateSignal::MenuEntered).unwrap();
    output.extend(render(&mut engine, CYCLE_FRAMES));
    assert_eq!(engine.layer_state(LayerId::Menu), LayerState::FadingIn);

    output.extend(render(&mut engine, CYCLE_FRAMES));
    assert_eq!(engine.layer_state(LayerId::Menu), LayerState::Sustaining);
    assert_abs_diff_eq!(engine.layer_gain(LayerId::Menu), 0.4, epsilon = 1e-6);

    handle.send_signal(StateSignal::CombatEntered).unwrap();
    output.extend(render(&mut engine, CYCLE_FRAMES / 2));
    // Nothing moves before the boundary
    assert_eq!(engine.layer_state(LayerId::Foundation), LayerState::Stopped);
    assert_eq!(engine.layer_state(LayerId::Menu), LayerState::Sustaining);

    output.extend(render(&mut engine, CYCLE_FRAMES / 2));
    assert_eq!(engine.layer_state(LayerId::Menu), LayerState::FadingOut);
    assert_eq!(engine.layer_state(LayerId::Foundation), LayerState::FadingIn);
    assert_eq!(engine.layer_state(LayerId::Combat), LayerState::FadingIn);

    // One fade duration later everything has settled
    output.extend(render(&mut engine, CYCLE_FRAMES));
    assert_eq!(engine.layer_state(LayerId::Foundation), LayerState::Sustaining);
    assert_eq!(engine.layer_state(LayerId::Combat), LayerState::Sustaining);
    assert_eq!(engine.layer_state(LayerId::Menu), LayerState::Stopped);
    assert_abs_diff_eq!(engine.layer_gain(LayerId::Foundation), 0.8, epsilon = 1e-6);
    assert_abs_diff_eq!(engine.layer_gain(LayerId::Combat), 0.6, epsilon = 1e-6);
    assert_abs_diff_eq!(engine.layer_gain(LayerId::Menu), 0.0, epsilon = 1e-6);

    output.extend(render(&mut engine, CYCLE_FRAMES));
    assert_abs_diff_eq!(*output.last().unwrap(), 1.4, epsilon = 1e-5);

    // No seams: steepest one-cycle S-curve at these gains moves ~1e-4 per sample
    assert!(max_step(&output) < 1e-3, "discontinuity {}", max_step(&output));
}

// ═══════════════════════════════════════════════════════════════════════════════
// BOUNDARY GATING
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_fade_starts_on_boundary_frame() {
    let (mut engine, handle, mut telemetry) = build();

    handle.send_signal(StateSignal::CombatEntered).unwrap();
    let first = render(&mut engine, CYCLE_FRAMES / 2);
    assert!(first.iter().all(|s| *s == 0.0));

    // Boundary lands in the middle of this block
    let second = render(&mut engine, CYCLE_FRAMES);
    let boundary = CYCLE_FRAMES / 2;
    assert!(second[..boundary].iter().all(|s| *s == 0.0));
    assert_eq!(second[boundary], 0.0);
    assert!(second[boundary + 1] > 0.0);

    let events = telemetry.drain();
    for event in &events {
        if let TelemetryEvent::LayerTransition(t) = event {
            assert_abs_diff_eq!(t.position, 1.0, epsilon = 1e-9);
        }
    }
    assert_eq!(transitions(&events), 2);
}

#[test]
fn test_stinger_starts_on_boundary_frame() {
    let (mut engine, handle, mut telemetry) = build();

    render(&mut engine, CYCLE_FRAMES / 4);
    handle.send_signal(StateSignal::RoundEnded).unwrap();
    let out = render(&mut engine, CYCLE_FRAMES);

    let boundary = CYCLE_FRAMES * 3 / 4;
    assert!(out[..boundary].iter().all(|s| *s == 0.0));
    assert!(out[boundary..boundary + STINGER_FRAMES / 4]
        .iter()
        .all(|s| (*s - 0.9).abs() < 1e-6));

    assert!(telemetry.drain().iter().any(|e| matches!(
        e,
        TelemetryEvent::StingerFired { stinger: 0, position } if (*position - 1.0).abs() < 1e-9
    )));
}

// ═══════════════════════════════════════════════════════════════════════════════
// REVERSAL
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_reversal_continues_from_current_gain() {
    let (mut engine, handle, _telemetry) =
        build_with(ProfileBuilder::new().fade_cycles(4.0), library());

    handle.send_signal(StateSignal::CombatEntered).unwrap();
    engine.tick(CYCLE_SECONDS);
    engine.tick(CYCLE_SECONDS * 2.0);
    assert_eq!(engine.layer_state(LayerId::Combat), LayerState::FadingIn);

    // Exit three quarters into the fade-in
    handle.send_signal(StateSignal::CombatExited).unwrap();
    engine.tick(CYCLE_SECONDS);
    assert_eq!(engine.layer_state(LayerId::Combat), LayerState::FadingOut);
    let peak = engine.layer_gain(LayerId::Combat);
    assert_abs_diff_eq!(peak, 0.6 * FadeCurve::SCurve.apply(0.75), epsilon = 1e-4);
    // Foundation follows the arena, not the fight
    assert_eq!(engine.layer_state(LayerId::Foundation), LayerState::FadingIn);

    engine.tick(CYCLE_SECONDS / 2.0);
    let before = engine.layer_gain(LayerId::Combat);
    assert!(before < peak && before > 0.0);

    // Re-enter while still fading out: no boundary needed
    handle.send_signal(StateSignal::CombatEntered).unwrap();
    engine.tick(0.0);
    assert_eq!(engine.layer_state(LayerId::Combat), LayerState::FadingIn);
    let after = engine.layer_gain(LayerId::Combat);
    assert_abs_diff_eq!(before, after, epsilon = 1e-6);

    // Remaining distance takes a proportional share of the fade
    let ramp = engine.director().track(LayerId::Combat).ramp().copied().unwrap();
    assert_abs_diff_eq!(
        ramp.duration_cycles,
        4.0 * (0.6 - ramp.from as f64) / 0.6,
        epsilon = 1e-4
    );

    engine.tick(CYCLE_SECONDS * 4.0);
    assert_eq!(engine.layer_state(LayerId::Combat), LayerState::Sustaining);
    assert_abs_diff_eq!(engine.layer_gain(LayerId::Combat), 0.6, epsilon = 1e-6);
}

#[test]
fn test_reversal_with_default_fade() {
    let (mut engine, handle, mut telemetry) = build();

    handle.send_signal(StateSignal::CombatEntered).unwrap();
    render(&mut engine, CYCLE_FRAMES * 2);
    assert_eq!(engine.layer_state(LayerId::Combat), LayerState::Sustaining);

    handle.send_signal(StateSignal::CombatExited).unwrap();
    let mut output = render(&mut engine, CYCLE_FRAMES);
    assert_eq!(engine.layer_state(LayerId::Combat), LayerState::FadingOut);

    output.extend(render(&mut engine, CYCLE_FRAMES / 4));
    let before = engine.layer_gain(LayerId::Combat);
    assert!(before > 0.0 && before < 0.6);

    // The fade-out would end on the next boundary; turn around well before it
    handle.send_signal(StateSignal::CombatEntered).unwrap();
    output.extend(render(&mut engine, CYCLE_FRAMES / 32));
    assert_eq!(engine.layer_state(LayerId::Combat), LayerState::FadingIn);
    assert!(engine.layer_gain(LayerId::Combat) > before);

    output.extend(render(&mut engine, CYCLE_FRAMES));
    assert_eq!(engine.layer_state(LayerId::Combat), LayerState::Sustaining);
    assert_abs_diff_eq!(engine.layer_gain(LayerId::Combat), 0.6, epsilon = 1e-6);
    assert!(max_step(&output) < 1e-3, "discontinuity {}", max_step(&output));

    let combat: Vec<_> = telemetry
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            TelemetryEvent::LayerTransition(t) if t.layer == LayerId::Combat => Some(t),
            _ => None,
        })
        .collect();
    assert!(combat.iter().all(|t| t.to != LayerState::Stopped));

    let reversal = combat
        .iter()
        .find(|t| t.from == LayerState::FadingOut)
        .unwrap();
    assert_eq!(reversal.to, LayerState::FadingIn);
    assert_abs_diff_eq!(reversal.position, 3.25, epsilon = 1e-9);
    assert_abs_diff_eq!(reversal.gain, before, epsilon = 1e-6);
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOW HEALTH
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_low_health_hysteresis() {
    let (mut engine, handle, _telemetry) = build();

    handle.send_signal(StateSignal::CombatEntered).unwrap();
    handle.send_signal(StateSignal::HealthChanged(0.25)).unwrap();
    engine.tick(CYCLE_SECONDS);
    assert!(engine.snapshot().low_health);
    assert_eq!(engine.layer_state(LayerId::Intensity), LayerState::FadingIn);

    // Inside the band: stays latched
    handle.send_signal(StateSignal::HealthChanged(0.33)).unwrap();
    engine.tick(CYCLE_SECONDS);
    assert!(engine.snapshot().low_health);
    assert_eq!(engine.layer_state(LayerId::Intensity), LayerState::Sustaining);

    // Above threshold + band: releases at the next boundary
    handle.send_signal(StateSignal::HealthChanged(0.36)).unwrap();
    engine.tick(CYCLE_SECONDS / 2.0);
    assert!(!engine.snapshot().low_health);
    assert_eq!(engine.layer_state(LayerId::Intensity), LayerState::Sustaining);

    engine.tick(CYCLE_SECONDS / 2.0);
    assert_eq!(engine.layer_state(LayerId::Intensity), LayerState::FadingOut);
}

#[test]
fn test_in_band_oscillation_never_flaps() {
    let (mut engine, handle, mut telemetry) = build();

    handle.send_signal(StateSignal::CombatEntered).unwrap();
    handle.send_signal(StateSignal::HealthChanged(0.25)).unwrap();
    engine.tick(CYCLE_SECONDS * 2.0);
    assert_eq!(engine.layer_state(LayerId::Intensity), LayerState::Sustaining);
    telemetry.drain();

    // Health jitters across the threshold but never clears the band
    for i in 0..80 {
        let health = if i % 2 == 0 { 0.29 } else { 0.34 };
        handle.send_signal(StateSignal::HealthChanged(health)).unwrap();
        engine.tick(CYCLE_SECONDS / 20.0);
        assert!(engine.snapshot().low_health);
    }
    assert!(engine.position() > 5.9);

    let flaps = telemetry
        .drain()
        .iter()
        .filter(|e| {
            matches!(e, TelemetryEvent::LayerTransition(t) if t.layer == LayerId::Intensity)
        })
        .count();
    assert_eq!(flaps, 0);
    assert_eq!(engine.layer_state(LayerId::Intensity), LayerState::Sustaining);
    assert_abs_diff_eq!(engine.layer_gain(LayerId::Intensity), 0.5, epsilon = 1e-6);
}

#[test]
fn test_intensity_needs_combat() {
    let (mut engine, handle, _telemetry) = build();

    handle.send_signal(StateSignal::HealthChanged(0.1)).unwrap();
    engine.tick(CYCLE_SECONDS * 2.0);
    assert!(engine.snapshot().low_health);
    assert_eq!(engine.layer_state(LayerId::Intensity), LayerState::Stopped);
}

// ═══════════════════════════════════════════════════════════════════════════════
// STINGERS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_stinger_drop_then_retrigger() {
    let (mut engine, handle, mut telemetry) = build();

    handle.send_signal(StateSignal::RoundEnded).unwrap();
    render(&mut engine, CYCLE_FRAMES);
    assert!(engine.stinger("round_end").unwrap().is_playing());

    let playing = render(&mut engine, STINGER_FRAMES / 2);
    assert!(playing.iter().all(|s| (*s - 0.9).abs() < 1e-6));

    // Second RoundEnded while playing is discarded
    handle.send_signal(StateSignal::RoundEnded).unwrap();
    let out = render(&mut engine, CYCLE_FRAMES);
    assert!(out[..STINGER_FRAMES / 2].iter().all(|s| (*s - 0.9).abs() < 1e-6));
    assert!(out[STINGER_FRAMES / 2..].iter().all(|s| *s == 0.0));

    let events = telemetry.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, TelemetryEvent::StingerDropped { stinger: 0, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, TelemetryEvent::StingerFinished { stinger: 0, .. })));
    let bank = engine.stinger("round_end").unwrap();
    assert!(!bank.is_playing());
    assert!(!bank.is_queued());
    assert_eq!(bank.fired(), 1);

    // A new instance plays on the next trigger
    handle.send_signal(StateSignal::RoundEnded).unwrap();
    render(&mut engine, CYCLE_FRAMES);
    let bank = engine.stinger("round_end").unwrap();
    assert!(bank.is_playing());
    assert_eq!(bank.fired(), 2);
    assert_eq!(telemetry.stinger_name(0), "round_end");
}

#[test]
fn test_manual_stinger_trigger() {
    let (mut engine, handle, mut telemetry) = build();

    handle.trigger_stinger("round_end").unwrap();
    engine.tick(CYCLE_SECONDS);
    assert!(engine.stinger("round_end").unwrap().is_playing());

    // Control-rate path advances the stinger too
    engine.tick(STINGER_FRAMES as f64 / RATE as f64);
    assert!(!engine.stinger("round_end").unwrap().is_playing());
    assert!(telemetry
        .drain()
        .iter()
        .any(|e| matches!(e, TelemetryEvent::StingerFinished { .. })));
}

// ═══════════════════════════════════════════════════════════════════════════════
// MUTUAL EXCLUSION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_menu_never_overlaps_combat_for_long() {
    let (mut engine, handle, _telemetry) = build();

    let script: [(f64, StateSignal); 8] = [
        (0.3, StateSignal::CombatEntered),
        (1.1, StateSignal::PlayersRemaining(2)),
        (2.5, StateSignal::HealthChanged(0.2)),
        (6.2, StateSignal::MenuEntered),
        (9.9, StateSignal::CombatEntered),
        (10.4, StateSignal::MenuEntered),
        (11.0, StateSignal::CombatEntered),
        (15.7, StateSignal::MenuEntered),
    ];

    let step = 0.05;
    let mut now = 0.0;
    let mut next = 0;
    let mut menu_since: Option<f64> = None;

    while now < 30.0 {
        while next < script.len() && script[next].0 <= now {
            handle.send_signal(script[next].1).unwrap();
            next += 1;
        }

        engine.tick(step);
        now += step;

        let position = engine.position();
        let menu_active = matches!(
            engine.layer_state(LayerId::Menu),
            LayerState::FadingIn | LayerState::Sustaining
        );
        if !menu_active {
            menu_since = None;
        } else if menu_since.is_none() {
            menu_since = Some(position);
        }

        if let Some(since) = menu_since {
            if position >= since + 1.0 {
                for layer in COMBAT_CONTEXT {
                    assert_eq!(
                        engine.layer_gain(layer),
                        0.0,
                        "{} audible with menu at {:.3}",
                        layer,
                        position
                    );
                }
            }
        }

        assert!(!(engine.director().desired().get(LayerId::Menu)
            && engine.director().desired().any_combat()));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IDEMPOTENCE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_duplicate_signal_is_idempotent() {
    let (mut once, once_handle, mut once_telemetry) = build();
    let (mut twice, twice_handle, mut twice_telemetry) = build();

    once_handle.send_signal(StateSignal::CombatEntered).unwrap();
    twice_handle.send_signal(StateSignal::CombatEntered).unwrap();
    twice_handle.send_signal(StateSignal::CombatEntered).unwrap();

    for _ in 0..6 {
        once.tick(CYCLE_SECONDS / 2.0);
        twice.tick(CYCLE_SECONDS / 2.0);
        // Duplicate arriving in a later drain changes nothing either
        twice_handle.send_signal(StateSignal::CombatEntered).unwrap();
        assert_eq!(once.gains(), twice.gains());
    }

    assert_eq!(
        transitions(&once_telemetry.drain()),
        transitions(&twice_telemetry.drain())
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCES
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_missing_asset_retries_at_boundaries() {
    let library = library();
    library.remove("combat_layer");
    let (mut engine, handle, mut telemetry) = build_with(ProfileBuilder::new(), Arc::clone(&library));

    handle.send_signal(StateSignal::CombatEntered).unwrap();
    engine.tick(CYCLE_SECONDS);
    assert_eq!(engine.layer_state(LayerId::Foundation), LayerState::FadingIn);
    assert_eq!(engine.layer_state(LayerId::Combat), LayerState::Stopped);

    let events = telemetry.drain();
    assert!(events.iter().any(|e| matches!(
        e,
        TelemetryEvent::AssetFailed {
            key: SlotKey::Layer(LayerId::Combat)
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        TelemetryEvent::AssetNotReady {
            key: SlotKey::Layer(LayerId::Combat),
            ..
        }
    )));

    library.insert("combat_layer", vec![1.0f32; 160], 1);
    engine.tick(CYCLE_SECONDS);
    engine.tick(CYCLE_SECONDS);
    assert_eq!(engine.layer_state(LayerId::Combat), LayerState::FadingIn);
}

#[test]
fn test_threaded_broker_delivers() {
    let broker = hf_ale::ThreadedBroker::spawn(library()).unwrap();
    let profile = ProfileBuilder::new().tempo(120.0, 4).audio(RATE, 1, 256).build();
    let (mut engine, handle, _telemetry) = MusicEngine::new(profile, Box::new(broker)).unwrap();

    handle.send_signal(StateSignal::MenuEntered).unwrap();
    engine.tick(0.0);

    // Give the loader thread time before the boundary
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while !engine.director().track(LayerId::Menu).source_slot().is_ready() {
        assert!(std::time::Instant::now() < deadline, "loader never delivered");
        std::thread::sleep(std::time::Duration::from_millis(1));
        engine.tick(0.0);
    }

    engine.tick(CYCLE_SECONDS);
    assert_eq!(engine.layer_state(LayerId::Menu), LayerState::FadingIn);
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLOCK
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_long_session_stays_on_grid() {
    let profile = ProfileBuilder::new().tempo(85.0, 4).audio(RATE, 1, 512).build();
    let (mut engine, _handle, _telemetry) =
        MusicEngine::new(profile, Box::new(ImmediateBroker::new(library()))).unwrap();

    // Odd block size so boundaries never line up with block edges
    let block = 333;
    let mut out = vec![0.0f32; block];
    let mut total: u64 = 0;
    while total < RATE as u64 * 600 {
        engine.render(&mut out);
        total += block as u64;
    }

    let cycle_frames = RATE as f64 * 60.0 * 4.0 / 85.0;
    let expected = total as f64 / cycle_frames;
    assert_eq!(engine.clock().cycle_index(), expected.floor() as u64);
    assert_abs_diff_eq!(engine.position(), expected, epsilon = 1e-6);
}

#[test]
fn test_tempo_change_waits_for_boundary() {
    let (mut engine, handle, mut telemetry) = build();

    engine.tick(CYCLE_SECONDS / 2.0);
    handle.set_tempo(60.0, 4).unwrap();
    engine.tick(CYCLE_SECONDS / 4.0);
    assert_abs_diff_eq!(engine.clock().cycle_duration_seconds(), 2.0, epsilon = 1e-12);

    engine.tick(CYCLE_SECONDS / 4.0);
    assert_abs_diff_eq!(engine.clock().cycle_duration_seconds(), 4.0, epsilon = 1e-12);
    assert_eq!(engine.clock().cycle_index(), 1);
    assert_abs_diff_eq!(engine.clock().phase(), 0.0, epsilon = 1e-9);

    assert!(telemetry.drain().iter().any(|e| matches!(
        e,
        TelemetryEvent::TempoChanged { cycle: 1, .. }
    )));
}

#[test]
fn test_reset_drops_signals_sent_before_it() {
    let (mut engine, handle, _telemetry) = build();

    handle.send_signal(StateSignal::CombatEntered).unwrap();
    handle.reset().unwrap();
    engine.tick(CYCLE_SECONDS * 1.25);

    assert!(!engine.snapshot().in_combat);
    assert_eq!(engine.layer_state(LayerId::Foundation), LayerState::Stopped);
    assert_eq!(engine.layer_state(LayerId::Combat), LayerState::Stopped);
}

#[test]
fn test_reset_returns_to_silence() {
    let (mut engine, handle, _telemetry) = build();

    handle.send_signal(StateSignal::CombatEntered).unwrap();
    handle.send_signal(StateSignal::RoundEnded).unwrap();
    engine.tick(CYCLE_SECONDS * 1.5);

    handle.reset().unwrap();
    let out = render(&mut engine, CYCLE_FRAMES * 2);
    assert!(out.iter().all(|s| *s == 0.0));
    assert_eq!(engine.clock().cycle_index(), 2);
    for layer in LayerId::ALL {
        assert_eq!(engine.layer_state(layer), LayerState::Stopped);
    }
}
