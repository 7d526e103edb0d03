//! HighFire ALE Simulator
//!
//! Usage:
//!   hf-ale-sim run <scenario.json>     - Play a signal script against the engine
//!   hf-ale-sim check <profile.json>    - Sanitize and validate a profile
//!   hf-ale-sim profile                 - Print the default profile

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use hf_ale::{
    ImmediateBroker, LayerGains, LayerId, MemoryLibrary, MusicEngine, MusicProfile, StateSignal,
    TelemetryEvent, TelemetryReceiver,
};

#[derive(Parser)]
#[command(name = "hf-ale-sim", about = "HighFire adaptive music simulator", version)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a scenario and print telemetry
    Run {
        /// Scenario JSON
        scenario: PathBuf,
        /// Profile JSON (defaults to the built-in profile)
        #[arg(short, long)]
        profile: Option<PathBuf>,
        /// Control step in milliseconds
        #[arg(long, default_value_t = 10.0)]
        step_ms: f64,
        /// Drive the audio path instead of the control-rate path
        #[arg(long)]
        render: bool,
    },
    /// Sanitize and validate a profile
    Check {
        profile: PathBuf,
    },
    /// Print the default profile as JSON
    Profile,
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCENARIO
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct Scenario {
    duration_seconds: f64,
    #[serde(default)]
    events: Vec<ScenarioEvent>,
}

#[derive(Debug, Deserialize)]
struct ScenarioEvent {
    /// Seconds from start
    at: f64,
    #[serde(flatten)]
    action: Action,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Action {
    Signal(StateSignal),
    Tempo { bpm: f64, beats_per_cycle: u32 },
    Stinger(String),
}

impl Scenario {
    fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        let mut scenario: Scenario = serde_json::from_str(&json)
            .with_context(|| format!("Invalid scenario {}", path.display()))?;

        if !scenario.duration_seconds.is_finite() || scenario.duration_seconds <= 0.0 {
            bail!("duration_seconds must be positive");
        }
        scenario.events.sort_by(|a, b| a.at.total_cmp(&b.at));
        Ok(scenario)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Run {
            scenario,
            profile,
            step_ms,
            render,
        } => run(&scenario, profile.as_deref(), step_ms, render),
        Commands::Check { profile } => check(&profile),
        Commands::Profile => {
            println!("{}", MusicProfile::default().to_json()?);
            Ok(())
        }
    }
}

fn load_profile(path: Option<&Path>) -> Result<MusicProfile> {
    match path {
        Some(path) => MusicProfile::load(path)
            .with_context(|| format!("Failed to load profile {}", path.display())),
        None => Ok(MusicProfile::default()),
    }
}

fn check(path: &Path) -> Result<()> {
    let mut profile = load_profile(Some(path))?;

    let warnings = profile.sanitize();
    for warning in &warnings {
        println!("warning: {}", warning);
    }

    if let Err(errors) = profile.validate() {
        for error in &errors {
            println!("error: {}", error);
        }
        bail!("{} error(s) in {}", errors.len(), path.display());
    }

    println!(
        "{}: ok ({} warning(s), {:.2} BPM, {} stingers)",
        path.display(),
        warnings.len(),
        profile.tempo_bpm,
        profile.stingers.len()
    );
    Ok(())
}

/// Silent stand-ins for every asset the profile names
fn silent_library(profile: &MusicProfile) -> MemoryLibrary {
    let library = MemoryLibrary::new();
    let cycle_frames =
        (profile.tempo().cycle_duration_seconds() * profile.sample_rate as f64).round() as usize;
    let beat_frames =
        (profile.tempo().beat_duration_seconds() * profile.sample_rate as f64).round() as usize;

    for layer in LayerId::ALL {
        library.insert_silence(profile.layer_config(layer).asset, cycle_frames, 1);
    }
    for stinger in &profile.stingers {
        library.insert_silence(stinger.asset.clone(), beat_frames, 1);
    }
    library
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUN
// ═══════════════════════════════════════════════════════════════════════════════

fn run(scenario_path: &Path, profile_path: Option<&Path>, step_ms: f64, render: bool) -> Result<()> {
    if !step_ms.is_finite() || step_ms <= 0.0 {
        bail!("--step-ms must be positive");
    }

    let scenario = Scenario::load(scenario_path)?;
    let profile = load_profile(profile_path)?;
    let library = Arc::new(silent_library(&profile));
    let broker = ImmediateBroker::new(library);

    let (mut engine, handle, mut telemetry) =
        MusicEngine::new(profile, Box::new(broker)).context("Failed to build engine")?;

    let step = step_ms / 1000.0;
    let frames_per_step = (step * engine.sample_rate() as f64).round().max(1.0) as usize;
    let mut block = vec![0.0f32; frames_per_step * engine.channels()];

    print_header();

    let mut now = 0.0;
    let mut next = 0;
    let mut last_cycle = None;

    while now < scenario.duration_seconds {
        while next < scenario.events.len() && scenario.events[next].at <= now {
            let event = &scenario.events[next];
            log::info!("{:>8.3}s  {:?}", event.at, event.action);
            let result = match &event.action {
                Action::Signal(signal) => handle.send_signal(*signal),
                Action::Tempo {
                    bpm,
                    beats_per_cycle,
                } => handle.set_tempo(*bpm, *beats_per_cycle),
                Action::Stinger(id) => handle.trigger_stinger(id),
            };
            if let Err(e) = result {
                log::warn!("Event at {:.3}s rejected: {}", event.at, e);
            }
            next += 1;
        }

        let gains = if render {
            engine.render(&mut block);
            engine.gains()
        } else {
            engine.tick(step)
        };
        now += step;

        print_telemetry(&mut telemetry, now);

        let cycle = engine.clock().cycle_index();
        if last_cycle != Some(cycle) {
            print_row(cycle, &gains);
            last_cycle = Some(cycle);
        }
    }

    if engine.telemetry_dropped() > 0 {
        log::warn!("{} telemetry events lost", engine.telemetry_dropped());
    }

    Ok(())
}

fn print_header() {
    print!("{:>6}", "cycle");
    for layer in LayerId::ALL {
        print!("  {:>16}", layer.name());
    }
    println!("  {:>8}", "stingers");
}

fn print_row(cycle: u64, gains: &LayerGains) {
    print!("{:>6}", cycle);
    for layer in LayerId::ALL {
        print!(
            "  {:>5.3} {:<10}",
            gains.gain(layer),
            gains.state(layer).name()
        );
    }
    println!("  {:>8}", gains.stingers_playing);
}

fn print_telemetry(telemetry: &mut TelemetryReceiver, now: f64) {
    while let Some(event) = telemetry.pop() {
        let line = match event {
            TelemetryEvent::LayerTransition(t) => format!(
                "layer {} {} -> {} at {:.3} (gain {:.3})",
                t.layer,
                t.from.name(),
                t.to.name(),
                t.position,
                t.gain
            ),
            TelemetryEvent::StingerFired { stinger, position } => {
                format!("stinger '{}' fired at {:.3}", telemetry.stinger_name(stinger), position)
            }
            TelemetryEvent::StingerDropped { stinger, position } => format!(
                "stinger '{}' dropped at {:.3} (still playing)",
                telemetry.stinger_name(stinger),
                position
            ),
            TelemetryEvent::StingerFinished { stinger, position } => format!(
                "stinger '{}' finished at {:.3}",
                telemetry.stinger_name(stinger),
                position
            ),
            TelemetryEvent::AssetNotReady { key, position } => {
                format!("{:?} not ready at {:.3}", key, position)
            }
            TelemetryEvent::AssetFailed { key } => format!("{:?} failed to load", key),
            TelemetryEvent::TempoChanged {
                bpm,
                beats_per_cycle,
                cycle,
            } => format!(
                "tempo {:.2} BPM / {} beats from cycle {}",
                bpm, beats_per_cycle, cycle
            ),
            TelemetryEvent::SignalsCoalesced { count } => {
                format!("{} signals coalesced", count)
            }
        };
        println!("{:>8.3}s  {}", now, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_scenario_parses() {
        let scenario: Scenario =
            serde_json::from_str(include_str!("../../../demos/arena_round.json")).unwrap();
        assert_eq!(scenario.events.len(), 13);
        assert!(matches!(
            scenario.events[1].action,
            Action::Signal(StateSignal::CombatEntered)
        ));
        assert!(matches!(
            scenario.events[8].action,
            Action::Tempo { beats_per_cycle: 4, .. }
        ));
    }

    #[test]
    fn test_silent_library_covers_profile() {
        let profile = MusicProfile::default();
        let library = silent_library(&profile);
        for layer in LayerId::ALL {
            assert!(library.contains(&profile.layer_config(layer).asset));
        }
        assert!(library.contains("round_end_stinger"));
    }
}
