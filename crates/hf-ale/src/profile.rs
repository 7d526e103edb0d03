//! Music Profile
//!
//! Complete engine configuration, loaded from and saved to JSON.
//! Every field has a default matching the shipped HighFire content, so an
//! empty document `{}` is a valid profile.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::clock::{MAX_BEATS_PER_CYCLE, MAX_TEMPO, MIN_BEATS_PER_CYCLE, MIN_TEMPO, Tempo};
use crate::layers::LayerId;
use crate::rules::{Condition, PolicyTable, default_condition};
use crate::signals::HealthHysteresis;
use crate::transitions::FadeCurve;
use crate::{AleError, AleResult, MAX_CHANNELS, MAX_STINGERS};

/// Profile format version
pub const PROFILE_VERSION: &str = "1.0";

/// Longest fade accepted, in cycles
pub const MAX_FADE_CYCLES: f64 = 64.0;

fn default_version() -> String {
    PROFILE_VERSION.to_string()
}

fn default_tempo() -> f64 {
    85.0
}

fn default_beats() -> u32 {
    4
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_channels() -> usize {
    2
}

fn default_block_size() -> usize {
    512
}

fn default_threshold() -> f32 {
    0.30
}

fn default_hysteresis() -> f32 {
    0.05
}

fn default_finale_players() -> u32 {
    2
}

fn default_queue_capacity() -> usize {
    crate::DEFAULT_SIGNAL_QUEUE_CAPACITY
}

fn default_telemetry_capacity() -> usize {
    crate::DEFAULT_TELEMETRY_CAPACITY
}

fn default_fade_cycles() -> f64 {
    1.0
}

fn default_stinger_gain() -> f32 {
    0.9
}

fn default_round_end() -> Option<String> {
    Some("round_end".to_string())
}

/// Asset name a layer slot is shipped with
pub fn default_asset(layer: LayerId) -> &'static str {
    match layer {
        LayerId::Foundation => "basis_loop",
        LayerId::Combat => "combat_layer",
        LayerId::Intensity => "intensity_layer",
        LayerId::Finale => "finale_layer",
        LayerId::Menu => "menu_theme",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LAYER / STINGER CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration of one layer slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub layer: LayerId,
    pub asset: String,
    /// Sustain gain (0.0-1.0)
    pub gain: f32,
    #[serde(default = "default_fade_cycles")]
    pub fade_cycles: f64,
    /// Activation predicate; the slot's built-in binding when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl LayerConfig {
    pub fn new(layer: LayerId) -> Self {
        Self {
            layer,
            asset: default_asset(layer).to_string(),
            gain: layer.default_gain(),
            fade_cycles: default_fade_cycles(),
            condition: None,
        }
    }
}

/// Configuration of one stinger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StingerConfig {
    pub id: String,
    pub asset: String,
    #[serde(default = "default_stinger_gain")]
    pub gain: f32,
}

fn default_layers() -> Vec<LayerConfig> {
    LayerId::ALL.into_iter().map(LayerConfig::new).collect()
}

fn default_stingers() -> Vec<StingerConfig> {
    vec![StingerConfig {
        id: "round_end".to_string(),
        asset: "round_end_stinger".to_string(),
        gain: default_stinger_gain(),
    }]
}

/// A value that was out of range and got clamped
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MUSIC PROFILE
// ═══════════════════════════════════════════════════════════════════════════════

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicProfile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_tempo")]
    pub tempo_bpm: f64,
    #[serde(default = "default_beats")]
    pub beats_per_cycle: u32,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Low-health latch engages below this fraction
    #[serde(default = "default_threshold")]
    pub health_threshold: f32,
    /// Latch releases above threshold + this band
    #[serde(default = "default_hysteresis")]
    pub health_hysteresis: f32,
    /// Finale plays at this many players or fewer
    #[serde(default = "default_finale_players")]
    pub finale_players: u32,
    #[serde(default)]
    pub fade_curve: FadeCurve,

    #[serde(default = "default_queue_capacity")]
    pub signal_queue_capacity: usize,
    #[serde(default = "default_telemetry_capacity")]
    pub telemetry_capacity: usize,

    #[serde(default = "default_layers")]
    pub layers: Vec<LayerConfig>,
    #[serde(default = "default_stingers")]
    pub stingers: Vec<StingerConfig>,
    /// Stinger fired by RoundEnded
    #[serde(default = "default_round_end")]
    pub round_end_stinger: Option<String>,
}

impl Default for MusicProfile {
    fn default() -> Self {
        Self {
            version: default_version(),
            name: "highfire".to_string(),
            tempo_bpm: default_tempo(),
            beats_per_cycle: default_beats(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            block_size: default_block_size(),
            health_threshold: default_threshold(),
            health_hysteresis: default_hysteresis(),
            finale_players: default_finale_players(),
            fade_curve: FadeCurve::default(),
            signal_queue_capacity: default_queue_capacity(),
            telemetry_capacity: default_telemetry_capacity(),
            layers: default_layers(),
            stingers: default_stingers(),
            round_end_stinger: default_round_end(),
        }
    }
}

impl MusicProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load profile from JSON string
    pub fn from_json(json: &str) -> AleResult<Self> {
        let raw: serde_json::Value = serde_json::from_str(json)?;

        let version = raw["version"].as_str().unwrap_or(PROFILE_VERSION);
        if version != PROFILE_VERSION {
            return Err(AleError::ProfileError(format!(
                "Unknown profile version: {}",
                version
            )));
        }

        Ok(serde_json::from_value(raw)?)
    }

    /// Save profile to JSON string
    pub fn to_json(&self) -> AleResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> AleResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> AleResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Clamp out-of-range values. Never fails; each clamp is logged and returned.
    pub fn sanitize(&mut self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        clamp_f64(
            &mut self.tempo_bpm,
            MIN_TEMPO,
            MAX_TEMPO,
            default_tempo(),
            "tempo_bpm",
            &mut warnings,
        );
        clamp_ord(
            &mut self.beats_per_cycle,
            MIN_BEATS_PER_CYCLE,
            MAX_BEATS_PER_CYCLE,
            "beats_per_cycle",
            &mut warnings,
        );
        clamp_ord(&mut self.sample_rate, 8000, 192_000, "sample_rate", &mut warnings);
        clamp_ord(&mut self.channels, 1, MAX_CHANNELS, "channels", &mut warnings);
        clamp_ord(&mut self.block_size, 16, 8192, "block_size", &mut warnings);
        clamp_f32(
            &mut self.health_threshold,
            0.0,
            1.0,
            default_threshold(),
            "health_threshold",
            &mut warnings,
        );
        clamp_f32(
            &mut self.health_hysteresis,
            0.0,
            1.0,
            default_hysteresis(),
            "health_hysteresis",
            &mut warnings,
        );
        clamp_ord(
            &mut self.signal_queue_capacity,
            8,
            65536,
            "signal_queue_capacity",
            &mut warnings,
        );
        clamp_ord(
            &mut self.telemetry_capacity,
            8,
            65536,
            "telemetry_capacity",
            &mut warnings,
        );

        for layer in &mut self.layers {
            let name = layer.layer.name();
            clamp_f32(
                &mut layer.gain,
                0.0,
                1.0,
                layer.layer.default_gain(),
                &format!("layers.{}.gain", name),
                &mut warnings,
            );
            clamp_f64(
                &mut layer.fade_cycles,
                0.0,
                MAX_FADE_CYCLES,
                default_fade_cycles(),
                &format!("layers.{}.fade_cycles", name),
                &mut warnings,
            );
        }

        for stinger in &mut self.stingers {
            clamp_f32(
                &mut stinger.gain,
                0.0,
                1.0,
                default_stinger_gain(),
                &format!("stingers.{}.gain", stinger.id),
                &mut warnings,
            );
        }

        for warning in &warnings {
            log::warn!("Profile value clamped: {}", warning);
        }

        warnings
    }

    /// Validate structure
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let mut seen = [false; crate::LAYER_COUNT];
        for layer in &self.layers {
            if seen[layer.layer.index()] {
                errors.push(format!("Layer '{}' configured twice", layer.layer));
            }
            seen[layer.layer.index()] = true;

            if layer.asset.is_empty() {
                errors.push(format!("Layer '{}' has no asset", layer.layer));
            }
        }

        if self.stingers.len() > MAX_STINGERS {
            errors.push(format!(
                "{} stingers configured, at most {} supported",
                self.stingers.len(),
                MAX_STINGERS
            ));
        }

        for (i, stinger) in self.stingers.iter().enumerate() {
            if stinger.id.is_empty() {
                errors.push(format!("Stinger #{} has no id", i));
            }
            if stinger.asset.is_empty() {
                errors.push(format!("Stinger '{}' has no asset", stinger.id));
            }
            if self.stingers[..i].iter().any(|s| s.id == stinger.id) {
                errors.push(format!("Stinger '{}' configured twice", stinger.id));
            }
        }

        if let Some(ref id) = self.round_end_stinger {
            if !self.stingers.iter().any(|s| &s.id == id) {
                errors.push(format!("round_end_stinger references unknown stinger '{}'", id));
            }
        }

        if let Err(snapshot) = self.policy_table().check_exclusive() {
            errors.push(format!(
                "Menu layer can play together with combat layers (e.g. {:?})",
                snapshot
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Config of a layer, the slot default when not listed
    pub fn layer_config(&self, layer: LayerId) -> LayerConfig {
        self.layers
            .iter()
            .find(|l| l.layer == layer)
            .cloned()
            .unwrap_or_else(|| LayerConfig::new(layer))
    }

    /// Activation conditions of all layers
    pub fn policy_table(&self) -> PolicyTable {
        let mut table = PolicyTable::with_finale_players(self.finale_players);
        for layer in LayerId::ALL {
            let condition = self
                .layer_config(layer)
                .condition
                .unwrap_or_else(|| default_condition(layer, self.finale_players));
            table.set_condition(layer, condition);
        }
        table
    }

    pub fn tempo(&self) -> Tempo {
        Tempo::new(self.tempo_bpm, self.beats_per_cycle)
    }

    pub fn hysteresis(&self) -> HealthHysteresis {
        HealthHysteresis::new(self.health_threshold, self.health_hysteresis)
    }

    /// Index of the stinger RoundEnded fires
    pub fn round_end_index(&self) -> Option<usize> {
        let id = self.round_end_stinger.as_ref()?;
        self.stingers.iter().position(|s| &s.id == id)
    }
}

fn clamp_f64(
    value: &mut f64,
    min: f64,
    max: f64,
    fallback: f64,
    field: &str,
    warnings: &mut Vec<ConfigWarning>,
) {
    let original = *value;
    if !original.is_finite() {
        *value = fallback;
    } else {
        *value = original.clamp(min, max);
    }
    if value.to_bits() != original.to_bits() {
        warnings.push(ConfigWarning {
            field: field.to_string(),
            message: format!("{} out of range [{}, {}], using {}", original, min, max, value),
        });
    }
}

fn clamp_f32(
    value: &mut f32,
    min: f32,
    max: f32,
    fallback: f32,
    field: &str,
    warnings: &mut Vec<ConfigWarning>,
) {
    let mut wide = *value as f64;
    clamp_f64(&mut wide, min as f64, max as f64, fallback as f64, field, warnings);
    *value = wide as f32;
}

fn clamp_ord<T>(value: &mut T, min: T, max: T, field: &str, warnings: &mut Vec<ConfigWarning>)
where
    T: Ord + Copy + fmt::Display,
{
    let original = *value;
    *value = original.clamp(min, max);
    if *value != original {
        warnings.push(ConfigWarning {
            field: field.to_string(),
            message: format!("{} out of range [{}, {}], using {}", original, min, max, value),
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROFILE BUILDER
// ═══════════════════════════════════════════════════════════════════════════════

/// Fluent builder for profiles
#[derive(Debug, Default)]
pub struct ProfileBuilder {
    profile: MusicProfile,
}

impl ProfileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: &str) -> Self {
        self.profile.name = name.to_string();
        self
    }

    pub fn tempo(mut self, bpm: f64, beats_per_cycle: u32) -> Self {
        self.profile.tempo_bpm = bpm;
        self.profile.beats_per_cycle = beats_per_cycle;
        self
    }

    pub fn audio(mut self, sample_rate: u32, channels: usize, block_size: usize) -> Self {
        self.profile.sample_rate = sample_rate;
        self.profile.channels = channels;
        self.profile.block_size = block_size;
        self
    }

    pub fn health(mut self, threshold: f32, hysteresis: f32) -> Self {
        self.profile.health_threshold = threshold;
        self.profile.health_hysteresis = hysteresis;
        self
    }

    pub fn finale_players(mut self, players: u32) -> Self {
        self.profile.finale_players = players;
        self
    }

    pub fn fade_curve(mut self, curve: FadeCurve) -> Self {
        self.profile.fade_curve = curve;
        self
    }

    /// Set the fade length of every layer
    pub fn fade_cycles(mut self, cycles: f64) -> Self {
        for layer in &mut self.profile.layers {
            layer.fade_cycles = cycles;
        }
        self
    }

    pub fn layer(mut self, config: LayerConfig) -> Self {
        self.profile.layers.retain(|l| l.layer != config.layer);
        self.profile.layers.push(config);
        self
    }

    pub fn stinger(mut self, id: &str, asset: &str, gain: f32) -> Self {
        self.profile.stingers.retain(|s| s.id != id);
        self.profile.stingers.push(StingerConfig {
            id: id.to_string(),
            asset: asset.to_string(),
            gain,
        });
        self
    }

    pub fn round_end_stinger(mut self, id: Option<&str>) -> Self {
        self.profile.round_end_stinger = id.map(str::to_string);
        self
    }

    pub fn build(self) -> MusicProfile {
        self.profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_content() {
        let profile = MusicProfile::default();
        assert_eq!(profile.tempo_bpm, 85.0);
        assert_eq!(profile.beats_per_cycle, 4);
        assert!((profile.health_threshold - 0.30).abs() < 1e-6);
        assert_eq!(profile.finale_players, 2);
        assert_eq!(profile.fade_curve, FadeCurve::SCurve);
        assert_eq!(profile.layers.len(), 5);
        assert!((profile.layer_config(LayerId::Foundation).gain - 0.8).abs() < 1e-6);
        assert_eq!(profile.round_end_index(), Some(0));
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_empty_json_is_default() {
        let profile = MusicProfile::from_json("{}").unwrap();
        let mut expected = MusicProfile::default();
        expected.name = String::new();
        assert_eq!(profile, expected);
    }

    #[test]
    fn test_json_roundtrip() {
        let profile = ProfileBuilder::new()
            .name("arena")
            .tempo(120.0, 3)
            .fade_cycles(2.0)
            .stinger("victory", "victory_hit", 0.7)
            .build();

        let json = profile.to_json().unwrap();
        let loaded = MusicProfile::from_json(&json).unwrap();
        assert_eq!(loaded, profile);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let result = MusicProfile::from_json(r#"{"version":"9.0"}"#);
        assert!(matches!(result, Err(AleError::ProfileError(_))));
    }

    #[test]
    fn test_sanitize_clamps() {
        let mut profile = ProfileBuilder::new()
            .tempo(1000.0, 0)
            .health(-0.5, 0.05)
            .fade_cycles(f64::NAN)
            .build();

        let warnings = profile.sanitize();
        assert_eq!(profile.tempo_bpm, MAX_TEMPO);
        assert_eq!(profile.beats_per_cycle, 1);
        assert_eq!(profile.health_threshold, 0.0);
        assert!(profile.layers.iter().all(|l| l.fade_cycles == 1.0));
        // tempo, beats, threshold, five fade lengths
        assert_eq!(warnings.len(), 8);
        assert!(warnings.iter().any(|w| w.field == "tempo_bpm"));
    }

    #[test]
    fn test_sanitize_leaves_valid_profile_alone() {
        let mut profile = MusicProfile::default();
        assert!(profile.sanitize().is_empty());
        assert_eq!(profile, MusicProfile::default());
    }

    #[test]
    fn test_validate_errors() {
        let mut profile = MusicProfile::default();
        profile.layers.push(LayerConfig::new(LayerId::Combat));
        profile.round_end_stinger = Some("missing".to_string());
        profile.stingers.push(profile.stingers[0].clone());

        let errors = profile.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_validate_rejects_overlapping_menu() {
        let profile = ProfileBuilder::new()
            .layer(LayerConfig {
                condition: Some(Condition::InMenu),
                ..LayerConfig::new(LayerId::Menu)
            })
            .layer(LayerConfig {
                condition: Some(Condition::Always),
                ..LayerConfig::new(LayerId::Combat)
            })
            .build();

        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_custom_condition_in_policy() {
        let json = r#"{
            "layers": [
                {"layer": "finale", "asset": "pad", "gain": 0.5,
                 "condition": {"type": "players_at_most", "count": 3}}
            ]
        }"#;
        let profile = MusicProfile::from_json(json).unwrap();
        let table = profile.policy_table();
        assert_eq!(
            table.condition(LayerId::Finale),
            &Condition::PlayersAtMost { count: 3 }
        );
        // Unlisted layers fall back to their slot defaults
        assert_eq!(table.condition(LayerId::Combat), &Condition::InCombat);
        assert_eq!(profile.layer_config(LayerId::Menu).asset, "menu_theme");
    }
}
