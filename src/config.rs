use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::clock::{Subdivision, DEFAULT_PPQ};
use crate::instruments;
use crate::pattern::DEFAULT_STEPS;
use crate::voices::VoiceRegistry;

pub const MIN_BPM: f64 = 30.0;
pub const MAX_BPM: f64 = 300.0;

// ── Engine config ─────────────────────────────────────────────────────────────

/// Engine-wide settings. Every field is optional in the JSON file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate:     u32,
    pub ppq:             u32,
    pub subdivision:     Subdivision,
    pub bpm:             f64,
    pub steps:           usize,
    /// How far past the loop end an export may run before it is abandoned.
    pub export_slack_ms: u64,
    /// Extra instrument ids mapped onto built-in ones, e.g. `"lead": "sawtooth"`.
    pub instruments:     BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate:     44_100,
            ppq:             DEFAULT_PPQ,
            subdivision:     Subdivision::Sixteenth,
            bpm:             120.0,
            steps:           DEFAULT_STEPS,
            export_slack_ms: 250,
            instruments:     BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_json::from_str(text).context("Failed to parse engine config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let cfg = Self::from_json(&text)?;
        log::info!("loaded config from {}", path.display());
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.sample_rate == 0 {
            bail!("sample_rate must be positive");
        }
        let per_beat = self.subdivision.per_beat();
        if self.ppq < per_beat || self.ppq % per_beat != 0 {
            bail!("ppq {} does not divide into whole {:?} steps", self.ppq, self.subdivision);
        }
        if self.steps == 0 {
            bail!("steps must be at least 1");
        }
        for (alias, target) in &self.instruments {
            if !instruments::INSTRUMENT_OPTIONS.contains(&target.as_str()) {
                bail!("instrument {:?} maps to unknown built-in {:?}", alias, target);
            }
        }
        Ok(())
    }

    pub fn clamp_bpm(bpm: f64) -> f64 {
        if bpm.is_nan() { MIN_BPM } else { bpm.clamp(MIN_BPM, MAX_BPM) }
    }

    pub fn export_slack_seconds(&self) -> f64 { self.export_slack_ms as f64 / 1000.0 }

    /// Built-in instruments plus the configured aliases.
    pub fn voice_registry(&self) -> VoiceRegistry {
        let mut reg = VoiceRegistry::with_builtin(self.sample_rate);
        for (alias, target) in &self.instruments {
            if let Some(inst) = instruments::create(target, self.sample_rate) {
                reg.register(alias.clone(), inst);
            }
        }
        reg
    }
}
