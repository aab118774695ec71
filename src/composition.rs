//! Whole-pattern import from a composition document (a generated or shared
//! song), e.g.
//!
//! ```json
//! { "title": "Boss Fight", "tempo": 140,
//!   "channels": [ { "name": "pulse50", "patternLength": 16,
//!                   "notes": [ { "step": 0, "pitch": "E4" } ] } ] }
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SeqError};
use crate::note::Pitch;
use crate::pattern::{PatternChange, PatternStore};

/// Imported channels play at full volume unless the document says otherwise.
pub const IMPORT_VOLUME: f32 = 1.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Composition {
    #[serde(default)]
    pub title:    Option<String>,
    #[serde(default, alias = "tempo")]
    pub bpm:      Option<f64>,
    pub channels: Vec<CompositionChannel>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionChannel {
    #[serde(alias = "name")]
    pub instrument:     String,
    #[serde(default)]
    pub pattern_length: Option<usize>,
    #[serde(default)]
    pub volume:         Option<f32>,
    #[serde(default)]
    pub muted:          bool,
    #[serde(default)]
    pub notes:          Vec<CompositionNote>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompositionNote {
    pub step:  usize,
    pub pitch: Pitch,
}

impl Composition {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).context("Failed to parse composition")
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read composition {}", path.display()))?;
        Self::from_json(&text)
    }

    /// The first channel's pattern length, if it gives one.
    pub fn pattern_length(&self) -> Option<usize> {
        self.channels.first().and_then(|c| c.pattern_length)
    }

    pub fn note_count(&self) -> usize {
        self.channels.iter().map(|c| c.notes.len()).sum()
    }

    /// Build a standalone store holding this composition, `fallback_steps`
    /// long when no pattern length is given.
    pub fn to_store(&self, fallback_steps: usize) -> Result<PatternStore> {
        let steps = self.pattern_length().unwrap_or(fallback_steps);
        let ids: Vec<&str> = self.channels.iter().map(|c| c.instrument.as_str()).collect();
        let mut store = PatternStore::with_instruments(ids.as_slice(), steps)?;
        for (row, ch) in self.channels.iter().enumerate() {
            store.set_volume(row, ch.volume.unwrap_or(IMPORT_VOLUME))?;
            store.set_muted(row, ch.muted)?;
            for note in &ch.notes {
                match store.set_step(row, note.step, true, Some(note.pitch.clone())) {
                    Ok(_) => {}
                    Err(SeqError::IndexOutOfRange { .. }) => {
                        log::warn!("channel {}: note at step {} is past the {}-step pattern, skipped", row, note.step, steps);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(store)
    }
}

impl PatternStore {
    /// Replace the whole pattern with a composition. Subscribers see a single
    /// `CompositionApplied` rather than one change per cell. A composition
    /// without a pattern length keeps the current step count.
    pub fn apply_composition(&mut self, composition: &Composition) -> Result<PatternChange> {
        let fresh = composition.to_store(self.step_count())?;
        let (channels, steps) = (fresh.channel_count(), fresh.step_count());
        self.replace_with(fresh);
        log::info!(
            "applied composition {:?}: {} channels x {} steps, {} notes",
            composition.title.as_deref().unwrap_or("untitled"), channels, steps, composition.note_count()
        );
        Ok(self.announce(PatternChange::CompositionApplied {
            title: composition.title.clone(),
            channels,
            steps,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::DEFAULT_STEPS;

    const DOC: &str = r#"{
        "title": "Overworld",
        "tempo": 132,
        "channels": [
            { "name": "pulse50", "patternLength": 8,
              "notes": [ { "step": 0, "pitch": "E4" }, { "step": 1, "pitch": "G4" }, { "step": 12, "pitch": "C5" } ] },
            { "instrument": "drum-kick", "volume": 0.6, "notes": [ { "step": 4, "pitch": "C2" } ] }
        ]
    }"#;

    #[test]
    fn parses_both_field_spellings() {
        let comp = Composition::from_json(DOC).unwrap();
        assert_eq!(comp.bpm, Some(132.0));
        assert_eq!(comp.channels[0].instrument, "pulse50");
        assert_eq!(comp.channels[1].instrument, "drum-kick");
        assert_eq!(comp.pattern_length(), Some(8));
        assert_eq!(comp.note_count(), 4);
    }

    #[test]
    fn bad_pitch_fails_the_whole_document() {
        let doc = r#"{ "channels": [ { "name": "sine", "notes": [ { "step": 0, "pitch": "Q7" } ] } ] }"#;
        assert!(Composition::from_json(doc).is_err());
    }

    #[test]
    fn apply_replaces_pattern_and_skips_out_of_range_notes() {
        let comp = Composition::from_json(DOC).unwrap();
        let mut store = PatternStore::with_instruments(&["square"; 4], 16).unwrap();
        store.set_step(3, 15, true, None).unwrap();
        let rx = store.subscribe();

        let change = store.apply_composition(&comp).unwrap();
        assert_eq!(change, PatternChange::CompositionApplied { title: Some("Overworld".into()), channels: 2, steps: 8 });
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![change]);

        assert_eq!(store.channel_count(), 2);
        assert_eq!(store.step_count(), 8);
        assert_eq!(store.pitch(0, 1).unwrap().map(Pitch::as_str), Some("G4"));
        assert!(store.is_active(1, 4).unwrap());
        assert_eq!(store.channel(0).unwrap().volume, IMPORT_VOLUME);
        assert_eq!(store.channel(1).unwrap().volume, 0.6);
    }

    #[test]
    fn missing_pattern_length_uses_the_fallback() {
        let comp = Composition::from_json(r#"{ "channels": [ { "name": "sine" } ] }"#).unwrap();
        assert_eq!(comp.pattern_length(), None);
        assert_eq!(comp.to_store(DEFAULT_STEPS).unwrap().step_count(), DEFAULT_STEPS);
    }

    #[test]
    fn missing_pattern_length_keeps_the_store_length() {
        let comp = Composition::from_json(r#"{ "channels": [ { "name": "sine", "notes": [ { "step": 10, "pitch": "A4" } ] } ] }"#).unwrap();
        let mut store = PatternStore::new(12).unwrap();
        store.apply_composition(&comp).unwrap();
        assert_eq!(store.step_count(), 12);
        assert!(store.is_active(0, 10).unwrap());
    }

    #[test]
    fn zero_length_pattern_is_rejected() {
        let comp = Composition::from_json(r#"{ "channels": [ { "name": "sine", "patternLength": 0 } ] }"#).unwrap();
        assert!(matches!(comp.to_store(DEFAULT_STEPS), Err(SeqError::InvalidStepCount(0))));
    }
}
