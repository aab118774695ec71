//! Instrument registry.
//!
//! The scheduler never knows what an instrument is; it hands a [`Trigger`] to
//! [`VoiceRegistry::dispatch`] under the channel's instrument id and the
//! registry decides whether anything sounds.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Result, SeqError};
use crate::instruments;
use crate::note::Pitch;

// ── Capability ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    /// Needs a pitch; sustains for the run duration.
    Pitched,
    /// Ignores pitch; decays on its own.
    Unpitched,
}

/// One note-on as the scheduler sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct Trigger {
    /// Audio time of the step boundary, in seconds on the driving clock.
    pub time:           f64,
    pub pitch:          Option<Pitch>,
    pub duration_steps: usize,
    /// Length of one step at the tempo in force when the trigger fired.
    pub step_seconds:   f64,
    /// Channel volume, 0.0–1.0.
    pub gain:           f32,
}

impl Trigger {
    pub fn duration_seconds(&self) -> f64 {
        self.duration_steps as f64 * self.step_seconds
    }
}

pub trait Instrument: Send {
    fn trigger_kind(&self) -> TriggerKind;

    /// Queue a note. The voice starts sounding at `trigger.time`.
    fn trigger(&mut self, trigger: &Trigger);

    /// Next mono sample for absolute frame `frame` of the driving clock.
    fn render(&mut self, frame: u64) -> f32;

    /// Drop every sounding or queued voice.
    fn silence(&mut self);

    /// Same instrument, no voice state.
    fn fresh(&self) -> Box<dyn Instrument>;
}

// ── Dispatch outcome ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Fired,
    /// Instrument exists but the channel is muted.
    Muted,
    /// No entry for the id; nothing happened.
    UnknownInstrument,
    /// Pitched instrument triggered without a pitch.
    MissingPitch,
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct VoiceRegistry {
    instruments: BTreeMap<String, Box<dyn Instrument>>,
}

impl VoiceRegistry {
    pub fn new() -> Self { Self::default() }

    /// Registry pre-loaded with every built-in instrument.
    pub fn with_builtin(sample_rate: u32) -> Self {
        let mut reg = Self::new();
        for (id, inst) in instruments::builtin(sample_rate) {
            reg.register(id, inst);
        }
        reg
    }

    /// Add or replace an instrument. Returns the one it displaced.
    pub fn register(&mut self, id: impl Into<String>, instrument: Box<dyn Instrument>) -> Option<Box<dyn Instrument>> {
        self.instruments.insert(id.into(), instrument)
    }

    pub fn remove(&mut self, id: &str) -> Option<Box<dyn Instrument>> {
        self.instruments.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool { self.instruments.contains_key(id) }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.instruments.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize { self.instruments.len() }

    pub fn is_empty(&self) -> bool { self.instruments.is_empty() }

    pub fn trigger_kind(&self, id: &str) -> Result<TriggerKind> {
        self.instruments
            .get(id)
            .map(|i| i.trigger_kind())
            .ok_or_else(|| SeqError::UnknownInstrument(id.to_string()))
    }

    /// Route one trigger. Never fails: a missing id or a muted channel is
    /// reported through the returned [`Dispatch`].
    pub fn dispatch(&mut self, id: &str, muted: bool, trigger: &Trigger) -> Dispatch {
        let Some(inst) = self.instruments.get_mut(id) else {
            return Dispatch::UnknownInstrument;
        };
        if muted {
            return Dispatch::Muted;
        }
        if inst.trigger_kind() == TriggerKind::Pitched && trigger.pitch.is_none() {
            return Dispatch::MissingPitch;
        }
        inst.trigger(trigger);
        Dispatch::Fired
    }

    /// Mix every instrument for one frame, soft-clipped.
    pub fn render(&mut self, frame: u64) -> f32 {
        self.instruments
            .values_mut()
            .map(|i| i.render(frame))
            .sum::<f32>()
            .tanh()
    }

    pub fn silence(&mut self) {
        for inst in self.instruments.values_mut() {
            inst.silence();
        }
    }

    /// Same id → instrument mapping with no voice state. Used by the
    /// exporter so a render never inherits or disturbs live voices.
    pub fn fresh_copy(&self) -> Self {
        Self {
            instruments: self
                .instruments
                .iter()
                .map(|(id, inst)| (id.clone(), inst.fresh()))
                .collect(),
        }
    }
}
