//! Per-channel step, pitch, volume and mute state.
//!
//! `PatternStore` is the single source of truth for what should play. The
//! editing layer owns it and is its only writer; the scheduler and exporter
//! only read. Every mutator returns a typed [`PatternChange`] and broadcasts
//! the same value to all subscribers, so persistence and rendering layers can
//! react without polling.

use std::sync::mpsc::{channel, Receiver, Sender};

use serde::Serialize;

use crate::error::{Result, SeqError};
use crate::note::Pitch;

pub const DEFAULT_VOLUME: f32 = 0.8;
pub const DEFAULT_INSTRUMENT: &str = "square";
pub const DEFAULT_STEPS: usize = 16;

// ── Channel ───────────────────────────────────────────────────────────────────

/// One sequencer row: which instrument it drives and its gain-path settings.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Channel {
    pub instrument_id: String,
    pub volume:        f32,
    pub muted:         bool,
}

impl Channel {
    pub fn new(instrument_id: impl Into<String>) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            volume:        DEFAULT_VOLUME,
            muted:         false,
        }
    }
}

// ── Change notifications ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PatternChange {
    CellChanged { channel: usize, step: usize, active: bool, pitch: Option<Pitch> },
    RangeChanged { channel: usize, from: usize, to: usize, active: bool },
    PitchChanged { channel: usize, step: usize, pitch: Pitch },
    Resized { channels: usize, steps: usize },
    ChannelAdded { channel: usize, instrument: String },
    ChannelRemoved { channel: usize },
    InstrumentChanged { channel: usize, instrument: String },
    VolumeChanged { channel: usize, volume: f32 },
    MuteChanged { channel: usize, muted: bool },
    Cleared,
    CompositionApplied { title: Option<String>, channels: usize, steps: usize },
}

// ── Pattern store ─────────────────────────────────────────────────────────────

pub struct PatternStore {
    channels:   Vec<Channel>,
    active:     Vec<Vec<bool>>,
    pitches:    Vec<Vec<Option<Pitch>>>,
    step_count: usize,
    listeners:  Vec<Sender<PatternChange>>,
}

impl PatternStore {
    pub fn new(step_count: usize) -> Result<Self> {
        if step_count == 0 {
            return Err(SeqError::InvalidStepCount(step_count));
        }
        Ok(Self {
            channels:   Vec::new(),
            active:     Vec::new(),
            pitches:    Vec::new(),
            step_count,
            listeners:  Vec::new(),
        })
    }

    /// Build a store with one channel per instrument id.
    pub fn with_instruments<S: AsRef<str>>(instruments: &[S], step_count: usize) -> Result<Self> {
        let mut store = Self::new(step_count)?;
        for id in instruments {
            store.push_channel(Channel::new(id.as_ref()));
        }
        Ok(store)
    }

    /// Receive every change made from now on. Dropped receivers are pruned
    /// on the next broadcast.
    pub fn subscribe(&mut self) -> Receiver<PatternChange> {
        let (tx, rx) = channel();
        self.listeners.push(tx);
        rx
    }

    fn emit(&mut self, change: PatternChange) -> PatternChange {
        self.listeners.retain(|tx| tx.send(change.clone()).is_ok());
        change
    }

    // ── Read accessors ────────────────────────────────────────────────────

    pub fn channel_count(&self) -> usize { self.channels.len() }

    pub fn step_count(&self) -> usize { self.step_count }

    pub fn channels(&self) -> &[Channel] { &self.channels }

    pub fn channel(&self, channel: usize) -> Result<&Channel> {
        self.channels.get(channel).ok_or(SeqError::IndexOutOfRange { channel, step: 0 })
    }

    /// Activation row for one channel.
    pub fn row(&self, channel: usize) -> Result<&[bool]> {
        self.active
            .get(channel)
            .map(Vec::as_slice)
            .ok_or(SeqError::IndexOutOfRange { channel, step: 0 })
    }

    /// Pitch row for one channel; `None` wherever the step is inactive.
    pub fn pitch_row(&self, channel: usize) -> Result<&[Option<Pitch>]> {
        self.pitches
            .get(channel)
            .map(Vec::as_slice)
            .ok_or(SeqError::IndexOutOfRange { channel, step: 0 })
    }

    pub fn is_active(&self, channel: usize, step: usize) -> Result<bool> {
        self.check(channel, step)?;
        Ok(self.active[channel][step])
    }

    pub fn pitch(&self, channel: usize, step: usize) -> Result<Option<&Pitch>> {
        self.check(channel, step)?;
        Ok(self.pitches[channel][step].as_ref())
    }

    /// The pitch that would sound at this cell, falling back to the default.
    pub fn pitch_or_default(&self, channel: usize, step: usize) -> Result<Pitch> {
        Ok(self.pitch(channel, step)?.cloned().unwrap_or_default())
    }

    fn check(&self, channel: usize, step: usize) -> Result<()> {
        if channel < self.channels.len() && step < self.step_count {
            Ok(())
        } else {
            Err(SeqError::IndexOutOfRange { channel, step })
        }
    }

    // ── Structural mutators ───────────────────────────────────────────────

    /// Reallocate to `channel_count × step_count`, keeping the overlapping
    /// region. New cells are off with no pitch; new channels get the default
    /// instrument, volume 0.8 and are unmuted.
    pub fn resize(&mut self, channel_count: usize, step_count: usize) -> Result<PatternChange> {
        if step_count == 0 {
            return Err(SeqError::InvalidStepCount(step_count));
        }
        self.step_count = step_count;
        self.channels.truncate(channel_count);
        self.active.truncate(channel_count);
        self.pitches.truncate(channel_count);
        for row in &mut self.active  { row.resize(step_count, false); }
        for row in &mut self.pitches { row.resize(step_count, None); }
        while self.channels.len() < channel_count {
            self.push_channel(Channel::new(DEFAULT_INSTRUMENT));
        }
        log::debug!("pattern resized to {} x {}", channel_count, step_count);
        Ok(self.emit(PatternChange::Resized { channels: channel_count, steps: step_count }))
    }

    pub fn add_channel(&mut self, instrument_id: impl Into<String>) -> PatternChange {
        let instrument: String = instrument_id.into();
        self.push_channel(Channel::new(instrument.clone()));
        let channel = self.channels.len() - 1;
        self.emit(PatternChange::ChannelAdded { channel, instrument })
    }

    pub fn remove_channel(&mut self, channel: usize) -> Result<PatternChange> {
        if channel >= self.channels.len() {
            return Err(SeqError::IndexOutOfRange { channel, step: 0 });
        }
        self.channels.remove(channel);
        self.active.remove(channel);
        self.pitches.remove(channel);
        Ok(self.emit(PatternChange::ChannelRemoved { channel }))
    }

    fn push_channel(&mut self, ch: Channel) {
        self.channels.push(ch);
        self.active.push(vec![false; self.step_count]);
        self.pitches.push(vec![None; self.step_count]);
    }

    // ── Cell mutators ─────────────────────────────────────────────────────

    /// Switch one cell on or off.
    ///
    /// Turning a cell on keeps an explicit `pitch` if given, else whatever
    /// pitch the cell already carries, else the default. Turning it off
    /// clears the pitch so a later activation starts from the default again.
    pub fn set_step(
        &mut self,
        channel: usize,
        step: usize,
        active: bool,
        pitch: Option<Pitch>,
    ) -> Result<PatternChange> {
        self.check(channel, step)?;
        self.write_cell(channel, step, active, pitch);
        let pitch = self.pitches[channel][step].clone();
        Ok(self.emit(PatternChange::CellChanged { channel, step, active, pitch }))
    }

    pub fn toggle_step(&mut self, channel: usize, step: usize) -> Result<PatternChange> {
        let on = self.is_active(channel, step)?;
        self.set_step(channel, step, !on, None)
    }

    /// Bulk-set an inclusive range (drag stretch). Endpoints may come in
    /// either order.
    pub fn set_range(
        &mut self,
        channel: usize,
        from_step: usize,
        to_step: usize,
        active: bool,
    ) -> Result<PatternChange> {
        let (from, to) = (from_step.min(to_step), from_step.max(to_step));
        self.check(channel, from)?;
        self.check(channel, to)?;
        for step in from..=to {
            self.write_cell(channel, step, active, None);
        }
        Ok(self.emit(PatternChange::RangeChanged { channel, from, to, active }))
    }

    fn write_cell(&mut self, channel: usize, step: usize, active: bool, pitch: Option<Pitch>) {
        self.active[channel][step] = active;
        let previous = self.pitches[channel][step].take();
        self.pitches[channel][step] = if active {
            Some(pitch.or(previous).unwrap_or_default())
        } else {
            None
        };
    }

    /// Change the note on an already active cell.
    pub fn set_pitch(&mut self, channel: usize, step: usize, pitch: Pitch) -> Result<PatternChange> {
        if !self.is_active(channel, step)? {
            return Err(SeqError::InactiveStep { channel, step });
        }
        self.pitches[channel][step] = Some(pitch.clone());
        Ok(self.emit(PatternChange::PitchChanged { channel, step, pitch }))
    }

    /// Switch every cell off, clearing all pitches. Channels stay.
    pub fn clear(&mut self) -> PatternChange {
        for row in &mut self.active  { row.fill(false); }
        for row in &mut self.pitches { row.fill(None); }
        self.emit(PatternChange::Cleared)
    }

    // ── Channel settings ──────────────────────────────────────────────────

    /// Point a channel at another instrument. Step data is untouched.
    pub fn set_instrument(&mut self, channel: usize, instrument_id: impl Into<String>) -> Result<PatternChange> {
        let instrument: String = instrument_id.into();
        let ch = self.channels.get_mut(channel).ok_or(SeqError::IndexOutOfRange { channel, step: 0 })?;
        ch.instrument_id = instrument.clone();
        Ok(self.emit(PatternChange::InstrumentChanged { channel, instrument }))
    }

    pub fn set_volume(&mut self, channel: usize, value: f32) -> Result<PatternChange> {
        let ch = self.channels.get_mut(channel).ok_or(SeqError::IndexOutOfRange { channel, step: 0 })?;
        ch.volume = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        let volume = ch.volume;
        Ok(self.emit(PatternChange::VolumeChanged { channel, volume }))
    }

    pub fn set_muted(&mut self, channel: usize, muted: bool) -> Result<PatternChange> {
        let ch = self.channels.get_mut(channel).ok_or(SeqError::IndexOutOfRange { channel, step: 0 })?;
        ch.muted = muted;
        Ok(self.emit(PatternChange::MuteChanged { channel, muted }))
    }

    /// Take over another store's channels and cells, keeping our subscribers.
    pub(crate) fn replace_with(&mut self, other: PatternStore) {
        self.channels   = other.channels;
        self.active     = other.active;
        self.pitches    = other.pitches;
        self.step_count = other.step_count;
    }

    pub(crate) fn announce(&mut self, change: PatternChange) -> PatternChange {
        self.emit(change)
    }
}
