//! Collapse contiguous active steps into sustained notes.
//!
//! The pattern is treated as linear: step 0 never continues a run that ended
//! on the last step, and a run touching the last step stops there.

use serde::Serialize;

use crate::error::Result;
use crate::note::Pitch;
use crate::pattern::PatternStore;

/// One sustain spanning `length_in_steps` contiguous active cells.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NoteEvent {
    pub channel:         usize,
    pub start_step:      usize,
    pub pitch:           Pitch,
    pub length_in_steps: usize,
}

impl NoteEvent {
    pub fn end_step(&self) -> usize { self.start_step + self.length_in_steps }
}

/// If `step` starts a run, return the run's length.
///
/// A run starts at `s` when `row[s]` is on and either `s == 0` or
/// `row[s - 1]` is off. Out-of-range steps never start a run.
pub fn run_length_at(row: &[bool], step: usize) -> Option<usize> {
    if !row.get(step).copied().unwrap_or(false) {
        return None;
    }
    if step > 0 && row[step - 1] {
        return None;
    }
    Some(row[step..].iter().take_while(|on| **on).count())
}

/// Every run in one channel's row, ordered by start step.
pub fn extract_runs(channel: usize, active: &[bool], pitches: &[Option<Pitch>]) -> Vec<NoteEvent> {
    let mut events = Vec::new();
    let mut step = 0;
    while step < active.len() {
        match run_length_at(active, step) {
            Some(len) => {
                let pitch = pitches.get(step).cloned().flatten().unwrap_or_default();
                events.push(NoteEvent { channel, start_step: step, pitch, length_in_steps: len });
                step += len;
            }
            None => step += 1,
        }
    }
    events
}

pub fn channel_runs(store: &PatternStore, channel: usize) -> Result<Vec<NoteEvent>> {
    Ok(extract_runs(channel, store.row(channel)?, store.pitch_row(channel)?))
}

/// Runs for all channels, channel-major.
pub fn all_runs(store: &PatternStore) -> Vec<NoteEvent> {
    (0..store.channel_count())
        .filter_map(|ch| channel_runs(store, ch).ok())
        .flatten()
        .collect()
}
