//! Error taxonomy for the sequencer engine.

use std::fmt;

/// Errors raised by the pattern store, clock, registry and exporter.
#[derive(Debug, Clone, PartialEq)]
pub enum SeqError {
    /// A channel or step index outside the current pattern bounds.
    IndexOutOfRange { channel: usize, step: usize },
    /// Pattern length must be at least one step.
    InvalidStepCount(usize),
    /// Tempo must be positive and finite.
    InvalidBpm(f64),
    /// Pitch edits are only meaningful on active steps.
    InactiveStep { channel: usize, step: usize },
    /// A note label that could not be parsed (e.g. "H9").
    InvalidPitch(String),
    /// Registry lookup miss.
    UnknownInstrument(String),
    /// The clock refused to schedule (suspended, no device).
    ClockUnavailable(String),
    /// The export one-shot never fired within the allowed slack.
    ExportTimingFailure { expected_frames: u64, rendered_frames: u64 },
    /// Export was asked for a loop length the pattern doesn't have.
    StepCountMismatch { expected: usize, actual: usize },
    /// Output device could not be opened or driven.
    AudioDevice(String),
}

impl fmt::Display for SeqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeqError::IndexOutOfRange { channel, step } => {
                write!(f, "Index out of range: channel {}, step {}", channel, step)
            }
            SeqError::InvalidStepCount(n) => write!(f, "Invalid step count: {}", n),
            SeqError::InvalidBpm(bpm) => write!(f, "Invalid BPM: {}", bpm),
            SeqError::InactiveStep { channel, step } => {
                write!(f, "Step {} on channel {} is not active", step, channel)
            }
            SeqError::InvalidPitch(label) => write!(f, "Invalid pitch: {:?}", label),
            SeqError::UnknownInstrument(id) => write!(f, "Unknown instrument: {}", id),
            SeqError::ClockUnavailable(msg) => write!(f, "Clock unavailable: {}", msg),
            SeqError::ExportTimingFailure { expected_frames, rendered_frames } => write!(
                f,
                "Export stop never fired: expected {} frames, rendered {}",
                expected_frames, rendered_frames
            ),
            SeqError::StepCountMismatch { expected, actual } => write!(
                f,
                "Step count mismatch: export asked for {}, pattern has {}",
                expected, actual
            ),
            SeqError::AudioDevice(msg) => write!(f, "Audio device error: {}", msg),
        }
    }
}

impl std::error::Error for SeqError {}

pub type Result<T> = std::result::Result<T, SeqError>;
