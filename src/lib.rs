//! loopseq - a loop-based step sequencer engine
//!
//! - Pattern state (steps, pitches, volume, mute) per channel
//! - Run extraction: contiguous active steps become one sustained note
//! - Tick-synchronised scheduler driven by a musical clock
//! - Instrument registry decoupling the scheduler from voices
//! - One-loop export to an audio buffer / WAV file

pub mod audio;
pub mod clock;
pub mod composition;
pub mod config;
pub mod error;
pub mod export;
pub mod instruments;
pub mod note;
pub mod pattern;
pub mod runs;
pub mod scheduler;
pub mod transport;
pub mod voices;
pub mod wav;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// Re-export commonly used types
pub use clock::{CallbackHandle, FrameClock, MusicalClock, SampleClock, Subdivision};
pub use composition::Composition;
pub use config::EngineConfig;
pub use error::SeqError;
pub use export::{AudioBuffer, BufferSink, CaptureSink, LoopExporter};
pub use note::Pitch;
pub use pattern::{Channel, PatternChange, PatternStore};
pub use runs::{extract_runs, NoteEvent};
pub use scheduler::{PlaybackEvent, Scheduler};
pub use transport::{Transport, TransportState};
pub use voices::{Dispatch, Instrument, Trigger, TriggerKind, VoiceRegistry};

/// Pattern state shared between the editing layer (writer) and playback (reader).
pub type SharedPattern = Arc<Mutex<PatternStore>>;

/// Instrument registry shared between the scheduler and the audio render path.
pub type SharedVoices = Arc<Mutex<VoiceRegistry>>;

pub fn share<T>(value: T) -> Arc<Mutex<T>> {
    Arc::new(Mutex::new(value))
}

/// Lock, recovering the data if another holder panicked. Playback must keep
/// running even if an editing thread died mid-update.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
