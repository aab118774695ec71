use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeqError};

/// Label assigned to a step that is switched on without an explicit note.
pub const DEFAULT_PITCH: &str = "C4";

const NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

// ── Pitch label ───────────────────────────────────────────────────────────────

/// A note-name label such as `C4`, `A#3` or `Bb2`.
///
/// The label is kept verbatim (it is what the editing layer shows in a cell);
/// the MIDI number is resolved once at construction so voices never re-parse.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pitch {
    label: String,
    midi:  u8,
}

impl Pitch {
    pub fn new(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let midi = parse_midi(&label).ok_or_else(|| SeqError::InvalidPitch(label.clone()))?;
        Ok(Self { label, midi })
    }

    pub fn from_midi(note: u8) -> Self {
        Self { label: note_name(note), midi: note.min(127) }
    }

    pub fn as_str(&self) -> &str { &self.label }

    pub fn midi(&self) -> u8 { self.midi }

    pub fn frequency(&self) -> f32 { note_to_freq(self.midi) }
}

impl Default for Pitch {
    fn default() -> Self {
        Self { label: DEFAULT_PITCH.to_string(), midi: 60 }
    }
}

impl fmt::Display for Pitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl FromStr for Pitch {
    type Err = SeqError;
    fn from_str(s: &str) -> Result<Self> { Pitch::new(s) }
}

impl TryFrom<String> for Pitch {
    type Error = SeqError;
    fn try_from(s: String) -> Result<Self> { Pitch::new(s) }
}

impl From<Pitch> for String {
    fn from(p: Pitch) -> String { p.label }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Parse `<letter>[#|b]<octave>` into a MIDI note number (C4 = 60).
fn parse_midi(label: &str) -> Option<u8> {
    let mut chars = label.trim().chars().peekable();
    let semitone: i32 = match chars.next()?.to_ascii_uppercase() {
        'C' => 0, 'D' => 2, 'E' => 4, 'F' => 5,
        'G' => 7, 'A' => 9, 'B' => 11,
        _ => return None,
    };
    let accidental = match chars.peek() {
        Some('#') => { chars.next(); 1 }
        Some('b') => { chars.next(); -1 }
        _ => 0,
    };
    let octave: i32 = chars.collect::<String>().parse().ok()?;
    let note = (octave + 1) * 12 + semitone + accidental;
    if (0..=127).contains(&note) { Some(note as u8) } else { None }
}

pub fn note_to_freq(note: u8) -> f32 {
    440.0 * 2f32.powf((note as f32 - 69.0) / 12.0)
}

pub fn note_name(note: u8) -> String {
    format!("{}{}", NAMES[(note % 12) as usize], (note / 12) as i32 - 1)
}
