use std::f32::consts::PI;

use crate::voices::{Instrument, Trigger, TriggerKind};

/// Ids of every built-in instrument, in menu order.
pub const INSTRUMENT_OPTIONS: [&str; 12] = [
    "sine", "square", "triangle", "sawtooth",
    "pulse25", "pulse50", "pulse75",
    "noise-white",
    "drum-kick", "drum-snare", "drum-tom", "drum-hat",
];

/// Oldest voices are stolen past this many per instrument.
const MAX_VOICES: usize = 32;

/// Build the instrument registered under a built-in id.
pub fn create(id: &str, sample_rate: u32) -> Option<Box<dyn Instrument>> {
    let sr = sample_rate.max(1) as f32;
    let osc = |wave: Waveform| -> Box<dyn Instrument> { Box::new(Oscillator::new(wave, sr)) };
    let hit = |kind: DrumKind| -> Box<dyn Instrument> { Box::new(DrumKit::new(kind, sr)) };
    Some(match id {
        "sine"        => osc(Waveform::Sine),
        "square"      => osc(Waveform::Square),
        "triangle"    => osc(Waveform::Triangle),
        "sawtooth"    => osc(Waveform::Sawtooth),
        "pulse25"     => osc(Waveform::Pulse(0.25)),
        "pulse50"     => osc(Waveform::Pulse(0.50)),
        "pulse75"     => osc(Waveform::Pulse(0.75)),
        "noise-white" => hit(DrumKind::WhiteNoise),
        "drum-kick"   => hit(DrumKind::Kick),
        "drum-snare"  => hit(DrumKind::Snare),
        "drum-tom"    => hit(DrumKind::Tom),
        "drum-hat"    => hit(DrumKind::Hat),
        _ => return None,
    })
}

pub fn builtin(sample_rate: u32) -> Vec<(&'static str, Box<dyn Instrument>)> {
    INSTRUMENT_OPTIONS
        .iter()
        .filter_map(|id| create(id, sample_rate).map(|inst| (*id, inst)))
        .collect()
}

fn start_frame(time: f64, sample_rate: f32) -> u64 {
    (time.max(0.0) * sample_rate as f64).round() as u64
}

// ── Waveform ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Waveform { Sine, Square, Sawtooth, Triangle, Pulse(f32) }

impl Waveform {
    /// One sample at normalised phase `p` in [0, 1).
    fn sample(self, p: f32) -> f32 {
        match self {
            Self::Sine     => (p * 2.0 * PI).sin(),
            Self::Square   => if p < 0.5 { 1.0 } else { -1.0 },
            Self::Sawtooth => 2.0 * p - 1.0,
            Self::Triangle => if p < 0.5 { 4.0 * p - 1.0 } else { 3.0 - 4.0 * p },
            Self::Pulse(w) => if p < w { 1.0 } else { -1.0 },
        }
    }
}

// ── ADSR envelope ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Envelope {
    pub attack:  f32,
    pub decay:   f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for Envelope {
    fn default() -> Self {
        Self { attack: 0.01, decay: 0.1, sustain: 0.5, release: 0.1 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum EnvelopeStage { Pending, Attack, Decay, Sustain, Release, Off }

// ── Pitched voice ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct Voice {
    frequency:     f32,
    phase:         f32,
    stage:         EnvelopeStage,
    level:         f32,
    release_level: f32,
    gain:          f32,
    start:         u64,
    /// Frame at which the run ends and release begins.
    end:           u64,
}

impl Voice {
    fn new(trigger: &Trigger, frequency: f32, sr: f32) -> Self {
        let start = start_frame(trigger.time, sr);
        let len = (trigger.duration_seconds() * sr as f64).round().max(1.0) as u64;
        Self { frequency, phase: 0.0, stage: EnvelopeStage::Pending, level: 0.0,
               release_level: 0.0, gain: trigger.gain, start, end: start + len }
    }

    fn release(&mut self) {
        if !matches!(self.stage, EnvelopeStage::Release | EnvelopeStage::Off) {
            self.release_level = self.level;
            self.stage = EnvelopeStage::Release;
        }
    }

    fn is_finished(&self) -> bool { self.stage == EnvelopeStage::Off }

    fn next_sample(&mut self, frame: u64, sr: f32, wave: Waveform, env: &Envelope) -> f32 {
        if frame < self.start {
            return 0.0;
        }
        if self.stage == EnvelopeStage::Pending {
            self.stage = EnvelopeStage::Attack;
        }
        if frame >= self.end {
            self.release();
        }

        let dt = 1.0 / sr;
        match self.stage {
            EnvelopeStage::Pending => {}
            EnvelopeStage::Attack => {
                self.level += dt / env.attack;
                if self.level >= 1.0 { self.level = 1.0; self.stage = EnvelopeStage::Decay; }
            }
            EnvelopeStage::Decay => {
                self.level -= dt * (1.0 - env.sustain) / env.decay;
                if self.level <= env.sustain { self.level = env.sustain; self.stage = EnvelopeStage::Sustain; }
            }
            EnvelopeStage::Sustain => { self.level = env.sustain; }
            EnvelopeStage::Release => {
                self.level -= dt * self.release_level.max(1e-3) / env.release;
                if self.level <= 0.0 { self.level = 0.0; self.stage = EnvelopeStage::Off; }
            }
            EnvelopeStage::Off => return 0.0,
        }

        let sample = wave.sample(self.phase);
        self.phase += self.frequency / sr;
        if self.phase >= 1.0 { self.phase -= 1.0; }
        sample * self.level * self.gain
    }
}

/// Polyphonic oscillator with one envelope shared by all its voices.
pub struct Oscillator {
    pub wave:     Waveform,
    pub envelope: Envelope,
    pub level:    f32,
    sample_rate:  f32,
    voices:       Vec<Voice>,
}

impl Oscillator {
    pub fn new(wave: Waveform, sample_rate: f32) -> Self {
        Self { wave, envelope: Envelope::default(), level: 0.3, sample_rate,
               voices: Vec::with_capacity(MAX_VOICES) }
    }

    pub fn active_voices(&self) -> usize { self.voices.len() }
}

impl Instrument for Oscillator {
    fn trigger_kind(&self) -> TriggerKind { TriggerKind::Pitched }

    fn trigger(&mut self, trigger: &Trigger) {
        let Some(pitch) = &trigger.pitch else { return };
        if self.voices.len() >= MAX_VOICES {
            self.voices.remove(0);
        }
        self.voices.push(Voice::new(trigger, pitch.frequency(), self.sample_rate));
    }

    fn render(&mut self, frame: u64) -> f32 {
        let (sr, wave, env) = (self.sample_rate, self.wave, self.envelope);
        let mix: f32 = self.voices.iter_mut().map(|v| v.next_sample(frame, sr, wave, &env)).sum();
        self.voices.retain(|v| !v.is_finished());
        mix * self.level
    }

    fn silence(&mut self) { self.voices.clear(); }

    fn fresh(&self) -> Box<dyn Instrument> {
        Box::new(Self { envelope: self.envelope, level: self.level, ..Self::new(self.wave, self.sample_rate) })
    }
}

// ── Drum kind ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DrumKind { Kick, Snare, Tom, Hat, WhiteNoise }

impl DrumKind {
    /// Maximum duration (seconds); the voice is dropped after this.
    fn duration(self) -> f32 {
        match self {
            Self::Kick       => 0.50,
            Self::Snare      => 0.20,
            Self::Tom        => 0.42,
            Self::Hat        => 0.06,
            Self::WhiteNoise => 0.25,
        }
    }
}

/// Fast XOR-shift PRNG. Returns values uniformly in [-1, 1].
#[inline(always)]
fn xorshift(state: &mut u32) -> f32 {
    *state ^= *state << 13;
    *state ^= *state >> 17;
    *state ^= *state << 5;
    (*state as i32 as f32) * (1.0 / i32::MAX as f32)
}

// ── Unpitched voice ───────────────────────────────────────────────────────────

struct Hit {
    kind:        DrumKind,
    start:       u64,
    sample_pos:  u64,
    dur_samples: u64,
    phase:       f32,
    noise:       u32,
    gain:        f32,
}

impl Hit {
    fn is_finished(&self) -> bool { self.sample_pos >= self.dur_samples }

    fn next_sample(&mut self, frame: u64, sr: f32) -> f32 {
        if frame < self.start || self.is_finished() {
            return 0.0;
        }
        let t = self.sample_pos as f32 / sr;
        let raw = match self.kind {
            DrumKind::Kick => {
                let freq = 50.0 + 100.0 * (-t * 32.0_f32).exp();
                let click = if t < 0.004 { self.noise() * 0.38 } else { 0.0 };
                (self.sine(freq, sr) * 0.88 + click) * (-t * 11.0_f32).exp()
            }
            DrumKind::Snare => {
                (self.noise() * 0.72 + self.sine(195.0, sr) * 0.28) * (-t * 24.0_f32).exp()
            }
            DrumKind::Tom => {
                let freq = 90.0 + 105.0 * (-t * 22.0_f32).exp();
                (self.sine(freq, sr) * 0.80 + self.noise() * 0.20) * (-t / 0.38).exp()
            }
            DrumKind::Hat        => self.noise() * (-t * 85.0_f32).exp(),
            DrumKind::WhiteNoise => self.noise() * (-t * 12.0_f32).exp(),
        };
        self.sample_pos += 1;
        (raw * self.gain).clamp(-1.0, 1.0)
    }

    fn noise(&mut self) -> f32 { xorshift(&mut self.noise) }

    fn sine(&mut self, freq: f32, sr: f32) -> f32 {
        self.phase += freq / sr;
        if self.phase >= 1.0 { self.phase -= 1.0; }
        (self.phase * 2.0 * PI).sin()
    }
}

/// Polyphonic percussion voice; pitch and run length are ignored.
pub struct DrumKit {
    pub kind:    DrumKind,
    sample_rate: f32,
    voices:      Vec<Hit>,
    /// Advanced before each trigger so every hit has a distinct noise flavour.
    seed:        u32,
}

impl DrumKit {
    pub fn new(kind: DrumKind, sample_rate: f32) -> Self {
        Self { kind, sample_rate, voices: Vec::with_capacity(MAX_VOICES), seed: 0xBEEF_CAFE }
    }

    pub fn active_voices(&self) -> usize { self.voices.len() }
}

impl Instrument for DrumKit {
    fn trigger_kind(&self) -> TriggerKind { TriggerKind::Unpitched }

    fn trigger(&mut self, trigger: &Trigger) {
        self.seed = self.seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        if self.voices.len() >= MAX_VOICES {
            self.voices.remove(0);
        }
        self.voices.push(Hit {
            kind:        self.kind,
            start:       start_frame(trigger.time, self.sample_rate),
            sample_pos:  0,
            dur_samples: (self.kind.duration() * self.sample_rate).ceil() as u64,
            phase:       0.0,
            noise:       self.seed | 1, // xorshift must never be 0
            gain:        trigger.gain,
        });
    }

    fn render(&mut self, frame: u64) -> f32 {
        let sr = self.sample_rate;
        let mix: f32 = self.voices.iter_mut().map(|v| v.next_sample(frame, sr)).sum();
        self.voices.retain(|v| !v.is_finished());
        mix * 0.5
    }

    fn silence(&mut self) { self.voices.clear(); }

    fn fresh(&self) -> Box<dyn Instrument> { Box::new(Self::new(self.kind, self.sample_rate)) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::note::Pitch;

    fn trig(time: f64, steps: usize) -> Trigger {
        Trigger { time, pitch: Some(Pitch::new("A4").unwrap()), duration_steps: steps,
                  step_seconds: 0.125, gain: 1.0 }
    }

    #[test]
    fn every_option_builds() {
        for id in INSTRUMENT_OPTIONS {
            assert!(create(id, 44100).is_some(), "{} missing", id);
        }
        assert!(create("kazoo", 44100).is_none());
    }

    #[test]
    fn oscillator_is_silent_before_its_start_time() {
        let mut osc = Oscillator::new(Waveform::Square, 1000.0);
        osc.trigger(&trig(0.5, 1));
        assert!((0..500).all(|f| osc.render(f) == 0.0));
        let audible = (500..560).any(|f| osc.render(f) != 0.0);
        assert!(audible);
    }

    #[test]
    fn oscillator_releases_after_its_run() {
        let mut osc = Oscillator::new(Waveform::Sine, 1000.0);
        osc.trigger(&trig(0.0, 2));
        // 250 ms run + 100 ms release
        for f in 0..400 {
            osc.render(f);
        }
        assert_eq!(osc.active_voices(), 0);
    }

    #[test]
    fn oscillator_ignores_unpitched_trigger() {
        let mut osc = Oscillator::new(Waveform::Sine, 1000.0);
        osc.trigger(&Trigger { pitch: None, ..trig(0.0, 1) });
        assert_eq!(osc.active_voices(), 0);
    }

    #[test]
    fn drum_decays_on_its_own_regardless_of_run_length() {
        let mut kit = DrumKit::new(DrumKind::Hat, 1000.0);
        kit.trigger(&trig(0.0, 16));
        for f in 0..100 {
            kit.render(f);
        }
        assert_eq!(kit.active_voices(), 0);
    }

    #[test]
    fn voice_count_is_capped() {
        let mut kit = DrumKit::new(DrumKind::Kick, 1000.0);
        for i in 0..(MAX_VOICES + 8) {
            kit.trigger(&trig(i as f64, 1));
        }
        assert_eq!(kit.active_voices(), MAX_VOICES);
    }

    #[test]
    fn pulse_width_sets_duty_cycle() {
        let high = (0..100).filter(|i| Waveform::Pulse(0.25).sample(*i as f32 / 100.0) > 0.0).count();
        assert_eq!(high, 25);
    }
}
