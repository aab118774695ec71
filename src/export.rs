//! Render exactly one loop of a pattern offline.
//!
//! The exporter drives a fresh `Scheduler` from a fresh clock one frame at a
//! time, pushing the mixed output into a [`CaptureSink`]. The end of the loop
//! is a one-shot scheduled on that same clock, so the capture window comes
//! from the tick-to-time mapping the scheduler itself uses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::{FrameClock, MusicalClock, SampleClock, Subdivision};
use crate::config::EngineConfig;
use crate::error::{Result, SeqError};
use crate::scheduler::Scheduler;
use crate::{lock, share, SharedPattern, SharedVoices};

// ── Audio buffer ──────────────────────────────────────────────────────────────

/// Mono samples in [-1, 1].
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    samples:     Vec<f32>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, samples: Vec<f32>) -> Self { Self { sample_rate, samples } }

    pub fn sample_rate(&self) -> u32 { self.sample_rate }

    pub fn samples(&self) -> &[f32] { &self.samples }

    pub fn len(&self) -> usize { self.samples.len() }

    pub fn is_empty(&self) -> bool { self.samples.is_empty() }

    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }

    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }
}

// ── Capture sink ──────────────────────────────────────────────────────────────

pub trait CaptureSink {
    fn start(&mut self, sample_rate: u32);

    fn push(&mut self, sample: f32);

    /// Finish capturing and hand over everything pushed since `start`.
    fn stop(&mut self) -> AudioBuffer;

    /// Discard a capture that will never be finished.
    fn abort(&mut self);

    fn is_capturing(&self) -> bool;
}

/// Collects samples in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    sample_rate: u32,
    samples:     Vec<f32>,
    capturing:   bool,
}

impl BufferSink {
    pub fn new() -> Self { Self::default() }
}

impl CaptureSink for BufferSink {
    fn start(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
        self.samples.clear();
        self.capturing = true;
    }

    fn push(&mut self, sample: f32) {
        if self.capturing {
            self.samples.push(sample);
        }
    }

    fn stop(&mut self) -> AudioBuffer {
        self.capturing = false;
        AudioBuffer::new(self.sample_rate, std::mem::take(&mut self.samples))
    }

    fn abort(&mut self) {
        self.capturing = false;
        self.samples = Vec::new();
    }

    fn is_capturing(&self) -> bool { self.capturing }
}

// ── Loop exporter ─────────────────────────────────────────────────────────────

pub struct LoopExporter {
    voices:        SharedVoices,
    sample_rate:   u32,
    ppq:           u32,
    subdivision:   Subdivision,
    slack_seconds: f64,
}

impl LoopExporter {
    pub fn new(voices: SharedVoices, config: &EngineConfig) -> Self {
        Self {
            voices,
            sample_rate:   config.sample_rate,
            ppq:           config.ppq,
            subdivision:   config.subdivision,
            slack_seconds: config.export_slack_seconds(),
        }
    }

    /// Seconds covered by `step_count` steps at `bpm`, in whole clock ticks.
    pub fn loop_duration(&self, bpm: f64, step_count: usize) -> f64 {
        step_count as f64 * self.subdivision.seconds(bpm, self.ppq)
    }

    /// Render one pass over `[0, step_count)` at `bpm`.
    pub fn export_one_loop(&self, pattern: &SharedPattern, bpm: f64, step_count: usize) -> Result<AudioBuffer> {
        let mut clock = SampleClock::new(self.sample_rate, self.ppq, bpm)?;
        let mut sink = BufferSink::new();
        self.export_with(pattern, step_count, &mut clock, &mut sink)
    }

    /// Export against a caller-supplied clock and sink. The capture window
    /// opens at the clock's next step boundary, where step 0 fires. On failure
    /// the sink has been aborted and the scheduler stopped.
    pub fn export_with<C: FrameClock>(
        &self,
        pattern: &SharedPattern,
        step_count: usize,
        clock: &mut C,
        sink: &mut dyn CaptureSink,
    ) -> Result<AudioBuffer> {
        if step_count == 0 {
            return Err(SeqError::InvalidStepCount(step_count));
        }
        let actual = lock(pattern).step_count();
        if actual != step_count {
            return Err(SeqError::StepCountMismatch { expected: step_count, actual });
        }

        let sr = clock.sample_rate();
        let duration = step_count as f64 * self.subdivision.seconds(clock.bpm(), clock.ppq());
        let expected_frames = (duration * sr as f64).round() as u64;
        let frame_limit = expected_frames + (self.slack_seconds * sr as f64).ceil() as u64;
        log::info!("exporting {} steps at {} bpm ({:.3}s, {} frames)", step_count, clock.bpm(), duration, expected_frames);

        let voices = share(lock(&self.voices).fresh_copy());
        let mut scheduler = Scheduler::new(Arc::clone(pattern), Arc::clone(&voices), self.subdivision);

        sink.start(sr);
        if let Err(e) = scheduler.start(&mut *clock, 0) {
            sink.abort();
            return Err(e);
        }

        let done = Arc::new(AtomicBool::new(false));
        let begin_at = clock.next_boundary_seconds(self.subdivision);
        let end_at = begin_at + duration;
        let on_end = {
            let done = Arc::clone(&done);
            let signal = scheduler.stop_signal();
            Box::new(move |_t: f64| {
                signal.halt();
                done.store(true, Ordering::SeqCst);
            })
        };
        if let Err(e) = clock.schedule_once(end_at, on_end) {
            scheduler.stop(&mut *clock);
            sink.abort();
            return Err(e);
        }

        let mut rendered = 0u64;
        loop {
            let frame = clock.frame();
            clock.advance_frame();
            if done.load(Ordering::SeqCst) {
                break;
            }
            if rendered >= frame_limit {
                scheduler.stop(&mut *clock);
                sink.abort();
                log::warn!("export stop never fired after {} frames", rendered);
                return Err(SeqError::ExportTimingFailure { expected_frames, rendered_frames: rendered });
            }
            let sample = lock(&voices).render(frame);
            if frame as f64 / sr as f64 >= begin_at - 1e-9 {
                sink.push(sample);
                rendered += 1;
            }
        }

        scheduler.stop(&mut *clock);
        let buffer = sink.stop();
        log::debug!("export captured {} frames, peak {:.3}", buffer.len(), buffer.peak());
        Ok(buffer)
    }
}
