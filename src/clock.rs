//! Musical clock: the narrow timing interface the scheduler depends on, and a
//! sample-accurate implementation of it.
//!
//! `SampleClock` keeps its position in ticks (PPQ resolution) derived from a
//! frame counter, so periodic and one-shot callbacks share one tick-to-time
//! mapping and a tempo change rescales both consistently. Callbacks fire from
//! `advance_frame`, on the caller's thread, and run to completion.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeqError};

pub const DEFAULT_PPQ: u32 = 192;

const TICK_EPSILON: f64 = 1e-6;

/// Receives the exact audio time (seconds) of the boundary it was scheduled for.
pub type ClockCallback = Box<dyn FnMut(f64) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

// ── Subdivision ───────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subdivision {
    Quarter,
    Eighth,
    #[default]
    Sixteenth,
    ThirtySecond,
}

impl Subdivision {
    pub fn per_beat(self) -> u32 {
        match self {
            Self::Quarter      => 1,
            Self::Eighth       => 2,
            Self::Sixteenth    => 4,
            Self::ThirtySecond => 8,
        }
    }

    /// Clock ticks per subdivision at the given resolution (never zero).
    pub fn ticks(self, ppq: u32) -> u64 {
        (ppq / self.per_beat()).max(1) as u64
    }

    /// Wall-clock length of one step as the clock counts it: whole ticks at
    /// `ppq`, so a coarse `ppq` gives a slightly short step.
    pub fn seconds(self, bpm: f64, ppq: u32) -> f64 {
        self.ticks(ppq) as f64 * 60.0 / (bpm * ppq.max(1) as f64)
    }
}

// ── Clock traits ──────────────────────────────────────────────────────────────

pub trait MusicalClock {
    fn bpm(&self) -> f64;

    fn set_bpm(&mut self, bpm: f64) -> Result<()>;

    /// Ticks per quarter note.
    fn ppq(&self) -> u32;

    /// Call `callback` at every subdivision boundary from the next one onward.
    fn schedule_periodic(&mut self, subdivision: Subdivision, callback: ClockCallback) -> Result<CallbackHandle>;

    /// Call `callback` once at `at` seconds on this clock's timeline.
    fn schedule_once(&mut self, at: f64, callback: ClockCallback) -> Result<CallbackHandle>;

    /// Remove a callback. Returns false if the handle was unknown or already
    /// fired. Once this returns the callback will not run again.
    fn unschedule(&mut self, handle: CallbackHandle) -> bool;
}

/// A clock advanced one audio frame at a time by its host.
pub trait FrameClock: MusicalClock {
    fn sample_rate(&self) -> u32;

    /// Index of the next frame to be processed.
    fn frame(&self) -> u64;

    /// Fire every callback due at the current frame, then move to the next.
    fn advance_frame(&mut self);

    /// Time of the first subdivision boundary a periodic callback registered
    /// now would fire at.
    fn next_boundary_seconds(&self, subdivision: Subdivision) -> f64;

    fn now_seconds(&self) -> f64 {
        self.frame() as f64 / self.sample_rate() as f64
    }
}

// ── Sample clock ──────────────────────────────────────────────────────────────

struct Entry {
    handle:    CallbackHandle,
    next_tick: f64,
    /// `Some` for periodic callbacks.
    interval:  Option<f64>,
    callback:  ClockCallback,
}

pub struct SampleClock {
    sample_rate:  u32,
    ppq:          u32,
    bpm:          f64,
    frame:        u64,
    anchor_frame: u64,
    anchor_ticks: f64,
    suspended:    bool,
    next_id:      u64,
    entries:      Vec<Entry>,
}

impl SampleClock {
    pub fn new(sample_rate: u32, ppq: u32, bpm: f64) -> Result<Self> {
        check_bpm(bpm)?;
        Ok(Self {
            sample_rate:  sample_rate.max(1),
            ppq:          ppq.max(1),
            bpm,
            frame:        0,
            anchor_frame: 0,
            anchor_ticks: 0.0,
            suspended:    false,
            next_id:      0,
            entries:      Vec::new(),
        })
    }

    /// A clock that refuses to schedule until `resume` is called, like an
    /// audio context waiting for permission.
    pub fn suspended(sample_rate: u32, ppq: u32, bpm: f64) -> Result<Self> {
        let mut clock = Self::new(sample_rate, ppq, bpm)?;
        clock.suspended = true;
        Ok(clock)
    }

    pub fn suspend(&mut self) { self.suspended = true; }

    pub fn resume(&mut self) { self.suspended = false; }

    pub fn is_suspended(&self) -> bool { self.suspended }

    /// Current position in ticks.
    pub fn ticks(&self) -> f64 { self.ticks_at(self.frame) }

    pub fn pending(&self) -> usize { self.entries.len() }

    fn ticks_per_frame(&self) -> f64 {
        self.bpm * self.ppq as f64 / (60.0 * self.sample_rate as f64)
    }

    fn ticks_at(&self, frame: u64) -> f64 {
        self.anchor_ticks + (frame - self.anchor_frame) as f64 * self.ticks_per_frame()
    }

    fn seconds_at_tick(&self, tick: f64) -> f64 {
        let anchor_secs = self.anchor_frame as f64 / self.sample_rate as f64;
        anchor_secs + (tick - self.anchor_ticks) * 60.0 / (self.bpm * self.ppq as f64)
    }

    fn tick_at_seconds(&self, seconds: f64) -> f64 {
        let anchor_secs = self.anchor_frame as f64 / self.sample_rate as f64;
        self.anchor_ticks + (seconds - anchor_secs) * self.bpm * self.ppq as f64 / 60.0
    }

    fn next_boundary_tick(&self, interval: f64) -> f64 {
        ((self.ticks() - TICK_EPSILON) / interval).ceil().max(0.0) * interval
    }

    fn insert(&mut self, next_tick: f64, interval: Option<f64>, callback: ClockCallback) -> Result<CallbackHandle> {
        if self.suspended {
            return Err(SeqError::ClockUnavailable("clock is suspended".to_string()));
        }
        let handle = CallbackHandle(self.next_id);
        self.next_id += 1;
        self.entries.push(Entry { handle, next_tick, interval, callback });
        Ok(handle)
    }

    /// Index of the entry that should fire next at `now`, if any.
    /// Earlier ticks first; at equal ticks (within rounding) one-shots run
    /// before periodic callbacks, then registration order.
    fn next_due(&self, now: f64) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.next_tick <= now + TICK_EPSILON)
            .min_by(|(_, a), (_, b)| {
                let by_tick = if (a.next_tick - b.next_tick).abs() <= TICK_EPSILON {
                    Ordering::Equal
                } else {
                    a.next_tick.total_cmp(&b.next_tick)
                };
                by_tick
                    .then(a.interval.is_some().cmp(&b.interval.is_some()))
                    .then(a.handle.0.cmp(&b.handle.0))
            })
            .map(|(i, _)| i)
    }
}

fn check_bpm(bpm: f64) -> Result<()> {
    if bpm.is_finite() && bpm > 0.0 { Ok(()) } else { Err(SeqError::InvalidBpm(bpm)) }
}

impl MusicalClock for SampleClock {
    fn bpm(&self) -> f64 { self.bpm }

    fn set_bpm(&mut self, bpm: f64) -> Result<()> {
        check_bpm(bpm)?;
        self.anchor_ticks = self.ticks();
        self.anchor_frame = self.frame;
        self.bpm = bpm;
        Ok(())
    }

    fn ppq(&self) -> u32 { self.ppq }

    fn schedule_periodic(&mut self, subdivision: Subdivision, callback: ClockCallback) -> Result<CallbackHandle> {
        let interval = subdivision.ticks(self.ppq) as f64;
        let first = self.next_boundary_tick(interval);
        self.insert(first, Some(interval), callback)
    }

    fn schedule_once(&mut self, at: f64, callback: ClockCallback) -> Result<CallbackHandle> {
        let tick = self.tick_at_seconds(at);
        self.insert(tick, None, callback)
    }

    fn unschedule(&mut self, handle: CallbackHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.handle != handle);
        self.entries.len() != before
    }
}

impl FrameClock for SampleClock {
    fn sample_rate(&self) -> u32 { self.sample_rate }

    fn frame(&self) -> u64 { self.frame }

    fn advance_frame(&mut self) {
        if self.suspended {
            return;
        }
        let now = self.ticks();
        while let Some(i) = self.next_due(now) {
            let time = self.seconds_at_tick(self.entries[i].next_tick);
            (self.entries[i].callback)(time);
            match self.entries[i].interval {
                Some(interval) => self.entries[i].next_tick += interval,
                None => { self.entries.remove(i); }
            }
        }
        self.frame += 1;
    }

    fn next_boundary_seconds(&self, subdivision: Subdivision) -> f64 {
        self.seconds_at_tick(self.next_boundary_tick(subdivision.ticks(self.ppq) as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<f64>>>, ClockCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (log, Box::new(move |t| sink.lock().unwrap().push(t)))
    }

    fn run(clock: &mut SampleClock, frames: u64) {
        for _ in 0..frames {
            clock.advance_frame();
        }
    }

    #[test]
    fn sixteenth_is_quarter_of_a_beat() {
        assert_eq!(Subdivision::Sixteenth.ticks(192), 48);
        assert_eq!(Subdivision::Sixteenth.seconds(120.0, 192), 0.125);
        assert_eq!(Subdivision::Quarter.ticks(192), 192);
    }

    #[test]
    fn coarse_ppq_truncates_the_step() {
        // 90 / 4 = 22 whole ticks, not 22.5
        assert_eq!(Subdivision::Sixteenth.ticks(90), 22);
        let secs = Subdivision::Sixteenth.seconds(120.0, 90);
        assert!((secs - 22.0 / 180.0).abs() < 1e-12);
    }

    #[test]
    fn periodic_fires_on_every_step_boundary() {
        let mut clock = SampleClock::new(1000, 192, 120.0).unwrap();
        let (log, cb) = recorder();
        clock.schedule_periodic(Subdivision::Sixteenth, cb).unwrap();
        // 125 frames per sixteenth at 1 kHz / 120 bpm
        run(&mut clock, 500);
        assert_eq!(*log.lock().unwrap(), vec![0.0, 0.125, 0.25, 0.375]);
    }

    #[test]
    fn once_fires_exactly_at_its_frame() {
        let mut clock = SampleClock::new(44100, 192, 120.0).unwrap();
        let (log, cb) = recorder();
        clock.schedule_once(2.0, cb).unwrap();
        run(&mut clock, 88200);
        assert!(log.lock().unwrap().is_empty());
        clock.advance_frame();
        assert_eq!(*log.lock().unwrap(), vec![2.0]);
        assert_eq!(clock.pending(), 0);
    }

    #[test]
    fn unscheduled_callback_never_fires_again() {
        let mut clock = SampleClock::new(1000, 192, 120.0).unwrap();
        let (log, cb) = recorder();
        let h = clock.schedule_periodic(Subdivision::Sixteenth, cb).unwrap();
        run(&mut clock, 130);
        assert!(clock.unschedule(h));
        assert!(!clock.unschedule(h));
        run(&mut clock, 1000);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn once_runs_before_periodic_on_the_same_tick() {
        let mut clock = SampleClock::new(1000, 192, 120.0).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&order);
        let b = Arc::clone(&order);
        clock.schedule_periodic(Subdivision::Sixteenth, Box::new(move |_: f64| a.lock().unwrap().push("step"))).unwrap();
        clock.schedule_once(0.125, Box::new(move |_: f64| b.lock().unwrap().push("once"))).unwrap();
        run(&mut clock, 126);
        assert_eq!(*order.lock().unwrap(), vec!["step", "once", "step"]);
    }

    #[test]
    fn near_equal_ticks_still_run_the_once_first() {
        let mut clock = SampleClock::new(1000, 192, 120.0).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&order);
        let b = Arc::clone(&order);
        clock.schedule_periodic(Subdivision::Sixteenth, Box::new(move |_: f64| a.lock().unwrap().push("step"))).unwrap();
        clock.schedule_once(0.125 + 1e-12, Box::new(move |_: f64| b.lock().unwrap().push("once"))).unwrap();
        run(&mut clock, 126);
        assert_eq!(*order.lock().unwrap(), vec!["step", "once", "step"]);
    }

    #[test]
    fn late_periodic_aligns_to_next_boundary() {
        let mut clock = SampleClock::new(1000, 192, 120.0).unwrap();
        run(&mut clock, 10);
        let (log, cb) = recorder();
        clock.schedule_periodic(Subdivision::Sixteenth, cb).unwrap();
        run(&mut clock, 200);
        assert_eq!(*log.lock().unwrap(), vec![0.125]);
        assert!((clock.next_boundary_seconds(Subdivision::Sixteenth) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn tempo_change_rescales_future_boundaries() {
        let mut clock = SampleClock::new(1000, 192, 120.0).unwrap();
        let (log, cb) = recorder();
        clock.schedule_periodic(Subdivision::Sixteenth, cb).unwrap();
        run(&mut clock, 126);
        clock.set_bpm(60.0).unwrap();
        run(&mut clock, 500);
        let times = log.lock().unwrap().clone();
        assert_eq!(times[0], 0.0);
        assert_eq!(times[1], 0.125);
        // halfway to the next boundary at the old tempo, twice as slow now
        assert!((times[2] - (0.126 + 0.124 * 2.0)).abs() < 1e-9);
    }

    #[test]
    fn suspended_clock_refuses_to_schedule() {
        let mut clock = SampleClock::suspended(44100, 192, 120.0).unwrap();
        let (_, cb) = recorder();
        assert!(matches!(
            clock.schedule_periodic(Subdivision::Sixteenth, cb),
            Err(SeqError::ClockUnavailable(_))
        ));
        assert!(clock.is_suspended());
        clock.resume();
        assert!(!clock.is_suspended());
        let (_, cb) = recorder();
        assert!(clock.schedule_periodic(Subdivision::Sixteenth, cb).is_ok());
    }

    #[test]
    fn bad_tempo_is_rejected() {
        assert!(SampleClock::new(44100, 192, 0.0).is_err());
        let mut clock = SampleClock::new(44100, 192, 90.0).unwrap();
        assert!(clock.set_bpm(f64::NAN).is_err());
        assert_eq!(clock.bpm(), 90.0);
    }
}
