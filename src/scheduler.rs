//! Tick-synchronised step scheduler.
//!
//! One periodic clock callback per step. Each callback reads the *current*
//! pattern (no snapshot), fires exactly one trigger per channel whose step is
//! a run start, then advances the playhead by one step of ticks.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::clock::{CallbackHandle, MusicalClock, Subdivision};
use crate::error::{Result, SeqError};
use crate::note::Pitch;
use crate::runs::run_length_at;
use crate::voices::{Dispatch, Trigger};
use crate::{lock, SharedPattern, SharedVoices};

// ── Notifications ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PlaybackEvent {
    StepAdvanced { step: usize, time: f64 },
    NoteOn { channel: usize, step: usize, pitch: Pitch, length: usize, time: f64 },
    UnknownInstrument { channel: usize, instrument: String },
    /// One-shot playback reached the loop end.
    Finished,
}

type Listeners = Arc<Mutex<Vec<Sender<PlaybackEvent>>>>;

fn broadcast(listeners: &Listeners, events: Vec<PlaybackEvent>) {
    let mut listeners = lock(listeners);
    for event in events {
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

// ── Playhead ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Playhead {
    elapsed_ticks:  u64,
    ticks_per_step: u64,
    step_seconds:   f64,
    /// Bumped on every start; a callback from an older session is inert.
    session:        u64,
    running:        bool,
}

/// Halts a scheduler from inside a clock callback, where the clock itself is
/// already borrowed and `Scheduler::stop` cannot be called.
#[derive(Clone)]
pub struct StopSignal(Arc<Mutex<Playhead>>);

impl StopSignal {
    pub fn halt(&self) { lock(&self.0).running = false; }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

pub struct Scheduler {
    pattern:     SharedPattern,
    voices:      SharedVoices,
    subdivision: Subdivision,
    playhead:    Arc<Mutex<Playhead>>,
    handle:      Option<CallbackHandle>,
    listeners:   Listeners,
}

impl Scheduler {
    pub fn new(pattern: SharedPattern, voices: SharedVoices, subdivision: Subdivision) -> Self {
        Self {
            pattern,
            voices,
            subdivision,
            playhead:  Arc::new(Mutex::new(Playhead::default())),
            handle:    None,
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subdivision(&self) -> Subdivision { self.subdivision }

    pub fn subscribe(&self) -> Receiver<PlaybackEvent> {
        let (tx, rx) = channel();
        lock(&self.listeners).push(tx);
        rx
    }

    pub(crate) fn notify(&self, event: PlaybackEvent) {
        broadcast(&self.listeners, vec![event]);
    }

    pub fn is_running(&self) -> bool { lock(&self.playhead).running }

    pub fn elapsed_ticks(&self) -> u64 { lock(&self.playhead).elapsed_ticks }

    pub fn ticks_per_step(&self) -> u64 { lock(&self.playhead).ticks_per_step }

    /// Step the next callback will evaluate.
    pub fn current_step(&self, step_count: usize) -> usize {
        let ph = lock(&self.playhead);
        if ph.ticks_per_step == 0 || step_count == 0 {
            return 0;
        }
        (ph.elapsed_ticks / ph.ticks_per_step) as usize % step_count
    }

    pub fn stop_signal(&self) -> StopSignal { StopSignal(Arc::clone(&self.playhead)) }

    /// Enter Running with the playhead at `origin` ticks and register one
    /// periodic callback per step.
    ///
    /// Any callback from a previous start is unscheduled first. If the clock
    /// refuses, the scheduler is left Stopped with `elapsed_ticks` unchanged.
    pub fn start(&mut self, clock: &mut dyn MusicalClock, origin: u64) -> Result<()> {
        if let Some(old) = self.handle.take() {
            clock.unschedule(old);
        }
        let session = {
            let mut ph = lock(&self.playhead);
            ph.running = false;
            ph.session + 1
        };

        let callback = {
            let pattern   = Arc::clone(&self.pattern);
            let voices    = Arc::clone(&self.voices);
            let playhead  = Arc::clone(&self.playhead);
            let listeners = Arc::clone(&self.listeners);
            Box::new(move |time: f64| {
                let events = {
                    let mut ph = lock(&playhead);
                    if !ph.running || ph.session != session {
                        return;
                    }
                    let events = fire_step(&ph, &pattern, &voices, time);
                    ph.elapsed_ticks += ph.ticks_per_step;
                    events
                };
                broadcast(&listeners, events);
            })
        };

        let handle = clock.schedule_periodic(self.subdivision, callback).map_err(|e| {
            log::warn!("scheduler start refused: {}", e);
            match e {
                SeqError::ClockUnavailable(_) => e,
                other => SeqError::ClockUnavailable(other.to_string()),
            }
        })?;

        let mut ph = lock(&self.playhead);
        ph.elapsed_ticks  = origin;
        ph.ticks_per_step = self.subdivision.ticks(clock.ppq());
        ph.step_seconds   = self.subdivision.seconds(clock.bpm(), clock.ppq());
        ph.session        = session;
        ph.running        = true;
        self.handle = Some(handle);
        log::debug!("scheduler started at tick {} (session {})", origin, session);
        Ok(())
    }

    /// Deregister the step callback. Idempotent; `elapsed_ticks` is kept.
    pub fn stop(&mut self, clock: &mut dyn MusicalClock) {
        if let Some(handle) = self.handle.take() {
            clock.unschedule(handle);
            log::debug!("scheduler stopped at tick {}", self.elapsed_ticks());
        }
        lock(&self.playhead).running = false;
    }

    /// Zero the playhead. Does not change Running/Stopped.
    pub fn reset(&mut self) { lock(&self.playhead).elapsed_ticks = 0; }

    /// Follow a tempo change; affects the duration of later triggers.
    pub fn retime(&self, clock: &dyn MusicalClock) {
        lock(&self.playhead).step_seconds = self.subdivision.seconds(clock.bpm(), clock.ppq());
    }
}

/// Evaluate one step against the latest pattern. Locks pattern, then voices.
fn fire_step(ph: &Playhead, pattern: &SharedPattern, voices: &SharedVoices, time: f64) -> Vec<PlaybackEvent> {
    let pattern = lock(pattern);
    let steps = pattern.step_count();
    let step = (ph.elapsed_ticks / ph.ticks_per_step.max(1)) as usize % steps.max(1);
    let mut events = vec![PlaybackEvent::StepAdvanced { step, time }];

    let mut voices = lock(voices);
    for (ch, channel) in pattern.channels().iter().enumerate() {
        let Some(length) = pattern.row(ch).ok().and_then(|row| run_length_at(row, step)) else {
            continue;
        };
        let pitch = pattern.pitch_or_default(ch, step).unwrap_or_default();
        let trigger = Trigger {
            time,
            pitch:          Some(pitch.clone()),
            duration_steps: length,
            step_seconds:   ph.step_seconds,
            gain:           channel.volume,
        };
        match voices.dispatch(&channel.instrument_id, channel.muted, &trigger) {
            Dispatch::Fired => {
                log::trace!("ch {} step {} -> {} x{}", ch, step, pitch, length);
                events.push(PlaybackEvent::NoteOn { channel: ch, step, pitch, length, time });
            }
            Dispatch::UnknownInstrument => {
                log::warn!("channel {}: unknown instrument {:?}", ch, channel.instrument_id);
                events.push(PlaybackEvent::UnknownInstrument {
                    channel:    ch,
                    instrument: channel.instrument_id.clone(),
                });
            }
            Dispatch::Muted | Dispatch::MissingPitch => {}
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FrameClock, SampleClock};
    use crate::pattern::PatternStore;
    use crate::voices::testing::{probe, TriggerLog};
    use crate::voices::{TriggerKind, VoiceRegistry};
    use crate::share;

    // 1 kHz, 120 bpm: 125 frames per sixteenth
    const STEP_FRAMES: u64 = 125;

    struct Rig {
        clock:     SampleClock,
        pattern:   SharedPattern,
        scheduler: Scheduler,
        lead:      TriggerLog,
    }

    fn rig(steps: usize) -> Rig {
        let (lead, inst) = probe(TriggerKind::Pitched);
        let mut reg = VoiceRegistry::new();
        reg.register("lead", inst);
        let pattern = share(PatternStore::with_instruments(&["lead"], steps).unwrap());
        let scheduler = Scheduler::new(Arc::clone(&pattern), share(reg), Subdivision::Sixteenth);
        Rig { clock: SampleClock::new(1000, 192, 120.0).unwrap(), pattern, scheduler, lead }
    }

    fn run_steps(clock: &mut SampleClock, steps: u64) {
        for _ in 0..steps * STEP_FRAMES {
            clock.advance_frame();
        }
    }

    #[test]
    fn sustained_run_fires_once() {
        let mut r = rig(8);
        lock(&r.pattern).set_range(0, 1, 4, true).unwrap();
        r.scheduler.start(&mut r.clock, 0).unwrap();
        run_steps(&mut r.clock, 8);

        let log = r.lead.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].duration_steps, 4);
        assert_eq!(log[0].time, 0.125);
        assert_eq!(log[0].duration_seconds(), 0.5);
    }

    #[test]
    fn current_step_wraps_after_step_count_callbacks() {
        let mut r = rig(6);
        r.scheduler.start(&mut r.clock, 0).unwrap();
        assert_eq!(r.scheduler.current_step(6), 0);
        run_steps(&mut r.clock, 6);
        assert_eq!(r.scheduler.elapsed_ticks(), 6 * 48);
        assert_eq!(r.scheduler.current_step(6), 0);
        run_steps(&mut r.clock, 2);
        assert_eq!(r.scheduler.current_step(6), 2);
    }

    #[test]
    fn last_step_run_does_not_tie_into_step_zero() {
        let mut r = rig(4);
        {
            let mut p = lock(&r.pattern);
            p.set_step(0, 0, true, None).unwrap();
            p.set_step(0, 3, true, None).unwrap();
        }
        r.scheduler.start(&mut r.clock, 0).unwrap();
        run_steps(&mut r.clock, 8);
        let starts: Vec<(f64, usize)> =
            r.lead.lock().unwrap().iter().map(|t| (t.time, t.duration_steps)).collect();
        assert_eq!(starts, vec![(0.0, 1), (0.375, 1), (0.5, 1), (0.875, 1)]);
    }

    #[test]
    fn stop_is_idempotent_and_keeps_position() {
        let mut r = rig(16);
        r.scheduler.start(&mut r.clock, 0).unwrap();
        run_steps(&mut r.clock, 3);
        r.scheduler.stop(&mut r.clock);
        r.scheduler.stop(&mut r.clock);
        assert!(!r.scheduler.is_running());
        assert_eq!(r.scheduler.current_step(16), 3);
        assert_eq!(r.clock.pending(), 0);
        r.scheduler.reset();
        assert_eq!(r.scheduler.elapsed_ticks(), 0);
    }

    #[test]
    fn restart_never_leaves_two_schedules() {
        let mut r = rig(4);
        lock(&r.pattern).set_step(0, 0, true, None).unwrap();
        r.scheduler.start(&mut r.clock, 0).unwrap();
        r.scheduler.start(&mut r.clock, 0).unwrap();
        assert_eq!(r.clock.pending(), 1);
        run_steps(&mut r.clock, 4);
        assert_eq!(r.lead.lock().unwrap().len(), 1);
    }

    #[test]
    fn stop_signal_silences_the_same_tick() {
        let mut r = rig(4);
        lock(&r.pattern).set_step(0, 2, true, None).unwrap();
        r.scheduler.start(&mut r.clock, 0).unwrap();
        let signal = r.scheduler.stop_signal();
        r.clock.schedule_once(0.25, Box::new(move |_: f64| signal.halt())).unwrap();
        run_steps(&mut r.clock, 4);
        assert!(r.lead.lock().unwrap().is_empty());
        assert!(!r.scheduler.is_running());
    }

    #[test]
    fn edits_take_effect_on_the_next_step() {
        let mut r = rig(4);
        r.scheduler.start(&mut r.clock, 0).unwrap();
        run_steps(&mut r.clock, 1);
        lock(&r.pattern).set_step(0, 1, true, Some(Pitch::new("G3").unwrap())).unwrap();
        run_steps(&mut r.clock, 1);
        let log = r.lead.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].pitch.as_ref().map(Pitch::as_str), Some("G3"));
    }

    #[test]
    fn suspended_clock_reports_unavailable_and_keeps_position() {
        let mut r = rig(4);
        r.scheduler.start(&mut r.clock, 0).unwrap();
        run_steps(&mut r.clock, 2);
        r.scheduler.stop(&mut r.clock);
        r.clock.suspend();
        let err = r.scheduler.start(&mut r.clock, 0).unwrap_err();
        assert!(matches!(err, SeqError::ClockUnavailable(_)));
        assert!(!r.scheduler.is_running());
        assert_eq!(r.scheduler.elapsed_ticks(), 96);
    }

    #[test]
    fn events_report_steps_and_notes() {
        let mut r = rig(2);
        lock(&r.pattern).set_step(0, 1, true, None).unwrap();
        let rx = r.scheduler.subscribe();
        r.scheduler.start(&mut r.clock, 0).unwrap();
        run_steps(&mut r.clock, 2);
        let events: Vec<PlaybackEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], PlaybackEvent::StepAdvanced { step: 0, time: 0.0 });
        assert!(matches!(events[2], PlaybackEvent::NoteOn { channel: 0, step: 1, length: 1, .. }));
    }
}
