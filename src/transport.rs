use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::clock::{CallbackHandle, FrameClock, MusicalClock, SampleClock};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::scheduler::{PlaybackEvent, Scheduler};
use crate::{lock, SharedPattern, SharedVoices};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState { Stopped, Playing, Paused }

// ── Transport ─────────────────────────────────────────────────────────────────

/// Live playback controller. The audio thread calls [`Transport::next_sample`]
/// once per frame; everything else is called from the control side.
///
/// With looping off, playback stops itself at the end of the current pass.
pub struct Transport {
    clock:        SampleClock,
    scheduler:    Scheduler,
    pattern:      SharedPattern,
    voices:       SharedVoices,
    loop_enabled: bool,
    end_handle:   Option<CallbackHandle>,
    end_reached:  Arc<AtomicBool>,
    state:        TransportState,
}

impl Transport {
    pub fn new(pattern: SharedPattern, voices: SharedVoices, config: &EngineConfig) -> Result<Self> {
        let clock = SampleClock::new(config.sample_rate, config.ppq, EngineConfig::clamp_bpm(config.bpm))?;
        let scheduler = Scheduler::new(Arc::clone(&pattern), Arc::clone(&voices), config.subdivision);
        Ok(Self {
            clock,
            scheduler,
            pattern,
            voices,
            loop_enabled: true,
            end_handle:   None,
            end_reached:  Arc::new(AtomicBool::new(false)),
            state:        TransportState::Stopped,
        })
    }

    pub fn state(&self) -> TransportState { self.state }

    pub fn bpm(&self) -> f64 { self.clock.bpm() }

    pub fn sample_rate(&self) -> u32 { self.clock.sample_rate() }

    pub fn is_looping(&self) -> bool { self.loop_enabled }

    pub fn pattern(&self) -> &SharedPattern { &self.pattern }

    pub fn subscribe(&self) -> std::sync::mpsc::Receiver<PlaybackEvent> { self.scheduler.subscribe() }

    pub fn current_step(&self) -> usize {
        let steps = lock(&self.pattern).step_count();
        self.scheduler.current_step(steps)
    }

    // ── Controls ──────────────────────────────────────────────────────────

    /// Start from step 0, cutting off anything still sounding.
    pub fn play(&mut self) -> Result<()> {
        self.cancel_end();
        lock(&self.voices).silence();
        self.scheduler.start(&mut self.clock, 0)?;
        self.state = TransportState::Playing;
        if !self.loop_enabled {
            self.arm_end()?;
        }
        log::info!("play at {} bpm, loop {}", self.clock.bpm(), self.loop_enabled);
        Ok(())
    }

    pub fn pause(&mut self) {
        if self.state != TransportState::Playing {
            return;
        }
        self.scheduler.stop(&mut self.clock);
        self.cancel_end();
        lock(&self.voices).silence();
        self.state = TransportState::Paused;
    }

    /// Continue from the paused position.
    pub fn resume(&mut self) -> Result<()> {
        if self.state != TransportState::Paused {
            return Ok(());
        }
        let origin = self.scheduler.elapsed_ticks();
        self.scheduler.start(&mut self.clock, origin)?;
        self.state = TransportState::Playing;
        if !self.loop_enabled {
            self.arm_end()?;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.scheduler.stop(&mut self.clock);
        self.scheduler.reset();
        self.cancel_end();
        lock(&self.voices).silence();
        self.state = TransportState::Stopped;
    }

    pub fn set_loop(&mut self, enabled: bool) -> Result<()> {
        self.loop_enabled = enabled;
        if self.state == TransportState::Playing {
            if enabled { self.cancel_end() } else { self.arm_end()? }
        }
        Ok(())
    }

    /// Clamp to the supported range and apply. Returns the tempo in force.
    pub fn set_bpm(&mut self, bpm: f64) -> Result<f64> {
        let bpm = EngineConfig::clamp_bpm(bpm);
        self.clock.set_bpm(bpm)?;
        self.scheduler.retime(&self.clock);
        Ok(bpm)
    }

    // ── Audio thread ──────────────────────────────────────────────────────

    /// Advance the clock one frame and return the mixed sample for it.
    pub fn next_sample(&mut self) -> f32 {
        let frame = self.clock.frame();
        self.clock.advance_frame();
        if self.end_reached.swap(false, Ordering::SeqCst) {
            self.finish();
        }
        lock(&self.voices).render(frame)
    }

    // ── One-shot end ──────────────────────────────────────────────────────

    /// Schedule the stop at the end of the pass the playhead is in.
    fn arm_end(&mut self) -> Result<()> {
        self.cancel_end();
        let steps = lock(&self.pattern).step_count();
        let remaining = steps - self.scheduler.current_step(steps);
        let subdivision = self.scheduler.subdivision();
        let end_at = self.clock.next_boundary_seconds(subdivision)
            + remaining as f64 * subdivision.seconds(self.clock.bpm(), self.clock.ppq());

        let flag = Arc::clone(&self.end_reached);
        let signal = self.scheduler.stop_signal();
        let handle = self.clock.schedule_once(end_at, Box::new(move |_: f64| {
            signal.halt();
            flag.store(true, Ordering::SeqCst);
        }))?;
        self.end_handle = Some(handle);
        Ok(())
    }

    fn cancel_end(&mut self) {
        if let Some(handle) = self.end_handle.take() {
            self.clock.unschedule(handle);
        }
        self.end_reached.store(false, Ordering::SeqCst);
    }

    fn finish(&mut self) {
        self.end_handle = None;
        self.scheduler.stop(&mut self.clock);
        self.scheduler.reset();
        self.state = TransportState::Stopped;
        self.scheduler.notify(PlaybackEvent::Finished);
        log::info!("one-shot playback finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternStore;
    use crate::share;
    use crate::voices::testing::{probe, TriggerLog};
    use crate::voices::{TriggerKind, VoiceRegistry};

    const STEP_FRAMES: usize = 125;

    fn transport(steps: usize) -> (Transport, TriggerLog) {
        let (log, inst) = probe(TriggerKind::Pitched);
        let mut reg = VoiceRegistry::new();
        reg.register("lead", inst);
        let pattern = share(PatternStore::with_instruments(&["lead"], steps).unwrap());
        lock(&pattern).set_step(0, 0, true, None).unwrap();
        let cfg = EngineConfig { sample_rate: 1000, ..EngineConfig::default() };
        (Transport::new(pattern, share(reg), &cfg).unwrap(), log)
    }

    fn run(t: &mut Transport, frames: usize) {
        for _ in 0..frames {
            t.next_sample();
        }
    }

    #[test]
    fn looping_playback_keeps_going() {
        let (mut t, log) = transport(4);
        t.play().unwrap();
        run(&mut t, 3 * 4 * STEP_FRAMES);
        assert_eq!(t.state(), TransportState::Playing);
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn one_shot_stops_at_the_loop_end() {
        let (mut t, log) = transport(4);
        let rx = t.subscribe();
        assert!(t.is_looping());
        t.set_loop(false).unwrap();
        assert!(!t.is_looping());
        t.play().unwrap();
        run(&mut t, 4 * STEP_FRAMES);
        assert_eq!(t.state(), TransportState::Playing);
        t.next_sample();
        assert_eq!(t.state(), TransportState::Stopped);
        run(&mut t, 4 * STEP_FRAMES);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(rx.try_iter().any(|e| e == PlaybackEvent::Finished));
        assert_eq!(t.current_step(), 0);
    }

    #[test]
    fn one_shot_end_follows_whole_tick_steps() {
        let (log, inst) = probe(TriggerKind::Pitched);
        let mut reg = VoiceRegistry::new();
        reg.register("lead", inst);
        let pattern = share(PatternStore::with_instruments(&["lead"], 4).unwrap());
        lock(&pattern).set_step(0, 0, true, None).unwrap();
        let cfg = EngineConfig { sample_rate: 1000, ppq: 90, ..EngineConfig::default() };
        let mut t = Transport::new(pattern, share(reg), &cfg).unwrap();

        t.set_loop(false).unwrap();
        t.play().unwrap();
        // 4 x 22 ticks at 0.18 ticks per frame ends on frame 489
        run(&mut t, 489);
        assert_eq!(t.state(), TransportState::Playing);
        t.next_sample();
        assert_eq!(t.state(), TransportState::Stopped);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn pause_and_resume_continue_without_repeats() {
        let (mut t, log) = transport(4);
        lock(t.pattern()).set_step(0, 2, true, None).unwrap();
        t.play().unwrap();
        run(&mut t, 2 * STEP_FRAMES);
        t.pause();
        assert_eq!(t.state(), TransportState::Paused);
        assert_eq!(t.current_step(), 2);
        run(&mut t, 3 * STEP_FRAMES + 40);
        t.resume().unwrap();
        run(&mut t, 2 * STEP_FRAMES);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].time, 0.75);
    }

    #[test]
    fn stop_rewinds() {
        let (mut t, _) = transport(4);
        t.play().unwrap();
        run(&mut t, 3 * STEP_FRAMES);
        t.stop();
        t.stop();
        assert_eq!(t.state(), TransportState::Stopped);
        assert_eq!(t.current_step(), 0);
    }

    #[test]
    fn tempo_is_clamped() {
        let (mut t, _) = transport(4);
        assert_eq!(t.set_bpm(1000.0).unwrap(), 300.0);
        assert_eq!(t.bpm(), 300.0);
        assert_eq!(t.set_bpm(5.0).unwrap(), 30.0);
    }
}
