//! loopseq CLI: headless playback and one-loop WAV export.
//!
//! Usage:
//!   loopseq song.json
//!   loopseq song.json --wav loop.wav
//!   loopseq song.json --loop --bpm 140 --config engine.json

use std::collections::BTreeSet;
use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use loopseq::audio::AudioOutput;
use loopseq::scheduler::PlaybackEvent;
use loopseq::{share, wav, Composition, EngineConfig, LoopExporter, PatternStore, Transport, TransportState};

struct Args {
    composition: String,
    config:      Option<String>,
    wav:         Option<String>,
    bpm:         Option<f64>,
    looping:     bool,
}

fn flag_value(args: &[String], name: &str) -> Option<String> {
    args.iter().position(|a| a == name).and_then(|i| args.get(i + 1)).cloned()
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = env::args().collect();
    let Some(composition) = args.get(1).filter(|a| !a.starts_with("--")).cloned() else {
        bail!("Usage: loopseq <composition.json> [--wav out.wav] [--bpm N] [--loop] [--config engine.json]");
    };
    let bpm = match flag_value(&args, "--bpm") {
        Some(v) => Some(v.parse::<f64>().with_context(|| format!("--bpm expects a number, got {:?}", v))?),
        None => None,
    };
    Ok(Args {
        composition,
        config:  flag_value(&args, "--config"),
        wav:     flag_value(&args, "--wav"),
        bpm,
        looping: args.iter().any(|a| a == "--loop"),
    })
}

fn main() -> Result<()> {
    env_logger::init();
    let args = parse_args()?;

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let comp = Composition::load(&args.composition)?;
    config.bpm = EngineConfig::clamp_bpm(args.bpm.or(comp.bpm).unwrap_or(config.bpm));

    let mut store = PatternStore::new(config.steps)?;
    store.apply_composition(&comp)?;

    println!("Title:    {}", comp.title.as_deref().unwrap_or("untitled"));
    println!("Tempo:    {} BPM", config.bpm);
    println!("Steps:    {}", store.step_count());
    println!("Channels: {}", store.channel_count());
    for (i, ch) in store.channels().iter().enumerate() {
        let runs = loopseq::runs::channel_runs(&store, i)?;
        println!("  {:>2} {:<12} vol {:.2} {:>3} notes", i, ch.instrument_id, ch.volume, runs.len());
    }
    println!();

    match &args.wav {
        Some(path) => render_to_wav(store, &config, path),
        None => play_audio(store, config, args.looping),
    }
}

fn render_to_wav(store: PatternStore, config: &EngineConfig, path: &str) -> Result<()> {
    let steps = store.step_count();
    let exporter = LoopExporter::new(share(config.voice_registry()), config);
    println!("Rendering {:.2}s to {} at {} Hz...", exporter.loop_duration(config.bpm, steps), path, config.sample_rate);

    let buffer = exporter
        .export_one_loop(&share(store), config.bpm, steps)
        .context("Export failed")?;
    wav::write_wav(path, &buffer)?;
    println!("Done. {} frames, peak {:.3}", buffer.len(), buffer.peak());
    Ok(())
}

fn play_audio(store: PatternStore, mut config: EngineConfig, looping: bool) -> Result<()> {
    let output = AudioOutput::open_default()?;
    config.sample_rate = output.sample_rate();

    let steps = store.step_count();
    let transport = share(Transport::new(share(store), share(config.voice_registry()), &config)?);
    let (events, looping) = {
        let mut t = transport.lock().unwrap_or_else(|e| e.into_inner());
        t.set_loop(looping)?;
        t.play()?;
        (t.subscribe(), t.is_looping())
    };
    let _engine = output.start(Arc::clone(&transport))?;
    println!("Playing {}...", if looping { "on loop (Ctrl-C to quit)" } else { "one pass" });

    let mut warned = BTreeSet::new();
    loop {
        for event in events.try_iter() {
            match event {
                PlaybackEvent::StepAdvanced { step, .. } => {
                    print!("\rStep {:>2}/{}", step + 1, steps);
                    let _ = std::io::stdout().flush();
                }
                PlaybackEvent::UnknownInstrument { channel, instrument } if warned.insert(channel) => {
                    eprintln!("\nchannel {}: unknown instrument {:?}", channel, instrument);
                }
                _ => {}
            }
        }
        let state = transport.lock().unwrap_or_else(|e| e.into_inner()).state();
        if state == TransportState::Stopped {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    // let the release tails ring out
    std::thread::sleep(Duration::from_millis(300));
    println!("\rDone.          ");
    Ok(())
}
