//! Live output through the default cpal device.

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};

use crate::error::{Result, SeqError};
use crate::lock;
use crate::transport::Transport;

/// The default output device, opened but not yet streaming. Ask it for the
/// sample rate before building the engine so the clock runs at device rate.
pub struct AudioOutput {
    device: Device,
    config: StreamConfig,
}

impl AudioOutput {
    pub fn open_default() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| SeqError::AudioDevice("no output device".to_string()))?;
        let config: StreamConfig = device
            .default_output_config()
            .map_err(|e| SeqError::AudioDevice(e.to_string()))?
            .into();
        log::info!(
            "output device {:?}: {} Hz, {} channels",
            device.name().unwrap_or_default(), config.sample_rate.0, config.channels
        );
        Ok(Self { device, config })
    }

    pub fn sample_rate(&self) -> u32 { self.config.sample_rate.0 }

    /// Start pulling samples from `transport`. The stream runs until the
    /// returned engine is dropped.
    pub fn start(self, transport: Arc<Mutex<Transport>>) -> Result<AudioEngine> {
        let channels = self.config.channels as usize;
        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut t = lock(&transport);
                    for frame in data.chunks_mut(channels) {
                        let s = t.next_sample();
                        for sample in frame.iter_mut() { *sample = s; }
                    }
                },
                |err| log::error!("audio stream error: {}", err),
                None,
            )
            .map_err(|e| SeqError::AudioDevice(e.to_string()))?;
        stream.play().map_err(|e| SeqError::AudioDevice(e.to_string()))?;
        Ok(AudioEngine { _stream: stream })
    }
}

pub struct AudioEngine {
    _stream: Stream,
}
