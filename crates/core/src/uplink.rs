//! Audio uplink: microphone samples in, fixed-size wire chunks out.
//!
//! Capture callbacks deliver arbitrary-length buffers. The pipeline slices them
//! into chunks of a fixed duration, keeps the raw chunk for voice-activity
//! classification, and produces the gained, resampled PCM16 payload that goes
//! on the wire.

use crate::audio_utils;
use anyhow::Result;
use rubato::{FastFixedIn, Resampler};
use std::time::Duration;

/// Chunking granularity used for both transmission and barge-in detection.
pub const DEFAULT_CHUNK_DURATION: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct UplinkConfig {
    /// Sample rate of the capture device.
    pub capture_rate: u32,
    /// Sample rate expected by the remote service.
    pub wire_rate: u32,
    /// Linear gain applied before encoding.
    pub input_gain: f32,
    pub chunk_duration: Duration,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            capture_rate: audio_utils::LIVE_INPUT_PCM16_SAMPLE_RATE,
            wire_rate: audio_utils::LIVE_INPUT_PCM16_SAMPLE_RATE,
            input_gain: 1.0,
            chunk_duration: DEFAULT_CHUNK_DURATION,
        }
    }
}

/// One fixed-duration slice of microphone audio.
#[derive(Debug, Clone)]
pub struct UplinkChunk {
    /// Un-gained samples at the capture rate, for classification.
    pub samples: Vec<f32>,
    /// Gained PCM16 little-endian bytes at the wire rate.
    pub pcm: Vec<u8>,
    pub wire_rate: u32,
}

pub struct UplinkPipeline {
    config: UplinkConfig,
    chunk_samples: usize,
    pending: Vec<f32>,
    resampler: Option<FastFixedIn<f32>>,
}

impl UplinkPipeline {
    pub fn new(config: UplinkConfig) -> Result<Self> {
        let chunk_samples = audio_utils::samples_for(config.chunk_duration, config.capture_rate);
        anyhow::ensure!(chunk_samples > 0, "chunk duration too short for capture rate");

        let resampler = if config.capture_rate != config.wire_rate {
            Some(audio_utils::create_resampler(
                config.capture_rate as f64,
                config.wire_rate as f64,
                chunk_samples,
            )?)
        } else {
            None
        };

        Ok(Self {
            config,
            chunk_samples,
            pending: Vec::with_capacity(chunk_samples * 2),
            resampler,
        })
    }

    pub fn config(&self) -> &UplinkConfig {
        &self.config
    }

    /// Samples per chunk at the capture rate.
    pub fn chunk_samples(&self) -> usize {
        self.chunk_samples
    }

    /// Samples held back until a full chunk is available.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    /// Appends captured samples and returns every chunk that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<UplinkChunk>> {
        self.pending.extend_from_slice(samples);

        let mut chunks = Vec::new();
        while self.pending.len() >= self.chunk_samples {
            let raw: Vec<f32> = self.pending.drain(..self.chunk_samples).collect();
            let gained = audio_utils::apply_gain(&raw, self.config.input_gain);
            let wire = match self.resampler.as_mut() {
                Some(resampler) => resampler.process(&[gained], None)?.swap_remove(0),
                None => gained,
            };
            chunks.push(UplinkChunk {
                samples: raw,
                pcm: audio_utils::encode_pcm16_le(&wire),
                wire_rate: self.config.wire_rate,
            });
        }
        Ok(chunks)
    }

    /// Drops any partial chunk, e.g. when the session restarts.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}
