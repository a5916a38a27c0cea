//! Voice activity detection and barge-in handling.
//!
//! Each uplink chunk is band-limited to the speech range with two one-pole IIR
//! stages, reduced to an RMS energy, and compared against a threshold. Speech
//! detected while the agent is talking interrupts playback.

use crate::playback::PlaybackManager;
use std::f32::consts::PI;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct VadConfig {
    pub sample_rate: u32,
    /// Gain the classification assumes was applied to the signal.
    pub input_gain: f32,
    /// RMS level (after gain) above which a chunk counts as speech.
    pub voice_detection_threshold: f32,
    /// Apply the bandpass before measuring energy.
    pub use_bandpass: bool,
    /// Upper edge of the vocal band (low-pass cutoff).
    pub lowpass_cutoff_hz: f32,
    /// Lower edge of the vocal band (high-pass cutoff).
    pub highpass_cutoff_hz: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            input_gain: 1.0,
            voice_detection_threshold: 0.02,
            use_bandpass: true,
            lowpass_cutoff_hz: 3000.0,
            highpass_cutoff_hz: 100.0,
        }
    }
}

/// Filter memory. Persists across chunks for the lifetime of a session.
#[derive(Debug, Default, Clone, Copy)]
struct FilterState {
    lowpass: f32,
    highpass_input: f32,
    highpass_output: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub rms: f32,
    pub is_speech: bool,
}

pub struct VoiceActivityDetector {
    config: VadConfig,
    lowpass_alpha: f32,
    highpass_alpha: f32,
    filter: FilterState,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        let dt = 1.0 / config.sample_rate as f32;
        let lowpass_rc = 1.0 / (2.0 * PI * config.lowpass_cutoff_hz);
        let highpass_rc = 1.0 / (2.0 * PI * config.highpass_cutoff_hz);
        Self {
            lowpass_alpha: dt / (lowpass_rc + dt),
            highpass_alpha: highpass_rc / (highpass_rc + dt),
            filter: FilterState::default(),
            config,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn classify(&mut self, samples: &[f32]) -> Classification {
        if samples.is_empty() {
            return Classification {
                rms: 0.0,
                is_speech: false,
            };
        }

        let mut sum_squares = 0.0f64;
        for &sample in samples {
            let value = if self.config.use_bandpass {
                self.bandpass(sample)
            } else {
                sample
            };
            sum_squares += (value as f64) * (value as f64);
        }

        let rms = (sum_squares / samples.len() as f64).sqrt() as f32;
        Classification {
            rms,
            is_speech: rms * self.config.input_gain > self.config.voice_detection_threshold,
        }
    }

    /// Clears filter memory, for a new session.
    pub fn reset(&mut self) {
        self.filter = FilterState::default();
    }

    fn bandpass(&mut self, x: f32) -> f32 {
        let f = &mut self.filter;
        f.lowpass += self.lowpass_alpha * (x - f.lowpass);
        let y = self.highpass_alpha * (f.highpass_output + f.lowpass - f.highpass_input);
        f.highpass_input = f.lowpass;
        f.highpass_output = y;
        y
    }
}

#[derive(Debug, Clone)]
pub struct InterruptionConfig {
    /// Window after a barge-in during which inbound audio is discarded.
    pub debounce: Duration,
    /// Continuous non-speech after which the user is no longer considered speaking.
    pub silence_threshold: Duration,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            silence_threshold: Duration::from_millis(800),
        }
    }
}

/// What processing one chunk did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkReport {
    pub classification: Classification,
    /// Playback was stopped because of this chunk.
    pub interrupted: bool,
    /// Advisory flag for UI and telemetry.
    pub user_speaking: bool,
}

/// Owns the detector state and stops agent playback on barge-in.
pub struct InterruptionController {
    vad: VoiceActivityDetector,
    playback: PlaybackManager,
    config: InterruptionConfig,
    user_speaking: bool,
    silence_accumulator: Duration,
}

impl InterruptionController {
    pub fn new(
        vad: VoiceActivityDetector,
        playback: PlaybackManager,
        config: InterruptionConfig,
    ) -> Self {
        Self {
            vad,
            playback,
            config,
            user_speaking: false,
            silence_accumulator: Duration::ZERO,
        }
    }

    pub fn is_user_speaking(&self) -> bool {
        self.user_speaking
    }

    pub async fn process_chunk(&mut self, samples: &[f32]) -> ChunkReport {
        let classification = self.vad.classify(samples);
        let chunk_duration =
            Duration::from_secs_f64(samples.len() as f64 / self.vad.config().sample_rate as f64);

        let mut interrupted = false;
        if classification.is_speech {
            self.silence_accumulator = Duration::ZERO;
            if !self.user_speaking {
                debug!(rms = classification.rms, "User started speaking");
            }
            self.user_speaking = true;

            if self.playback.is_playing().await {
                info!(rms = classification.rms, "Barge-in detected, interrupting playback");
                self.playback.interrupt(self.config.debounce).await;
                interrupted = true;
            }
        } else {
            self.silence_accumulator += chunk_duration;
            if self.user_speaking && self.silence_accumulator > self.config.silence_threshold {
                debug!("User stopped speaking");
                self.user_speaking = false;
            }
        }

        ChunkReport {
            classification,
            interrupted,
            user_speaking: self.user_speaking,
        }
    }

    pub fn reset(&mut self) {
        self.vad.reset();
        self.user_speaking = false;
        self.silence_accumulator = Duration::ZERO;
    }
}
