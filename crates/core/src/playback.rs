//! Playback buffer manager.
//!
//! Inbound audio arrives as irregular fragments. They are accumulated here and
//! handed to the host sink as a single unit once a minimum depth is buffered,
//! which removes the clicks that per-fragment playback produces.

use crate::audio_utils;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often to re-check a sink that is still draining the last unit.
const SINK_DRAIN_POLL: Duration = Duration::from_millis(20);

/// Host audio output. The only coupling between the core and audio hardware.
#[cfg_attr(test, mockall::automock)]
pub trait PlaybackSink: Send + Sync {
    fn play(&self, samples: Vec<f32>, sample_rate: u32);
    fn stop(&self);
    fn is_playing(&self) -> bool;
}

/// Ordered buffer of normalized samples.
#[derive(Debug, Default)]
pub struct AudioRingBuffer {
    samples: VecDeque<f32>,
}

impl AudioRingBuffer {
    pub fn append(&mut self, samples: &[f32]) {
        self.samples.extend(samples.iter().copied());
    }

    /// Moves every buffered sample out, leaving the buffer empty.
    pub fn drain_all(&mut self) -> Vec<f32> {
        self.samples.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Discards inbound audio until a deadline after a barge-in.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptionGate {
    ignore_until: Option<Instant>,
}

impl InterruptionGate {
    pub fn close_for(&mut self, debounce: Duration) {
        self.ignore_until = Some(Instant::now() + debounce);
    }

    pub fn is_closed(&self) -> bool {
        self.ignore_until.is_some_and(|until| Instant::now() < until)
    }
}

#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Rate assumed for deltas that do not declare one.
    pub default_sample_rate: u32,
    /// Buffered audio required before a unit starts.
    pub min_buffer: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            default_sample_rate: audio_utils::LIVE_OUTPUT_PCM16_SAMPLE_RATE,
            min_buffer: Duration::from_millis(100),
        }
    }
}

/// Result of offering a delta to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Inside the debounce window; the audio was discarded.
    Gated,
    Buffered,
    /// The delta pushed the buffer over the minimum and a unit started.
    Started,
}

#[derive(Debug)]
struct PlaybackState {
    /// Backlog sealed when the inbound rate changed, each with its own rate.
    sealed: VecDeque<(u32, Vec<f32>)>,
    buffer: AudioRingBuffer,
    gate: InterruptionGate,
    is_playing: bool,
    sample_rate: u32,
    /// Bumped for every unit started and every interruption; stale timers compare against it.
    generation: u64,
}

impl PlaybackState {
    fn buffered(&self) -> usize {
        self.sealed.iter().map(|(_, samples)| samples.len()).sum::<usize>() + self.buffer.len()
    }

    fn is_empty(&self) -> bool {
        self.sealed.is_empty() && self.buffer.is_empty()
    }
}

/// Cloneable handle; all clones share one buffer.
#[derive(Clone)]
pub struct PlaybackManager {
    state: Arc<Mutex<PlaybackState>>,
    sink: Arc<dyn PlaybackSink>,
    config: PlaybackConfig,
    cancel: CancellationToken,
}

impl PlaybackManager {
    pub fn new(
        sink: Arc<dyn PlaybackSink>,
        config: PlaybackConfig,
        cancel: CancellationToken,
    ) -> Self {
        let state = PlaybackState {
            sealed: VecDeque::new(),
            buffer: AudioRingBuffer::default(),
            gate: InterruptionGate::default(),
            is_playing: false,
            sample_rate: config.default_sample_rate,
            generation: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            sink,
            config,
            cancel,
        }
    }

    /// Decodes a PCM16 delta and appends it, starting playback when deep enough.
    pub async fn append_pcm16(&self, pcm: &[u8], sample_rate: Option<u32>) -> AppendOutcome {
        self.append(&audio_utils::decode_pcm16_le(pcm), sample_rate).await
    }

    pub async fn append(&self, samples: &[f32], sample_rate: Option<u32>) -> AppendOutcome {
        let mut state = self.state.lock().await;
        if state.gate.is_closed() {
            debug!(samples = samples.len(), "Dropping inbound audio inside debounce window");
            return AppendOutcome::Gated;
        }
        match sample_rate {
            Some(0) => warn!("Ignoring zero sample rate on inbound audio"),
            Some(rate) if rate != state.sample_rate => {
                if !state.buffer.is_empty() {
                    let backlog = state.buffer.drain_all();
                    let previous = state.sample_rate;
                    state.sealed.push_back((previous, backlog));
                }
                debug!(from = state.sample_rate, to = rate, "Inbound sample rate changed");
                state.sample_rate = rate;
            }
            _ => {}
        }
        state.buffer.append(samples);

        let min_samples = audio_utils::samples_for(self.config.min_buffer, state.sample_rate);
        let ready = !state.sealed.is_empty() || state.buffer.len() > min_samples;
        if !state.is_playing && ready {
            self.start_unit(&mut state);
            AppendOutcome::Started
        } else {
            AppendOutcome::Buffered
        }
    }

    /// Plays whatever is buffered even if below the minimum depth, e.g. at end of turn.
    pub async fn flush(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.gate.is_closed() || state.is_playing || state.is_empty() {
            return false;
        }
        self.start_unit(&mut state);
        true
    }

    /// Stops playback, discards unplayed audio and gates inbound audio for `debounce`.
    pub async fn interrupt(&self, debounce: Duration) {
        let mut state = self.state.lock().await;
        self.sink.stop();
        let discarded = state.buffered();
        state.sealed.clear();
        state.buffer.clear();
        state.is_playing = false;
        state.generation += 1;
        if !debounce.is_zero() {
            state.gate.close_for(debounce);
        }
        info!(discarded, debounce_ms = debounce.as_millis() as u64, "Playback interrupted");
    }

    pub async fn is_playing(&self) -> bool {
        self.state.lock().await.is_playing
    }

    pub async fn buffered_samples(&self) -> usize {
        self.state.lock().await.buffered()
    }

    pub async fn is_gated(&self) -> bool {
        self.state.lock().await.gate.is_closed()
    }

    fn start_unit(&self, state: &mut PlaybackState) {
        let (rate, samples) = match state.sealed.pop_front() {
            Some(segment) => segment,
            None => (state.sample_rate, state.buffer.drain_all()),
        };
        let duration = Duration::from_secs_f64(samples.len() as f64 / rate as f64);
        state.generation += 1;
        state.is_playing = true;
        debug!(samples = samples.len(), rate, "Starting playback unit");
        self.sink.play(samples, rate);
        self.spawn_end_timer(state.generation, duration);
    }

    fn spawn_end_timer(&self, generation: u64, duration: Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut wait = duration;
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = tokio::time::sleep(wait) => {}
                }
                let mut state = manager.state.lock().await;
                // A later unit or an interruption owns the flag now.
                if state.generation != generation {
                    return;
                }
                if manager.sink.is_playing() {
                    wait = SINK_DRAIN_POLL;
                    continue;
                }
                state.is_playing = false;
                if !state.is_empty() && !state.gate.is_closed() {
                    manager.start_unit(&mut state);
                }
                return;
            }
        });
    }
}
