//! Non-protocol collaborators driven by the orchestrator: the avatar's
//! animation layer, a camera, and the audio output.

use embody_core::playback::PlaybackSink;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Receives lifecycle notifications and structured turn output.
#[cfg_attr(test, mockall::automock)]
pub trait AvatarController: Send + Sync {
    fn on_ready(&self);
    /// A fragment of the model's reply text, in arrival order.
    fn on_text(&self, delta: &str);
    /// Parsed body action, facial expression and gaze target for a finished turn.
    fn on_tool_command(&self, action: &str, emotion: &str, gaze: &str);
    fn on_closed(&self, reason: &str);
}

/// Supplies a compressed still frame on demand.
#[cfg_attr(test, mockall::automock)]
pub trait ImageSource: Send + Sync {
    /// JPEG bytes, or `None` when no frame is available.
    fn capture_jpeg(&self) -> Option<Vec<u8>>;
}

/// Collaborators outside the protocol.
pub struct Collaborators {
    pub avatar: Arc<dyn AvatarController>,
    pub images: Option<Arc<dyn ImageSource>>,
}

/// Avatar that writes everything to the log.
#[derive(Debug, Default)]
pub struct LoggingAvatar;

impl AvatarController for LoggingAvatar {
    fn on_ready(&self) {
        info!("Avatar ready");
    }

    fn on_text(&self, delta: &str) {
        debug!(delta, "Avatar text");
    }

    fn on_tool_command(&self, action: &str, emotion: &str, gaze: &str) {
        info!(action, emotion, gaze, "Avatar command");
    }

    fn on_closed(&self, reason: &str) {
        info!(reason, "Avatar session closed");
    }
}

/// Playback sink without an audio device.
///
/// Each unit is logged and reported as playing for its real-time duration so
/// the playback timer behaves as it would with hardware.
#[derive(Debug, Default)]
pub struct LoggingSink {
    playing_until: Mutex<Option<Instant>>,
}

impl PlaybackSink for LoggingSink {
    fn play(&self, samples: Vec<f32>, sample_rate: u32) {
        let duration = Duration::from_secs_f64(samples.len() as f64 / sample_rate.max(1) as f64);
        info!(samples = samples.len(), sample_rate, ?duration, "Playing audio unit");
        if let Ok(mut until) = self.playing_until.lock() {
            *until = Some(Instant::now() + duration);
        }
    }

    fn stop(&self) {
        info!("Playback stopped");
        if let Ok(mut until) = self.playing_until.lock() {
            *until = None;
        }
    }

    fn is_playing(&self) -> bool {
        self.playing_until
            .lock()
            .map(|until| until.is_some_and(|t| Instant::now() < t))
            .unwrap_or(false)
    }
}
