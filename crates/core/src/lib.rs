//! Embodied-agent conversational core.
//!
//! Everything here is transport-agnostic: the uplink pipeline, voice activity
//! and barge-in control, the playback buffer, the tool registry and the
//! structured-reply parser. A session client implements [`EnvelopeSender`]
//! to put envelopes on a concrete wire.

pub mod audio_utils;
pub mod generic_types;
pub mod playback;
pub mod structured;
pub mod tools;
pub mod uplink;
pub mod vad;

use async_trait::async_trait;
use generic_types::{Delivery, OutboundEnvelope};

/// Anything that can transmit an envelope to the remote model.
///
/// Implementations must be safe to call from several tasks at once and must
/// never interleave two envelopes on the wire.
#[async_trait]
pub trait EnvelopeSender: Send + Sync {
    /// Returns `Delivery::Dropped` rather than an error when the session is not ready.
    async fn send(&self, envelope: OutboundEnvelope) -> anyhow::Result<Delivery>;
}
