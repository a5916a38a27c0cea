//! Turn sequencing on top of the live session.
//!
//! The orchestrator owns no protocol or DSP logic. It primes the model once the
//! session is ready, gates user turns on the wake policy, attaches camera
//! frames, feeds microphone audio through the uplink and barge-in controller,
//! and routes model output to playback, tools and the avatar.

use crate::collaborators::Collaborators;
use crate::config::{VisionMode, WakeMode};
use anyhow::Result;
use embody_core::EnvelopeSender;
use embody_core::generic_types::{Delivery, InboundEvent, OutboundEnvelope};
use embody_core::playback::{AppendOutcome, PlaybackManager};
use embody_core::structured::parse_structured_reply;
use embody_core::tools::{ToolDispatcher, ToolRegistry};
use embody_core::uplink::UplinkPipeline;
use embody_core::vad::{InterruptionConfig, InterruptionController, VoiceActivityDetector};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Control turn sent before the greeting so the model settles into its persona silently.
pub const DEFAULT_PRIME_TEXT: &str =
    "Get ready for the conversation. Stay silent and do not reply to this message.";

/// Input produced by the host outside the live session.
#[derive(Debug, Clone, PartialEq)]
pub enum HostInput {
    /// Microphone samples at the uplink capture rate.
    Audio(Vec<f32>),
    /// Recognized or typed user text.
    UserText(String),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub wake_mode: WakeMode,
    pub wake_phrase: String,
    pub vision_mode: VisionMode,
    pub vision_phrase: String,
    pub prime_text: Option<String>,
    pub greeting: Option<String>,
    pub interruption: InterruptionConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            wake_mode: WakeMode::Always,
            wake_phrase: "hey avatar".to_string(),
            vision_mode: VisionMode::Off,
            vision_phrase: "look".to_string(),
            prime_text: Some(DEFAULT_PRIME_TEXT.to_string()),
            greeting: Some("Say hello to the user.".to_string()),
            interruption: InterruptionConfig::default(),
        }
    }
}

fn contains_phrase(text: &str, phrase: &str) -> bool {
    let phrase = phrase.trim().to_lowercase();
    !phrase.is_empty() && text.to_lowercase().contains(&phrase)
}

/// Decides which user turns reach the model.
#[derive(Debug, Clone)]
pub struct WakeGate {
    mode: WakeMode,
    phrase: String,
    awake: bool,
}

impl WakeGate {
    pub fn new(mode: WakeMode, phrase: impl Into<String>) -> Self {
        Self {
            mode,
            phrase: phrase.into(),
            awake: mode == WakeMode::Always,
        }
    }

    /// Whether the gate is open without needing a phrase.
    pub fn is_awake(&self) -> bool {
        self.awake
    }

    /// Evaluates one utterance and returns whether it should be forwarded.
    pub fn admit(&mut self, text: &str) -> bool {
        match self.mode {
            WakeMode::Always => true,
            WakeMode::Phrase => contains_phrase(text, &self.phrase),
            WakeMode::PhraseOnce => {
                if !self.awake && contains_phrase(text, &self.phrase) {
                    info!("Wake phrase heard, staying awake");
                    self.awake = true;
                }
                self.awake
            }
        }
    }
}

pub struct Orchestrator<S: EnvelopeSender + ?Sized + 'static> {
    sender: Arc<S>,
    dispatcher: ToolDispatcher<S>,
    playback: PlaybackManager,
    interruption: InterruptionController,
    uplink: UplinkPipeline,
    collaborators: Collaborators,
    config: OrchestratorConfig,
    wake: WakeGate,
    turn_text: String,
    ready: bool,
}

impl<S> Orchestrator<S>
where
    S: EnvelopeSender + ?Sized + 'static,
{
    pub fn new(
        sender: Arc<S>,
        registry: Arc<ToolRegistry>,
        playback: PlaybackManager,
        uplink: UplinkPipeline,
        vad: VoiceActivityDetector,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Self {
        let dispatcher = ToolDispatcher::new(registry, Arc::clone(&sender));
        let interruption =
            InterruptionController::new(vad, playback.clone(), config.interruption.clone());
        let wake = WakeGate::new(config.wake_mode, config.wake_phrase.clone());
        Self {
            sender,
            dispatcher,
            playback,
            interruption,
            uplink,
            collaborators,
            config,
            wake,
            turn_text: String::new(),
            ready: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_user_speaking(&self) -> bool {
        self.interruption.is_user_speaking()
    }

    /// Processes events and host input until the session closes, the event
    /// stream ends, or `cancel` fires.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<InboundEvent>,
        mut inputs: mpsc::Receiver<HostInput>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut inputs_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Orchestrator cancelled");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if !self.handle_event(event).await {
                            break;
                        }
                    }
                    None => {
                        info!("Event stream ended");
                        break;
                    }
                },
                input = inputs.recv(), if inputs_open => match input {
                    Some(input) => {
                        if let Err(e) = self.handle_input(input).await {
                            warn!(error = %e, "Failed to forward host input");
                        }
                    }
                    None => {
                        debug!("Host input closed");
                        inputs_open = false;
                    }
                },
            }
        }
        self.playback.interrupt(Duration::ZERO).await;
        Ok(())
    }

    /// Applies one inbound event. Returns `false` once the session is closed.
    pub async fn handle_event(&mut self, event: InboundEvent) -> bool {
        match event {
            InboundEvent::SetupAcknowledged => {
                // Fresh session: no filter memory or partial chunk carries over.
                self.interruption.reset();
                self.uplink.reset();
                self.ready = true;
                self.collaborators.avatar.on_ready();
                self.prime().await;
            }
            InboundEvent::TextDelta(delta) => {
                self.collaborators.avatar.on_text(&delta);
                self.turn_text.push_str(&delta);
            }
            InboundEvent::AudioDelta { pcm, sample_rate } => {
                if self.playback.append_pcm16(&pcm, sample_rate).await == AppendOutcome::Gated {
                    trace!(bytes = pcm.len(), "Dropped audio inside debounce window");
                }
            }
            InboundEvent::ToolCallRequest(call) => {
                info!(call_id = %call.call_id, tool = %call.name, "Tool call requested");
                // Detached: the response is sent by the worker.
                drop(self.dispatcher.spawn(call));
            }
            InboundEvent::TurnInterrupted => {
                info!("Model turn interrupted");
                self.playback.interrupt(Duration::ZERO).await;
                self.turn_text.clear();
            }
            InboundEvent::TurnComplete => {
                self.playback.flush().await;
                self.finish_turn();
            }
            InboundEvent::ConnectionClosed { reason } => {
                warn!(%reason, "Live session closed");
                self.ready = false;
                self.playback.interrupt(Duration::ZERO).await;
                self.collaborators.avatar.on_closed(&reason);
                return false;
            }
        }
        true
    }

    pub async fn handle_input(&mut self, input: HostInput) -> Result<()> {
        match input {
            HostInput::Audio(samples) => self.push_audio(&samples).await,
            HostInput::UserText(text) => self.submit_text(&text).await.map(|_| ()),
        }
    }

    /// Runs microphone samples through barge-in detection and streams them
    /// while the wake gate is open. A failed send does not stop detection on
    /// the remaining chunks.
    pub async fn push_audio(&mut self, samples: &[f32]) -> Result<()> {
        for chunk in self.uplink.push(samples)? {
            self.interruption.process_chunk(&chunk.samples).await;
            if !(self.ready && self.wake.is_awake()) {
                continue;
            }
            let envelope = OutboundEnvelope::AudioChunk {
                pcm: chunk.pcm,
                sample_rate: chunk.wire_rate,
            };
            if let Err(e) = self.sender.send(envelope).await {
                warn!(error = %e, "Failed to stream audio chunk");
            }
        }
        Ok(())
    }

    /// Sends a user turn, attaching a camera frame when the vision policy asks
    /// for one. Returns `Delivery::Dropped` when the wake gate rejects it.
    pub async fn submit_text(&mut self, text: &str) -> Result<Delivery> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Delivery::Dropped);
        }
        if !self.wake.admit(text) {
            debug!(text, "Turn ignored, wake phrase not heard");
            return Ok(Delivery::Dropped);
        }

        if self.wants_image(text) {
            self.attach_image().await?;
        }
        self.sender
            .send(OutboundEnvelope::UserTurn {
                text: text.to_string(),
                turn_complete: true,
            })
            .await
    }

    fn wants_image(&self, text: &str) -> bool {
        match self.config.vision_mode {
            VisionMode::Off => false,
            VisionMode::Always => true,
            VisionMode::Phrase => contains_phrase(text, &self.config.vision_phrase),
        }
    }

    async fn attach_image(&self) -> Result<()> {
        let Some(images) = &self.collaborators.images else {
            debug!("Vision requested but no image source configured");
            return Ok(());
        };
        match images.capture_jpeg() {
            Some(jpeg) => {
                debug!(bytes = jpeg.len(), "Attaching camera frame");
                self.sender.send(OutboundEnvelope::ImageFrame { jpeg }).await?;
            }
            None => warn!("Image source returned no frame"),
        }
        Ok(())
    }

    async fn prime(&self) {
        let turns = [
            (self.config.prime_text.as_deref(), false),
            (self.config.greeting.as_deref(), true),
        ];
        for (text, turn_complete) in turns {
            let Some(text) = text else { continue };
            let envelope = OutboundEnvelope::UserTurn {
                text: text.to_string(),
                turn_complete,
            };
            if let Err(e) = self.sender.send(envelope).await {
                warn!(error = %e, "Failed to send opening turn");
            }
        }
    }

    fn finish_turn(&mut self) {
        let raw = std::mem::take(&mut self.turn_text);
        if raw.trim().is_empty() {
            return;
        }
        let reply = parse_structured_reply(&raw);
        info!(
            text = %reply.text,
            action = %reply.action,
            emotion = %reply.emotion,
            gaze = %reply.gaze,
            "Model turn complete"
        );
        self.collaborators
            .avatar
            .on_tool_command(&reply.action, &reply.emotion, &reply.gaze);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ImageSource, MockAvatarController, MockImageSource};
    use async_trait::async_trait;
    use embody_core::audio_utils::encode_pcm16_le;
    use embody_core::generic_types::PendingToolCall;
    use embody_core::playback::{PlaybackConfig, PlaybackSink};
    use embody_core::tools::ToolDefinition;
    use embody_core::uplink::UplinkConfig;
    use embody_core::vad::VadConfig;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<OutboundEnvelope>>,
        failing: AtomicBool,
    }

    impl RecordingSender {
        fn sent(&self) -> Vec<OutboundEnvelope> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EnvelopeSender for RecordingSender {
        async fn send(&self, envelope: OutboundEnvelope) -> Result<Delivery> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("transport down");
            }
            self.sent.lock().unwrap().push(envelope);
            Ok(Delivery::Sent)
        }
    }

    #[derive(Default)]
    struct CountingSink {
        plays: AtomicUsize,
        stops: AtomicUsize,
    }

    impl PlaybackSink for CountingSink {
        fn play(&self, _samples: Vec<f32>, _sample_rate: u32) {
            self.plays.fetch_add(1, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn is_playing(&self) -> bool {
            false
        }
    }

    fn quiet_avatar() -> MockAvatarController {
        let mut avatar = MockAvatarController::new();
        avatar.expect_on_ready().return_const(());
        avatar.expect_on_text().return_const(());
        avatar.expect_on_tool_command().return_const(());
        avatar.expect_on_closed().return_const(());
        avatar
    }

    struct Harness {
        orchestrator: Orchestrator<RecordingSender>,
        sender: Arc<RecordingSender>,
        sink: Arc<CountingSink>,
    }

    fn harness(
        config: OrchestratorConfig,
        avatar: MockAvatarController,
        images: Option<MockImageSource>,
    ) -> Harness {
        let sender = Arc::new(RecordingSender::default());
        let sink = Arc::new(CountingSink::default());
        let playback = PlaybackManager::new(
            sink.clone(),
            PlaybackConfig::default(),
            CancellationToken::new(),
        );
        let registry = Arc::new(ToolRegistry::from_definitions([ToolDefinition::new(
            "wave_hand",
            "Wave",
        )
        .with_fn(|_| async { Ok(json!("waved")) })]));
        let vad = VoiceActivityDetector::new(VadConfig {
            use_bandpass: false,
            ..VadConfig::default()
        });
        let uplink = UplinkPipeline::new(UplinkConfig::default()).unwrap();
        let collaborators = Collaborators {
            avatar: Arc::new(avatar),
            images: images.map(|i| Arc::new(i) as Arc<dyn ImageSource>),
        };
        let orchestrator = Orchestrator::new(
            sender.clone(),
            registry,
            playback,
            uplink,
            vad,
            collaborators,
            config,
        );
        Harness {
            orchestrator,
            sender,
            sink,
        }
    }

    fn user_turns(sent: &[OutboundEnvelope]) -> Vec<(String, bool)> {
        sent.iter()
            .filter_map(|e| match e {
                OutboundEnvelope::UserTurn {
                    text,
                    turn_complete,
                } => Some((text.clone(), *turn_complete)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_wake_gate_modes() {
        let mut always = WakeGate::new(WakeMode::Always, "hey avatar");
        assert!(always.admit("what time is it"));

        let mut phrase = WakeGate::new(WakeMode::Phrase, "hey avatar");
        assert!(!phrase.admit("what time is it"));
        assert!(phrase.admit("Hey Avatar, what time is it"));
        assert!(!phrase.admit("and tomorrow?"));
        assert!(!phrase.is_awake());

        let mut once = WakeGate::new(WakeMode::PhraseOnce, "hey avatar");
        assert!(!once.admit("hello"));
        assert!(once.admit("hey avatar"));
        assert!(once.admit("and tomorrow?"));
        assert!(once.is_awake());
    }

    #[tokio::test]
    async fn test_setup_ack_primes_then_greets() {
        let mut avatar = MockAvatarController::new();
        avatar.expect_on_ready().times(1).return_const(());
        let mut h = harness(OrchestratorConfig::default(), avatar, None);

        assert!(h.orchestrator.handle_event(InboundEvent::SetupAcknowledged).await);
        assert!(h.orchestrator.is_ready());
        assert_eq!(
            user_turns(&h.sender.sent()),
            vec![
                (DEFAULT_PRIME_TEXT.to_string(), false),
                ("Say hello to the user.".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_opening_turns_when_disabled() {
        let config = OrchestratorConfig {
            prime_text: None,
            greeting: None,
            ..OrchestratorConfig::default()
        };
        let mut h = harness(config, quiet_avatar(), None);
        h.orchestrator.handle_event(InboundEvent::SetupAcknowledged).await;
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_turn_complete_routes_structured_reply() {
        let mut avatar = MockAvatarController::new();
        avatar.expect_on_text().times(2).return_const(());
        avatar
            .expect_on_tool_command()
            .withf(|action, emotion, gaze| action == "wave" && emotion == "smile" && gaze == "none")
            .times(1)
            .return_const(());
        let mut h = harness(OrchestratorConfig::default(), avatar, None);

        h.orchestrator
            .handle_event(InboundEvent::TextDelta("message: Hi there ||| body ".to_string()))
            .await;
        h.orchestrator
            .handle_event(InboundEvent::TextDelta(
                "action: wave ||| face:smile ||| gaze:none".to_string(),
            ))
            .await;
        h.orchestrator.handle_event(InboundEvent::TurnComplete).await;
        // A second completion with no text is not routed again.
        h.orchestrator.handle_event(InboundEvent::TurnComplete).await;
    }

    #[tokio::test]
    async fn test_interrupted_turn_discards_text() {
        let mut avatar = MockAvatarController::new();
        avatar.expect_on_text().return_const(());
        avatar.expect_on_tool_command().never();
        let mut h = harness(OrchestratorConfig::default(), avatar, None);

        h.orchestrator
            .handle_event(InboundEvent::TextDelta("message: I was say".to_string()))
            .await;
        h.orchestrator.handle_event(InboundEvent::TurnInterrupted).await;
        h.orchestrator.handle_event(InboundEvent::TurnComplete).await;
    }

    #[tokio::test]
    async fn test_tool_call_gets_response() {
        let mut h = harness(OrchestratorConfig::default(), quiet_avatar(), None);
        h.orchestrator
            .handle_event(InboundEvent::ToolCallRequest(PendingToolCall {
                call_id: "fc-1".to_string(),
                name: "wave_hand".to_string(),
                raw_arguments: json!({}),
            }))
            .await;

        let response = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let found = h.sender.sent().into_iter().find_map(|e| match e {
                    OutboundEnvelope::ToolResponse(r) => Some(r),
                    _ => None,
                });
                if let Some(response) = found {
                    return response;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(response.call_id, "fc-1");
        assert_eq!(response.payload()["status"], "success");
    }

    #[tokio::test]
    async fn test_wake_phrase_gates_text_turns() {
        let config = OrchestratorConfig {
            wake_mode: WakeMode::Phrase,
            ..OrchestratorConfig::default()
        };
        let mut h = harness(config, quiet_avatar(), None);

        let ignored = h.orchestrator.submit_text("what's the weather").await.unwrap();
        assert_eq!(ignored, Delivery::Dropped);
        let sent = h.orchestrator.submit_text("hey avatar, what's the weather").await.unwrap();
        assert_eq!(sent, Delivery::Sent);
        assert_eq!(
            user_turns(&h.sender.sent()),
            vec![("hey avatar, what's the weather".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_vision_phrase_attaches_frame_first() {
        let mut images = MockImageSource::new();
        images
            .expect_capture_jpeg()
            .times(1)
            .returning(|| Some(vec![0xff, 0xd8, 0xff]));
        let config = OrchestratorConfig {
            vision_mode: VisionMode::Phrase,
            ..OrchestratorConfig::default()
        };
        let mut h = harness(config, quiet_avatar(), Some(images));

        h.orchestrator.submit_text("hello").await.unwrap();
        h.orchestrator.submit_text("Look at my drawing").await.unwrap();

        let sent = h.sender.sent();
        assert_eq!(sent.len(), 3);
        assert!(matches!(sent[0], OutboundEnvelope::UserTurn { .. }));
        assert_eq!(sent[1], OutboundEnvelope::ImageFrame { jpeg: vec![0xff, 0xd8, 0xff] });
        assert!(matches!(
            &sent[2],
            OutboundEnvelope::UserTurn { text, .. } if text == "Look at my drawing"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_audio_plays_and_speech_interrupts() {
        let mut h = harness(OrchestratorConfig::default(), quiet_avatar(), None);
        h.orchestrator.handle_event(InboundEvent::SetupAcknowledged).await;

        // 150 ms at 24 kHz clears the minimum playback depth.
        let pcm = encode_pcm16_le(&vec![0.1; 3600]);
        h.orchestrator
            .handle_event(InboundEvent::AudioDelta {
                pcm: pcm.clone(),
                sample_rate: Some(24000),
            })
            .await;
        assert_eq!(h.sink.plays.load(Ordering::SeqCst), 1);

        // One 50 ms chunk of loud tone at 16 kHz.
        h.orchestrator.push_audio(&tone(800)).await.unwrap();

        assert_eq!(h.sink.stops.load(Ordering::SeqCst), 1);
        assert!(h.orchestrator.is_user_speaking());
        let audio_chunks = h
            .sender
            .sent()
            .into_iter()
            .filter(|e| matches!(e, OutboundEnvelope::AudioChunk { sample_rate: 16000, .. }))
            .count();
        assert_eq!(audio_chunks, 1);

        // Inbound audio inside the debounce window never reaches the sink.
        h.orchestrator
            .handle_event(InboundEvent::AudioDelta {
                pcm,
                sample_rate: Some(24000),
            })
            .await;
        assert_eq!(h.sink.plays.load(Ordering::SeqCst), 1);
    }

    fn tone(samples: usize) -> Vec<f32> {
        (0..samples)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 300.0 * i as f32 / 16000.0).sin())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_audio_send_keeps_detecting_speech() {
        let mut h = harness(OrchestratorConfig::default(), quiet_avatar(), None);
        h.orchestrator.handle_event(InboundEvent::SetupAcknowledged).await;
        h.orchestrator
            .handle_event(InboundEvent::AudioDelta {
                pcm: encode_pcm16_le(&vec![0.1; 3600]),
                sample_rate: Some(24000),
            })
            .await;
        h.sender.failing.store(true, Ordering::SeqCst);

        // A silent chunk whose send fails, then a loud one in the same batch.
        let mut samples = vec![0.0; 800];
        samples.extend(tone(800));
        h.orchestrator.push_audio(&samples).await.unwrap();

        assert_eq!(h.sink.stops.load(Ordering::SeqCst), 1);
        assert!(h.orchestrator.is_user_speaking());
    }

    #[tokio::test]
    async fn test_setup_ack_resets_speech_state() {
        let config = OrchestratorConfig {
            prime_text: None,
            greeting: None,
            ..OrchestratorConfig::default()
        };
        let mut h = harness(config, quiet_avatar(), None);
        h.orchestrator.push_audio(&tone(800)).await.unwrap();
        assert!(h.orchestrator.is_user_speaking());

        h.orchestrator.handle_event(InboundEvent::SetupAcknowledged).await;
        assert!(!h.orchestrator.is_user_speaking());
    }

    #[tokio::test]
    async fn test_audio_not_streamed_before_ready() {
        let mut h = harness(OrchestratorConfig::default(), quiet_avatar(), None);
        h.orchestrator.push_audio(&vec![0.0; 1600]).await.unwrap();
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_connection_closed() {
        let mut avatar = MockAvatarController::new();
        avatar.expect_on_ready().return_const(());
        avatar
            .expect_on_closed()
            .withf(|reason| reason == "stream ended")
            .times(1)
            .return_const(());
        let h = harness(OrchestratorConfig::default(), avatar, None);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::channel(8);
        events_tx.send(InboundEvent::SetupAcknowledged).unwrap();
        inputs_tx
            .send(HostInput::UserText("how are you?".to_string()))
            .await
            .unwrap();
        drop(inputs_tx);

        let sender = h.sender.clone();
        let run = tokio::spawn(h.orchestrator.run(events_rx, inputs_rx, CancellationToken::new()));
        tokio::time::timeout(Duration::from_secs(2), async {
            while !user_turns(&sender.sent()).iter().any(|(t, _)| t == "how are you?") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        events_tx
            .send(InboundEvent::ConnectionClosed {
                reason: "stream ended".to_string(),
            })
            .unwrap();
        run.await.unwrap().unwrap();
    }
}
