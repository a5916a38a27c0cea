use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use embody_core::EnvelopeSender;
use embody_core::generic_types::{Delivery, InboundEvent, OutboundEnvelope, SessionConfig};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::SessionError;
use crate::protocol;

/// Upper bound on the close handshake and on joining the receive loop.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type WsStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingSetupAck,
    Ready,
    Closing,
}

struct Shared {
    state: watch::Sender<SessionState>,
    writer: Mutex<Option<WsSink>>,
    cancel: StdMutex<CancellationToken>,
    sequence: AtomicU64,
    /// Bumped by every connect attempt; stale receive loops compare against it.
    attempt: AtomicU64,
    events: mpsc::UnboundedSender<InboundEvent>,
    receive_task: StdMutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn current_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    /// Leaves `Connecting` for `Disconnected` unless a disconnect already moved on.
    fn abandon_connect(&self) {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Disconnected;
                true
            } else {
                false
            }
        });
    }

    fn handle_frame(&self, text: &str) {
        let events = match protocol::decode_server_message(text) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "Dropping malformed server message");
                return;
            }
        };
        for event in events {
            if event == InboundEvent::SetupAcknowledged {
                let became_ready = self.state.send_if_modified(|state| {
                    if matches!(state, SessionState::Connecting | SessionState::AwaitingSetupAck) {
                        *state = SessionState::Ready;
                        true
                    } else {
                        false
                    }
                });
                if became_ready {
                    info!("Setup acknowledged, session ready");
                } else {
                    debug!("Ignoring setup acknowledgement outside of setup");
                }
            }
            if self.events.send(event).is_err() {
                debug!("No event subscriber, dropping inbound event");
            }
        }
    }
}

/// A single bidirectional live session.
///
/// Cloning yields another handle to the same session. Sends from any number
/// of tasks are serialized on one writer so frames never interleave.
#[derive(Clone)]
pub struct LiveClient {
    shared: Arc<Shared>,
}

impl LiveClient {
    /// Creates a disconnected client and the receiver for its inbound events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InboundEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Disconnected);
        let client = Self {
            shared: Arc::new(Shared {
                state,
                writer: Mutex::new(None),
                cancel: StdMutex::new(CancellationToken::new()),
                sequence: AtomicU64::new(0),
                attempt: AtomicU64::new(0),
                events,
                receive_task: StdMutex::new(None),
            }),
        };
        (client, events_rx)
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Number of envelopes written in the current session.
    pub fn sequence(&self) -> u64 {
        self.shared.sequence.load(Ordering::SeqCst)
    }

    /// Token cancelled when the current session ends.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.current_token()
    }

    /// Opens a websocket to `url`, sends the setup envelope and waits for the
    /// acknowledgement. The whole sequence is bounded by `timeout`.
    #[instrument(skip_all, fields(model = %config.model))]
    pub async fn connect(
        &self,
        url: &str,
        config: SessionConfig,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let deadline = Instant::now() + timeout;
        let (attempt, cancel) = self.begin_connect()?;

        let handshake = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Connect abandoned by disconnect");
                return Err(SessionError::ClosedDuringSetup);
            }
            result = tokio::time::timeout_at(deadline, connect_async(url)) => result,
        };
        let ws_stream = match handshake {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                error!(error = %e, "Failed to open live connection");
                self.shared.abandon_connect();
                return Err(SessionError::Connect(e));
            }
            Err(_) => {
                error!("Timed out opening live connection");
                self.shared.abandon_connect();
                return Err(SessionError::ConnectTimeout);
            }
        };
        info!("Live connection established");

        let (sink, stream) = ws_stream.split();
        self.start(attempt, cancel, Box::pin(sink), Box::pin(stream), config, deadline)
            .await
    }

    /// Same as [`connect`](Self::connect) over an already-open transport.
    pub async fn connect_with(
        &self,
        sink: WsSink,
        stream: WsStream,
        config: SessionConfig,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let deadline = Instant::now() + timeout;
        let (attempt, cancel) = self.begin_connect()?;
        self.start(attempt, cancel, sink, stream, config, deadline)
            .await
    }

    /// Claims the client for a new session and installs its cancellation token,
    /// so a disconnect issued mid-handshake cancels this attempt.
    fn begin_connect(&self) -> Result<(u64, CancellationToken), SessionError> {
        let mut previous = SessionState::Disconnected;
        let started = self.shared.state.send_if_modified(|state| {
            previous = *state;
            if *state == SessionState::Disconnected {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(SessionError::InvalidState(previous));
        }
        let cancel = CancellationToken::new();
        *lock(&self.shared.cancel) = cancel.clone();
        let attempt = self.shared.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((attempt, cancel))
    }

    async fn start(
        &self,
        attempt: u64,
        cancel: CancellationToken,
        sink: WsSink,
        stream: WsStream,
        config: SessionConfig,
        deadline: Instant,
    ) -> Result<(), SessionError> {
        {
            let mut writer = self.shared.writer.lock().await;
            // Disconnect cancels before it takes the writer; a sink installed
            // after that would stay open.
            if cancel.is_cancelled() {
                drop(writer);
                close_sink(sink).await;
                info!("Connect abandoned by disconnect");
                return Err(SessionError::ClosedDuringSetup);
            }
            *writer = Some(sink);
        }
        self.shared.sequence.store(0, Ordering::SeqCst);

        let mut state_rx = self.shared.state.subscribe();
        let receive = receive_loop(self.shared.clone(), stream, attempt, cancel);
        *lock(&self.shared.receive_task) = Some(tokio::spawn(receive));

        match self.send(OutboundEnvelope::Setup(config)).await {
            Ok(Delivery::Sent) => {}
            Ok(Delivery::Dropped) => {
                self.disconnect().await;
                return Err(SessionError::ClosedDuringSetup);
            }
            Err(e) => {
                self.disconnect().await;
                return Err(e);
            }
        }
        self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::AwaitingSetupAck;
                true
            } else {
                false
            }
        });
        debug!("Setup sent, awaiting acknowledgement");

        let outcome = tokio::time::timeout_at(
            deadline,
            state_rx.wait_for(|s| matches!(s, SessionState::Ready | SessionState::Disconnected)),
        )
        .await
        .map(|result| result.map(|state| *state));

        match outcome {
            Ok(Ok(SessionState::Ready)) => Ok(()),
            Ok(_) => Err(SessionError::ClosedDuringSetup),
            Err(_) => {
                warn!("Setup acknowledgement did not arrive in time");
                self.disconnect().await;
                Err(SessionError::SetupTimeout)
            }
        }
    }

    /// Writes one envelope. Returns `Delivery::Dropped` with a warning when the
    /// session is not in a state that accepts it.
    pub async fn send(&self, envelope: OutboundEnvelope) -> Result<Delivery, SessionError> {
        let state = self.state();
        let accepted = if envelope.is_setup() {
            state == SessionState::Connecting
        } else {
            state == SessionState::Ready
        };
        if !accepted {
            warn!(kind = envelope.kind(), ?state, "Dropping envelope, session not ready");
            return Ok(Delivery::Dropped);
        }

        let kind = envelope.kind();
        let payload = protocol::encode_envelope(&envelope)?;
        let cancel = self.shared.current_token();

        let mut writer = tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            writer = self.shared.writer.lock() => writer,
        };
        let Some(sink) = writer.as_mut() else {
            warn!(kind, "Dropping envelope, no open writer");
            return Ok(Delivery::Dropped);
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            result = sink.send(Message::Text(payload.into())) => {
                result?;
                let sequence = self.shared.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                if matches!(envelope, OutboundEnvelope::AudioChunk { .. }) {
                    trace!(sequence, kind, "Envelope sent");
                } else {
                    debug!(sequence, kind, "Envelope sent");
                }
                Ok(Delivery::Sent)
            }
        }
    }

    /// Cancels the session and closes the transport. Safe to call in any state.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        let active = self.shared.state.send_if_modified(|state| {
            if matches!(state, SessionState::Disconnected | SessionState::Closing) {
                false
            } else {
                *state = SessionState::Closing;
                true
            }
        });
        if !active {
            return;
        }

        self.shared.current_token().cancel();

        let sink = self.shared.writer.lock().await.take();
        if let Some(sink) = sink {
            close_sink(sink).await;
        }

        let task = lock(&self.shared.receive_task).take();
        if let Some(task) = task {
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                warn!("Receive loop did not stop in time");
            }
        }

        self.shared.state.send_replace(SessionState::Disconnected);
        info!("Live session disconnected");
    }
}

#[async_trait]
impl EnvelopeSender for LiveClient {
    async fn send(&self, envelope: OutboundEnvelope) -> anyhow::Result<Delivery> {
        Ok(LiveClient::send(self, envelope).await?)
    }
}

async fn close_sink(mut sink: WsSink) {
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => debug!("Close handshake complete"),
        Ok(Err(e)) => debug!(error = %e, "Close handshake failed"),
        Err(_) => warn!("Close handshake timed out"),
    }
}

async fn receive_loop(
    shared: Arc<Shared>,
    mut stream: WsStream,
    attempt: u64,
    cancel: CancellationToken,
) {
    let reason = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break "closed by client".to_string(),
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => shared.handle_frame(&text),
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => shared.handle_frame(text),
                Err(_) => warn!(len = bytes.len(), "Ignoring non-UTF-8 binary frame"),
            },
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => format!("closed by server: {} {}", frame.code, frame.reason),
                    None => "closed by server".to_string(),
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "Live transport error");
                break format!("transport error: {e}");
            }
            None => break "stream ended".to_string(),
        }
    };

    cancel.cancel();
    {
        // Only the loop of the current attempt may tear down shared state.
        let mut writer = shared.writer.lock().await;
        let current = shared.attempt.load(Ordering::SeqCst) == attempt;
        let closing = *shared.state.borrow() == SessionState::Closing;
        if current && !closing {
            writer.take();
            shared.state.send_if_modified(|state| {
                let active = *state != SessionState::Disconnected;
                *state = SessionState::Disconnected;
                active
            });
        }
    }
    info!(%reason, "Receive loop finished");
    if shared
        .events
        .send(InboundEvent::ConnectionClosed { reason })
        .is_err()
    {
        debug!("No event subscriber for connection close");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embody_core::generic_types::Modality;
    use futures::channel::mpsc as fmpsc;
    use serde_json::Value;
    use std::collections::HashSet;

    struct Transport {
        outbound: fmpsc::UnboundedReceiver<Message>,
        inbound: fmpsc::UnboundedSender<Result<Message, WsError>>,
    }

    fn transport() -> (WsSink, WsStream, Transport) {
        let (out_tx, out_rx) = fmpsc::unbounded::<Message>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Message, WsError>>();
        let sink: WsSink = Box::pin(out_tx.sink_map_err(|_| WsError::ConnectionClosed));
        let stream: WsStream = Box::pin(in_rx);
        (
            sink,
            stream,
            Transport {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }

    fn config() -> SessionConfig {
        SessionConfig {
            model: "models/test".to_string(),
            response_modalities: vec![Modality::Audio],
            ..Default::default()
        }
    }

    fn frame_json(message: Message) -> Value {
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn server(transport: &Transport, text: &str) {
        transport
            .inbound
            .unbounded_send(Ok(Message::Text(text.to_string().into())))
            .unwrap();
    }

    /// Drives a session to Ready and returns the setup frame that was sent.
    async fn ready_client() -> (
        LiveClient,
        mpsc::UnboundedReceiver<InboundEvent>,
        Transport,
        Value,
    ) {
        let (client, events) = LiveClient::new();
        let (sink, stream, mut transport) = transport();
        let connecting = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .connect_with(sink, stream, config(), Duration::from_secs(5))
                    .await
            }
        });
        let setup = frame_json(transport.outbound.next().await.unwrap());
        server(&transport, r#"{"setupComplete":{}}"#);
        connecting.await.unwrap().unwrap();
        (client, events, transport, setup)
    }

    #[tokio::test]
    async fn test_connect_happy_path() {
        let (client, mut events, mut transport, setup) = ready_client().await;
        assert_eq!(setup["setup"]["model"], "models/test");
        assert_eq!(client.state(), SessionState::Ready);
        assert_eq!(events.recv().await, Some(InboundEvent::SetupAcknowledged));

        let delivery = client
            .send(OutboundEnvelope::UserTurn {
                text: "hello".to_string(),
                turn_complete: true,
            })
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Sent);

        let frame = frame_json(transport.outbound.next().await.unwrap());
        assert_eq!(frame["clientContent"]["turns"][0]["parts"][0]["text"], "hello");
        assert_eq!(frame["clientContent"]["turnComplete"], true);
        assert!(transport.outbound.try_next().is_err());
        assert_eq!(client.sequence(), 2);
    }

    #[tokio::test]
    async fn test_sends_dropped_until_ready() {
        let (client, _events) = LiveClient::new();
        let turn = OutboundEnvelope::UserTurn {
            text: "too early".to_string(),
            turn_complete: true,
        };
        assert_eq!(client.send(turn.clone()).await.unwrap(), Delivery::Dropped);

        let (sink, stream, mut transport) = transport();
        let connecting = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .connect_with(sink, stream, config(), Duration::from_secs(5))
                    .await
            }
        });
        let setup = frame_json(transport.outbound.next().await.unwrap());
        assert!(setup.get("setup").is_some());

        // Setup sent but not acknowledged.
        assert_eq!(client.send(turn.clone()).await.unwrap(), Delivery::Dropped);
        assert!(transport.outbound.try_next().is_err());

        server(&transport, r#"{"setup_complete":{}}"#);
        connecting.await.unwrap().unwrap();
        assert_eq!(client.send(turn).await.unwrap(), Delivery::Sent);
    }

    #[tokio::test]
    async fn test_concurrent_sends_never_interleave() {
        let (client, _events, mut transport, _) = ready_client().await;

        let mut tasks = Vec::new();
        for i in 0..32 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client
                    .send(OutboundEnvelope::UserTurn {
                        text: format!("turn-{i}"),
                        turn_complete: true,
                    })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), Delivery::Sent);
        }

        let mut seen = HashSet::new();
        for _ in 0..32 {
            let frame = frame_json(transport.outbound.next().await.unwrap());
            let text = frame["clientContent"]["turns"][0]["parts"][0]["text"]
                .as_str()
                .unwrap()
                .to_string();
            seen.insert(text);
        }
        let expected: HashSet<String> = (0..32).map(|i| format!("turn-{i}")).collect();
        assert_eq!(seen, expected);
        assert_eq!(client.sequence(), 33);
    }

    #[tokio::test]
    async fn test_connect_rejected_when_not_disconnected() {
        let (client, _events, _transport, _) = ready_client().await;
        let (sink, stream, _other) = transport();
        let err = client
            .connect_with(sink, stream, config(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(SessionState::Ready)));
    }

    #[tokio::test]
    async fn test_setup_timeout_returns_to_disconnected() {
        let (client, _events) = LiveClient::new();
        let (sink, stream, _transport) = transport();
        let err = client
            .connect_with(sink, stream, config(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SetupTimeout));
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_endpoint_fails() {
        let (client, _events) = LiveClient::new();
        let err = client
            .connect("ws://127.0.0.1:1/live", config(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Connect(_) | SessionError::ConnectTimeout
        ));
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let (_client, mut events, transport, _) = ready_client().await;
        assert_eq!(events.recv().await, Some(InboundEvent::SetupAcknowledged));

        server(&transport, "not json at all");
        transport
            .inbound
            .unbounded_send(Ok(Message::Binary(
                br#"{"serverContent":{"modelTurn":{"parts":[{"text":"hi"}]}}}"#.to_vec().into(),
            )))
            .unwrap();
        assert_eq!(
            events.recv().await,
            Some(InboundEvent::TextDelta("hi".to_string()))
        );
    }

    #[tokio::test]
    async fn test_transport_error_closes_session() {
        let (client, mut events, transport, _) = ready_client().await;
        let mut state = client.subscribe_state();
        assert_eq!(events.recv().await, Some(InboundEvent::SetupAcknowledged));

        transport
            .inbound
            .unbounded_send(Err(WsError::ConnectionClosed))
            .unwrap();

        match events.recv().await {
            Some(InboundEvent::ConnectionClosed { reason }) => {
                assert!(reason.contains("transport error"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        state
            .wait_for(|s| *s == SessionState::Disconnected)
            .await
            .unwrap();
        assert!(client.cancellation_token().is_cancelled());

        let late = client
            .send(OutboundEnvelope::UserTurn {
                text: "late".to_string(),
                turn_complete: true,
            })
            .await
            .unwrap();
        assert_eq!(late, Delivery::Dropped);
    }

    #[tokio::test]
    async fn test_blocked_send_is_cancelled_by_disconnect() {
        let (client, _events) = LiveClient::new();
        // Zero-capacity outbound channel: a frame only flushes once it is read.
        let (out_tx, mut outbound) = fmpsc::channel::<Message>(0);
        let (inbound, in_rx) = fmpsc::unbounded::<Result<Message, WsError>>();
        let sink: WsSink = Box::pin(out_tx.sink_map_err(|_| WsError::ConnectionClosed));
        let connecting = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .connect_with(sink, Box::pin(in_rx), config(), Duration::from_secs(5))
                    .await
            }
        });
        outbound.next().await.unwrap();
        inbound
            .unbounded_send(Ok(Message::Text(r#"{"setupComplete":{}}"#.to_string().into())))
            .unwrap();
        connecting.await.unwrap().unwrap();

        let sending = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .send(OutboundEnvelope::UserTurn {
                        text: "stuck".to_string(),
                        turn_complete: true,
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sending.is_finished());

        client.disconnect().await;
        let result = sending.await.unwrap();
        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert_eq!(client.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake_closes_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Answers the websocket upgrade late, then reports whether the client
        // went away within a few seconds.
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                return true;
            };
            tokio::time::timeout(Duration::from_secs(3), async {
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_close() {
                        break;
                    }
                }
            })
            .await
            .is_ok()
        });

        let (client, _events) = LiveClient::new();
        let connecting = tokio::spawn({
            let client = client.clone();
            let url = format!("ws://{addr}/live");
            async move { client.connect(&url, config(), Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.state(), SessionState::Connecting);
        let token = client.cancellation_token();

        client.disconnect().await;
        let err = connecting.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ClosedDuringSetup));
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(token.is_cancelled());
        assert!(server.await.unwrap(), "connection left open after disconnect");
    }

    #[tokio::test]
    async fn test_disconnect_then_reconnect() {
        let (client, mut events, mut transport, _) = ready_client().await;
        assert_eq!(events.recv().await, Some(InboundEvent::SetupAcknowledged));

        client.disconnect().await;
        assert_eq!(client.state(), SessionState::Disconnected);
        assert!(matches!(
            events.recv().await,
            Some(InboundEvent::ConnectionClosed { .. })
        ));
        // The close handshake closed the outbound channel.
        assert!(transport.outbound.next().await.is_none());

        // Idempotent.
        client.disconnect().await;

        let (sink, stream, mut second) = self::transport();
        let connecting = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .connect_with(sink, stream, config(), Duration::from_secs(5))
                    .await
            }
        });
        second.outbound.next().await.unwrap();
        server(&second, r#"{"setupComplete":{}}"#);
        connecting.await.unwrap().unwrap();
        assert!(client.is_ready());
        assert_eq!(client.sequence(), 1);
    }
}
