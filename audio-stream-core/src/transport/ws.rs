//! WebSocket implementation of `StreamTransport`.
//!
//! One background task owns the socket for the lifetime of the
//! transport: it establishes the connection, performs the
//! handshake/ack exchange, pumps outbound PCM and control frames,
//! decodes inbound results, and reconnects with backoff. While the
//! socket is down, PCM lands in a bounded ring and flushes oldest-first
//! once the next handshake completes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::models::audio::{AudioFrame, SourceKind};
use crate::models::config::SessionConfig;
use crate::models::error::CaptureError;
use crate::models::state::TransportState;
use crate::processing::pcm_ring::PcmRing;
use crate::traits::transport::{ControlKind, StreamTransport, TransportEvent};

use super::protocol::{control_frame, decode_inbound, into_transcript_event, Handshake, InboundFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const CMD_CHANNEL_CAPACITY: usize = 256;

/// Connection parameters for one ingest channel.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub endpoint: String,
    pub auth_token: String,
    pub source: SourceKind,
    pub sample_rate: u32,
    pub channels: u16,
    pub language: String,
    pub device_id: String,
    pub max_frame_bytes: usize,
    pub ring_window: Duration,
    pub handshake_timeout: Duration,
    pub close_ack_timeout: Duration,
    pub keepalive_interval: Duration,
    pub reconnect_backoff: Vec<Duration>,
}

impl WsConfig {
    pub fn from_session(source: SourceKind, config: &SessionConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            auth_token: config.auth_token.clone(),
            source,
            sample_rate: config.target_sample_rate,
            channels: config.channels,
            language: config.language.clone(),
            device_id: config.device_id.clone(),
            max_frame_bytes: config.max_frame_bytes,
            ring_window: config.ring_window,
            handshake_timeout: Duration::from_secs(6),
            close_ack_timeout: Duration::from_secs(3),
            keepalive_interval: Duration::from_secs(10),
            reconnect_backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
        }
    }
}

/// Reconnect delay for the given attempt; the schedule clamps at its
/// last entry and resets to the first after any successful connection.
fn backoff_delay(schedule: &[Duration], attempt: usize) -> Duration {
    let index = attempt.min(schedule.len().saturating_sub(1));
    schedule.get(index).copied().unwrap_or(Duration::from_secs(1))
}

enum TxCommand {
    Pcm(AudioFrame),
    Control(ControlKind),
    Close(oneshot::Sender<()>),
}

enum ServeExit {
    /// Graceful close completed; the task must not reconnect.
    Closed,
    /// Connection failed; reconnect with backoff.
    Failed(String),
}

/// Counters for debugging one transport, readable at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportDiagnostics {
    pub connect_attempts: u64,
    pub reconnects: u64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
}

struct Inner {
    state_tx: watch::Sender<TransportState>,
    events: broadcast::Sender<TransportEvent>,
    stop: AtomicBool,
    connect_attempts: AtomicU64,
    reconnects: AtomicU64,
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    ever_connected: AtomicBool,
}

impl Inner {
    fn record_connected(&self) {
        if self.ever_connected.swap(true, Ordering::Relaxed) {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_frame(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn set_state(&self, source: SourceKind, next: TransportState) {
        let changed = {
            let current = *self.state_tx.borrow();
            current != next
        };
        if changed {
            log::debug!("{}: transport {:?}", source, next);
            let _ = self.state_tx.send(next);
            let _ = self.events.send(TransportEvent::StateChanged(next));
        }
    }

    fn emit_error(&self, source: SourceKind, message: String) {
        log::warn!("{}: transport error: {}", source, message);
        let _ = self.events.send(TransportEvent::Error(message));
    }
}

/// WebSocket ingest transport for one logical source.
pub struct WsTransport {
    config: WsConfig,
    inner: Arc<Inner>,
    state_rx: watch::Receiver<TransportState>,
    cmd_tx: mpsc::Sender<TxCommand>,
    cmd_rx: Mutex<Option<mpsc::Receiver<TxCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    pub fn new(config: WsConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(TransportState::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);

        Self {
            config,
            inner: Arc::new(Inner {
                state_tx,
                events,
                stop: AtomicBool::new(false),
                connect_attempts: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
                frames_sent: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                ever_connected: AtomicBool::new(false),
            }),
            state_rx,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            task: Mutex::new(None),
        }
    }

    pub fn for_source(source: SourceKind, config: &SessionConfig) -> Self {
        Self::new(WsConfig::from_session(source, config))
    }

    pub fn diagnostics(&self) -> TransportDiagnostics {
        TransportDiagnostics {
            connect_attempts: self.inner.connect_attempts.load(Ordering::Relaxed),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            frames_sent: self.inner.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl StreamTransport for WsTransport {
    fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    async fn connect(&self) -> Result<(), CaptureError> {
        if let Some(cmd_rx) = self.cmd_rx.lock().take() {
            let task = tokio::spawn(run(
                self.config.clone(),
                Arc::clone(&self.inner),
                cmd_rx,
            ));
            *self.task.lock() = Some(task);
        }

        // The task keeps retrying with backoff either way; the result
        // only reports whether the first confirmation arrived in time.
        let mut state_rx = self.state_rx.clone();
        let wait = state_rx.wait_for(|state| state.is_connected());
        let result = match tokio::time::timeout(self.config.handshake_timeout * 2, wait).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(CaptureError::HandshakeFailed(
                "transport task ended before handshake".into(),
            )),
            Err(_) => Err(CaptureError::HandshakeFailed(
                "no handshake confirmation from ingest endpoint".into(),
            )),
        };
        result
    }

    async fn send_pcm(&self, frame: AudioFrame) -> Result<(), CaptureError> {
        if frame.pcm.len() > self.config.max_frame_bytes {
            log::warn!(
                "{}: rejecting {} byte frame (cap {} bytes)",
                self.config.source,
                frame.pcm.len(),
                self.config.max_frame_bytes
            );
            return Err(CaptureError::SendFailed(format!(
                "frame exceeds {} byte payload cap",
                self.config.max_frame_bytes
            )));
        }
        self.cmd_tx
            .send(TxCommand::Pcm(frame))
            .await
            .map_err(|_| CaptureError::SendFailed("transport closed".into()))
    }

    async fn send_control(&self, kind: ControlKind) -> Result<(), CaptureError> {
        self.cmd_tx
            .send(TxCommand::Control(kind))
            .await
            .map_err(|_| CaptureError::SendFailed("transport closed".into()))
    }

    async fn close(&self) -> Result<(), CaptureError> {
        self.inner.stop.store(true, Ordering::SeqCst);

        let has_task = self.task.lock().is_some();
        if has_task {
            let (ack_tx, ack_rx) = oneshot::channel();
            if self.cmd_tx.send(TxCommand::Close(ack_tx)).await.is_ok() {
                let grace = self.config.close_ack_timeout + Duration::from_secs(1);
                if tokio::time::timeout(grace, ack_rx).await.is_err() {
                    log::warn!(
                        "{}: close acknowledgement timed out, aborting",
                        self.config.source
                    );
                }
            }
        }

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.inner.set_state(self.config.source, TransportState::Disconnected);
        Ok(())
    }
}

/// Connection task body: establish, serve, reconnect with backoff.
async fn run(config: WsConfig, inner: Arc<Inner>, mut cmd_rx: mpsc::Receiver<TxCommand>) {
    let mut ring = PcmRing::new(config.ring_window);
    let mut attempt = 0usize;

    loop {
        if inner.stop.load(Ordering::SeqCst) {
            inner.set_state(config.source, TransportState::Disconnected);
            return;
        }

        inner.set_state(config.source, TransportState::Connecting);
        inner.connect_attempts.fetch_add(1, Ordering::Relaxed);
        match establish(&config).await {
            Ok(ws) => {
                inner.record_connected();
                inner.set_state(config.source, TransportState::Connected);
                attempt = 0;
                match serve(ws, &config, &inner, &mut cmd_rx, &mut ring).await {
                    ServeExit::Closed => {
                        inner.set_state(config.source, TransportState::Disconnected);
                        return;
                    }
                    ServeExit::Failed(message) => {
                        inner.emit_error(config.source, message);
                        inner.set_state(config.source, TransportState::Disconnected);
                    }
                }
            }
            Err(e) => {
                inner.emit_error(config.source, e.to_string());
                inner.set_state(config.source, TransportState::Disconnected);
            }
        }

        let delay = backoff_delay(&config.reconnect_backoff, attempt);
        attempt += 1;
        log::info!("{}: reconnecting in {:?}", config.source, delay);

        // Keep buffering audio while waiting out the backoff.
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                cmd = cmd_rx.recv() => match cmd {
                    None => return,
                    Some(TxCommand::Pcm(frame)) => {
                        if let Err(e) = ring.push(frame) {
                            inner.emit_error(config.source, e.to_string());
                        }
                    }
                    Some(TxCommand::Control(_)) => {}
                    Some(TxCommand::Close(ack)) => {
                        let _ = ack.send(());
                        inner.set_state(config.source, TransportState::Disconnected);
                        return;
                    }
                },
            }
        }
    }
}

/// Open the socket and complete the handshake/ack exchange. `Connected`
/// is only reached once the far end confirmed receipt.
async fn establish(config: &WsConfig) -> Result<WsStream, CaptureError> {
    let connection_id = uuid::Uuid::new_v4();
    let mut request = config
        .endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| CaptureError::HandshakeFailed(e.to_string()))?;
    if !config.auth_token.is_empty() {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.auth_token))
            .map_err(|e| CaptureError::HandshakeFailed(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);
    }

    let (mut ws, _response) =
        tokio::time::timeout(config.handshake_timeout, connect_async(request))
            .await
            .map_err(|_| CaptureError::HandshakeFailed("connect timed out".into()))?
            .map_err(|e| CaptureError::HandshakeFailed(e.to_string()))?;

    let handshake = Handshake::new(
        config.source,
        config.sample_rate,
        config.channels,
        &config.language,
        &config.device_id,
        &connection_id.to_string(),
    );
    let text = serde_json::to_string(&handshake)
        .map_err(|e| CaptureError::HandshakeFailed(e.to_string()))?;
    ws.send(Message::Text(text))
        .await
        .map_err(|e| CaptureError::HandshakeFailed(e.to_string()))?;

    let deadline = tokio::time::sleep(config.handshake_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                return Err(CaptureError::HandshakeFailed("handshake ack timed out".into()));
            }
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => match decode_inbound(&text) {
                    Ok(InboundFrame::HandshakeAck { ok: true }) => {
                        log::info!(
                            "{}: handshake confirmed (connection {})",
                            config.source,
                            connection_id
                        );
                        return Ok(ws);
                    }
                    Ok(InboundFrame::HandshakeAck { ok: false }) => {
                        return Err(CaptureError::HandshakeFailed(
                            "handshake rejected by ingest endpoint".into(),
                        ));
                    }
                    _ => {}
                },
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(CaptureError::HandshakeFailed(e.to_string())),
                None => return Err(CaptureError::HandshakeFailed("closed during handshake".into())),
            },
        }
    }
}

/// Duplex loop over one established connection.
async fn serve(
    ws: WsStream,
    config: &WsConfig,
    inner: &Inner,
    cmd_rx: &mut mpsc::Receiver<TxCommand>,
    ring: &mut PcmRing,
) -> ServeExit {
    let (mut sink, mut stream) = ws.split();

    // Buffered residue flushes first so reconnects never reorder audio.
    if !ring.is_empty() {
        log::info!(
            "{}: flushing {} buffered frame(s) ({:?})",
            config.source,
            ring.len(),
            ring.buffered()
        );
        let mut pending = ring.drain().into_iter();
        while let Some(frame) = pending.next() {
            let len = frame.pcm.len();
            if let Err(e) = sink.send(Message::Binary(frame.pcm.to_vec())).await {
                // Drained frames fit the window by construction.
                let _ = ring.push(frame);
                for rest in pending {
                    let _ = ring.push(rest);
                }
                return ServeExit::Failed(format!("flush failed: {}", e));
            }
            inner.record_frame(len);
        }
    }

    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + config.keepalive_interval,
        config.keepalive_interval,
    );
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_audio = Instant::now();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => {
                    return graceful_close(&mut sink, &mut stream, config, inner, None).await;
                }
                Some(TxCommand::Pcm(frame)) => {
                    last_audio = Instant::now();
                    let len = frame.pcm.len();
                    if let Err(e) = sink.send(Message::Binary(frame.pcm.to_vec())).await {
                        if let Err(overrun) = ring.push(frame) {
                            inner.emit_error(config.source, overrun.to_string());
                        }
                        return ServeExit::Failed(format!("send failed: {}", e));
                    }
                    inner.record_frame(len);
                }
                Some(TxCommand::Control(kind)) => {
                    if let Err(e) = sink.send(Message::Text(control_frame(kind))).await {
                        return ServeExit::Failed(format!("control send failed: {}", e));
                    }
                }
                Some(TxCommand::Close(ack)) => {
                    return graceful_close(&mut sink, &mut stream, config, inner, Some(ack)).await;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_inbound(&text, config, inner),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    return ServeExit::Failed("closed by server".into());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return ServeExit::Failed(e.to_string()),
                None => return ServeExit::Failed("connection lost".into()),
            },
            _ = keepalive.tick() => {
                if last_audio.elapsed() >= config.keepalive_interval {
                    if let Err(e) = sink.send(Message::Text(control_frame(ControlKind::KeepAlive))).await {
                        return ServeExit::Failed(format!("keepalive failed: {}", e));
                    }
                }
            }
        }
    }
}

/// Finalize, wait out the bounded ack window, then drop the socket.
/// Always terminates within `close_ack_timeout` even if the far end
/// never answers.
async fn graceful_close(
    sink: &mut SplitSink<WsStream, Message>,
    stream: &mut SplitStream<WsStream>,
    config: &WsConfig,
    inner: &Inner,
    ack: Option<oneshot::Sender<()>>,
) -> ServeExit {
    inner.set_state(config.source, TransportState::Closing);
    let _ = sink
        .send(Message::Text(control_frame(ControlKind::Finalize)))
        .await;
    let _ = sink
        .send(Message::Text(control_frame(ControlKind::CloseStream)))
        .await;

    let deadline = tokio::time::sleep(config.close_ack_timeout);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                log::debug!("{}: no finalize acknowledgement, closing anyway", config.source);
                break;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Text(text))) => handle_inbound(&text, config, inner),
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    if let Some(ack) = ack {
        let _ = ack.send(());
    }
    ServeExit::Closed
}

/// Decode one inbound text frame into events. Malformed payloads become
/// discrete error events; they never take the transport down.
fn handle_inbound(text: &str, config: &WsConfig, inner: &Inner) {
    match decode_inbound(text) {
        Ok(InboundFrame::TranscriptPartial(payload)) => {
            let event = into_transcript_event(payload, false, config.source);
            let _ = inner.events.send(TransportEvent::Transcript(event));
        }
        Ok(InboundFrame::TranscriptFinal(payload)) => {
            let event = into_transcript_event(payload, true, config.source);
            let _ = inner.events.send(TransportEvent::Transcript(event));
        }
        Ok(InboundFrame::Error {
            error_code,
            error_message,
        }) => {
            inner.emit_error(config.source, format!("{}: {}", error_code, error_message));
        }
        Ok(InboundFrame::Status { status }) => {
            log::debug!("{}: server status '{}'", config.source, status);
        }
        Ok(InboundFrame::HandshakeAck { .. }) => {}
        Err(e) => {
            inner.emit_error(config.source, format!("malformed payload dropped: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::events::TranscriptKind;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    fn test_config(endpoint: String) -> WsConfig {
        WsConfig {
            endpoint,
            auth_token: "test-token".into(),
            source: SourceKind::Mic,
            sample_rate: 16000,
            channels: 1,
            language: "en".into(),
            device_id: "dev-test".into(),
            max_frame_bytes: 32 * 1024,
            ring_window: Duration::from_millis(500),
            handshake_timeout: Duration::from_millis(500),
            close_ack_timeout: Duration::from_millis(200),
            keepalive_interval: Duration::from_secs(60),
            reconnect_backoff: vec![Duration::from_millis(100)],
        }
    }

    // 100 ms of 16 kHz mono PCM16, tagged for order assertions.
    fn frame(tag: u8) -> AudioFrame {
        AudioFrame {
            source: SourceKind::Mic,
            pcm: Bytes::from(vec![tag; 1600 * 2]),
            sample_rate: 16000,
            channels: 1,
            captured_at: Instant::now(),
        }
    }

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        (listener, endpoint)
    }

    /// Accept one connection, assert the handshake, send the ack.
    async fn accept_and_ack(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let v: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(v["type"], "handshake");
                assert_eq!(v["source"], "mic");
                assert_eq!(v["sample_rate"], 16000);
                assert!(v["connection_id"].is_string());
            }
            other => panic!("expected handshake, got {:?}", other),
        }
        ws.send(Message::Text(r#"{"type":"handshake-ack","ok":true}"#.into()))
            .await
            .unwrap();
        ws
    }

    async fn wait_for_state(transport: &WsTransport, state: TransportState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while transport.state() != state {
            assert!(Instant::now() < deadline, "never reached {:?}", state);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn backoff_schedule_clamps_at_tail() {
        let schedule = [
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(5),
        ];
        assert_eq!(backoff_delay(&schedule, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&schedule, 2), Duration::from_secs(5));
        assert_eq!(backoff_delay(&schedule, 9), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn connected_only_after_ack() {
        let (listener, endpoint) = bind().await;
        let transport = WsTransport::new(test_config(endpoint));

        let server = tokio::spawn(async move {
            let mut ws = accept_and_ack(&listener).await;
            // Hold the connection open until the client closes.
            while let Some(Ok(_)) = ws.next().await {}
        });

        transport.connect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);

        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Disconnected);
        server.abort();
    }

    #[tokio::test]
    async fn connect_fails_fast_when_endpoint_is_down() {
        let (listener, endpoint) = bind().await;
        drop(listener);
        let transport = WsTransport::new(test_config(endpoint));

        let result = transport.connect().await;
        assert!(matches!(result, Err(CaptureError::HandshakeFailed(_))));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn pcm_frames_arrive_in_order() {
        let (listener, endpoint) = bind().await;
        let transport = WsTransport::new(test_config(endpoint));
        let (tags_tx, mut tags_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut ws = accept_and_ack(&listener).await;
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Binary(payload) = msg {
                    let _ = tags_tx.send((payload[0], payload.len()));
                }
            }
        });

        transport.connect().await.unwrap();
        for tag in 1..=3u8 {
            transport.send_pcm(frame(tag)).await.unwrap();
        }

        for expected in 1..=3u8 {
            let (tag, len) = tokio::time::timeout(Duration::from_secs(2), tags_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(tag, expected);
            assert_eq!(len, 1600 * 2);
        }

        let diagnostics = transport.diagnostics();
        assert_eq!(diagnostics.frames_sent, 3);
        assert_eq!(diagnostics.bytes_sent, 3 * 1600 * 2);
        assert_eq!(diagnostics.reconnects, 0);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn severed_connection_buffers_then_flushes_fifo() {
        let (listener, endpoint) = bind().await;
        let transport = WsTransport::new(test_config(endpoint));
        let (tags_tx, mut tags_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            // First connection: confirm the handshake, then sever.
            let ws = accept_and_ack(&listener).await;
            drop(ws);
            // Second connection: receive the flushed residue.
            let mut ws = accept_and_ack(&listener).await;
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Binary(payload) = msg {
                    let _ = tags_tx.send(payload[0]);
                }
            }
        });

        transport.connect().await.unwrap();
        wait_for_state(&transport, TransportState::Disconnected).await;

        // Buffered, never dropped, never an error.
        for tag in 1..=3u8 {
            transport.send_pcm(frame(tag)).await.unwrap();
        }

        for expected in 1..=3u8 {
            let tag = tokio::time::timeout(Duration::from_secs(5), tags_rx.recv())
                .await
                .expect("no flush after reconnect")
                .unwrap();
            assert_eq!(tag, expected);
        }

        let diagnostics = transport.diagnostics();
        assert_eq!(diagnostics.reconnects, 1);
        assert!(diagnostics.connect_attempts >= 2);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_locally() {
        let (_listener, endpoint) = bind().await;
        let transport = WsTransport::new(test_config(endpoint));

        let oversized = AudioFrame {
            source: SourceKind::Mic,
            pcm: Bytes::from(vec![0u8; 64 * 1024]),
            sample_rate: 16000,
            channels: 1,
            captured_at: Instant::now(),
        };
        assert!(matches!(
            transport.send_pcm(oversized).await,
            Err(CaptureError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn malformed_inbound_is_a_discrete_error_event() {
        let (listener, endpoint) = bind().await;
        let transport = WsTransport::new(test_config(endpoint));
        let mut events = transport.subscribe();

        tokio::spawn(async move {
            let mut ws = accept_and_ack(&listener).await;
            ws.send(Message::Text("{{{ not json".into())).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"transcript.final","text":"still alive","confidence":0.9,"speech_final":true}"#
                    .into(),
            ))
            .await
            .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        transport.connect().await.unwrap();

        let mut saw_error = false;
        let mut transcript = None;
        while transcript.is_none() {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event stream stalled")
                .unwrap();
            match event {
                TransportEvent::Error(_) => saw_error = true,
                TransportEvent::Transcript(t) => transcript = Some(t),
                TransportEvent::StateChanged(_) => {}
            }
        }

        assert!(saw_error);
        let transcript = transcript.unwrap();
        assert_eq!(transcript.kind, TranscriptKind::Final);
        assert_eq!(transcript.text, "still alive");
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_reaches_disconnected_without_finalize_ack() {
        let (listener, endpoint) = bind().await;
        let transport = WsTransport::new(test_config(endpoint));

        tokio::spawn(async move {
            let mut ws = accept_and_ack(&listener).await;
            // Read Finalize/CloseStream and never answer.
            while let Some(Ok(_)) = ws.next().await {}
        });

        transport.connect().await.unwrap();
        let started = Instant::now();
        transport.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(transport.state(), TransportState::Disconnected);

        // Idempotent.
        transport.close().await.unwrap();
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn keepalive_flows_while_idle() {
        let (listener, endpoint) = bind().await;
        let mut config = test_config(endpoint);
        config.keepalive_interval = Duration::from_millis(100);
        let transport = WsTransport::new(config);
        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut ws = accept_and_ack(&listener).await;
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let _ = ping_tx.send(text);
                }
            }
        });

        transport.connect().await.unwrap();
        let text = tokio::time::timeout(Duration::from_secs(2), ping_rx.recv())
            .await
            .expect("no keepalive while idle")
            .unwrap();
        assert_eq!(text, r#"{"type":"KeepAlive"}"#);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn backoff_resets_after_successful_connection() {
        let (listener, endpoint) = bind().await;
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = test_config(endpoint);
        config.handshake_timeout = Duration::from_secs(2);
        config.reconnect_backoff =
            vec![Duration::from_millis(100), Duration::from_millis(600)];
        let transport = Arc::new(WsTransport::new(config));

        let started = Instant::now();
        let connect = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.connect().await })
        };

        // Nothing listens yet, so the first two attempts are refused and
        // the delay advances to the second schedule entry. Come up
        // mid-backoff; the third attempt lands no earlier than 100 + 600 ms.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let listener = TcpListener::bind(addr).await.unwrap();
        let ws = accept_and_ack(&listener).await;
        assert!(started.elapsed() >= Duration::from_millis(700));
        connect.await.unwrap().unwrap();
        assert_eq!(transport.state(), TransportState::Connected);

        // Sever after success; the reconnect must come back at the first
        // delay again, well inside the 600 ms second entry.
        let severed = Instant::now();
        drop(ws);
        let _ws = accept_and_ack(&listener).await;
        assert!(severed.elapsed() < Duration::from_millis(600));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn window_overrun_while_disconnected_is_an_error_event() {
        let (listener, endpoint) = bind().await;
        let transport = WsTransport::new(test_config(endpoint));
        let mut events = transport.subscribe();

        let server = tokio::spawn(async move {
            let ws = accept_and_ack(&listener).await;
            drop(ws);
        });

        transport.connect().await.unwrap();
        wait_for_state(&transport, TransportState::Disconnected).await;
        server.await.unwrap();

        // One second of audio cannot fit the 500 ms ring window, so the
        // frame is dropped and reported rather than buffered.
        let long = AudioFrame {
            source: SourceKind::Mic,
            pcm: Bytes::from(vec![0u8; 16000 * 2]),
            sample_rate: 16000,
            channels: 1,
            captured_at: Instant::now(),
        };
        transport.send_pcm(long).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            assert!(Instant::now() < deadline, "no overrun event");
            match tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event stream stalled")
                .unwrap()
            {
                TransportEvent::Error(message) if message.contains("overrun") => break,
                _ => {}
            }
        }
        transport.close().await.unwrap();
    }
}
