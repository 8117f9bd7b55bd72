//! The self-reconnecting WebSocket transport.
//!
//! One component serves both environments: `lan` dials a peer's embedded
//! server at a URL obtained from discovery, `cloud` dials the configured
//! relay. Exactly one long-lived socket is maintained; there is no polling
//! loop. Binary frames carry clipboard envelopes, text frames carry pairing
//! JSON.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use hypo_core::config::{Environment, SyncConfig};
use hypo_core::envelope::{ControlBody, SyncEnvelope};
use hypo_core::error::TransportError;
use hypo_core::events::{PinningReport, TransportMetrics};
use hypo_core::ids::DeviceId;

use crate::codec;
use crate::pinning;

/// How long a sender waits on the handshake latch.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Keepalive ping cadence; detects half-open sockets.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP_CLOUD: Duration = Duration::from_secs(128);
const BACKOFF_CAP_LAN: Duration = Duration::from_secs(32);

const OUTBOUND_BUFFER: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Events surfaced to the transport manager.
#[derive(Debug)]
pub enum TransportEvent {
    Opened {
        environment: Environment,
        handshake: Duration,
    },
    Closed {
        environment: Environment,
        code: Option<u16>,
    },
    /// A decoded inbound clipboard or control envelope.
    Envelope(SyncEnvelope),
    /// A text frame; always pairing JSON, routed to the pairing protocol.
    PairingText(String),
    RoundTrip {
        envelope: SyncEnvelope,
        elapsed: Duration,
    },
    PinningFailure(PinningReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    NoUrl,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
enum LatchState {
    Pending,
    Open,
    Failed(TransportError),
}

#[derive(Debug)]
enum OutboundItem {
    Envelope(SyncEnvelope),
    Text(String),
    Close(CloseCode),
}

enum SessionExit {
    Closed(Option<u16>),
    PeerChanged,
    Failed(TransportError),
}

struct TransportInner {
    environment: Environment,
    config: SyncConfig,
    device_id: DeviceId,
    event_tx: mpsc::UnboundedSender<TransportEvent>,

    url_tx: watch::Sender<Option<String>>,
    latch_tx: watch::Sender<LatchState>,
    state: Mutex<SessionState>,

    outbound_tx: mpsc::Sender<OutboundItem>,
    /// Taken by the active session loop; exactly one session runs at a time.
    outbound_rx: Mutex<mpsc::Receiver<OutboundItem>>,

    /// Envelopes sent and awaiting their counterpart, keyed by id.
    pending: Mutex<HashMap<hypo_core::ids::EnvelopeId, Instant>>,

    metrics: Mutex<TransportMetrics>,
    connect_attempts: AtomicU64,
    user_closed: AtomicBool,
    runner: Mutex<Option<JoinHandle<()>>>,
}

/// A single long-lived, self-reconnecting framed WebSocket client.
#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<TransportInner>,
}

impl WsTransport {
    pub fn new(
        config: SyncConfig,
        device_id: DeviceId,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let environment = config.environment;
        let initial_url = config.url.clone();
        let (url_tx, _) = watch::channel(initial_url);
        let (latch_tx, _) = watch::channel(LatchState::Pending);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);

        Self {
            inner: Arc::new(TransportInner {
                environment,
                config,
                device_id,
                event_tx,
                url_tx,
                latch_tx,
                state: Mutex::new(SessionState::NoUrl),
                outbound_tx,
                outbound_rx: Mutex::new(outbound_rx),
                pending: Mutex::new(HashMap::new()),
                metrics: Mutex::new(TransportMetrics::default()),
                connect_attempts: AtomicU64::new(0),
                user_closed: AtomicBool::new(false),
                runner: Mutex::new(None),
            }),
        }
    }

    pub fn environment(&self) -> Environment {
        self.inner.environment
    }

    /// Spawn the connection runner. Without a URL the runner parks until a
    /// discovery event supplies one; it performs no network operations
    /// meanwhile.
    pub async fn start(&self) {
        let mut runner = self.inner.runner.lock().await;
        if runner.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *runner = Some(tokio::spawn(async move {
            TransportInner::run(inner).await;
        }));
    }

    /// Supply or replace the peer URL. A change while connected forces
    /// `Closing → Connecting` onto the new endpoint.
    pub fn set_peer_url(&self, url: Option<String>) {
        self.inner.url_tx.send_if_modified(|current| {
            if *current != url {
                *current = url;
                true
            } else {
                false
            }
        });
    }

    /// Wake the runner without changing the URL: cuts a backoff sleep short
    /// after a network path change.
    pub fn kick(&self) {
        self.inner.url_tx.send_modify(|_| {});
    }

    /// Queue one envelope, waiting for the handshake latch when a connect is
    /// still in flight.
    pub async fn send(&self, envelope: SyncEnvelope) -> Result<(), TransportError> {
        self.await_open().await?;
        self.inner
            .outbound_tx
            .send(OutboundItem::Envelope(envelope))
            .await
            .map_err(|_| TransportError::SendFailed("transport is shut down".into()))
    }

    /// Queue one pairing text frame.
    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.await_open().await?;
        self.inner
            .outbound_tx
            .send(OutboundItem::Text(text))
            .await
            .map_err(|_| TransportError::SendFailed("transport is shut down".into()))
    }

    /// Close for good. A connect still in its handshake is cancelled rather
    /// than closing a half-opened socket; an open session sends a normal
    /// close frame first.
    pub async fn close(&self) {
        self.inner.user_closed.store(true, Ordering::SeqCst);

        let state = *self.inner.state.lock().await;
        let Some(mut handle) = self.inner.runner.lock().await.take() else {
            return;
        };

        if state == SessionState::Open {
            let _ = self
                .inner
                .outbound_tx
                .try_send(OutboundItem::Close(CloseCode::Normal));
            if tokio::time::timeout(Duration::from_secs(2), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        } else {
            handle.abort();
        }

        *self.inner.state.lock().await = SessionState::Closed;
    }

    pub async fn is_open(&self) -> bool {
        *self.inner.state.lock().await == SessionState::Open
    }

    pub async fn metrics(&self) -> TransportMetrics {
        let mut snapshot = self.inner.metrics.lock().await.clone();
        snapshot.pending_round_trips = self.inner.pending.lock().await.len();
        snapshot
    }

    /// Number of connect attempts made so far (diagnostics and tests).
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    async fn await_open(&self) -> Result<(), TransportError> {
        let mut latch = self.inner.latch_tx.subscribe();
        let wait = async {
            loop {
                let state = latch.borrow_and_update().clone();
                match state {
                    LatchState::Open => return Ok(()),
                    LatchState::Failed(e) => return Err(e),
                    LatchState::Pending => {}
                }
                if latch.changed().await.is_err() {
                    return Err(TransportError::SendFailed("transport is shut down".into()));
                }
            }
        };
        tokio::time::timeout(HANDSHAKE_TIMEOUT, wait)
            .await
            .map_err(|_| TransportError::HandshakeTimeout)?
    }
}

impl TransportInner {
    async fn run(inner: Arc<Self>) {
        let mut url_rx = inner.url_tx.subscribe();
        let mut backoff = BACKOFF_BASE;
        let backoff_cap = match inner.environment {
            Environment::Cloud => BACKOFF_CAP_CLOUD,
            Environment::Lan => BACKOFF_CAP_LAN,
        };

        loop {
            if inner.user_closed.load(Ordering::SeqCst) {
                break;
            }

            let url = url_rx.borrow_and_update().clone();
            let Some(url) = url else {
                // LAN without a discovered URL: stay idle until discovery
                // produces one. No retries, no sockets.
                inner.set_state(SessionState::NoUrl).await;
                if url_rx.changed().await.is_err() {
                    break;
                }
                continue;
            };

            inner.set_state(SessionState::Connecting).await;
            inner.latch_tx.send_replace(LatchState::Pending);
            inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

            let started = Instant::now();
            let connected = tokio::time::timeout(HANDSHAKE_TIMEOUT, inner.connect(&url)).await;

            match connected {
                Ok(Ok(ws)) => {
                    let handshake = started.elapsed();
                    inner.metrics.lock().await.handshake_ms = Some(handshake.as_millis() as u64);
                    inner.set_state(SessionState::Open).await;
                    inner.latch_tx.send_replace(LatchState::Open);
                    backoff = BACKOFF_BASE;
                    info!(environment = %inner.environment, url = %url, ?handshake, "transport open");
                    let _ = inner.event_tx.send(TransportEvent::Opened {
                        environment: inner.environment,
                        handshake,
                    });

                    let exit = inner.session(ws, &url, &mut url_rx).await;

                    inner.pending.lock().await.clear();
                    inner.set_state(SessionState::Closed).await;
                    inner.latch_tx.send_replace(LatchState::Pending);

                    let code = match &exit {
                        SessionExit::Closed(code) => *code,
                        SessionExit::PeerChanged => Some(u16::from(CloseCode::Normal)),
                        SessionExit::Failed(_) => None,
                    };
                    let _ = inner.event_tx.send(TransportEvent::Closed {
                        environment: inner.environment,
                        code,
                    });

                    match exit {
                        SessionExit::PeerChanged => continue,
                        SessionExit::Closed(_) | SessionExit::Failed(_) => {}
                    }
                }
                Ok(Err(e)) => {
                    warn!(environment = %inner.environment, url = %url, error = %e, "connect failed");
                    inner.latch_tx.send_replace(LatchState::Failed(e));
                }
                Err(_) => {
                    warn!(environment = %inner.environment, url = %url, "handshake timed out");
                    inner
                        .latch_tx
                        .send_replace(LatchState::Failed(TransportError::HandshakeTimeout));
                }
            }

            if inner.user_closed.load(Ordering::SeqCst) {
                break;
            }

            // Reconnect with exponential backoff; a URL change cuts the wait
            // short so a rediscovered peer is dialed promptly.
            debug!(environment = %inner.environment, delay = ?backoff, "scheduling reconnect");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                changed = url_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            backoff = (backoff * 2).min(backoff_cap);
        }
        inner.set_state(SessionState::Closed).await;
    }

    async fn connect(&self, url: &str) -> Result<WsStream, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectRefused(e.to_string()))?;
        let host = request
            .uri()
            .host()
            .unwrap_or_default()
            .to_string();

        let headers = request.headers_mut();
        headers.insert(
            "X-Device-Id",
            HeaderValue::from_str(self.device_id.as_str())
                .map_err(|e| TransportError::ConnectRefused(e.to_string()))?,
        );
        for (name, value) in &self.config.headers {
            let name: tokio_tungstenite::tungstenite::http::HeaderName = name
                .parse()
                .map_err(|_| TransportError::ConnectRefused(format!("bad header name {name}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::ConnectRefused(e.to_string()))?;
            headers.insert(name, value);
        }

        let mismatch_seen = Arc::new(AtomicBool::new(false));
        let connector = match (&self.config.fingerprint_sha256, url.starts_with("wss://")) {
            (Some(fingerprint), true) => Some(Connector::Rustls(Arc::new(
                pinning::pinned_client_config(fingerprint, mismatch_seen.clone())?,
            ))),
            _ => None,
        };

        let result =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await;

        match result {
            Ok((ws, _response)) => Ok(ws),
            Err(e) => {
                if mismatch_seen.load(Ordering::SeqCst) {
                    let report = PinningReport {
                        environment: self.environment.to_string(),
                        host: host.clone(),
                        message: e.to_string(),
                    };
                    self.metrics.lock().await.pinning_failures += 1;
                    let _ = self.event_tx.send(TransportEvent::PinningFailure(report));
                    Err(TransportError::PinningFailure {
                        host,
                        message: e.to_string(),
                    })
                } else {
                    Err(TransportError::ConnectRefused(e.to_string()))
                }
            }
        }
    }

    /// Cooperative select between the outbound queue, the socket and the
    /// keepalive timer, until the session ends.
    async fn session(
        &self,
        ws: WsStream,
        current_url: &str,
        url_rx: &mut watch::Receiver<Option<String>>,
    ) -> SessionExit {
        let (mut sink, mut stream) = ws.split();
        let mut outbound = self.outbound_rx.lock().await;

        let mut keepalive =
            tokio::time::interval_at(tokio::time::Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // A socket that answers nothing, not even pongs, past the idle
        // timeout is treated as dead and closed going-away.
        let idle_timeout = self.config.idle_timeout().max(KEEPALIVE_INTERVAL);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                item = outbound.recv() => {
                    match item {
                        Some(OutboundItem::Envelope(envelope)) => {
                            if let Some(exit) = self.write_envelope(&mut sink, envelope).await {
                                return exit;
                            }
                        }
                        Some(OutboundItem::Text(text)) => {
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                return SessionExit::Failed(TransportError::SendFailed(
                                    "text frame write failed".into(),
                                ));
                            }
                        }
                        Some(OutboundItem::Close(code)) => {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code,
                                    reason: "".into(),
                                })))
                                .await;
                            return SessionExit::Closed(Some(u16::from(code)));
                        }
                        None => return SessionExit::Closed(None),
                    }
                }

                msg = stream.next() => {
                    last_inbound = Instant::now();
                    match msg {
                        Some(Ok(Message::Binary(bytes))) => self.on_binary(&bytes).await,
                        Some(Ok(Message::Text(text))) => {
                            let _ = self
                                .event_tx
                                .send(TransportEvent::PairingText(text.as_str().to_string()));
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            return SessionExit::Closed(frame.map(|f| u16::from(f.code)));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "socket read failed");
                            return SessionExit::Closed(None);
                        }
                        None => return SessionExit::Closed(None),
                    }
                }

                _ = keepalive.tick() => {
                    self.prune_pending().await;
                    if last_inbound.elapsed() > idle_timeout {
                        debug!(environment = %self.environment, "idle timeout; closing going-away");
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Away,
                                reason: "".into(),
                            })))
                            .await;
                        return SessionExit::Closed(Some(u16::from(CloseCode::Away)));
                    }
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        // Half-open socket; going-away close.
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Away,
                                reason: "".into(),
                            })))
                            .await;
                        return SessionExit::Closed(Some(u16::from(CloseCode::Away)));
                    }
                }

                changed = url_rx.changed() => {
                    if changed.is_err() {
                        return SessionExit::Closed(None);
                    }
                    let new_url = url_rx.borrow().clone();
                    if new_url.as_deref() != Some(current_url) {
                        self.set_state(SessionState::Closing).await;
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Normal,
                                reason: "".into(),
                            })))
                            .await;
                        return SessionExit::PeerChanged;
                    }
                }
            }
        }
    }

    async fn write_envelope(
        &self,
        sink: &mut WsSink,
        envelope: SyncEnvelope,
    ) -> Option<SessionExit> {
        let frame = match codec::encode_frame(&envelope, self.config.max_frame_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                // Local recovery: drop the frame, keep the connection.
                warn!(envelope_id = %envelope.id, error = %e, "dropping unencodable envelope");
                return None;
            }
        };

        self.pending
            .lock()
            .await
            .insert(envelope.id.clone(), Instant::now());

        if sink.send(Message::Binary(frame.into())).await.is_err() {
            self.pending.lock().await.remove(&envelope.id);
            return Some(SessionExit::Failed(TransportError::SendFailed(
                "binary frame write failed".into(),
            )));
        }
        None
    }

    async fn on_binary(&self, bytes: &[u8]) {
        let envelope = match codec::decode_frame(bytes, self.config.max_frame_bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Local recovery: drop the frame, keep the connection.
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        // A control ack (or a relay echo of our own envelope) resolves a
        // pending round trip.
        let resolved_id = match ControlBody::from_envelope(&envelope) {
            Some(ControlBody::Ack { envelope_id }) => envelope_id,
            _ => envelope.id.clone(),
        };
        if let Some(sent_at) = self.pending.lock().await.remove(&resolved_id) {
            let elapsed = sent_at.elapsed();
            self.metrics.lock().await.last_round_trip_ms = Some(elapsed.as_millis() as u64);
            let _ = self
                .event_tx
                .send(TransportEvent::RoundTrip { envelope, elapsed });
            return;
        }

        let _ = self.event_tx.send(TransportEvent::Envelope(envelope));
    }

    /// Drop pending round-trip entries older than the configured TTL.
    async fn prune_pending(&self) {
        let ttl = self.config.round_trip_timeout();
        self.pending
            .lock()
            .await
            .retain(|_, sent_at| sent_at.elapsed() <= ttl);
    }

    async fn set_state(&self, state: SessionState) {
        *self.state.lock().await = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypo_core::envelope::{ContentType, EnvelopeKind, Payload};

    fn lan_transport() -> (WsTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = WsTransport::new(SyncConfig::lan(), DeviceId::new("mac"), tx);
        (transport, rx)
    }

    fn envelope() -> SyncEnvelope {
        SyncEnvelope::new(
            EnvelopeKind::Clipboard,
            Payload {
                content_type: ContentType::Text,
                ciphertext: vec![1],
                device_id: DeviceId::new("mac"),
                target: None,
                encryption: None,
                metadata: None,
            },
        )
    }

    #[tokio::test]
    async fn test_lan_without_url_performs_no_network_operations() {
        let (transport, _rx) = lan_transport();
        transport.start().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.connect_attempts(), 0);
        assert!(!transport.is_open().await);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_url_from_discovery_triggers_a_connect_attempt() {
        let (transport, _rx) = lan_transport();
        transport.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.connect_attempts(), 0);

        // Unroutable port: the attempt fails, but it must be attempted.
        transport.set_peer_url(Some("ws://127.0.0.1:1/ws".to_string()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(transport.connect_attempts() >= 1);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_send_without_open_socket_times_out_quickly_under_dispatch_timeout() {
        // The dispatcher wraps LAN sends in its own 3 s timeout; the latch
        // itself enforces 10 s. Exercise the failure path with a dead URL.
        let (transport, _rx) = lan_transport();
        transport.start().await;
        transport.set_peer_url(Some("ws://127.0.0.1:1/ws".to_string()));

        let result =
            tokio::time::timeout(Duration::from_secs(3), transport.send(envelope())).await;
        match result {
            Ok(Err(_)) => {}
            Ok(Ok(())) => panic!("send must not succeed with no listener"),
            Err(_) => {} // still waiting on the latch; acceptable
        }
        transport.close().await;
    }

    #[tokio::test]
    async fn test_metrics_start_empty() {
        let (transport, _rx) = lan_transport();
        let metrics = transport.metrics().await;
        assert_eq!(metrics.pending_round_trips, 0);
        assert_eq!(metrics.pinning_failures, 0);
        assert!(metrics.handshake_ms.is_none());
    }
}
