//! Embedded WebSocket server for inbound LAN peers.
//!
//! Accepts TCP on the advertised port and performs the RFC 6455 upgrade by
//! hand. Post-upgrade it reads client frames, unmasks them and dispatches by
//! opcode; fragmentation is not supported and oversized payloads are
//! rejected with a policy close. Outbound frames are never masked.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hypo_core::envelope::SyncEnvelope;
use hypo_core::ids::DeviceId;

use crate::codec;

/// RFC 6455 handshake GUID.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the upgrade request.
const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// Close codes used by the server.
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_POLICY: u16 = 1008;

const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// Events surfaced to the transport manager.
#[derive(Debug)]
pub enum ServerEvent {
    Connected {
        addr: SocketAddr,
    },
    Disconnected {
        addr: SocketAddr,
        device_id: Option<DeviceId>,
    },
    Envelope {
        addr: SocketAddr,
        envelope: SyncEnvelope,
    },
    /// A text frame; always pairing JSON.
    PairingText {
        addr: SocketAddr,
        text: String,
    },
}

/// Per-connection bookkeeping. `device_id` is filled once the first
/// envelope's sender is resolved.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub device_id: Option<DeviceId>,
    pub connected_at: DateTime<Utc>,
}

enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Pong(Vec<u8>),
    Close(u16),
}

struct Connection {
    meta: ConnectionMeta,
    tx: mpsc::Sender<OutboundFrame>,
}

struct ServerInner {
    connections: RwLock<HashMap<SocketAddr, Connection>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    max_payload_bytes: usize,
}

/// The LAN-facing WebSocket server.
pub struct WsServer {
    inner: Arc<ServerInner>,
    listener: Mutex<Option<TcpListener>>,
    port: u16,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsServer {
    /// Bind the listener; port 0 picks an ephemeral port (the bound port is
    /// what discovery advertises).
    pub async fn bind(
        port: u16,
        max_payload_bytes: usize,
        event_tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .context("failed to bind LAN server port")?;
        let port = listener.local_addr()?.port();
        info!(port, "embedded WebSocket server bound");

        Ok(Self {
            inner: Arc::new(ServerInner {
                connections: RwLock::new(HashMap::new()),
                event_tx,
                max_payload_bytes,
            }),
            listener: Mutex::new(Some(listener)),
            port,
            accept_task: Mutex::new(None),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the accept loop; each connection gets its own task.
    pub async fn start(&self) {
        let Some(listener) = self.listener.lock().await.take() else {
            return;
        };
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(inner, stream, addr).await {
                                debug!(%addr, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
        *self.accept_task.lock().await = Some(task);
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        let mut connections = self.inner.connections.write().await;
        for (_, connection) in connections.drain() {
            let _ = connection.tx.try_send(OutboundFrame::Close(CLOSE_NORMAL));
        }
    }

    /// Reply on an inbound connection with a pairing text frame.
    pub async fn send_text(&self, addr: SocketAddr, text: String) -> Result<()> {
        self.send_frame(addr, OutboundFrame::Text(text)).await
    }

    /// Push one envelope to an inbound connection.
    pub async fn send_envelope(&self, addr: SocketAddr, envelope: &SyncEnvelope) -> Result<()> {
        let frame = codec::encode_frame(envelope, self.inner.max_payload_bytes)?;
        self.send_frame(addr, OutboundFrame::Binary(frame)).await
    }

    async fn send_frame(&self, addr: SocketAddr, frame: OutboundFrame) -> Result<()> {
        let connections = self.inner.connections.read().await;
        let connection = connections
            .get(&addr)
            .with_context(|| format!("no connection from {addr}"))?;
        connection
            .tx
            .send(frame)
            .await
            .map_err(|_| anyhow::anyhow!("connection writer for {addr} is gone"))
    }

    /// Find the inbound connection for a given peer device, if any.
    pub async fn connection_for_device(&self, device_id: &DeviceId) -> Option<SocketAddr> {
        self.inner
            .connections
            .read()
            .await
            .iter()
            .find(|(_, c)| c.meta.device_id.as_ref() == Some(device_id))
            .map(|(addr, _)| *addr)
    }

    pub async fn connections(&self) -> Vec<(SocketAddr, ConnectionMeta)> {
        self.inner
            .connections
            .read()
            .await
            .iter()
            .map(|(addr, c)| (*addr, c.meta.clone()))
            .collect()
    }
}

async fn handle_connection(
    inner: Arc<ServerInner>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);

    match perform_upgrade(&mut reader, &mut writer).await {
        Ok(()) => {}
        Err(e) => {
            let _ = writer
                .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
                .await;
            return Err(e);
        }
    }

    let (tx, mut rx) = mpsc::channel::<OutboundFrame>(32);
    inner.connections.write().await.insert(
        addr,
        Connection {
            meta: ConnectionMeta {
                device_id: None,
                connected_at: Utc::now(),
            },
            tx,
        },
    );
    let _ = inner.event_tx.send(ServerEvent::Connected { addr });
    debug!(%addr, "peer upgraded");

    // Writer task: serializes all outbound frames for this connection.
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let result = match frame {
                OutboundFrame::Text(text) => {
                    write_frame(&mut writer, OP_TEXT, text.as_bytes()).await
                }
                OutboundFrame::Binary(bytes) => write_frame(&mut writer, OP_BINARY, &bytes).await,
                OutboundFrame::Pong(bytes) => write_frame(&mut writer, OP_PONG, &bytes).await,
                OutboundFrame::Close(code) => {
                    let _ = write_frame(&mut writer, OP_CLOSE, &code.to_be_bytes()).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let result = read_loop(&inner, &mut reader, addr).await;

    let device_id = {
        let mut connections = inner.connections.write().await;
        connections
            .remove(&addr)
            .and_then(|c| c.meta.device_id.clone())
    };
    writer_task.abort();
    let _ = inner
        .event_tx
        .send(ServerEvent::Disconnected { addr, device_id });
    result
}

async fn read_loop(
    inner: &Arc<ServerInner>,
    reader: &mut ReadHalf<TcpStream>,
    addr: SocketAddr,
) -> Result<()> {
    loop {
        let frame = match read_frame(reader, inner.max_payload_bytes).await {
            Ok(frame) => frame,
            Err(FrameError::TooLarge) | Err(FrameError::Protocol(_)) => {
                send_close(inner, addr, CLOSE_POLICY).await;
                return Ok(());
            }
            Err(FrameError::Io(_)) => return Ok(()),
        };

        match frame.opcode {
            OP_TEXT | OP_BINARY => {
                if !frame.fin {
                    // Fragmentation is not supported.
                    send_close(inner, addr, CLOSE_POLICY).await;
                    return Ok(());
                }
                if frame.opcode == OP_TEXT {
                    let text = String::from_utf8_lossy(&frame.payload).to_string();
                    let _ = inner.event_tx.send(ServerEvent::PairingText { addr, text });
                } else {
                    match codec::decode_frame(&frame.payload, inner.max_payload_bytes) {
                        Ok(envelope) => {
                            resolve_device_id(inner, addr, &envelope).await;
                            let _ = inner.event_tx.send(ServerEvent::Envelope { addr, envelope });
                        }
                        Err(e) => {
                            // Bad frame: drop it, keep the connection.
                            warn!(%addr, error = %e, "dropping undecodable envelope frame");
                        }
                    }
                }
            }
            OP_CLOSE => {
                send_close(inner, addr, CLOSE_NORMAL).await;
                return Ok(());
            }
            OP_PING => {
                // Pong carries the ping payload back.
                let connections = inner.connections.read().await;
                if let Some(connection) = connections.get(&addr) {
                    let _ = connection.tx.send(OutboundFrame::Pong(frame.payload)).await;
                }
            }
            OP_PONG => {}
            other => {
                debug!(%addr, opcode = other, "unsupported opcode");
                send_close(inner, addr, CLOSE_POLICY).await;
                return Ok(());
            }
        }
    }
}

async fn resolve_device_id(inner: &Arc<ServerInner>, addr: SocketAddr, envelope: &SyncEnvelope) {
    let mut connections = inner.connections.write().await;
    if let Some(connection) = connections.get_mut(&addr) {
        if connection.meta.device_id.is_none() {
            connection.meta.device_id = Some(envelope.payload.device_id.clone());
        }
    }
}

async fn send_close(inner: &Arc<ServerInner>, addr: SocketAddr, code: u16) {
    let connections = inner.connections.read().await;
    if let Some(connection) = connections.get(&addr) {
        let _ = connection.tx.send(OutboundFrame::Close(code)).await;
    }
}

/// Read the upgrade request and reply `101 Switching Protocols`.
async fn perform_upgrade(
    reader: &mut ReadHalf<TcpStream>,
    writer: &mut WriteHalf<TcpStream>,
) -> Result<()> {
    let mut buf = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= MAX_REQUEST_BYTES {
            anyhow::bail!("upgrade request too large");
        }
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            anyhow::bail!("connection closed during upgrade");
        }
        buf.push(byte[0]);
    }

    let request = String::from_utf8_lossy(&buf);
    let mut lines = request.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    if !request_line.starts_with("GET ") {
        anyhow::bail!("upgrade must be a GET request");
    }

    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let upgrade = headers.get("upgrade").map(|s| s.to_ascii_lowercase());
    if upgrade.as_deref() != Some("websocket") {
        anyhow::bail!("missing Upgrade: websocket");
    }
    let connection = headers
        .get("connection")
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    if !connection.contains("upgrade") {
        anyhow::bail!("missing Connection: upgrade");
    }
    let key = headers
        .get("sec-websocket-key")
        .context("missing Sec-WebSocket-Key")?;

    let accept = compute_accept(key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    );
    writer.write_all(response.as_bytes()).await?;
    Ok(())
}

/// `base64(SHA1(key ‖ GUID))` per RFC 6455.
fn compute_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

struct Frame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

enum FrameError {
    TooLarge,
    Protocol(&'static str),
    Io(std::io::Error),
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Read and unmask one client frame.
async fn read_frame(
    reader: &mut ReadHalf<TcpStream>,
    max_payload_bytes: usize,
) -> Result<Frame, FrameError> {
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let fin = header[0] & 0x80 != 0;
    let opcode = header[0] & 0x0F;
    let masked = header[1] & 0x80 != 0;
    let len7 = (header[1] & 0x7F) as usize;

    let len = match len7 {
        126 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            let len = u64::from_be_bytes(ext);
            usize::try_from(len).map_err(|_| FrameError::TooLarge)?
        }
        n => n,
    };

    if len > max_payload_bytes {
        return Err(FrameError::TooLarge);
    }
    if !masked {
        // Client frames must be masked.
        return Err(FrameError::Protocol("unmasked client frame"));
    }

    let mut mask = [0u8; 4];
    reader.read_exact(&mut mask).await?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    Ok(Frame {
        fin,
        opcode,
        payload,
    })
}

/// Write one unmasked server frame.
async fn write_frame(
    writer: &mut WriteHalf<TcpStream>,
    opcode: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(0x80 | opcode);
    match payload.len() {
        n if n < 126 => frame.push(n as u8),
        n if n <= u16::MAX as usize => {
            frame.push(126);
            frame.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            frame.push(127);
            frame.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use hypo_core::envelope::{ContentType, EnvelopeKind, Payload};
    use tokio_tungstenite::tungstenite::Message;

    #[test]
    fn test_accept_key_matches_rfc6455_example() {
        assert_eq!(
            compute_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    fn envelope(sender: &str) -> SyncEnvelope {
        SyncEnvelope::new(
            EnvelopeKind::Clipboard,
            Payload {
                content_type: ContentType::Text,
                ciphertext: vec![1, 2, 3],
                device_id: DeviceId::new(sender),
                target: None,
                encryption: None,
                metadata: None,
            },
        )
    }

    async fn start_server() -> (Arc<WsServer>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Arc::new(
            WsServer::bind(0, codec::DEFAULT_MAX_FRAME_BYTES, tx)
                .await
                .unwrap(),
        );
        server.start().await;
        (server, rx)
    }

    #[tokio::test]
    async fn test_client_envelope_reaches_events_and_sets_device_id() {
        let (server, mut events) = start_server().await;
        let url = format!("ws://127.0.0.1:{}/ws", server.port());

        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let sent = envelope("6ba7b810-9dad-11d1-80b4-00c04fd430c8");
        let frame = codec::encode_frame(&sent, codec::DEFAULT_MAX_FRAME_BYTES).unwrap();
        ws.send(Message::Binary(frame.into())).await.unwrap();

        let mut received = None;
        for _ in 0..3 {
            match events.recv().await.unwrap() {
                ServerEvent::Envelope { envelope, .. } => {
                    received = Some(envelope);
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(received.unwrap(), sent);

        let device = DeviceId::new("6ba7b810-9dad-11d1-80b4-00c04fd430c8");
        assert!(server.connection_for_device(&device).await.is_some());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_text_frame_routes_to_pairing() {
        let (server, mut events) = start_server().await;
        let url = format!("ws://127.0.0.1:{}/ws", server.port());

        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws.send(Message::Text("{\"kind\":\"challenge\"}".into()))
            .await
            .unwrap();

        let mut pairing_text = None;
        for _ in 0..3 {
            match events.recv().await.unwrap() {
                ServerEvent::PairingText { text, .. } => {
                    pairing_text = Some(text);
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(pairing_text.as_deref(), Some("{\"kind\":\"challenge\"}"));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_server_replies_on_same_connection() {
        let (server, mut events) = start_server().await;
        let url = format!("ws://127.0.0.1:{}/ws", server.port());

        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        // Wait for the server to register the connection.
        let addr = loop {
            match events.recv().await.unwrap() {
                ServerEvent::Connected { addr } => break addr,
                _ => continue,
            }
        };

        server
            .send_text(addr, "{\"kind\":\"ack\"}".to_string())
            .await
            .unwrap();

        let msg = ws.next().await.unwrap().unwrap();
        assert_eq!(msg, Message::Text("{\"kind\":\"ack\"}".into()));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_ping_gets_ponged() {
        let (server, _events) = start_server().await;
        let url = format!("ws://127.0.0.1:{}/ws", server.port());

        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws.send(Message::Ping("hi".as_bytes().to_vec().into()))
            .await
            .unwrap();

        // tungstenite surfaces the pong as a message.
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Pong(data) => {
                    assert_eq!(data.as_ref(), b"hi");
                    break;
                }
                _ => continue,
            }
        }

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_websocket_request_is_rejected() {
        let (server, _events) = start_server().await;
        let mut stream = TcpStream::connect(("127.0.0.1", server.port()))
            .await
            .unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 400"));

        server.shutdown().await;
    }
}
