//! The sync engine: entry point of the core.
//!
//! Outbound: a local clipboard event is echo-filtered, sealed once per
//! paired peer, and queued with a sixty-second validity window. A single
//! worker drains the queue through the fallback dispatcher; it parks when
//! the queue is empty or stuck and is woken by a new enqueue or by the
//! connection state entering a connected state. No polling.
//!
//! Inbound: envelopes are deduplicated by id, decrypted with the sender's
//! stored key, and handed to the installed clipboard sink.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hypo_core::clipboard::ClipboardEvent;
use hypo_core::config::SyncConfig;
use hypo_core::envelope::{meta_keys, ControlBody, EnvelopeAssembler, EnvelopeKind, SyncEnvelope};
use hypo_core::error::AeadError;
use hypo_core::ports::{ClipboardSink, DeviceKeyStore, SyncTransportPort};
use hypo_core::sync::{DedupSet, EchoFilter, QueuedSyncMessage, SyncQueue, DEDUP_TTL, QUEUE_VALIDITY};
use hypo_net::manager::InboundEnvelopeHandler;

use crate::identity::DeviceIdentity;

struct EngineInner {
    local_device: hypo_core::ids::DeviceId,
    local_name: String,
    local_platform: hypo_core::device::Platform,
    config: SyncConfig,
    key_store: Arc<dyn DeviceKeyStore>,
    transport: Arc<dyn SyncTransportPort>,
    sink: OnceLock<Arc<dyn ClipboardSink>>,

    queue: Mutex<SyncQueue>,
    queue_signal: Notify,
    dedup: Mutex<DedupSet>,
    echo: Mutex<EchoFilter>,

    worker: AsyncMutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        identity: &DeviceIdentity,
        config: SyncConfig,
        key_store: Arc<dyn DeviceKeyStore>,
        transport: Arc<dyn SyncTransportPort>,
    ) -> Self {
        let local_device = identity.device_id.clone();
        Self {
            inner: Arc::new(EngineInner {
                local_device: local_device.clone(),
                local_name: identity.name.clone(),
                local_platform: identity.platform,
                config,
                key_store,
                transport,
                sink: OnceLock::new(),
                queue: Mutex::new(SyncQueue::new(QUEUE_VALIDITY)),
                queue_signal: Notify::new(),
                dedup: Mutex::new(DedupSet::new(DEDUP_TTL)),
                echo: Mutex::new(EchoFilter::new(local_device)),
                worker: AsyncMutex::new(None),
            }),
        }
    }

    /// Install the upward consumer. Single slot, set once at startup.
    pub fn set_clipboard_sink(&self, sink: Arc<dyn ClipboardSink>) {
        if self.inner.sink.set(sink).is_err() {
            warn!("clipboard sink was already installed");
        }
    }

    /// Adapter handed to the transport manager's inbound slot.
    pub fn inbound_handler(&self) -> Arc<dyn InboundEnvelopeHandler> {
        Arc::new(EngineInboundHandler {
            engine: self.clone(),
        })
    }

    /// Spawn the queue processor.
    pub async fn start(&self) {
        let mut worker = self.inner.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *worker = Some(tokio::spawn(async move {
            EngineInner::process_queue(inner).await;
        }));
    }

    /// Stop the queue processor; queued entries are preserved for a later
    /// `start`.
    pub async fn shutdown(&self) {
        if let Some(worker) = self.inner.worker.lock().await.take() {
            worker.abort();
        }
    }

    /// Handle one local clipboard event: filter echoes, seal once per
    /// paired peer with a stored key, and enqueue. Returns the number of
    /// envelopes enqueued.
    pub async fn handle_local_event(&self, mut event: ClipboardEvent) -> Result<usize> {
        if !self.inner.echo.lock().expect("echo lock").should_send(&event) {
            debug!("clipboard event suppressed as echo");
            return Ok(0);
        }

        if event.bytes.len() > self.inner.config.max_attachment_bytes {
            bail!(
                "attachment of {} bytes exceeds the configured limit of {}",
                event.bytes.len(),
                self.inner.config.max_attachment_bytes
            );
        }

        event
            .metadata
            .insert(meta_keys::SENDER_NAME.to_string(), self.inner.local_name.clone());
        event.metadata.insert(
            meta_keys::SENDER_PLATFORM.to_string(),
            self.inner.local_platform.to_string(),
        );

        let mut enqueued = 0;
        for device in self.inner.transport.paired_devices() {
            if device.id == self.inner.local_device {
                continue;
            }
            let Some(key) = self
                .inner
                .key_store
                .load(&device.id)
                .await
                .with_context(|| format!("loading key for {}", device.id))?
            else {
                warn!(device_id = %device.id, "paired device has no stored key; skipping");
                continue;
            };

            let envelope = EnvelopeAssembler::build(&event, &device.id, &key)?;
            self.inner
                .queue
                .lock()
                .expect("queue lock")
                .push(QueuedSyncMessage::new(envelope, device.id.clone()));
            enqueued += 1;
        }

        if enqueued > 0 {
            self.inner.queue_signal.notify_one();
        }
        Ok(enqueued)
    }

    /// Handle one decoded inbound envelope from any transport.
    pub async fn handle_inbound_envelope(&self, envelope: SyncEnvelope) {
        let fresh = self
            .inner
            .dedup
            .lock()
            .expect("dedup lock")
            .insert(envelope.id.clone());
        if !fresh {
            debug!(envelope_id = %envelope.id, "duplicate envelope dropped");
            return;
        }

        match envelope.kind {
            EnvelopeKind::Control => self.handle_control(envelope).await,
            EnvelopeKind::Clipboard => self.handle_clipboard(envelope).await,
        }
    }

    async fn handle_control(&self, envelope: SyncEnvelope) {
        let sender = envelope.payload.device_id.clone();
        match ControlBody::from_envelope(&envelope) {
            Some(ControlBody::Ping { .. }) => {
                // Answer so the peer can resolve its round trip.
                let ack = ControlBody::Ack {
                    envelope_id: envelope.id.clone(),
                }
                .into_envelope(self.inner.local_device.clone(), Some(sender.clone()));
                if let Err(e) = self.inner.transport.dispatch(ack, &sender).await {
                    debug!(error = %e, "control ack delivery failed");
                }
            }
            Some(ControlBody::Ack { .. }) => {
                // Round trips resolve at the transport; nothing to do here.
            }
            Some(ControlBody::DeviceAnnounce { name, .. }) => {
                info!(device_id = %sender, name, "peer announced a new name");
            }
            None => debug!(envelope_id = %envelope.id, "malformed control envelope dropped"),
        }
        self.inner.transport.note_device_seen(&sender).await;
    }

    async fn handle_clipboard(&self, envelope: SyncEnvelope) {
        let sender = envelope.payload.device_id.clone();

        let key = match self.inner.key_store.load(&sender).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                warn!(device_id = %sender, "no key for inbound envelope");
                self.emit_decryption_error(sender, AeadError::MissingKey(
                    envelope.payload.device_id.clone(),
                ))
                .await;
                return;
            }
            Err(e) => {
                warn!(device_id = %sender, error = %e, "key store failure on inbound envelope");
                self.emit_decryption_error(sender, AeadError::MissingKey(
                    envelope.payload.device_id.clone(),
                ))
                .await;
                return;
            }
        };

        match EnvelopeAssembler::open(&envelope, &key) {
            Ok(event) => {
                self.inner
                    .echo
                    .lock()
                    .expect("echo lock")
                    .note_inbound(event.content_hash());
                self.inner.transport.note_device_seen(&sender).await;
                if let Some(sink) = self.inner.sink.get() {
                    sink.on_clipboard(event).await;
                }
            }
            Err(e) => {
                warn!(device_id = %sender, error = %e, "inbound envelope failed to decrypt");
                self.emit_decryption_error(sender, e).await;
            }
        }
    }

    async fn emit_decryption_error(&self, sender: hypo_core::ids::DeviceId, error: AeadError) {
        if let Some(sink) = self.inner.sink.get() {
            sink.on_decryption_error(sender, error).await;
        }
    }

    /// Number of messages currently queued (diagnostics and tests).
    pub fn queued_len(&self) -> usize {
        self.inner.queue.lock().expect("queue lock").len()
    }
}

impl EngineInner {
    /// Single queue worker. Parks when there is nothing deliverable and is
    /// woken by (a) a new enqueue or (b) a connection-state transition into
    /// any connected state.
    async fn process_queue(inner: Arc<Self>) {
        let mut state_rx = inner.transport.connection_state();
        loop {
            let now = Instant::now();
            for expired in inner.queue.lock().expect("queue lock").drain_expired(now) {
                warn!(
                    envelope_id = %expired.envelope.id,
                    target = %expired.target_device_id,
                    age = ?expired.age(now),
                    "dropping expired queued message"
                );
            }

            let pass_len = inner.queue.lock().expect("queue lock").len();
            let mut delivered = 0;
            for _ in 0..pass_len {
                let Some(message) = inner.queue.lock().expect("queue lock").pop() else {
                    break;
                };
                if message.is_expired(Instant::now(), QUEUE_VALIDITY) {
                    warn!(envelope_id = %message.envelope.id, "dropping expired queued message");
                    continue;
                }

                let target = message.target_device_id.clone();
                match inner
                    .transport
                    .dispatch(message.envelope.clone(), &target)
                    .await
                {
                    Ok(kind) => {
                        debug!(envelope_id = %message.envelope.id, target = %target, ?kind, "delivered");
                        inner.transport.note_device_seen(&target).await;
                        delivered += 1;
                    }
                    Err(e) => {
                        debug!(envelope_id = %message.envelope.id, target = %target, error = %e, "delivery failed; retained");
                        inner.queue.lock().expect("queue lock").requeue(message);
                    }
                }
            }

            let should_park = {
                let queue = inner.queue.lock().expect("queue lock");
                queue.is_empty() || delivered == 0
            };
            if should_park {
                tokio::select! {
                    _ = inner.queue_signal.notified() => {}
                    _ = wait_for_connected(&mut state_rx) => {}
                }
            }
        }
    }
}

/// Resolve when the connection state transitions into any connected state.
async fn wait_for_connected(
    state_rx: &mut tokio::sync::watch::Receiver<hypo_core::events::ConnectionState>,
) {
    loop {
        if state_rx.changed().await.is_err() {
            // Transport layer is gone; park forever and let the enqueue
            // signal drive the loop.
            std::future::pending::<()>().await;
        }
        if state_rx.borrow().is_connected() {
            return;
        }
    }
}

struct EngineInboundHandler {
    engine: SyncEngine,
}

#[async_trait]
impl InboundEnvelopeHandler for EngineInboundHandler {
    async fn on_envelope(&self, envelope: SyncEnvelope) {
        self.engine.handle_inbound_envelope(envelope).await;
    }
}
