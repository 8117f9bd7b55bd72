//! Inbound clipboard flow against a running core: a peer pushes sealed
//! envelopes into the embedded server and the decrypted events reach the
//! installed sink exactly once per envelope id.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use tokio_tungstenite::tungstenite::Message;

use hypo_core::clipboard::ClipboardEvent;
use hypo_core::crypto::DeviceKey;
use hypo_core::envelope::EnvelopeAssembler;
use hypo_core::error::AeadError;
use hypo_core::ids::DeviceId;
use hypo_core::ports::{ClipboardSink, DeviceKeyStore};
use hypo_sync::{DeviceIdentity, MemoryDeviceKeyStore, Platform, SyncConfig, SyncCoreBuilder};

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ClipboardEvent>>,
    errors: Mutex<Vec<DeviceId>>,
}

#[async_trait]
impl ClipboardSink for RecordingSink {
    async fn on_clipboard(&self, event: ClipboardEvent) {
        self.events.lock().unwrap().push(event);
    }

    async fn on_decryption_error(&self, sender: DeviceId, _error: AeadError) {
        self.errors.lock().unwrap().push(sender);
    }
}

const PEER_ID: &str = "7ba7b810-9dad-11d1-80b4-00c04fd430c8";

async fn running_core() -> (
    hypo_sync::builder::SyncCore,
    Arc<RecordingSink>,
    DeviceKey,
    String,
) {
    let identity = DeviceIdentity::generate("Desk", Platform::MacOS);
    let key_store = Arc::new(MemoryDeviceKeyStore::new());
    let sink = Arc::new(RecordingSink::default());

    // The peer paired earlier; its key is installed.
    let peer_key = DeviceKey::new([0x42; 32]);
    key_store
        .save(&DeviceId::new(PEER_ID), &peer_key)
        .await
        .unwrap();

    let core = SyncCoreBuilder::new(identity, SyncConfig::lan())
        .with_key_store(key_store)
        .with_clipboard_sink(sink.clone())
        .build();
    core.start().await.expect("core starts");

    let port = core.manager.server().await.unwrap().port();
    let url = format!("ws://127.0.0.1:{port}/ws");
    (core, sink, peer_key, url)
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn test_sealed_envelope_reaches_sink_decrypted() {
    let (core, sink, peer_key, url) = running_core().await;
    let local_id = core.identity.device_id.clone();

    let event = ClipboardEvent::text(DeviceId::new(PEER_ID), "hello, hypo");
    let envelope = EnvelopeAssembler::build(&event, &local_id, &peer_key).unwrap();
    let frame = hypo_net::codec::encode_frame(&envelope, 256 * 1024).unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws.send(Message::Binary(frame.into())).await.unwrap();

    wait_for("decrypted event", || !sink.events.lock().unwrap().is_empty()).await;
    let events = sink.events.lock().unwrap();
    assert_eq!(events[0].bytes, b"hello, hypo");
    assert_eq!(events[0].origin, DeviceId::new(PEER_ID));
    drop(events);

    core.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_envelope_id_is_delivered_once() {
    let (core, sink, peer_key, url) = running_core().await;
    let local_id = core.identity.device_id.clone();

    let event = ClipboardEvent::text(DeviceId::new(PEER_ID), "only once");
    let envelope = EnvelopeAssembler::build(&event, &local_id, &peer_key).unwrap();
    let frame = hypo_net::codec::encode_frame(&envelope, 256 * 1024).unwrap();

    // The same envelope arrives twice, as after a LAN/cloud race.
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws.send(Message::Binary(frame.clone().into())).await.unwrap();
    ws.send(Message::Binary(frame.into())).await.unwrap();

    wait_for("first delivery", || !sink.events.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.events.lock().unwrap().len(), 1);

    core.shutdown().await;
}

#[tokio::test]
async fn test_envelope_from_unknown_sender_raises_diagnostic() {
    let (core, sink, _peer_key, url) = running_core().await;
    let local_id = core.identity.device_id.clone();

    let stranger = DeviceId::new("9ba7b810-9dad-11d1-80b4-00c04fd430c8");
    let stranger_key = DeviceKey::new([0x13; 32]);
    let event = ClipboardEvent::text(stranger.clone(), "who dis");
    let envelope = EnvelopeAssembler::build(&event, &local_id, &stranger_key).unwrap();
    let frame = hypo_net::codec::encode_frame(&envelope, 256 * 1024).unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws.send(Message::Binary(frame.into())).await.unwrap();

    wait_for("diagnostic", || !sink.errors.lock().unwrap().is_empty()).await;
    assert!(sink.events.lock().unwrap().is_empty());
    assert_eq!(sink.errors.lock().unwrap()[0], stranger);

    core.shutdown().await;
}

#[tokio::test]
async fn test_tampered_ciphertext_keeps_connection_and_raises_diagnostic() {
    let (core, sink, peer_key, url) = running_core().await;
    let local_id = core.identity.device_id.clone();

    let event = ClipboardEvent::text(DeviceId::new(PEER_ID), "attacked");
    let mut envelope = EnvelopeAssembler::build(&event, &local_id, &peer_key).unwrap();
    envelope.payload.ciphertext[0] ^= 0x01;
    let bad_frame = hypo_net::codec::encode_frame(&envelope, 256 * 1024).unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws.send(Message::Binary(bad_frame.into())).await.unwrap();

    wait_for("diagnostic", || !sink.errors.lock().unwrap().is_empty()).await;

    // The connection survives: a good envelope on the same socket arrives.
    let good = ClipboardEvent::text(DeviceId::new(PEER_ID), "recovered");
    let good_envelope = EnvelopeAssembler::build(&good, &local_id, &peer_key).unwrap();
    let good_frame = hypo_net::codec::encode_frame(&good_envelope, 256 * 1024).unwrap();
    ws.send(Message::Binary(good_frame.into())).await.unwrap();

    wait_for("recovery", || !sink.events.lock().unwrap().is_empty()).await;
    assert_eq!(sink.events.lock().unwrap()[0].bytes, b"recovered");

    core.shutdown().await;
}
