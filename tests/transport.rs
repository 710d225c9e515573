//! Transport channel integration tests
//!
//! Exercises the connect/reconnect state machine, the paced outbound audio
//! queue, and inbound dispatch against an in-memory connector.

mod common;

use std::time::Duration;

use babelcall::{LinkStatus, TransportChannel, TransportEvent, WireFrame};
use common::{FakeConnector, accept_peer, test_transport_config, wait_status, wait_until};

fn frame_json(frame: &WireFrame) -> serde_json::Value {
    match frame {
        WireFrame::Text(text) => serde_json::from_str(text).expect("text frame is JSON"),
        WireFrame::Binary(_) => panic!("expected a text frame, got binary"),
    }
}

#[tokio::test]
async fn connect_targets_session_scoped_url() {
    let (connector, mut accepted) = FakeConnector::new();
    let transport = TransportChannel::new(test_transport_config(), connector.clone());

    transport.connect("sess-42").await.unwrap();
    let _peer = accept_peer(&mut accepted).await;

    assert_eq!(
        connector.dialed_urls(),
        vec!["ws://test.invalid/ws/sess-42".to_string()]
    );
    assert_eq!(transport.status(), LinkStatus::Open);
}

#[tokio::test]
async fn config_is_pushed_before_audio_on_open() {
    let (connector, mut accepted) = FakeConnector::new();
    let transport = TransportChannel::new(test_transport_config(), connector);

    // Merged locally while disconnected; no frame goes out yet
    transport
        .send_config(babelcall::SessionConfig {
            role: None,
            source_language: Some("en".to_string()),
            target_language: Some("es".to_string()),
        })
        .await;
    transport.send_audio(vec![1, 2, 3]).await;

    transport.connect("sess-1").await.unwrap();
    let mut peer = accept_peer(&mut accepted).await;

    let first = frame_json(&peer.next_sent().await);
    assert_eq!(first["type"], "config");
    assert_eq!(first["data"]["sourceLanguage"], "en");
    assert_eq!(first["data"]["targetLanguage"], "es");

    assert_eq!(peer.next_sent().await, WireFrame::Binary(vec![1, 2, 3]));
}

#[tokio::test]
async fn audio_drains_in_fifo_order() {
    let (connector, mut accepted) = FakeConnector::new();
    let transport = TransportChannel::new(test_transport_config(), connector);

    transport.connect("sess-1").await.unwrap();
    let mut peer = accept_peer(&mut accepted).await;

    for i in 0..5_u8 {
        transport.send_audio(vec![i]).await;
    }
    for i in 0..5_u8 {
        assert_eq!(peer.next_sent().await, WireFrame::Binary(vec![i]));
    }
}

#[tokio::test]
async fn queue_is_cleared_on_close_and_drains_after_reconnect() {
    let (connector, mut accepted) = FakeConnector::new();
    let transport = TransportChannel::new(test_transport_config(), connector.clone());

    transport.connect("sess-1").await.unwrap();
    let peer = accept_peer(&mut accepted).await;

    // A burst in flight when the connection dies
    for i in 0..50_u8 {
        transport.send_audio(vec![i]).await;
    }

    // Refuse the first retry so the close is fully processed before
    // anything new is enqueued
    connector.plan(&[false]);
    drop(peer);
    wait_until("the refused retry happens", || connector.dial_count() == 2).await;

    // Frames enqueued while retrying survive until the next open
    transport.send_audio(vec![0xAA]).await;

    let mut peer = accept_peer(&mut accepted).await;

    // Nothing from the pre-close burst is replayed
    assert_eq!(peer.next_sent().await, WireFrame::Binary(vec![0xAA]));
    transport.send_audio(vec![0xBB]).await;
    assert_eq!(peer.next_sent().await, WireFrame::Binary(vec![0xBB]));
}

#[tokio::test]
async fn retries_until_budget_exhausted() {
    let (connector, mut accepted) = FakeConnector::new();
    let transport = TransportChannel::new(test_transport_config(), connector.clone());
    let mut status = transport.status_watch();

    transport.connect("sess-1").await.unwrap();
    let peer = accept_peer(&mut accepted).await;

    // Every reconnect attempt is refused
    connector.plan(&[false, false, false, false, false]);
    drop(peer);

    wait_status(&mut status, LinkStatus::ClosedExhausted).await;

    // One successful dial plus the full retry budget, then silence
    assert_eq!(connector.dial_count(), 6);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(connector.dial_count(), 6);
}

#[tokio::test]
async fn explicit_connect_recovers_after_exhaustion() {
    let (connector, mut accepted) = FakeConnector::new();
    let transport = TransportChannel::new(test_transport_config(), connector.clone());
    let mut status = transport.status_watch();

    transport.connect("sess-1").await.unwrap();
    let peer = accept_peer(&mut accepted).await;

    connector.plan(&[false, false, false, false, false]);
    drop(peer);
    wait_status(&mut status, LinkStatus::ClosedExhausted).await;

    transport.connect("sess-1").await.unwrap();
    let _peer = accept_peer(&mut accepted).await;
    assert_eq!(transport.status(), LinkStatus::Open);
}

#[tokio::test]
async fn successful_reopen_resets_the_retry_budget() {
    let (connector, mut accepted) = FakeConnector::new();
    let transport = TransportChannel::new(test_transport_config(), connector.clone());
    let mut status = transport.status_watch();

    transport.connect("sess-1").await.unwrap();
    let peer = accept_peer(&mut accepted).await;

    // Three refused dials, then one accepted
    connector.plan(&[false, false, false]);
    drop(peer);
    let peer = accept_peer(&mut accepted).await;
    wait_status(&mut status, LinkStatus::Open).await;

    // The counter restarted: a fresh close affords the full budget again
    connector.plan(&[false, false, false, false, false]);
    drop(peer);
    wait_status(&mut status, LinkStatus::ClosedExhausted).await;
    // 1 initial + 3 refused + 1 reopen + 5 refused
    assert_eq!(connector.dial_count(), 10);
}

#[tokio::test]
async fn deliberate_disconnect_does_not_retry() {
    let (connector, mut accepted) = FakeConnector::new();
    let transport = TransportChannel::new(test_transport_config(), connector.clone());

    transport.connect("sess-1").await.unwrap();
    let _peer = accept_peer(&mut accepted).await;

    transport.disconnect().await;
    assert_eq!(transport.status(), LinkStatus::Disconnected);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.dial_count(), 1);
}

#[tokio::test]
async fn inbound_messages_dispatch_to_typed_events() {
    let (connector, mut accepted) = FakeConnector::new();
    let transport = TransportChannel::new(test_transport_config(), connector);
    let mut events = transport.subscribe();

    transport.connect("sess-1").await.unwrap();
    let peer = accept_peer(&mut accepted).await;

    peer.push_text(
        r#"{"type":"transcript","data":{"id":"t1","text":"hello","timestamp":"2026-03-01T10:00:00Z","isFinal":true,"sourceLanguage":"en"}}"#,
    )
    .await;
    peer.push_text(
        r#"{"type":"translation","data":{"id":"t1","text":"hola","timestamp":"2026-03-01T10:00:01Z","sourceLanguage":"en","targetLanguage":"es"}}"#,
    )
    .await;
    peer.push_text(r#"{"type":"session_update","data":{"sessionId":"sess-1","participants":2,"status":"active"}}"#)
        .await;
    peer.push_text(r#"{"type":"error","data":{"code":"stt_failed","message":"model overload"}}"#)
        .await;
    peer.push_binary(vec![0xFF, 0xFB, 0x90]).await;

    let mut seen = Vec::new();
    while seen.len() < 5 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out")
            .expect("event stream closed");
        match event {
            TransportEvent::Status(_) => {}
            other => seen.push(other),
        }
    }

    assert!(matches!(&seen[0], TransportEvent::Transcript(p) if p.id == "t1"));
    assert!(matches!(&seen[1], TransportEvent::Translation(p) if p.text == "hola"));
    assert!(matches!(&seen[2], TransportEvent::SessionUpdate(p) if p.participants == 2));
    assert!(matches!(&seen[3], TransportEvent::Error(e) if e.code == "stt_failed"));
    assert!(matches!(&seen[4], TransportEvent::SynthesizedAudio(b) if b.len() == 3));
}

#[tokio::test]
async fn unknown_message_types_are_dropped_silently() {
    let (connector, mut accepted) = FakeConnector::new();
    let transport = TransportChannel::new(test_transport_config(), connector);
    let mut events = transport.subscribe();

    transport.connect("sess-1").await.unwrap();
    let peer = accept_peer(&mut accepted).await;

    peer.push_text(r#"{"type":"participant_joined","data":{"username":"u"}}"#)
        .await;
    peer.push_text(
        r#"{"type":"transcript","data":{"id":"t9","text":"next","timestamp":"2026-03-01T10:00:00Z","isFinal":false,"sourceLanguage":"en"}}"#,
    )
    .await;

    // The unknown type produces no event at all; the transcript follows
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out")
            .expect("event stream closed");
        match event {
            TransportEvent::Status(_) => {}
            TransportEvent::Transcript(p) => {
                assert_eq!(p.id, "t9");
                break;
            }
            other => panic!("unexpected event before transcript: {other:?}"),
        }
    }
}

#[tokio::test]
async fn malformed_message_reports_decode_error_without_teardown() {
    let (connector, mut accepted) = FakeConnector::new();
    let transport = TransportChannel::new(test_transport_config(), connector);
    let mut events = transport.subscribe();

    transport.connect("sess-1").await.unwrap();
    let peer = accept_peer(&mut accepted).await;

    peer.push_text("not json at all").await;

    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out")
            .expect("event stream closed");
        match event {
            TransportEvent::Status(_) => {}
            TransportEvent::Error(e) => {
                assert_eq!(e.code, "decode_error");
                break;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    // Connection stays open
    assert_eq!(transport.status(), LinkStatus::Open);
}

#[tokio::test]
async fn tts_request_while_open_is_sent_and_while_closed_reports_error() {
    let (connector, mut accepted) = FakeConnector::new();
    let transport = TransportChannel::new(test_transport_config(), connector);
    let mut events = transport.subscribe();

    // Closed: the request cannot be delivered
    transport.request_tts("hola", "es").await;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out")
            .expect("event stream closed");
        if let TransportEvent::Error(e) = event {
            assert_eq!(e.code, "tts_request_error");
            break;
        }
    }

    transport.connect("sess-1").await.unwrap();
    let mut peer = accept_peer(&mut accepted).await;

    transport.request_tts("hola", "es").await;
    let frame = frame_json(&peer.next_sent().await);
    assert_eq!(frame["type"], "tts");
    assert_eq!(frame["data"]["text"], "hola");
    assert_eq!(frame["data"]["language"], "es");
}

#[tokio::test]
async fn merged_config_is_resent_when_the_channel_reopens() {
    let (connector, mut accepted) = FakeConnector::new();
    let transport = TransportChannel::new(test_transport_config(), connector);
    let mut status = transport.status_watch();

    transport
        .send_config(babelcall::SessionConfig {
            role: None,
            source_language: Some("en".to_string()),
            target_language: None,
        })
        .await;

    transport.connect("sess-1").await.unwrap();
    let mut peer = accept_peer(&mut accepted).await;
    let first = frame_json(&peer.next_sent().await);
    assert_eq!(first["type"], "config");
    assert_eq!(first["data"]["sourceLanguage"], "en");

    // A later partial write merges into the full config
    transport
        .send_config(babelcall::SessionConfig {
            role: None,
            source_language: None,
            target_language: Some("fr".to_string()),
        })
        .await;
    let second = frame_json(&peer.next_sent().await);
    assert_eq!(second["data"]["sourceLanguage"], "en");
    assert_eq!(second["data"]["targetLanguage"], "fr");

    // The merged config comes back on its own after an unexpected close
    drop(peer);
    let mut peer = accept_peer(&mut accepted).await;
    wait_status(&mut status, LinkStatus::Open).await;
    let replay = frame_json(&peer.next_sent().await);
    assert_eq!(replay["type"], "config");
    assert_eq!(replay["data"]["sourceLanguage"], "en");
    assert_eq!(replay["data"]["targetLanguage"], "fr");
}

#[tokio::test]
async fn keepalive_pings_while_open() {
    let (connector, mut accepted) = FakeConnector::new();
    let mut config = test_transport_config();
    config.keepalive = Duration::from_millis(20);
    let transport = TransportChannel::new(config, connector);

    transport.connect("sess-1").await.unwrap();
    let mut peer = accept_peer(&mut accepted).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        assert!(tokio::time::Instant::now() < deadline, "no ping observed");
        if let WireFrame::Text(text) = peer.next_sent().await {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            if value["type"] == "ping" {
                break;
            }
        }
    }
}
