//! Inbound routing end to end: normalization, at-most-once processing,
//! replies, and broadcast.

mod common;

use common::{fast_reconnect, wait_until, Harness, ScriptedProcessor};
use relaygate::instances::{OutboundContent, StructuredContent};
use relaygate::kv::{MemoryKvStore, SqliteKvStore};
use relaygate::router::BroadcastOutcome;
use relaygate::transport::{MediaAttachment, OutgoingPayload, RawMessage, TransportEvent};
use std::sync::Arc;
use std::time::Duration;

fn ack() -> Option<OutboundContent> {
    Some(OutboundContent::Text("ack".into()))
}

fn attachment(mime_type: &str) -> MediaAttachment {
    MediaAttachment {
        mime_type: mime_type.into(),
        data: "AAAA".into(),
        filename: None,
        caption: None,
    }
}

#[tokio::test]
async fn broadcast_reports_each_instance_without_failing() {
    let h = Harness::new();
    h.ready_instance("A").await;
    h.ready_instance("B").await;
    h.controller("B").fail_sends(true);

    let outcomes = h
        .router
        .broadcast("x@domain", &OutboundContent::Text("notice".into()))
        .await;

    assert_eq!(
        outcomes,
        vec![
            BroadcastOutcome {
                instance: "A".into(),
                success: true
            },
            BroadcastOutcome {
                instance: "B".into(),
                success: false
            },
        ]
    );
    assert_eq!(h.controller("A").sent().len(), 1);
}

#[tokio::test]
async fn broadcast_skips_instances_that_are_not_ready() {
    let h = Harness::new();
    h.ready_instance("A").await;
    h.registry.create_instance("B", None).await.unwrap();

    let outcomes = h
        .router
        .broadcast("x@domain", &OutboundContent::Text("notice".into()))
        .await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].instance, "A");
}

#[tokio::test]
async fn duplicate_delivery_is_processed_and_answered_once() {
    let h = Harness::new();
    h.ready_instance("A").await;
    let ctl = h.controller("A");

    ctl.message("msg-1", "200@c.us", "hello").await;
    ctl.message("msg-1", "200@c.us", "hello").await;

    wait_until("reply", || !ctl.sent().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.processor.call_count(), 1);
    let sent = ctl.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "200@c.us");
    assert_eq!(sent[0].payload, OutgoingPayload::text("ack"));
}

#[tokio::test]
async fn slow_processing_still_blocks_redelivery() {
    let h = Harness::with(
        ScriptedProcessor::slow(ack(), Duration::from_millis(100)),
        fast_reconnect(),
    );
    h.ready_instance("A").await;
    let ctl = h.controller("A");

    for _ in 0..3 {
        ctl.message("msg-1", "200@c.us", "hello").await;
    }
    wait_until("reply", || !ctl.sent().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(h.processor.call_count(), 1);
    assert_eq!(ctl.sent().len(), 1);
}

#[tokio::test]
async fn same_message_id_on_different_instances_is_independent() {
    let h = Harness::new();
    h.ready_instance("A").await;
    h.ready_instance("B").await;

    h.controller("A").message("shared", "200@c.us", "hi").await;
    h.controller("B").message("shared", "200@c.us", "hi").await;

    wait_until("both processed", || h.processor.call_count() == 2).await;
    let mut sources: Vec<String> = h
        .processor
        .calls()
        .into_iter()
        .map(|e| e.source_instance)
        .collect();
    sources.sort();
    assert_eq!(sources, vec!["A", "B"]);
}

#[tokio::test]
async fn persisted_records_survive_a_gateway_restart() {
    let tmp = tempfile::TempDir::new().unwrap();
    let db = tmp.path().join("dedup.db");

    {
        let store = Arc::new(SqliteKvStore::open(&db).unwrap());
        let h = Harness::with_store(ScriptedProcessor::replying(ack()), fast_reconnect(), store);
        h.ready_instance("A").await;
        h.controller("A").message("msg-1", "200@c.us", "hello").await;
        wait_until("first processing", || h.processor.call_count() == 1).await;
        h.registry.shutdown().await;
    }

    let store = Arc::new(SqliteKvStore::open(&db).unwrap());
    let h = Harness::with_store(ScriptedProcessor::replying(ack()), fast_reconnect(), store);
    h.ready_instance("A").await;
    let ctl = h.controller("A");
    ctl.message("msg-1", "200@c.us", "hello").await;
    ctl.message("msg-2", "200@c.us", "again").await;

    wait_until("new message processed", || h.processor.call_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let calls = h.processor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].message_id, "msg-2");
}

#[tokio::test]
async fn unavailable_store_fails_closed_without_poisoning() {
    let store = Arc::new(MemoryKvStore::new());
    let h = Harness::with_store(
        ScriptedProcessor::replying(ack()),
        fast_reconnect(),
        store.clone(),
    );
    h.ready_instance("A").await;
    let ctl = h.controller("A");

    store.set_unavailable(true);
    ctl.message("msg-1", "200@c.us", "hello").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.processor.call_count(), 0);
    assert!(ctl.sent().is_empty());

    // Nothing was recorded, so a redelivery after recovery is processed
    store.set_unavailable(false);
    ctl.message("msg-1", "200@c.us", "hello").await;
    wait_until("processing after recovery", || h.processor.call_count() == 1).await;
}

#[tokio::test]
async fn own_status_and_blank_messages_are_ignored() {
    let h = Harness::new();
    h.ready_instance("A").await;
    let ctl = h.controller("A");

    let base = RawMessage {
        id: "m".into(),
        from: "200@c.us".into(),
        body: "hi".into(),
        timestamp: 1_700_000_000,
        message_type: "chat".into(),
        from_me: false,
        has_media: false,
    };
    ctl.emit(TransportEvent::Message(RawMessage {
        id: "own".into(),
        from_me: true,
        ..base.clone()
    }))
    .await;
    ctl.emit(TransportEvent::Message(RawMessage {
        id: "story".into(),
        from: "status@broadcast".into(),
        ..base.clone()
    }))
    .await;
    ctl.emit(TransportEvent::Message(RawMessage {
        id: "blank".into(),
        body: "   ".into(),
        ..base.clone()
    }))
    .await;
    ctl.emit(TransportEvent::Message(RawMessage {
        id: "photo".into(),
        body: String::new(),
        message_type: "image".into(),
        has_media: true,
        ..base
    }))
    .await;

    wait_until("media message processed", || h.processor.call_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let calls = h.processor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].message_id, "photo");
}

#[tokio::test]
async fn reply_falls_back_when_origin_is_no_longer_ready() {
    let h = Harness::with(
        ScriptedProcessor::slow(ack(), Duration::from_millis(150)),
        fast_reconnect(),
    );
    h.ready_instance("A").await;
    h.ready_instance("B").await;
    let a = h.controller("A");
    let b = h.controller("B");

    a.message("msg-1", "300@c.us", "hello").await;
    wait_until("processing started", || h.processor.call_count() == 1).await;
    a.disconnected("CONFLICT").await;

    wait_until("fallback reply", || !b.sent().is_empty()).await;
    assert!(a.sent().is_empty());
    assert_eq!(b.sent()[0].recipient, "300@c.us");
}

#[tokio::test]
async fn no_reply_means_nothing_is_sent() {
    let h = Harness::with(ScriptedProcessor::replying(None), fast_reconnect());
    h.ready_instance("A").await;
    let ctl = h.controller("A");

    ctl.message("msg-1", "200@c.us", "hello").await;
    wait_until("processing", || h.processor.call_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ctl.sent().is_empty());
}

#[tokio::test]
async fn structured_reply_sends_text_then_voice() {
    let reply = OutboundContent::Structured(StructuredContent {
        text: Some("listen".into()),
        media: Some(attachment("image/png")),
        voice: Some(attachment("audio/ogg")),
        voice_only: false,
    });
    let h = Harness::with(ScriptedProcessor::replying(Some(reply)), fast_reconnect());
    h.ready_instance("A").await;
    let ctl = h.controller("A");

    ctl.message("msg-1", "200@c.us", "hello").await;
    wait_until("both sends", || ctl.sent().len() == 2).await;

    let sent = ctl.sent();
    assert_eq!(sent[0].payload, OutgoingPayload::text("listen"));
    assert!(matches!(
        &sent[1].payload,
        OutgoingPayload::Voice { media } if media.mime_type == "audio/ogg"
    ));
}
