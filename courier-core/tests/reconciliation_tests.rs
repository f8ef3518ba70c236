//! Scenario tests for reconciling a room after reconnecting
//!
//! Each scenario starts from a device that queued messages while offline and
//! then receives the authoritative room history from the server.

use chrono::{Duration, Utc};
use courier_core::{
    merge_room_history, Attachment, DeliveryStatus, MessageKind, OutboundMessage, PendingMessage, RoomMessage,
    TimelineEntry, VoiceAttachment,
};

fn queued(body: &str, minutes_ago: i64) -> PendingMessage {
    let mut message = PendingMessage::new("room-1", "alice", Some(body.into()), MessageKind::Text, None);
    message.created_at = Utc::now() - Duration::minutes(minutes_ago);
    message
}

/// What the server stores after accepting an outbound payload.
fn accepted(outbound: &OutboundMessage, id: &str) -> RoomMessage {
    RoomMessage {
        id: id.to_string(),
        temporary_id: Some(outbound.temporary_id.clone()),
        room_id: outbound.room_id.clone(),
        sender_id: outbound.sender_id.clone(),
        body: outbound.body.clone(),
        kind: outbound.kind.clone(),
        reply_ref: outbound.reply_ref.clone(),
        created_at: outbound.created_at,
    }
}

fn other_user(id: &str, body: &str, minutes_ago: i64) -> RoomMessage {
    RoomMessage {
        id: id.to_string(),
        temporary_id: None,
        room_id: "room-1".to_string(),
        sender_id: "bob".to_string(),
        body: Some(body.into()),
        kind: MessageKind::Text,
        reply_ref: None,
        created_at: Utc::now() - Duration::minutes(minutes_ago),
    }
}

#[test]
fn test_ack_lost_but_server_kept_the_message() {
    // SCENARIO: the send reached the server, the ack never made it back.
    let first = queued("are we still on for lunch?", 5);
    let second = queued("I can bring the slides", 3);

    let history = vec![
        other_user("srv-10", "morning!", 8),
        accepted(&OutboundMessage::from(&first), "srv-11"),
        other_user("srv-12", "yes, noon", 4),
    ];

    let outcome = merge_room_history(&history, &[first.clone(), second.clone()]);

    let ids: Vec<&str> = outcome.timeline.iter().map(|entry| entry.id()).collect();
    assert_eq!(ids, vec!["srv-10", "srv-11", "srv-12", second.temporary_id.as_str()]);
    assert_eq!(outcome.reaped, vec![first]);

    // Only the genuinely unsent message is still shown as local.
    let local: Vec<&TimelineEntry> = outcome
        .timeline
        .iter()
        .filter(|entry| matches!(entry, TimelineEntry::Local(_)))
        .collect();
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].status(), DeliveryStatus::Pending);
}

#[test]
fn test_failed_record_is_reaped_when_server_has_it() {
    let mut record = queued("this one timed out", 2);
    record.transition_to(DeliveryStatus::Failed).unwrap();

    let history = vec![accepted(&OutboundMessage::from(&record), "srv-1")];
    let outcome = merge_room_history(&history, &[record.clone()]);

    assert_eq!(outcome.timeline.len(), 1);
    assert_eq!(outcome.timeline[0].status(), DeliveryStatus::Sent);
    assert_eq!(outcome.reaped.len(), 1);
    assert_eq!(outcome.reaped[0].status, DeliveryStatus::Failed);
}

#[test]
fn test_uploaded_voice_note_keeps_its_attachment_in_history() {
    let mut voice = PendingMessage::new(
        "room-1",
        "alice",
        None,
        MessageKind::Voice(VoiceAttachment {
            attachment: Attachment::staged("audio/ogg", 48_000),
            duration_secs: 6.0,
        }),
        None,
    );
    voice.record_upload("https://cdn.example/voices/1700000000000_voice.ogg".into());

    let history = vec![accepted(&OutboundMessage::from(&voice), "srv-7")];
    let outcome = merge_room_history(&history, &[voice.clone()]);

    match &outcome.timeline[..] {
        [TimelineEntry::Confirmed(message)] => {
            let attachment = message.kind.attachment().unwrap();
            assert_eq!(
                attachment.url.as_deref(),
                Some("https://cdn.example/voices/1700000000000_voice.ogg")
            );
            assert!(!attachment.raw_bytes_pending);
        }
        other => panic!("expected one confirmed entry, got {:?}", other),
    }
}

#[test]
fn test_reconnecting_twice_yields_the_same_room() {
    let unsent = queued("still offline", 1);
    let history = vec![other_user("srv-1", "ping", 3), other_user("srv-2", "pong", 2)];

    let first = merge_room_history(&history, &[unsent.clone()]);
    let second = merge_room_history(&history, &[unsent]);

    assert_eq!(first, second);
    assert!(first.reaped.is_empty());
    assert_eq!(first.timeline.len(), 3);
}
