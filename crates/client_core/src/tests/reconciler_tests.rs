use super::*;
use chrono::TimeZone;

fn message(id: &str) -> Message {
    message_sent_at(id, 0)
}

fn message_sent_at(id: &str, sent_offset_secs: i64) -> Message {
    Message {
        id: MessageId::new(id),
        text: format!("text {id}"),
        sender_id: ParticipantId::new("participant-a"),
        screen_name: "Finch".into(),
        sent_at: Utc.timestamp_opt(1_700_000_000 + sent_offset_secs, 0).single(),
        received_at: Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default(),
    }
}

fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|message| message.id.as_str()).collect()
}

#[test]
fn merge_ignores_known_id() {
    let existing = vec![message("1"), message("2")];
    let merged = merge(existing.clone(), message("2"));
    assert_eq!(merged, existing);
}

#[test]
fn merge_appends_new_id_at_tail() {
    let merged = merge(vec![message("1"), message("2")], message("3"));
    assert_eq!(ids(&merged), vec!["1", "2", "3"]);
}

#[test]
fn repeated_ids_never_produce_duplicates() {
    let incoming = ["a", "b", "a", "c", "b", "b", "d", "a", "c"];

    let merged = incoming
        .iter()
        .fold(Vec::new(), |acc, id| merge(acc, message(id)));
    assert_eq!(ids(&merged), vec!["a", "b", "c", "d"]);

    let mut timeline = Timeline::new();
    let appended = incoming
        .iter()
        .filter(|id| timeline.merge(message(id)))
        .count();
    assert_eq!(appended, 4);
    assert_eq!(timeline.messages(), merged.as_slice());
}

#[test]
fn arrival_order_wins_over_send_time() {
    let mut timeline = Timeline::new();
    // The second sender's clock runs behind: its message claims an earlier
    // send time but arrives later.
    timeline.merge(message_sent_at("late-clock-first", 60));
    timeline.merge(message_sent_at("early-clock-second", -60));

    assert_eq!(
        ids(timeline.messages()),
        vec!["late-clock-first", "early-clock-second"]
    );
}

#[test]
fn merge_policy_keeps_live_messages_and_dedupes_history() {
    let mut timeline = Timeline::new();
    timeline.merge(message("live-1"));

    let appended = timeline.apply_history(
        vec![message("h1"), message("live-1"), message("h2")],
        HydrationPolicy::Merge,
    );

    assert_eq!(appended, 2);
    assert_eq!(ids(timeline.messages()), vec!["live-1", "h1", "h2"]);
}

#[test]
fn replace_policy_drops_live_messages_missing_from_history() {
    let mut timeline = Timeline::new();
    timeline.merge(message("live-1"));

    let appended =
        timeline.apply_history(vec![message("h1"), message("h2")], HydrationPolicy::Replace);

    assert_eq!(appended, 2);
    assert_eq!(ids(timeline.messages()), vec!["h1", "h2"]);
    assert!(!timeline.contains(&MessageId::new("live-1")));
}

#[test]
fn clear_forgets_seen_ids() {
    let mut timeline = Timeline::new();
    timeline.merge(message("1"));
    timeline.clear();

    assert!(timeline.is_empty());
    assert!(timeline.merge(message("1")));
    assert_eq!(timeline.len(), 1);
}

#[test]
fn decode_derives_receive_time_from_delivery_token() {
    let payload = serde_json::json!({
        "id": "m1",
        "text": "hi",
        "senderId": "participant-a",
        "screenName": "Finch",
        "timestamp": "not a timestamp",
    });

    let decoded = Message::decode(&payload, 17_000_000_000_000_000).expect("decode");
    assert_eq!(decoded.received_at.timestamp_millis(), 1_700_000_000_000);
    assert_eq!(decoded.sent_at, None);
    assert_eq!(decoded.screen_name, "Finch");

    assert!(Message::decode(&serde_json::json!({ "id": "m2" }), 0).is_err());
}
