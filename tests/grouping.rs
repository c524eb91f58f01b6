use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use rstest::rstest;

use babelroom::transcript::MessageKind::{ReceivedFromOther as Other, SentByMe as Me, System};
use babelroom::transcript::{Message, MessageId, MessageKind, Nonce, TranscriptBuilder};

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
}

fn entry(id: &str, kind: MessageKind, sender: &str, ts: DateTime<Utc>) -> Message {
    Message::confirmed(MessageId::new(id), kind, sender, sender, id, ts)
}

fn flags(log: &[Message]) -> Vec<(String, bool, bool, bool)> {
    log.iter()
        .map(|m| {
            (
                m.text.clone(),
                m.is_first_of_day(),
                m.show_avatar(),
                m.show_timestamp(),
            )
        })
        .collect()
}

#[rstest]
#[case::same_sender_same_minute(Other, "jun", at(9, 0, 5), Other, "jun", at(9, 0, 40), false, false)]
#[case::same_sender_next_minute(Other, "jun", at(9, 0, 59), Other, "jun", at(9, 1, 0), true, true)]
#[case::different_senders(Other, "jun", at(9, 0, 5), Other, "ana", at(9, 0, 6), true, true)]
#[case::own_messages_keep_avatar(Me, "me", at(9, 0, 5), Me, "me", at(9, 0, 6), false, true)]
#[case::system_before(System, "sys", at(9, 0, 5), Other, "sys", at(9, 0, 6), true, true)]
#[case::system_after(Other, "jun", at(9, 0, 5), System, "jun", at(9, 0, 6), true, false)]
fn pair_grouping(
    #[case] prev_kind: MessageKind,
    #[case] prev_sender: &str,
    #[case] prev_at: DateTime<Utc>,
    #[case] next_kind: MessageKind,
    #[case] next_sender: &str,
    #[case] next_at: DateTime<Utc>,
    #[case] prev_shows_timestamp: bool,
    #[case] next_shows_avatar: bool,
) {
    let builder = TranscriptBuilder::utc();
    let mut log = Vec::new();
    builder.insert(&mut log, entry("a", prev_kind, prev_sender, prev_at));
    builder.insert(&mut log, entry("b", next_kind, next_sender, next_at));

    assert_eq!(log[0].show_timestamp(), prev_shows_timestamp);
    assert_eq!(log[1].show_avatar(), next_shows_avatar);
    // The newest entry always closes its run.
    assert!(log[1].show_timestamp());
}

#[rstest]
#[case::utc(0, false)]
#[case::seoul(9 * 3600, true)]
#[case::los_angeles(-8 * 3600, false)]
fn day_boundary_follows_the_viewer_offset(#[case] offset_secs: i32, #[case] new_day: bool) {
    let builder = TranscriptBuilder::new(FixedOffset::east_opt(offset_secs).unwrap());
    let mut log = Vec::new();
    builder.insert(&mut log, entry("a", Other, "jun", at(14, 59, 0)));
    builder.insert(&mut log, entry("b", Other, "jun", at(15, 0, 0)));

    assert!(log[0].is_first_of_day());
    assert_eq!(log[1].is_first_of_day(), new_day);
}

fn conversation() -> Vec<Message> {
    vec![
        entry("m1", Other, "jun", at(9, 0, 1)),
        entry("m2", Other, "jun", at(9, 0, 30)),
        entry("m3", Other, "ana", at(9, 0, 31)),
        entry("m4", System, "ana", at(9, 2, 0)),
        entry("m5", Me, "me", at(9, 2, 10)),
        entry("m6", Me, "me", at(9, 2, 20)),
        entry("m7", Other, "jun", at(23, 59, 59)),
    ]
}

#[rstest]
#[case::in_order(vec![0, 1, 2, 3, 4, 5, 6])]
#[case::reversed(vec![6, 5, 4, 3, 2, 1, 0])]
#[case::shuffled(vec![3, 0, 6, 2, 5, 1, 4])]
fn arrival_order_does_not_change_the_result(#[case] order: Vec<usize>) {
    let builder = TranscriptBuilder::utc();
    let source = conversation();

    let mut expected = Vec::new();
    for m in source.clone() {
        builder.insert(&mut expected, m);
    }

    let mut live = Vec::new();
    for &i in &order {
        builder.insert(&mut live, source[i].clone());
    }

    let mut batched = Vec::new();
    let batch: Vec<Message> = order.iter().map(|&i| source[i].clone()).collect();
    builder.extend(&mut batched, batch);

    assert_eq!(flags(&live), flags(&expected));
    assert_eq!(flags(&batched), flags(&expected));
}

#[test]
fn backfill_into_an_existing_log_matches_a_full_replay() {
    let builder = TranscriptBuilder::utc();
    let source = conversation();

    let mut expected = Vec::new();
    builder.extend(&mut expected, source.clone());

    let mut log = Vec::new();
    builder.extend(&mut log, vec![source[0].clone(), source[6].clone()]);
    builder.extend(&mut log, source[1..6].to_vec());

    assert_eq!(flags(&log), flags(&expected));
}

#[test]
fn acknowledged_send_regroups_at_its_server_time() {
    let builder = TranscriptBuilder::utc();
    let mut log = Vec::new();
    builder.insert(&mut log, entry("m1", Me, "me", at(9, 0, 10)));

    let nonce = Nonce::new("n-1");
    let optimistic = Message::outgoing(nonce, "me", "me", "draft", at(9, 5, 0));
    builder.insert(&mut log, optimistic);
    assert!(log[0].show_timestamp());

    // The server stamped it within the same minute as m1.
    log[1].id = Some(MessageId::new("srv-1"));
    log[1].timestamp = at(9, 0, 20);
    builder.reposition(&mut log, 1);

    assert!(!log[0].show_timestamp());
    assert!(log[1].show_timestamp());
    assert!(!log[1].is_first_of_day());
}
