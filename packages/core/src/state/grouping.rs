//! Date separators for the message list.
//!
//! Pure projection: the input is never mutated, grouping the flattened output
//! again yields the same groups.

use crate::storage::models::Message;
use chrono::{DateTime, Local, NaiveDate, TimeZone};
use serde::Serialize;
use std::collections::BTreeMap;

/// Messages of one calendar day, in the order the list holds them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageGroup {
    pub label: String,
    pub day: NaiveDate,
    pub messages: Vec<Message>,
}

/// "Today", "Yesterday", the weekday within a week, otherwise a long date.
pub fn day_label(day: NaiveDate, today: NaiveDate) -> String {
    match (today - day).num_days() {
        0 => "Today".to_string(),
        1 => "Yesterday".to_string(),
        2..=6 => day.format("%A").to_string(),
        _ => day.format("%B %-d, %Y").to_string(),
    }
}

/// Group by calendar day in the time zone of `now`.
pub fn group_by_date_in<Tz: TimeZone>(messages: &[Message], now: &DateTime<Tz>) -> Vec<MessageGroup> {
    let tz = now.timezone();
    let today = now.date_naive();

    let mut days: BTreeMap<NaiveDate, Vec<Message>> = BTreeMap::new();
    for message in messages {
        let day = message.created_at.with_timezone(&tz).date_naive();
        days.entry(day).or_default().push(message.clone());
    }

    days.into_iter()
        .map(|(day, messages)| MessageGroup {
            label: day_label(day, today),
            day,
            messages,
        })
        .collect()
}

/// Group by local calendar day.
pub fn group_by_date(messages: &[Message]) -> Vec<MessageGroup> {
    group_by_date_in(messages, &Local::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{MessageStatus, Role, SenderIdentity};
    use chrono::{FixedOffset, Utc};

    fn msg(id: &str, iso: &str) -> Message {
        Message {
            id: id.to_string(),
            room_id: "r1".to_string(),
            content: id.to_string(),
            attachments: vec![],
            created_at: DateTime::parse_from_rfc3339(iso).unwrap().with_timezone(&Utc),
            time_label: String::new(),
            sender: SenderIdentity {
                sender_id: "u1".to_string(),
                role: Role::Client,
                display_name: "Dana".to_string(),
            },
            is_mine: false,
            client_correlation_id: None,
            status: MessageStatus::Delivered,
            error_text: None,
        }
    }

    fn now() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2024-03-15T18:00:00+00:00").unwrap()
    }

    #[test]
    fn test_labels() {
        let messages = vec![
            msg("old", "2024-01-02T09:00:00Z"),
            msg("week", "2024-03-11T09:00:00Z"),
            msg("yesterday", "2024-03-14T23:00:00Z"),
            msg("today", "2024-03-15T08:00:00Z"),
        ];
        let labels: Vec<String> = group_by_date_in(&messages, &now()).into_iter().map(|g| g.label).collect();
        assert_eq!(labels, vec!["January 2, 2024", "Monday", "Yesterday", "Today"]);
    }

    #[test]
    fn test_groups_ordered_by_day_and_keep_list_order() {
        let messages = vec![
            msg("b", "2024-03-15T10:00:00Z"),
            msg("x", "2024-03-14T10:00:00Z"),
            msg("a", "2024-03-15T09:00:00Z"),
        ];
        let groups = group_by_date_in(&messages, &now());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].label, "Yesterday");
        let today: Vec<&str> = groups[1].messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(today, vec!["b", "a"]);
    }

    #[test]
    fn test_regrouping_is_idempotent() {
        let messages = vec![
            msg("c", "2024-03-15T10:00:00Z"),
            msg("a", "2024-03-01T10:00:00Z"),
            msg("b", "2024-03-14T10:00:00Z"),
        ];
        let once = group_by_date_in(&messages, &now());
        let flat: Vec<Message> = once.iter().flat_map(|g| g.messages.clone()).collect();
        assert_eq!(group_by_date_in(&flat, &now()), once);
        assert_eq!(group_by_date_in(&messages, &now()), once);
    }

    #[test]
    fn test_day_boundary_follows_time_zone() {
        let messages = vec![msg("late", "2024-03-14T23:30:00Z")];
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = now().with_timezone(&plus_two);
        assert_eq!(group_by_date_in(&messages, &now)[0].label, "Today");
    }

    #[test]
    fn test_empty_input() {
        assert!(group_by_date(&[]).is_empty());
    }
}
