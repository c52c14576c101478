//! Identity matching for incoming messages.
//!
//! Strategies, in priority order:
//! 1. exact `client_correlation_id` match;
//! 2. fuzzy match of the viewer's own message against the latest unconfirmed
//!    optimistic entry with the same text inside the matching window;
//! 3. fallback signature equality.
//!
//! Lookup by final id happens before any of these, in the reconciliation engine.

use crate::config::Config;
use crate::storage::models::Message;

/// Prefix of ids synthesised for payloads that came without one.
pub const SYNTHETIC_ID_PREFIX: &str = "sig-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Correlation,
    FuzzyMine,
    Signature,
}

/// Composite dedupe key: room, role, ownership, text prefix, second, attachment count.
pub fn fallback_signature(msg: &Message, prefix_chars: usize) -> String {
    signature_with(msg, prefix_chars, Some(msg.created_at.timestamp()))
}

/// Same key without the time component. Used for payloads that carried no
/// timestamp, where `created_at` is only the arrival time.
pub fn untimed_signature(msg: &Message, prefix_chars: usize) -> String {
    signature_with(msg, prefix_chars, None)
}

fn signature_with(msg: &Message, prefix_chars: usize, second: Option<i64>) -> String {
    let prefix: String = msg.trimmed_content().chars().take(prefix_chars).collect();
    let second = second.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
    format!(
        "{}|{}|{}|{}|{}|{}",
        msg.room_id,
        msg.sender.role.key(),
        u8::from(msg.is_mine),
        prefix,
        second,
        msg.attachments.len()
    )
}

fn is_server_id(msg: &Message, cfg: &Config) -> bool {
    !msg.has_temp_id(&cfg.temp_id_prefix) && !msg.id.starts_with(SYNTHETIC_ID_PREFIX)
}

pub fn find_by_id(list: &[Message], id: &str) -> Option<usize> {
    list.iter().position(|m| m.id == id)
}

pub fn find_by_correlation(list: &[Message], incoming: &Message) -> Option<usize> {
    let correlation = incoming.client_correlation_id.as_deref()?;
    list.iter().position(|m| {
        m.room_id == incoming.room_id && m.client_correlation_id.as_deref() == Some(correlation)
    })
}

/// Only for the viewer's own messages: the most recent optimistic entry that is
/// still pending/sent, with equal trimmed text and creation time within the window.
pub fn find_fuzzy_mine(list: &[Message], incoming: &Message, cfg: &Config) -> Option<usize> {
    if !incoming.is_mine {
        return None;
    }
    let window = cfg.match_window();
    let content = incoming.trimmed_content();

    list.iter().rposition(|m| {
        let correlation_conflict = matches!(
            (&m.client_correlation_id, &incoming.client_correlation_id),
            (Some(a), Some(b)) if a != b
        );
        m.room_id == incoming.room_id
            && m.is_mine
            && m.status.is_unconfirmed()
            && m.has_temp_id(&cfg.temp_id_prefix)
            && !correlation_conflict
            && m.trimmed_content() == content
            && m.attachments.len() == incoming.attachments.len()
            && (incoming.created_at - m.created_at).abs() <= window
    })
}

/// Equal fallback signatures mean the same logical message, unless both sides
/// carry distinct server-issued ids.
pub fn find_by_signature(list: &[Message], incoming: &Message, cfg: &Config) -> Option<usize> {
    let signature = fallback_signature(incoming, cfg.signature_prefix_chars);
    list.iter().position(|m| {
        let distinct_server_ids = is_server_id(m, cfg) && is_server_id(incoming, cfg) && m.id != incoming.id;
        !distinct_server_ids && fallback_signature(m, cfg.signature_prefix_chars) == signature
    })
}

/// First match wins; `None` means a genuinely new message.
pub fn find_match(list: &[Message], incoming: &Message, cfg: &Config) -> Option<(usize, MatchKind)> {
    if let Some(index) = find_by_correlation(list, incoming) {
        return Some((index, MatchKind::Correlation));
    }
    if let Some(index) = find_fuzzy_mine(list, incoming, cfg) {
        return Some((index, MatchKind::FuzzyMine));
    }
    find_by_signature(list, incoming, cfg).map(|index| (index, MatchKind::Signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{MessageStatus, Role, SenderIdentity};
    use chrono::{DateTime, Duration, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z").unwrap().with_timezone(&Utc) + Duration::seconds(secs)
    }

    fn msg(id: &str, content: &str, is_mine: bool, secs: i64, status: MessageStatus) -> Message {
        Message {
            id: id.to_string(),
            room_id: "r1".to_string(),
            content: content.to_string(),
            attachments: vec![],
            created_at: at(secs),
            time_label: String::new(),
            sender: SenderIdentity {
                sender_id: if is_mine { "me".to_string() } else { "them".to_string() },
                role: Role::Client,
                display_name: "X".to_string(),
            },
            is_mine,
            client_correlation_id: None,
            status,
            error_text: None,
        }
    }

    #[test]
    fn correlation_wins_over_everything() {
        let cfg = Config::default();
        let mut pending = msg("local-1", "hello", true, 0, MessageStatus::Pending);
        pending.client_correlation_id = Some("c1".to_string());
        let mut echo = msg("m1", "different text", true, 100, MessageStatus::Delivered);
        echo.client_correlation_id = Some("c1".to_string());

        assert_eq!(find_match(&[pending], &echo, &cfg), Some((0, MatchKind::Correlation)));
    }

    #[test]
    fn fuzzy_picks_most_recent_within_window() {
        let cfg = Config::default();
        let list = vec![
            msg("local-1", "ok", true, 0, MessageStatus::Pending),
            msg("local-2", "ok", true, 5, MessageStatus::Sent),
        ];
        let echo = msg("m9", " ok ", true, 12, MessageStatus::Delivered);
        assert_eq!(find_match(&list, &echo, &cfg), Some((1, MatchKind::FuzzyMine)));
    }

    #[test]
    fn fuzzy_rejects_outside_window_and_other_text() {
        let cfg = Config::default();
        let list = vec![msg("local-1", "ok", true, 0, MessageStatus::Pending)];

        let late = msg("m9", "ok", true, cfg.match_window_secs + 1, MessageStatus::Delivered);
        assert_eq!(find_fuzzy_mine(&list, &late, &cfg), None);

        let other = msg("m9", "not ok", true, 1, MessageStatus::Delivered);
        assert_eq!(find_fuzzy_mine(&list, &other, &cfg), None);

        let theirs = msg("m9", "ok", false, 1, MessageStatus::Delivered);
        assert_eq!(find_fuzzy_mine(&list, &theirs, &cfg), None);
    }

    #[test]
    fn fuzzy_skips_failed_and_confirmed_entries() {
        let cfg = Config::default();
        let list = vec![
            msg("local-1", "ok", true, 0, MessageStatus::Failed),
            msg("m1", "ok", true, 0, MessageStatus::Sent),
        ];
        let echo = msg("m2", "ok", true, 1, MessageStatus::Delivered);
        assert_eq!(find_fuzzy_mine(&list, &echo, &cfg), None);
    }

    #[test]
    fn signature_matches_same_second_duplicates() {
        let cfg = Config::default();
        let list = vec![msg("sig-abc", "hello there", false, 3, MessageStatus::Delivered)];
        let dup = msg("m5", "hello there", false, 3, MessageStatus::Delivered);
        assert_eq!(find_match(&list, &dup, &cfg), Some((0, MatchKind::Signature)));

        let distinct = msg("m6", "hello there", false, 3, MessageStatus::Delivered);
        let list = vec![dup];
        assert_eq!(find_by_signature(&list, &distinct, &cfg), None);
    }

    #[test]
    fn signature_uses_content_prefix() {
        let cfg = Config {
            signature_prefix_chars: 5,
            ..Config::default()
        };
        let a = msg("m1", "hello world", false, 0, MessageStatus::Delivered);
        let b = msg("m1", "hello there", false, 0, MessageStatus::Delivered);
        assert_eq!(
            fallback_signature(&a, cfg.signature_prefix_chars),
            fallback_signature(&b, cfg.signature_prefix_chars)
        );
    }
}
