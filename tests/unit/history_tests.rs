//! Unit tests for history injection.

use parachute_sandbox::continuity::history::{inject_history, HISTORY_CLOSE, HISTORY_OPEN};
use parachute_sandbox::models::session::HistoryMessage;

#[test]
fn empty_history_leaves_message_unchanged() {
    assert_eq!(inject_history(&[], "hello", 10), "hello");
}

#[test]
fn history_is_tagged_by_role_and_precedes_message() {
    let history = vec![
        HistoryMessage::new("user", "what is 2+2?"),
        HistoryMessage::new("assistant", "4\n"),
    ];

    let out = inject_history(&history, "and 3+3?", 10);

    assert!(out.starts_with(HISTORY_OPEN));
    assert!(out.contains("[user]: what is 2+2?\n[assistant]: 4\n"));
    let close = out.find(HISTORY_CLOSE).expect("closing tag");
    let message = out.rfind("and 3+3?").expect("message");
    assert!(close < message);
    assert!(out.ends_with("\n\nand 3+3?"));
}

#[test]
fn only_the_most_recent_entries_are_kept() {
    let history: Vec<_> = (0..5)
        .map(|i| HistoryMessage::new("user", format!("m{i}")))
        .collect();

    let out = inject_history(&history, "next", 2);

    assert!(!out.contains("m2"));
    assert!(out.contains("[user]: m3\n[user]: m4\n"));
}

#[test]
fn zero_limit_injects_nothing() {
    let history = vec![HistoryMessage::new("user", "old")];
    assert_eq!(inject_history(&history, "new", 0), "new");
}
