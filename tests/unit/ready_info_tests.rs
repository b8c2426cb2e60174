//! Unit tests for the readiness summary model.

use chrono::{TimeZone, Utc};
use serve_harness::models::ready::ReadyInfo;
use url::Url;

#[test]
fn serializes_with_snake_case_fields() {
    let info = ReadyInfo {
        session_id: "s-1".into(),
        url: Url::parse("http://localhost:3000").expect("url"),
        build_id: "abc123".into(),
        ready_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("timestamp"),
    };

    let value = serde_json::to_value(&info).expect("serialize");

    assert_eq!(value["session_id"], "s-1");
    assert_eq!(value["url"], "http://localhost:3000/");
    assert_eq!(value["build_id"], "abc123");
    assert_eq!(value["ready_at"], "2024-05-01T12:00:00Z");

    let back: ReadyInfo = serde_json::from_value(value).expect("deserialize");
    assert_eq!(back, info);
}
