//! Wire types of the monitoring service's management API (v3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CHECKS_PATH: &str = "/api/v3/checks/";

/// Ping history of one check, addressed by uuid.
pub fn pings_path(uuid: &str) -> String {
    format!("{}{}/pings/", CHECKS_PATH, uuid)
}

/// Body of the create-or-update call. `unique: ["slug"]` makes the service
/// return the existing check instead of creating a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertCheck {
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub tags: String,
    #[serde(default)]
    pub desc: String,
    pub timeout: u64,
    pub grace: u64,
    /// Host timezone, used by the service to render ping times.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tz: String,
    #[serde(default)]
    pub channels: String,
    #[serde(default)]
    pub unique: Vec<String>,
}

/// Check state as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    New,
    Up,
    Grace,
    Down,
    Paused,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub tags: String,
    pub status: CheckStatus,
    /// A start signal arrived and no success/failure has followed yet.
    #[serde(default)]
    pub started: bool,
    /// Time of the most recent ping of any kind.
    #[serde(default)]
    pub last_ping: Option<DateTime<Utc>>,
    /// Only present when using a read-write key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckList {
    pub checks: Vec<CheckRecord>,
}

/// One entry of a check's ping history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRecord {
    /// `start`, `success`, `fail`, `log` or `ign`.
    #[serde(rename = "type")]
    pub kind: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingList {
    pub pings: Vec<PingRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_check_record() {
        let json = r#"{
            "name": "pve1",
            "slug": "job__pve1-abc",
            "tags": "role=job",
            "desc": "",
            "grace": 7200,
            "n_pings": 4,
            "status": "up",
            "started": false,
            "last_ping": "2025-03-12T10:00:00+00:00",
            "uuid": "31365bce-8ad4-4b0f-b3a8-8b34fbc8b4b3",
            "ping_url": "https://hc.example.com/ping/31365bce-8ad4-4b0f-b3a8-8b34fbc8b4b3"
        }"#;
        let record: CheckRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.status, CheckStatus::Up);
        assert!(!record.started);
        assert_eq!(record.slug, "job__pve1-abc");
        assert!(record.uuid.is_some());
        assert_eq!(
            record.last_ping.unwrap().to_rfc3339(),
            "2025-03-12T10:00:00+00:00"
        );
    }

    #[test]
    fn test_parse_ping_history() {
        let json = r#"{"pings": [
            {"type": "success", "date": "2025-03-12T10:05:00+00:00", "n": 2, "scheme": "https"},
            {"type": "start", "date": "2025-03-12T10:00:00+00:00", "n": 1, "scheme": "https"}
        ]}"#;
        let list: PingList = serde_json::from_str(json).unwrap();
        assert_eq!(list.pings.len(), 2);
        assert_eq!(list.pings[1].kind, "start");
        assert!(list.pings[0].date > list.pings[1].date);
        assert_eq!(
            pings_path("abc"),
            "/api/v3/checks/abc/pings/"
        );
    }

    #[test]
    fn test_unknown_status_tolerated() {
        let record: CheckRecord =
            serde_json::from_str(r#"{"status":"frozen","started":true}"#).unwrap();
        assert_eq!(record.status, CheckStatus::Unknown);
        assert!(record.started);
    }

    #[test]
    fn test_upsert_body() {
        let body = UpsertCheck {
            name: "pve1".into(),
            slug: "job__pve1-abc".into(),
            tags: "role=job".into(),
            desc: String::new(),
            timeout: 86_400,
            grace: 7_200,
            tz: "Europe/Paris".into(),
            channels: "*".into(),
            unique: vec!["slug".into()],
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["unique"], serde_json::json!(["slug"]));
        assert_eq!(value["grace"], 7200);
        assert_eq!(value["tz"], "Europe/Paris");
    }
}
