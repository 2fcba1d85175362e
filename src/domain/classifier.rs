//! Status classifier — derives a node's effective report status.
//!
//! Rules are evaluated in a fixed order and the first one that fires owns
//! the `reason`. Later rules still run, but only the first reason sticks.
//!
//! 1. blank report timestamp
//! 2. timestamp that does not parse
//! 3. timestamp older than the unreported threshold
//! 4. empty report status

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::Serialize;

use crate::duration::HumanDuration;

use super::node::Node;

/// Status label (and tally bucket) for nodes without a usable report.
pub const UNREPORTED: &str = "unreported";

/// `YYYY-MM-DDTHH:MM:SSZ`, with optional fractional seconds after the seconds.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

pub const REASON_BLANK_TIMESTAMP: &str = "Timestamp string is blank";
pub const REASON_INVALID_TIMESTAMP: &str = "Invalid time parsed";
pub const REASON_UNREPORTED_STATUS: &str = "Unreported status";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    /// Raw report status, or `unreported`.
    pub status_label: String,
    pub unreported: bool,
    /// Text of the first rule that fired; empty when reported.
    pub reason: String,
    pub report_time: Option<DateTime<Utc>>,
}

impl Classification {
    /// Unix seconds of the report; 0 when the timestamp was missing or unparsable.
    pub fn report_epoch_secs(&self) -> f64 {
        self.report_time.map_or(0.0, |t| t.timestamp() as f64)
    }
}

/// Zero-padded fields only: no signs, no surrounding whitespace, no leap second.
pub fn parse_report_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if !has_fixed_shape(raw.as_bytes()) {
        return None;
    }
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .filter(|naive| naive.nanosecond() < 1_000_000_000)
        .map(|naive| naive.and_utc())
}

/// `DDDD-DD-DDTDD:DD:DD`, then `.D+` optionally, then `Z` and nothing else.
fn has_fixed_shape(raw: &[u8]) -> bool {
    const SEPARATORS: [(usize, u8); 5] = [(4, b'-'), (7, b'-'), (10, b'T'), (13, b':'), (16, b':')];

    if raw.len() < 20 || raw[raw.len() - 1] != b'Z' {
        return false;
    }
    let (head, tail) = raw.split_at(19);
    let head_ok = head.iter().enumerate().all(|(i, &b)| {
        match SEPARATORS.iter().find(|(pos, _)| *pos == i) {
            Some(&(_, sep)) => b == sep,
            None => b.is_ascii_digit(),
        }
    });
    let fraction = &tail[..tail.len() - 1];
    let fraction_ok = match fraction.split_first() {
        None => true,
        Some((b'.', digits)) => !digits.is_empty() && digits.iter().all(u8::is_ascii_digit),
        Some(_) => false,
    };
    head_ok && fraction_ok
}

pub fn older_than_reason(threshold: HumanDuration) -> String {
    format!("Latest timestamp older than {threshold}")
}

/// True when `report_time + threshold` lies strictly before `now`.
/// A missing report time counts as infinitely old.
fn is_stale(report_time: Option<DateTime<Utc>>, threshold: HumanDuration, now: DateTime<Utc>) -> bool {
    let Some(report_time) = report_time else {
        return true;
    };
    chrono::Duration::from_std(threshold.as_std())
        .ok()
        .and_then(|threshold| report_time.checked_add_signed(threshold))
        .is_some_and(|deadline| deadline < now)
}

pub fn classify(node: &Node, threshold: HumanDuration, now: DateTime<Utc>) -> Classification {
    let mut reason: Option<String> = None;

    let raw = node.report_timestamp.as_deref().unwrap_or_default();
    if raw.is_empty() {
        reason.get_or_insert_with(|| REASON_BLANK_TIMESTAMP.to_string());
    }

    let report_time = parse_report_timestamp(raw);
    if report_time.is_none() {
        reason.get_or_insert_with(|| REASON_INVALID_TIMESTAMP.to_string());
    }

    if is_stale(report_time, threshold, now) {
        reason.get_or_insert_with(|| older_than_reason(threshold));
    } else if node.latest_report_status.is_empty() {
        reason.get_or_insert_with(|| REASON_UNREPORTED_STATUS.to_string());
    }

    match reason {
        Some(reason) => Classification {
            status_label: UNREPORTED.to_string(),
            unreported: true,
            reason,
            report_time,
        },
        None => Classification {
            status_label: node.latest_report_status.clone(),
            unreported: false,
            reason: String::new(),
            report_time,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const TWO_HOURS: HumanDuration = HumanDuration::from_secs(7200);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn stamp(t: DateTime<Utc>) -> Option<String> {
        Some(t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
    }

    fn node(timestamp: Option<String>, status: &str) -> Node {
        Node {
            certname: "web01.example.com".into(),
            report_environment: "production".into(),
            report_timestamp: timestamp,
            latest_report_status: status.into(),
            latest_report_hash: "h1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn missing_or_empty_timestamp_is_blank() {
        for timestamp in [None, Some(String::new())] {
            let c = classify(&node(timestamp, "changed"), TWO_HOURS, now());
            assert!(c.unreported);
            assert_eq!(c.status_label, UNREPORTED);
            assert_eq!(c.reason, REASON_BLANK_TIMESTAMP);
            assert_eq!(c.report_time, None);
            assert_eq!(c.report_epoch_secs(), 0.0);
        }
    }

    #[test]
    fn unparsable_timestamp_is_invalid() {
        for raw in [
            "yesterday",
            "2024-05-01 12:00:00",
            "2024-05-01T12:00:00+02:00",
            "2024-13-01T00:00:00Z",
            "2024-5-1T1:2:3Z",
            "2024-05-01T12:00:60Z",
            " 2024-05-01T12:00:00Z",
            "+2024-05-01T12:00:00Z",
            "2024-05-01T12:00:00.Z",
            "2024-05-01T12:00:00Z ",
        ] {
            let c = classify(&node(Some(raw.into()), "changed"), TWO_HOURS, now());
            assert!(c.unreported, "{raw}");
            assert_eq!(c.reason, REASON_INVALID_TIMESTAMP, "{raw}");
            assert_eq!(c.status_label, UNREPORTED);
        }
    }

    #[test]
    fn timestamp_past_threshold_is_stale() {
        let t = now() - chrono::Duration::seconds(7200) - chrono::Duration::seconds(1);
        let c = classify(&node(stamp(t), "changed"), TWO_HOURS, now());
        assert!(c.unreported);
        assert_eq!(c.reason, "Latest timestamp older than 2h0m0s");
        assert_eq!(c.report_time, Some(t));
    }

    #[test]
    fn timestamp_exactly_at_threshold_is_fresh() {
        let t = now() - chrono::Duration::seconds(7200);
        let c = classify(&node(stamp(t), "unchanged"), TWO_HOURS, now());
        assert!(!c.unreported);
        assert_eq!(c.status_label, "unchanged");
    }

    #[test]
    fn fresh_report_keeps_raw_status() {
        let c = classify(&node(stamp(now()), "changed"), TWO_HOURS, now());
        assert!(!c.unreported);
        assert_eq!(c.status_label, "changed");
        assert!(c.reason.is_empty());
        assert_eq!(c.report_epoch_secs(), now().timestamp() as f64);
    }

    #[test]
    fn fresh_report_without_status_is_unreported() {
        let c = classify(&node(stamp(now()), ""), TWO_HOURS, now());
        assert!(c.unreported);
        assert_eq!(c.reason, REASON_UNREPORTED_STATUS);
        assert_eq!(c.status_label, UNREPORTED);
    }

    #[test]
    fn first_matching_rule_owns_the_reason() {
        // Blank timestamp also fails parsing and the staleness check.
        let c = classify(&node(None, ""), TWO_HOURS, now());
        assert_eq!(c.reason, REASON_BLANK_TIMESTAMP);

        // Stale and statusless: staleness comes first.
        let old = now() - chrono::Duration::days(3);
        let c = classify(&node(stamp(old), ""), TWO_HOURS, now());
        assert_eq!(c.reason, older_than_reason(TWO_HOURS));
    }

    #[test]
    fn accepts_fractional_seconds() {
        let c = classify(
            &node(Some("2024-05-01T11:59:30.123Z".into()), "unchanged"),
            TWO_HOURS,
            now(),
        );
        assert!(!c.unreported);
        assert_eq!(c.report_epoch_secs(), (now().timestamp() - 30) as f64);
    }

    #[test]
    fn parse_accepts_only_the_fixed_layout() {
        assert_eq!(
            parse_report_timestamp("2024-05-01T12:00:00Z"),
            Some(now())
        );
        assert!(parse_report_timestamp("2024-05-01T12:00:00.5Z").is_some());
        for raw in ["2024-5-1T1:2:3Z", "2024-05-01T12:00:60Z", " 2024-05-01T12:00:00Z", "+2024-05-01T12:00:00Z"] {
            assert_eq!(parse_report_timestamp(raw), None, "{raw}");
        }
    }

    #[test]
    fn deactivation_does_not_change_classification() {
        let mut active = node(stamp(now()), "failed");
        let baseline = classify(&active, TWO_HOURS, now());
        active.deactivated = Some("2024-05-01T00:00:00.000Z".into());
        assert_eq!(classify(&active, TWO_HOURS, now()), baseline);
    }
}
