//! Node and report-metric records as returned by the PuppetDB query API.
//!
//! Records are rebuilt from scratch on every poll cycle and never mutated.
//! PuppetDB reports missing values as JSON `null`; optional fields keep that
//! distinction, the rest collapse it to an empty string.

use serde::{Deserialize, Deserializer, Serialize};

/// A managed host tracked by PuppetDB.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub certname: String,
    /// Deactivation timestamp. Present means the node is inactive.
    #[serde(default)]
    pub deactivated: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub report_environment: String,
    #[serde(default)]
    pub report_timestamp: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub latest_report_status: String,
    /// Empty when the node has never submitted a report.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub latest_report_hash: String,
}

impl Node {
    pub fn is_deactivated(&self) -> bool {
        self.deactivated.as_deref().is_some_and(|d| !d.is_empty())
    }

    /// Value of the `deactivated` label.
    pub fn deactivated_label(&self) -> &'static str {
        if self.is_deactivated() {
            "true"
        } else {
            "false"
        }
    }
}

/// One metric from a report, e.g. `{category: "resources", name: "failed", value: 0}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetric {
    pub category: String,
    pub name: String,
    pub value: f64,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_puppetdb_node_with_nulls() {
        let node: Node = serde_json::from_str(
            r#"{
                "certname": "web01.example.com",
                "deactivated": null,
                "expired": null,
                "report_environment": null,
                "report_timestamp": null,
                "latest_report_status": null,
                "latest_report_hash": null,
                "catalog_environment": "production"
            }"#,
        )
        .unwrap();

        assert_eq!(node.certname, "web01.example.com");
        assert_eq!(node.deactivated, None);
        assert_eq!(node.report_timestamp, None);
        assert!(node.report_environment.is_empty());
        assert!(node.latest_report_status.is_empty());
        assert!(node.latest_report_hash.is_empty());
        assert_eq!(node.deactivated_label(), "false");
    }

    #[test]
    fn deactivated_timestamp_marks_node_inactive() {
        let node: Node = serde_json::from_str(
            r#"{
                "certname": "db01",
                "deactivated": "2024-03-01T10:00:00.000Z",
                "report_environment": "production",
                "report_timestamp": "2024-02-28T09:00:00.000Z",
                "latest_report_status": "unchanged",
                "latest_report_hash": "abc123"
            }"#,
        )
        .unwrap();

        assert!(node.is_deactivated());
        assert_eq!(node.deactivated_label(), "true");
        assert_eq!(node.latest_report_hash, "abc123");
    }

    #[test]
    fn decodes_report_metric() {
        let metric: ReportMetric =
            serde_json::from_str(r#"{"category": "time", "name": "total", "value": 12.75}"#)
                .unwrap();
        assert_eq!(metric.category, "time");
        assert_eq!(metric.name, "total");
        assert_eq!(metric.value, 12.75);
    }
}
