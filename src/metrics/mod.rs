//! Gauge families and the sink they are published to.
//!
//! The [`FamilyRegistry`] is built once at startup from the configured
//! categories and never changes afterwards. Every poll cycle replaces the
//! full observation set of every family, so label combinations that
//! disappeared from PuppetDB disappear from the exposition too.

pub mod prometheus_sink;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use prometheus_sink::PrometheusSink;

pub const STATUS_COUNT_FAMILY: &str = "node_report_status_count";
pub const REPORT_FAMILY: &str = "report";

const STATUS_COUNT_LABELS: &[&str] = &["status"];
const REPORT_LABELS: &[&str] = &["environment", "host", "deactivated", "status", "reason"];
const CATEGORY_LABELS: &[&str] = &["name", "environment", "host", "deactivated", "status", "reason"];

/// Label name → label value. Keys must match the family's label schema.
pub type Labels = BTreeMap<&'static str, String>;

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub labels: Labels,
    pub value: f64,
}

impl Observation {
    pub fn new(labels: Labels, value: f64) -> Self {
        Self { labels, value }
    }
}

/// Registry key of the family holding metrics of one report category.
pub fn category_family(category: &str) -> String {
    format!("report_{category}")
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("gauge family {0:?} is not registered")]
    UnknownFamily(String),
    #[error("gauge family {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("metrics exposition is not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

/// Where a failed inventory request was headed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchEndpoint {
    Nodes,
    ReportMetrics,
}

impl FetchEndpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nodes => "nodes",
            Self::ReportMetrics => "report_metrics",
        }
    }
}

/// Schema of one gauge family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilySpec {
    /// Registry key, e.g. `report_resources`.
    pub key: String,
    pub namespace: &'static str,
    pub help: String,
    pub label_names: &'static [&'static str],
}

impl FamilySpec {
    /// Name as it appears in the exposition, e.g. `puppet_report_resources`.
    pub fn exposed_name(&self) -> String {
        format!("{}_{}", self.namespace, self.key)
    }
}

/// Destination for gauge observations.
///
/// `replace` must look atomic to concurrent readers: either the previous
/// observation set or the new one, never a mix.
pub trait GaugeSink: Send + Sync {
    fn register(&self, family: &FamilySpec) -> Result<(), SinkError>;

    fn reset(&self, family: &str) -> Result<(), SinkError>;

    fn set(&self, family: &str, labels: &Labels, value: f64) -> Result<(), SinkError>;

    fn replace(&self, family: &str, observations: &[Observation]) -> Result<(), SinkError> {
        self.reset(family)?;
        for observation in observations {
            self.set(family, &observation.labels, observation.value)?;
        }
        Ok(())
    }

    fn record_fetch_errors(&self, _endpoint: FetchEndpoint, _count: u64) {}

    fn record_cycle(&self, _started_at: DateTime<Utc>, _elapsed: Duration) {}
}

/// The fixed set of gauge families exported by this process.
#[derive(Debug, Clone)]
pub struct FamilyRegistry {
    families: Vec<FamilySpec>,
    categories: BTreeSet<String>,
}

impl FamilyRegistry {
    pub fn new(categories: &BTreeSet<String>) -> Self {
        let mut families = vec![
            FamilySpec {
                key: STATUS_COUNT_FAMILY.to_string(),
                namespace: "puppetdb",
                help: "Total count of reports status by type".to_string(),
                label_names: STATUS_COUNT_LABELS,
            },
            FamilySpec {
                key: REPORT_FAMILY.to_string(),
                namespace: "puppet",
                help: "Timestamp of latest report".to_string(),
                label_names: REPORT_LABELS,
            },
        ];

        families.extend(categories.iter().map(|category| FamilySpec {
            key: category_family(category),
            namespace: "puppet",
            help: format!("Total count of {category} per status"),
            label_names: CATEGORY_LABELS,
        }));

        Self {
            families,
            categories: categories.clone(),
        }
    }

    pub fn families(&self) -> &[FamilySpec] {
        &self.families
    }

    pub fn categories(&self) -> &BTreeSet<String> {
        &self.categories
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.contains(category)
    }

    pub fn register_all(&self, sink: &dyn GaugeSink) -> Result<(), SinkError> {
        for family in &self.families {
            sink.register(family)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn registry_has_fixed_families_plus_one_per_category() {
        let registry = FamilyRegistry::new(&categories(&["resources", "time"]));
        let keys: Vec<_> = registry.families().iter().map(|f| f.key.as_str()).collect();
        assert_eq!(
            keys,
            ["node_report_status_count", "report", "report_resources", "report_time"]
        );

        let exposed: Vec<_> = registry.families().iter().map(FamilySpec::exposed_name).collect();
        assert_eq!(exposed[0], "puppetdb_node_report_status_count");
        assert_eq!(exposed[1], "puppet_report");
        assert_eq!(exposed[2], "puppet_report_resources");
    }

    #[test]
    fn category_families_carry_name_label() {
        let registry = FamilyRegistry::new(&categories(&["events"]));
        let events = &registry.families()[2];
        assert_eq!(events.label_names[0], "name");
        assert_eq!(events.help, "Total count of events per status");
        assert!(registry.has_category("events"));
        assert!(!registry.has_category("time"));
    }
}
