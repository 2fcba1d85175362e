//! [`GaugeSink`] backed by the `prometheus` crate.
//!
//! Each family is a custom collector around a `GaugeVec`. `replace` builds a
//! complete new vec off to the side and swaps it in under a write lock, so a
//! scrape sees either the old full set or the new full set.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Gauge, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

use super::{FamilySpec, FetchEndpoint, GaugeSink, Labels, Observation, SinkError};

const SELF_NAMESPACE: &str = "puppetdb_exporter";

#[derive(Clone)]
struct FamilyGauge {
    inner: Arc<FamilyInner>,
}

struct FamilyInner {
    opts: Opts,
    label_names: &'static [&'static str],
    descs: Vec<Desc>,
    current: RwLock<GaugeVec>,
}

fn label_map(labels: &Labels) -> HashMap<&str, &str> {
    labels.iter().map(|(k, v)| (*k, v.as_str())).collect()
}

impl FamilyGauge {
    fn new(spec: &FamilySpec) -> Result<Self, SinkError> {
        let opts = Opts::new(spec.key.clone(), spec.help.clone()).namespace(spec.namespace);
        let vec = GaugeVec::new(opts.clone(), spec.label_names)?;
        let descs = vec.desc().into_iter().cloned().collect();
        Ok(Self {
            inner: Arc::new(FamilyInner {
                opts,
                label_names: spec.label_names,
                descs,
                current: RwLock::new(vec),
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, GaugeVec> {
        self.inner
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn reset(&self) {
        self.read().reset();
    }

    fn set(&self, labels: &Labels, value: f64) -> Result<(), SinkError> {
        self.read().get_metric_with(&label_map(labels))?.set(value);
        Ok(())
    }

    fn replace(&self, observations: &[Observation]) -> Result<(), SinkError> {
        let next = GaugeVec::new(self.inner.opts.clone(), self.inner.label_names)?;
        for observation in observations {
            next.get_metric_with(&label_map(&observation.labels))?
                .set(observation.value);
        }

        *self
            .inner
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next;
        Ok(())
    }
}

impl Collector for FamilyGauge {
    fn desc(&self) -> Vec<&Desc> {
        self.inner.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.read().collect()
    }
}

pub struct PrometheusSink {
    registry: Registry,
    families: RwLock<HashMap<String, FamilyGauge>>,
    fetch_errors: IntCounterVec,
    last_cycle: Gauge,
    cycle_duration: Gauge,
}

impl PrometheusSink {
    pub fn new() -> Result<Self, SinkError> {
        let registry = Registry::new();

        let fetch_errors = IntCounterVec::new(
            Opts::new(
                "fetch_errors_total",
                "Failed PuppetDB requests by endpoint",
            )
            .namespace(SELF_NAMESPACE),
            &["endpoint"],
        )?;
        let last_cycle = Gauge::with_opts(
            Opts::new(
                "last_scrape_timestamp_seconds",
                "Unix time the last PuppetDB poll started",
            )
            .namespace(SELF_NAMESPACE),
        )?;
        let cycle_duration = Gauge::with_opts(
            Opts::new(
                "scrape_duration_seconds",
                "Duration of the last PuppetDB poll",
            )
            .namespace(SELF_NAMESPACE),
        )?;

        registry.register(Box::new(fetch_errors.clone()))?;
        registry.register(Box::new(last_cycle.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;

        // Both endpoints show up as 0 before the first failure.
        for endpoint in [FetchEndpoint::Nodes, FetchEndpoint::ReportMetrics] {
            fetch_errors.with_label_values(&[endpoint.as_str()]);
        }

        Ok(Self {
            registry,
            families: RwLock::new(HashMap::new()),
            fetch_errors,
            last_cycle,
            cycle_duration,
        })
    }

    /// Render every registered metric in the text exposition format.
    pub fn encode(&self) -> Result<String, SinkError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    fn family(&self, key: &str) -> Result<FamilyGauge, SinkError> {
        self.families
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| SinkError::UnknownFamily(key.to_string()))
    }

    /// Current observations of one family as (label map, value), sorted by labels.
    #[cfg(test)]
    pub fn snapshot(
        &self,
        key: &str,
    ) -> Result<Vec<(std::collections::BTreeMap<String, String>, f64)>, SinkError> {
        let mut rows: Vec<_> = self
            .family(key)?
            .collect()
            .iter()
            .flat_map(|mf| mf.get_metric().iter())
            .map(|metric| {
                let labels: std::collections::BTreeMap<String, String> = metric
                    .get_label()
                    .iter()
                    .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
                    .collect();
                (labels, metric.get_gauge().get_value())
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    #[cfg(test)]
    pub fn fetch_error_count(&self, endpoint: FetchEndpoint) -> u64 {
        self.fetch_errors.with_label_values(&[endpoint.as_str()]).get()
    }
}

impl GaugeSink for PrometheusSink {
    fn register(&self, family: &FamilySpec) -> Result<(), SinkError> {
        let mut families = self.families.write().unwrap_or_else(PoisonError::into_inner);
        if families.contains_key(&family.key) {
            return Err(SinkError::AlreadyRegistered(family.key.clone()));
        }
        let gauge = FamilyGauge::new(family)?;
        self.registry.register(Box::new(gauge.clone()))?;
        families.insert(family.key.clone(), gauge);
        Ok(())
    }

    fn reset(&self, family: &str) -> Result<(), SinkError> {
        self.family(family)?.reset();
        Ok(())
    }

    fn set(&self, family: &str, labels: &Labels, value: f64) -> Result<(), SinkError> {
        self.family(family)?.set(labels, value)
    }

    fn replace(&self, family: &str, observations: &[Observation]) -> Result<(), SinkError> {
        self.family(family)?.replace(observations)
    }

    fn record_fetch_errors(&self, endpoint: FetchEndpoint, count: u64) {
        self.fetch_errors
            .with_label_values(&[endpoint.as_str()])
            .inc_by(count);
    }

    fn record_cycle(&self, started_at: DateTime<Utc>, elapsed: Duration) {
        self.last_cycle.set(started_at.timestamp() as f64);
        self.cycle_duration.set(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::metrics::{FamilyRegistry, REPORT_FAMILY, STATUS_COUNT_FAMILY};

    fn sink_with(categories: &[&str]) -> PrometheusSink {
        let categories: BTreeSet<String> = categories.iter().map(|s| s.to_string()).collect();
        let sink = PrometheusSink::new().unwrap();
        FamilyRegistry::new(&categories).register_all(&sink).unwrap();
        sink
    }

    fn status(value: &str) -> Labels {
        Labels::from([("status", value.to_string())])
    }

    #[test]
    fn replace_drops_previous_label_sets() {
        let sink = sink_with(&[]);
        sink.replace(
            STATUS_COUNT_FAMILY,
            &[
                Observation::new(status("changed"), 3.0),
                Observation::new(status("failed"), 1.0),
            ],
        )
        .unwrap();
        sink.replace(STATUS_COUNT_FAMILY, &[Observation::new(status("unchanged"), 5.0)])
            .unwrap();

        let rows = sink.snapshot(STATUS_COUNT_FAMILY).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0["status"], "unchanged");
        assert_eq!(rows[0].1, 5.0);
    }

    #[test]
    fn reset_then_set_matches_replace() {
        let sink = sink_with(&[]);
        sink.set(STATUS_COUNT_FAMILY, &status("changed"), 2.0).unwrap();
        sink.reset(STATUS_COUNT_FAMILY).unwrap();
        assert!(sink.snapshot(STATUS_COUNT_FAMILY).unwrap().is_empty());

        sink.set(STATUS_COUNT_FAMILY, &status("failed"), 4.0).unwrap();
        let rows = sink.snapshot(STATUS_COUNT_FAMILY).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, 4.0);
    }

    #[test]
    fn replace_with_wrong_labels_keeps_previous_set() {
        let sink = sink_with(&[]);
        sink.set(STATUS_COUNT_FAMILY, &status("changed"), 2.0).unwrap();

        let bad = Labels::from([("host", "web01".to_string())]);
        assert!(sink
            .replace(STATUS_COUNT_FAMILY, &[Observation::new(bad, 1.0)])
            .is_err());
        assert_eq!(sink.snapshot(STATUS_COUNT_FAMILY).unwrap().len(), 1);
    }

    #[test]
    fn unknown_and_duplicate_families_are_rejected() {
        let sink = sink_with(&["time"]);
        assert!(matches!(
            sink.reset("report_resources"),
            Err(SinkError::UnknownFamily(_))
        ));
        let again = FamilyRegistry::new(&BTreeSet::new());
        assert!(matches!(
            again.register_all(&sink),
            Err(SinkError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn encodes_namespaced_families_and_self_metrics() {
        let sink = sink_with(&["resources"]);
        let labels = Labels::from([
            ("environment", "production".to_string()),
            ("host", "web01".to_string()),
            ("deactivated", "false".to_string()),
            ("status", "changed".to_string()),
            ("reason", String::new()),
        ]);
        sink.set(REPORT_FAMILY, &labels, 1_714_564_800.0).unwrap();
        sink.record_fetch_errors(FetchEndpoint::Nodes, 2);

        let text = sink.encode().unwrap();
        assert!(text.contains("# TYPE puppet_report gauge"));
        assert!(text.contains("host=\"web01\""));
        assert!(text.contains("puppetdb_exporter_fetch_errors_total{endpoint=\"nodes\"} 2"));
        assert!(text.contains("puppetdb_exporter_fetch_errors_total{endpoint=\"report_metrics\"} 0"));
        assert_eq!(sink.fetch_error_count(FetchEndpoint::Nodes), 2);
    }
}
