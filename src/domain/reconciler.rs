//! Reconciler — turns PuppetDB state into gauge observations.
//!
//! One cycle runs the pipeline:
//!   list nodes → classify → fetch report metrics → aggregate → publish
//!
//! `collect()` only reads from the inventory. `publish()` replaces every
//! registered family in the sink, including families that received no
//! observations this cycle, so stale label sets never survive a poll.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::ExporterConfig;
use crate::duration::HumanDuration;
use crate::inventory::Inventory;
use crate::metrics::{
    category_family, FamilyRegistry, FetchEndpoint, GaugeSink, Labels, Observation, REPORT_FAMILY,
    STATUS_COUNT_FAMILY,
};

use super::classifier::{classify, Classification, UNREPORTED};
use super::node::{Node, ReportMetric};

/// Target of the per-node lines written in verbose mode.
pub const UNREPORTED_LOG_TARGET: &str = "puppetdb_exporter::unreported";

#[derive(Debug, Clone, Copy)]
pub struct ReconcileSettings {
    pub interval: Duration,
    pub threshold: HumanDuration,
    pub verbose: bool,
}

impl From<&ExporterConfig> for ReconcileSettings {
    fn from(config: &ExporterConfig) -> Self {
        Self {
            interval: config.scrape_interval.as_std(),
            threshold: config.unreported_threshold,
            verbose: config.verbose,
        }
    }
}

/// Per-node result of one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    pub certname: String,
    pub environment: String,
    pub deactivated: bool,
    #[serde(flatten)]
    pub classification: Classification,
    /// Report metrics emitted for configured categories.
    pub metrics: usize,
}

/// Everything one cycle gathered, ready to publish.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub nodes: Vec<NodeOutcome>,
    /// Tally keyed by status label. Unreported nodes land in `unreported`
    /// twice: once through their label, once through the unreported flag.
    pub statuses: BTreeMap<String, u64>,
    /// Observations per family key; every registered family is present.
    pub families: BTreeMap<String, Vec<Observation>>,
    pub node_fetch_errors: u64,
    pub metric_fetch_errors: u64,
}

impl CycleReport {
    fn empty(registry: &FamilyRegistry) -> Self {
        Self {
            families: registry
                .families()
                .iter()
                .map(|family| (family.key.clone(), Vec::new()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn unreported_nodes(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.classification.unreported)
            .count()
    }

    fn push(&mut self, family: String, observation: Observation) {
        self.families.entry(family).or_default().push(observation);
    }
}

/// Metric name as shown in the `name` label: whitespace collapsed, each word
/// capitalised, underscores turned into spaces (`out_of_sync` → `Out of sync`).
pub fn display_metric_name(raw: &str) -> String {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut titled = String::with_capacity(normalized.len());
    let mut at_word_start = true;
    for c in normalized.chars() {
        if at_word_start {
            titled.extend(c.to_uppercase());
        } else {
            titled.push(c);
        }
        at_word_start = is_word_separator(c);
    }
    titled.replace('_', " ")
}

/// Underscores join words; letters and digits never separate them.
fn is_word_separator(c: char) -> bool {
    if c.is_ascii() {
        !(c.is_ascii_alphanumeric() || c == '_')
    } else if c.is_alphanumeric() {
        false
    } else {
        c.is_whitespace()
    }
}

fn node_labels(node: &Node, classification: &Classification) -> Labels {
    Labels::from([
        ("environment", node.report_environment.clone()),
        ("host", node.certname.clone()),
        ("deactivated", node.deactivated_label().to_string()),
        ("status", classification.status_label.clone()),
        ("reason", classification.reason.clone()),
    ])
}

pub struct Reconciler<I> {
    inventory: I,
    registry: FamilyRegistry,
    settings: ReconcileSettings,
}

impl<I: Inventory> Reconciler<I> {
    pub fn new(inventory: I, registry: FamilyRegistry, settings: ReconcileSettings) -> Self {
        Self {
            inventory,
            registry,
            settings,
        }
    }

    /// Fetch and aggregate one cycle. Fetch failures are logged and counted;
    /// they never abort the cycle.
    pub async fn collect(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::empty(&self.registry);

        let nodes = match self.inventory.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %format!("{e:#}"), "failed to list nodes");
                report.node_fetch_errors += 1;
                Vec::new()
            }
        };

        for node in &nodes {
            self.observe_node(node, now, &mut report).await;
        }

        let status_counts = report
            .statuses
            .iter()
            .map(|(status, count)| {
                Observation::new(Labels::from([("status", status.clone())]), *count as f64)
            })
            .collect();
        report
            .families
            .insert(STATUS_COUNT_FAMILY.to_string(), status_counts);

        report
    }

    async fn observe_node(&self, node: &Node, now: DateTime<Utc>, report: &mut CycleReport) {
        let classification = classify(node, self.settings.threshold, now);

        if self.settings.verbose && classification.unreported {
            info!(
                target: UNREPORTED_LOG_TARGET,
                node = %node.certname,
                reason = %classification.reason,
                "node unreported"
            );
        }

        *report
            .statuses
            .entry(classification.status_label.clone())
            .or_default() += 1;
        if classification.unreported {
            *report.statuses.entry(UNREPORTED.to_string()).or_default() += 1;
        }

        let labels = node_labels(node, &classification);
        report.push(
            REPORT_FAMILY.to_string(),
            Observation::new(labels.clone(), classification.report_epoch_secs()),
        );

        let mut emitted = 0;
        if !node.latest_report_hash.is_empty() {
            match self
                .inventory
                .list_report_metrics(&node.latest_report_hash)
                .await
            {
                Ok(metrics) => {
                    for metric in metrics {
                        if let Some((family, observation)) = self.metric_observation(&labels, metric) {
                            report.push(family, observation);
                            emitted += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        node = %node.certname,
                        report_hash = %node.latest_report_hash,
                        error = %format!("{e:#}"),
                        "failed to fetch report metrics"
                    );
                    report.metric_fetch_errors += 1;
                }
            }
        }

        report.nodes.push(NodeOutcome {
            certname: node.certname.clone(),
            environment: node.report_environment.clone(),
            deactivated: node.is_deactivated(),
            classification,
            metrics: emitted,
        });
    }

    /// `None` for categories that are not configured.
    fn metric_observation(
        &self,
        base: &Labels,
        metric: ReportMetric,
    ) -> Option<(String, Observation)> {
        if !self.registry.has_category(&metric.category) {
            return None;
        }
        let mut labels = base.clone();
        labels.insert("name", display_metric_name(&metric.name));
        Some((
            category_family(&metric.category),
            Observation::new(labels, metric.value),
        ))
    }

    /// Collect one cycle and publish it.
    pub async fn run_cycle<S: GaugeSink + ?Sized>(&self, sink: &S, now: DateTime<Utc>) -> CycleReport {
        let started = Instant::now();
        let report = self.collect(now).await;
        publish(sink, &report);
        let elapsed = started.elapsed();
        sink.record_cycle(now, elapsed);

        info!(
            nodes = report.nodes.len(),
            unreported = report.unreported_nodes(),
            node_fetch_errors = report.node_fetch_errors,
            metric_fetch_errors = report.metric_fetch_errors,
            elapsed_ms = elapsed.as_millis() as u64,
            "reconciliation cycle completed"
        );
        report
    }

    /// Poll forever: run a cycle, then sleep for the configured interval.
    pub async fn run<S: GaugeSink + ?Sized>(self, sink: Arc<S>) {
        info!(
            interval = %HumanDuration::from(self.settings.interval),
            unreported_threshold = %self.settings.threshold,
            categories = ?self.registry.categories(),
            "starting reconciliation loop"
        );

        loop {
            self.run_cycle(sink.as_ref(), Utc::now()).await;
            tokio::time::sleep(self.settings.interval).await;
        }
    }
}

/// Replace every family's observation set and record fetch failures.
/// A family that fails to publish keeps its previous set; the rest proceed.
pub fn publish<S: GaugeSink + ?Sized>(sink: &S, report: &CycleReport) {
    for (family, observations) in &report.families {
        if let Err(e) = sink.replace(family, observations) {
            error!(family = %family, error = %e, "failed to publish gauge family");
        }
    }

    if report.node_fetch_errors > 0 {
        sink.record_fetch_errors(FetchEndpoint::Nodes, report.node_fetch_errors);
    }
    if report.metric_fetch_errors > 0 {
        sink.record_fetch_errors(FetchEndpoint::ReportMetrics, report.metric_fetch_errors);
    }
}
