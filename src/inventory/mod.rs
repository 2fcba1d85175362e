//! Inventory service access.

pub mod puppetdb;

use std::future::Future;

use anyhow::Result;

use crate::domain::node::{Node, ReportMetric};

pub use puppetdb::PuppetDbClient;

/// Read-only view of the inventory service used by the reconciliation loop.
pub trait Inventory: Send + Sync {
    fn list_nodes(&self) -> impl Future<Output = Result<Vec<Node>>> + Send;

    fn list_report_metrics(
        &self,
        report_hash: &str,
    ) -> impl Future<Output = Result<Vec<ReportMetric>>> + Send;
}
