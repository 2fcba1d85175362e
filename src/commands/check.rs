//! `puppetdb-exporter check` — run one poll against PuppetDB and print the
//! classification of every node without serving metrics.

use std::fmt::Write as _;

use anyhow::{bail, Result};
use chrono::Utc;
use colored::Colorize;

use crate::config::ExporterConfig;
use crate::domain::classifier::UNREPORTED;
use crate::domain::reconciler::{CycleReport, NodeOutcome, ReconcileSettings, Reconciler};
use crate::inventory::{Inventory, PuppetDbClient};
use crate::metrics::FamilyRegistry;

pub fn run(config: ExporterConfig, format: &str) -> Result<()> {
    if !matches!(format, "table" | "json") {
        bail!("unknown format {:?} (expected table or json)", format);
    }
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async { run_async(config, format).await })
}

async fn run_async(config: ExporterConfig, format: &str) -> Result<()> {
    let client = PuppetDbClient::from_config(&config)?;
    let report = poll(client, &config).await?;
    print!("{}", render(&report, format)?);
    Ok(())
}

/// One cycle without publishing. Fails when the node list itself could not be fetched.
async fn poll<I: Inventory>(inventory: I, config: &ExporterConfig) -> Result<CycleReport> {
    let registry = FamilyRegistry::new(&config.category_set());
    let reconciler = Reconciler::new(inventory, registry, ReconcileSettings::from(config));

    let report = reconciler.collect(Utc::now()).await;
    if report.node_fetch_errors > 0 {
        bail!("could not list nodes from {}", config.puppetdb_url);
    }
    Ok(report)
}

fn render(report: &CycleReport, format: &str) -> Result<String> {
    Ok(match format {
        "json" => format!("{}\n", serde_json::to_string_pretty(&report.nodes)?),
        _ => render_table(report),
    })
}

/// `status` may carry trailing padding.
fn colored_status(status: &str) -> String {
    match status.trim_end() {
        "unchanged" => status.green().to_string(),
        "changed" => status.cyan().to_string(),
        "failed" => status.red().bold().to_string(),
        UNREPORTED => status.yellow().to_string(),
        _ => status.to_string(),
    }
}

fn write_row(out: &mut String, node: &NodeOutcome, width: usize) {
    let c = &node.classification;
    let host = if node.deactivated {
        format!("{:<width$}", format!("{} (deactivated)", node.certname))
            .dimmed()
            .to_string()
    } else {
        format!("{:<width$}", node.certname)
    };
    // Pad before colouring; escape codes would throw the alignment off
    let status = colored_status(&format!("{:<12}", c.status_label));
    let _ = writeln!(
        out,
        "  {}  {}  {:<12}  {}",
        host,
        status,
        node.environment,
        c.reason.dimmed()
    );
}

fn render_table(report: &CycleReport) -> String {
    let mut out = String::new();
    if report.nodes.is_empty() {
        let _ = writeln!(out, "{}", "No nodes returned by PuppetDB".yellow());
        return out;
    }

    let width = report
        .nodes
        .iter()
        .map(|n| n.certname.len() + if n.deactivated { 14 } else { 0 })
        .max()
        .unwrap_or(0);

    let _ = writeln!(out, "{}", "Nodes".bold());
    for node in &report.nodes {
        write_row(&mut out, node, width);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "{}", "Status counts".bold());
    for (status, count) in &report.statuses {
        let _ = writeln!(out, "  {:<12} {}", status, count);
    }

    if report.metric_fetch_errors > 0 {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{} report metrics could not be fetched for {} node(s)",
            "warning:".yellow().bold(),
            report.metric_fetch_errors
        );
    }
    out
}
