use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Deserializer, Serialize};

use crate::duration::HumanDuration;

pub const ENV_PREFIX: &str = "PUPPETDB_EXPORTER_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Base URL of the PuppetDB query API, e.g. `https://puppetdb:8081/pdb/query`.
    pub puppetdb_url: String,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ssl_skip_verify: bool,
    pub request_timeout: HumanDuration,
    pub scrape_interval: HumanDuration,
    /// Nodes whose latest report is older than this are unreported.
    pub unreported_threshold: HumanDuration,
    /// Report metric categories exported as `puppet_report_<category>`.
    #[serde(deserialize_with = "deserialize_categories")]
    pub categories: Vec<String>,
    pub listen_address: String,
    pub metrics_path: String,
    /// Log every unreported node with its reason.
    pub verbose: bool,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            puppetdb_url: "https://puppetdb:8081/pdb/query".to_string(),
            ca_file: None,
            cert_file: None,
            key_file: None,
            ssl_skip_verify: false,
            request_timeout: HumanDuration::from_secs(30),
            scrape_interval: HumanDuration::from_secs(60),
            unreported_threshold: HumanDuration::from_secs(2 * 3600),
            categories: ["resources", "time", "changes", "events"]
                .map(String::from)
                .to_vec(),
            listen_address: "0.0.0.0:9635".to_string(),
            metrics_path: "/metrics".to_string(),
            verbose: false,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

/// Command-line overrides; unset flags leave lower layers untouched.
#[derive(Debug, Clone, Default, Serialize, clap::Args)]
pub struct ConfigOverrides {
    /// PuppetDB query API base URL
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub puppetdb_url: Option<String>,

    /// CA bundle used to verify PuppetDB (PEM)
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,

    /// Client certificate (PEM)
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,

    /// Accept invalid PuppetDB certificates
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ssl_skip_verify: bool,

    /// Per-request timeout, e.g. 30s
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<String>,

    /// Time between PuppetDB polls, e.g. 1m
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scrape_interval: Option<String>,

    /// Report age after which a node counts as unreported, e.g. 2h
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unreported_threshold: Option<String>,

    /// Comma-separated report metric categories
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<String>,

    /// HTTP listen address
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<String>,

    /// Path serving the metrics exposition
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_path: Option<String>,

    /// Log unreported nodes with their reason
    #[arg(long, short, global = true)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Log output format (json or pretty)
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<String>,
}

impl ExporterConfig {
    /// `~/.config/puppetdb-exporter/config.yaml`, if a config dir exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("puppetdb-exporter").join("config.yaml"))
    }

    pub fn category_set(&self) -> BTreeSet<String> {
        self.categories.iter().cloned().collect()
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.puppetdb_url.starts_with("http://") || self.puppetdb_url.starts_with("https://")) {
            bail!(
                "puppetdb_url must be an http(s) URL, got {:?}",
                self.puppetdb_url
            );
        }
        if self.scrape_interval.is_zero() {
            bail!("scrape_interval must be greater than zero");
        }
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than zero");
        }
        if !self.metrics_path.starts_with('/') || self.metrics_path == "/health" {
            bail!(
                "metrics_path must start with '/' and not be /health, got {:?}",
                self.metrics_path
            );
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            bail!("cert_file and key_file must be set together");
        }
        for category in &self.categories {
            if !is_valid_category(category) {
                bail!(
                    "category {:?} cannot be used in a metric name (letters, digits and '_' only)",
                    category
                );
            }
        }
        Ok(())
    }
}

fn is_valid_category(category: &str) -> bool {
    let mut chars = category.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Accepts a YAML list or a comma-separated string.
fn deserialize_categories<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Csv(String),
    }

    let items = match Raw::deserialize(deserializer)? {
        Raw::List(items) => items,
        Raw::Csv(csv) => csv.split(',').map(String::from).collect(),
    };

    let mut seen = BTreeSet::new();
    Ok(items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty() && seen.insert(item.clone()))
        .collect())
}

/// Layering: defaults → YAML file → `PUPPETDB_EXPORTER_*` env → CLI flags.
///
/// An explicit `path` must exist; the default path is used only if present.
pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<ExporterConfig> {
    let mut figment = Figment::from(Serialized::defaults(ExporterConfig::default()));

    match path {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }
        None => {
            if let Some(path) = ExporterConfig::default_path().filter(|p| p.exists()) {
                figment = figment.merge(Yaml::file(path));
            }
        }
    }

    let config: ExporterConfig = figment
        .merge(Env::prefixed(ENV_PREFIX))
        .merge(Serialized::defaults(overrides))
        .extract()
        .context("loading exporter configuration")?;

    config.validate()?;
    Ok(config)
}
