//! Typed HTTP client for the PuppetDB v4 query API.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Certificate, Client, Identity};
use tracing::warn;

use crate::config::ExporterConfig;
use crate::domain::node::{Node, ReportMetric};

use super::Inventory;

/// TLS material for talking to PuppetDB over HTTPS.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub skip_verify: bool,
}

impl From<&ExporterConfig> for TlsOptions {
    fn from(config: &ExporterConfig) -> Self {
        Self {
            ca_file: config.ca_file.clone(),
            cert_file: config.cert_file.clone(),
            key_file: config.key_file.clone(),
            skip_verify: config.ssl_skip_verify,
        }
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

pub struct PuppetDbClient {
    base_url: String,
    http: Client,
}

impl PuppetDbClient {
    pub fn new(base_url: &str, tls: &TlsOptions, timeout: Duration) -> Result<Self> {
        let mut builder = Client::builder().timeout(timeout);

        if let Some(ca_file) = &tls.ca_file {
            let ca = Certificate::from_pem(&read_pem(ca_file)?)
                .with_context(|| format!("parsing CA certificate {}", ca_file.display()))?;
            builder = builder.add_root_certificate(ca);
        }

        match (&tls.cert_file, &tls.key_file) {
            (Some(cert_file), Some(key_file)) => {
                let mut pem = read_pem(cert_file)?;
                pem.push(b'\n');
                pem.extend(read_pem(key_file)?);
                let identity = Identity::from_pem(&pem).with_context(|| {
                    format!(
                        "loading client certificate {} with key {}",
                        cert_file.display(),
                        key_file.display()
                    )
                })?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => bail!("client certificate and key must be configured together"),
        }

        if tls.skip_verify {
            warn!("PuppetDB certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder.build().context("building HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn from_config(config: &ExporterConfig) -> Result<Self> {
        Self::new(
            &config.puppetdb_url,
            &TlsOptions::from(config),
            config.request_timeout.as_std(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn nodes(&self) -> Result<Vec<Node>> {
        self.get("/v4/nodes").await
    }

    pub async fn report_metrics(&self, report_hash: &str) -> Result<Vec<ReportMetric>> {
        self.get(&format!("/v4/reports/{report_hash}/metrics")).await
    }

    // ── Internal helpers ───────────────────────────────────

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;

        if !resp.status().is_success() {
            bail!("{} returned {}", url, resp.status());
        }

        resp.json()
            .await
            .with_context(|| format!("parsing response from {}", url))
    }
}

impl Inventory for PuppetDbClient {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.nodes().await
    }

    async fn list_report_metrics(&self, report_hash: &str) -> Result<Vec<ReportMetric>> {
        self.report_metrics(report_hash).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path as UrlPath;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/pdb/query/")
    }

    fn client(base_url: &str) -> PuppetDbClient {
        PuppetDbClient::new(base_url, &TlsOptions::default(), Duration::from_secs(5)).unwrap()
    }

    async fn nodes() -> Json<Value> {
        Json(json!([
            {
                "certname": "web01.example.com",
                "deactivated": null,
                "report_environment": "production",
                "report_timestamp": "2024-05-01T11:30:00.512Z",
                "latest_report_status": "changed",
                "latest_report_hash": "h1"
            },
            {
                "certname": "new01.example.com",
                "deactivated": null,
                "report_environment": null,
                "report_timestamp": null,
                "latest_report_status": null,
                "latest_report_hash": null
            }
        ]))
    }

    async fn metrics(UrlPath(hash): UrlPath<String>) -> Result<Json<Value>, StatusCode> {
        match hash.as_str() {
            "h1" => Ok(Json(json!([
                {"category": "resources", "name": "changed", "value": 3},
                {"category": "time", "name": "total", "value": 4.25}
            ]))),
            _ => Err(StatusCode::NOT_FOUND),
        }
    }

    fn puppetdb() -> Router {
        Router::new()
            .route("/pdb/query/v4/nodes", get(nodes))
            .route("/pdb/query/v4/reports/{hash}/metrics", get(metrics))
    }

    #[tokio::test]
    async fn lists_nodes() {
        let client = client(&serve(puppetdb()).await);
        assert!(!client.base_url().ends_with('/'));

        let nodes = client.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].certname, "web01.example.com");
        assert_eq!(nodes[0].latest_report_hash, "h1");
        assert_eq!(nodes[1].report_timestamp, None);
        assert!(nodes[1].latest_report_hash.is_empty());
    }

    #[tokio::test]
    async fn lists_report_metrics() {
        let client = client(&serve(puppetdb()).await);
        let metrics = client.list_report_metrics("h1").await.unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].category, "resources");
        assert_eq!(metrics[0].value, 3.0);
        assert_eq!(metrics[1].value, 4.25);
    }

    #[tokio::test]
    async fn error_status_is_reported_with_url() {
        let client = client(&serve(puppetdb()).await);
        let err = client.list_report_metrics("missing").await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("/v4/reports/missing/metrics"), "{message}");
        assert!(message.contains("404"), "{message}");
    }

    #[tokio::test]
    async fn undecodable_body_is_an_error() {
        let router = Router::new().route("/pdb/query/v4/nodes", get(|| async { "not json" }));
        let client = client(&serve(router).await);
        let err = client.list_nodes().await.unwrap_err();
        assert!(format!("{err:#}").contains("parsing response"));
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = client(&format!("http://{addr}/pdb/query"));
        assert!(client.list_nodes().await.is_err());
    }

    #[test]
    fn certificate_without_key_is_rejected() {
        let tls = TlsOptions {
            cert_file: Some(PathBuf::from("/etc/puppetlabs/puppet/ssl/certs/exporter.pem")),
            ..Default::default()
        };
        let err = PuppetDbClient::new("https://puppetdb:8081/pdb/query", &tls, Duration::from_secs(5))
            .err()
            .unwrap();
        assert!(err.to_string().contains("together"));
    }

    #[test]
    fn missing_ca_file_is_reported() {
        let tls = TlsOptions {
            ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        let err = PuppetDbClient::new("https://puppetdb:8081/pdb/query", &tls, Duration::from_secs(5))
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("/nonexistent/ca.pem"));
    }
}
