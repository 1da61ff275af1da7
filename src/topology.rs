//! Thing-directory topology watcher.
//!
//! Polls the external directory once a minute for the set of series whose
//! primary HDS is this service's source, together with the replica hosts
//! each series targets. Every `(series, replica hosts)` tuple is handed to
//! [`Controller::add_or_update_series`]; the controller does the diffing.
//!
//! Transport or decode errors are logged and the poll is abandoned until
//! the next tick; a half-applied poll is harmless because the controller
//! reconciles incrementally.
//!
//! # Authentication
//!
//! An optional bearer [`TokenSource`] may be attached. On a 401 the token
//! is renewed once and the request retried; a second 401 fails the poll.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::certs::CertDirectory;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::sync::Controller;

/// Poll period for the directory.
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Directory page size.
const PAGE_SIZE: usize = 100;

/// Supplies bearer tokens for the directory.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// The current token.
    async fn obtain(&self) -> Result<String>;

    /// Force-renew after a rejection and return the fresh token.
    async fn renew(&self) -> Result<String>;
}

/// A fixed token from configuration.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn obtain(&self) -> Result<String> {
        Ok(self.0.clone())
    }

    async fn renew(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// One page of thing descriptions.
#[derive(Debug, Deserialize)]
pub struct ThingDescriptionPage {
    #[serde(default)]
    pub items: Vec<ThingDescription>,
    #[serde(default)]
    pub page: usize,
    #[serde(rename = "perPage", default)]
    pub per_page: usize,
    #[serde(default)]
    pub total: usize,
}

/// A directory item; unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct ThingDescription {
    #[serde(default)]
    pub series: Option<String>,
    #[serde(default)]
    pub links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
pub struct Link {
    #[serde(default)]
    pub rel: String,
    #[serde(default)]
    pub href: String,
    #[serde(rename = "caEndpoint", default)]
    pub ca_endpoint: Option<String>,
}

/// Replica targets of one item: `(host, optional CA endpoint)`.
///
/// Only links with `rel == "replica"` count; hrefs that do not parse to a
/// URL with a host are skipped with a warning.
pub fn replica_targets(td: &ThingDescription) -> Vec<(String, Option<String>)> {
    let mut targets = Vec::new();
    for link in &td.links {
        if link.rel != "replica" {
            continue;
        }
        match url::Url::parse(&link.href) {
            Ok(parsed) => match parsed.host_str() {
                Some(host) => {
                    let host = match parsed.port() {
                        Some(port) => format!("{}:{}", host, port),
                        None => host.to_string(),
                    };
                    targets.push((host, link.ca_endpoint.clone()));
                }
                None => warn!(href = %link.href, "Replica link has no host"),
            },
            Err(e) => warn!(href = %link.href, error = %e, "Unparsable replica link"),
        }
    }
    targets
}

/// Polls the directory and feeds the controller.
pub struct TopologyWatcher {
    endpoint: String,
    source_hds: String,
    http: reqwest::Client,
    token: Option<Arc<dyn TokenSource>>,
    certs: Option<Arc<CertDirectory>>,
}

impl TopologyWatcher {
    /// `endpoint` is the directory base URL; the watcher polls
    /// `<endpoint>/td`. `source_hds` is the primary-HDS filter value.
    pub fn new(endpoint: &str, source_hds: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            source_hds: source_hds.to_string(),
            http: reqwest::Client::new(),
            token: None,
            certs: None,
        }
    }

    /// Attach a bearer token source.
    pub fn with_token(mut self, token: Arc<dyn TokenSource>) -> Self {
        self.token = Some(token);
        self
    }

    /// Attach the certificate directory so per-replica CA endpoints from
    /// the directory get registered before the pool dials.
    pub fn with_cert_directory(mut self, certs: Arc<CertDirectory>) -> Self {
        self.certs = Some(certs);
        self
    }

    /// Poll immediately, then every minute until canceled.
    pub async fn run(self, controller: Arc<Controller>, cancel: CancellationToken) {
        info!(endpoint = %self.endpoint, "Topology watcher started");
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once(&controller).await {
                        Ok(applied) => {
                            metrics::record_topology_poll(true);
                            debug!(series = applied, "Topology poll complete");
                        }
                        Err(e) => {
                            metrics::record_topology_poll(false);
                            warn!(error = %e, "Topology poll failed");
                        }
                    }
                }
            }
        }
        info!("Topology watcher stopped");
    }

    /// One full (paged) poll. Returns the number of series applied.
    pub async fn poll_once(&self, controller: &Controller) -> Result<usize> {
        let url = format!("{}/td", self.endpoint);
        let xpath = format!("*[primaryHDS='{}']", self.source_hds);

        let mut applied = 0usize;
        let mut seen = 0usize;
        let mut page = 1usize;

        loop {
            let response = self
                .get_with_auth(&url, &[("xpath", xpath.as_str()), ("page", &page.to_string()), ("perPage", &PAGE_SIZE.to_string())])
                .await?;
            let body: ThingDescriptionPage = response
                .json()
                .await
                .map_err(|e| SyncError::http(&url, format!("decoding page: {}", e)))?;

            let page_len = body.items.len();
            seen += page_len;

            for td in &body.items {
                let Some(series) = td.series.as_deref() else {
                    warn!("Directory item without a series name, skipping");
                    continue;
                };
                let targets = replica_targets(td);
                if let Some(certs) = &self.certs {
                    for (host, ca_endpoint) in &targets {
                        if let Some(ca) = ca_endpoint {
                            certs.register_ca_endpoint(host, ca);
                        }
                    }
                }
                let hosts: Vec<String> = targets.into_iter().map(|(host, _)| host).collect();
                controller.add_or_update_series(series, &hosts).await;
                applied += 1;
            }

            if page_len == 0 || seen >= body.total {
                break;
            }
            page += 1;
        }

        Ok(applied)
    }

    /// GET with optional bearer auth; renews the token once on 401.
    async fn get_with_auth(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response> {
        let mut request = self.http.get(url).query(query);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.obtain().await?);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::http(url, e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            if let Some(token) = &self.token {
                info!("Directory rejected token, renewing once");
                let fresh = token.renew().await?;
                let retry = self
                    .http
                    .get(url)
                    .query(query)
                    .bearer_auth(fresh)
                    .send()
                    .await
                    .map_err(|e| SyncError::http(url, e.to_string()))?;
                if !retry.status().is_success() {
                    return Err(SyncError::http(
                        url,
                        format!("unexpected status {}", retry.status()),
                    ));
                }
                return Ok(retry);
            }
        }

        if !response.status().is_success() {
            return Err(SyncError::http(
                url,
                format!("unexpected status {}", response.status()),
            ));
        }
        Ok(response)
    }
}
