//! Connection pooling for HDS endpoints.
//!
//! One [`TimeSeriesClient`] is interned per destination host and shared by
//! every series that replicates to it. Dials are **single-flight**:
//! concurrent [`ConnectionPool::get_or_connect`] calls for the same host
//! produce the same client instance, and only one dial runs at a time for
//! a given host. A failed dial leaves no residue, so the next topology
//! round simply tries again; the pool itself never retries.
//!
//! Dialing is abstracted behind the [`Connector`] trait so the pool (and
//! everything above it) can be tested without a network. The production
//! [`GrpcConnector`] builds mTLS credentials from the certificate provider,
//! with the TLS server name taken from the bare hostname of `host[:port]`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};
use tracing::{debug, info};

use crate::certs::CertificateProvider;
use crate::client::TimeSeriesClient;
use crate::error::Result;
use crate::grpc::GrpcTimeSeriesClient;

/// Extract the bare hostname from `host[:port]`.
///
/// Bracketed IPv6 literals keep their address without brackets or port.
pub fn bare_host(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match host.rsplit_once(':') {
        // A second colon means an unbracketed IPv6 literal; leave it whole.
        Some((name, _port)) if !name.contains(':') => name,
        _ => host,
    }
}

/// Dials one host into a ready client.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Arc<dyn TimeSeriesClient>>;
}

/// Production connector: mTLS gRPC channels.
pub struct GrpcConnector {
    provider: Arc<dyn CertificateProvider>,
}

impl GrpcConnector {
    pub fn new(provider: Arc<dyn CertificateProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl Connector for GrpcConnector {
    async fn connect(&self, host: &str) -> Result<Arc<dyn TimeSeriesClient>> {
        let creds = self.provider.credentials_for(host).await?;
        let tls = ClientTlsConfig::new()
            .domain_name(bare_host(host))
            .ca_certificate(Certificate::from_pem(&creds.ca_pem))
            .identity(Identity::from_pem(&creds.cert_pem, &creds.key_pem));

        let client = GrpcTimeSeriesClient::connect(host, tls).await?;
        Ok(Arc::new(client))
    }
}

/// Host-interned client pool.
pub struct ConnectionPool {
    /// One cell per host; the cell guarantees single-flight initialization.
    clients: DashMap<String, Arc<OnceCell<Arc<dyn TimeSeriesClient>>>>,
    connector: Arc<dyn Connector>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            clients: DashMap::new(),
            connector,
        }
    }

    /// Get the client for a host, dialing on first use.
    ///
    /// Concurrent callers for the same host wait on one dial and receive
    /// the same instance. Errors are surfaced to the caller and nothing is
    /// cached, so a later call dials afresh.
    pub async fn get_or_connect(&self, host: &str) -> Result<Arc<dyn TimeSeriesClient>> {
        let cell = self
            .clients
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let connector = Arc::clone(&self.connector);
        let client = cell
            .get_or_try_init(|| async {
                debug!(host = %host, "Dialing");
                let client = connector.connect(host).await?;
                info!(host = %host, "Connected");
                Ok::<_, crate::error::SyncError>(client)
            })
            .await?;
        Ok(Arc::clone(client))
    }

    /// Get an already-connected client without dialing.
    pub fn get(&self, host: &str) -> Option<Arc<dyn TimeSeriesClient>> {
        self.clients
            .get(host)
            .and_then(|cell| cell.get().cloned())
    }

    /// Number of hosts with an established client.
    pub fn connected_count(&self) -> usize {
        self.clients
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    /// Tear down every client. Handles held by synchronizers die with
    /// their cancellation tokens; the pool just drops its references.
    pub fn close(&self) {
        let count = self.clients.len();
        self.clients.clear();
        if count > 0 {
            info!(hosts = count, "Connection pool closed");
        }
    }
}
