//! Client certificate provisioning.
//!
//! Every HDS connection is mTLS; this module supplies the client
//! certificate, private key, and CA trust anchors the connection pool
//! dials with. Two strategies:
//!
//! - **Static** ([`StaticCertProvider`]): all three PEMs are loaded from
//!   the filesystem at boot. Missing files are fatal.
//! - **Dynamic** ([`CertDirectory`]): the private key is loaded, or
//!   freshly generated and written `0600`, and a CSR built from the
//!   configured subject is POSTed as `application/x-pem-file` to the
//!   per-host CA endpoint. Issued certificates are cached in a persistent
//!   [`Store`] keyed by the target URL; only a `NotFound` from the store
//!   permits enrolment, any other store error aborts for that host.

mod store;

pub use store::{store_key, SqliteCertStore, Store};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::{CertData, TlsConfig};
use crate::error::{Result, SyncError};

/// The PEM material a connection dials with.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    /// CA trust anchors.
    pub ca_pem: String,
    /// Client certificate.
    pub cert_pem: String,
    /// Client private key.
    pub key_pem: String,
}

/// Supplies mTLS material to the connection pool.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Credentials for dialing `host[:port]`.
    async fn credentials_for(&self, host: &str) -> Result<ClientCredentials>;
}

fn read_pem(path: &str, what: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("cannot read {} file '{}': {}", what, path, e)))
}

/// Static provider: one fixed credential set from disk.
#[derive(Debug)]
pub struct StaticCertProvider {
    credentials: ClientCredentials,
}

impl StaticCertProvider {
    pub fn from_files(tls: &TlsConfig) -> Result<Self> {
        Ok(Self {
            credentials: ClientCredentials {
                ca_pem: read_pem(&tls.ca, "CA")?,
                cert_pem: read_pem(&tls.cert, "certificate")?,
                key_pem: read_pem(&tls.key, "private key")?,
            },
        })
    }
}

#[async_trait]
impl CertificateProvider for StaticCertProvider {
    async fn credentials_for(&self, _host: &str) -> Result<ClientCredentials> {
        Ok(self.credentials.clone())
    }
}

/// Dynamic provider: per-host certificates issued by each replica's CA.
pub struct CertDirectory {
    ca_pem: String,
    key_pem: String,
    cert_data: CertData,
    store: Arc<dyn Store>,
    /// CA enrolment endpoint per host, registered from the topology feed.
    ca_endpoints: DashMap<String, String>,
    http: reqwest::Client,
}

impl CertDirectory {
    /// Build the directory: load the CA pool and load-or-generate the key.
    pub fn new(tls: &TlsConfig, store: Arc<dyn Store>) -> Result<Self> {
        let ca_pem = read_pem(&tls.ca, "CA")?;

        let key_pem = if Path::new(&tls.key).exists() {
            let pem = read_pem(&tls.key, "private key")?;
            // Validate eagerly so a corrupt key fails at boot, not mid-enrolment.
            rcgen::KeyPair::from_pem(&pem)
                .map_err(|e| SyncError::Config(format!("invalid private key '{}': {}", tls.key, e)))?;
            pem
        } else {
            let key = rcgen::KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
                .map_err(|e| SyncError::Internal(format!("key generation: {}", e)))?;
            let pem = key.serialize_pem();
            write_key_file(&tls.key, &pem)?;
            info!(path = %tls.key, "Generated new private key");
            pem
        };

        Ok(Self {
            ca_pem,
            key_pem,
            cert_data: tls.cert_data.clone(),
            store,
            ca_endpoints: DashMap::new(),
            http: reqwest::Client::new(),
        })
    }

    /// Remember which CA endpoint issues certificates for a host.
    pub fn register_ca_endpoint(&self, host: &str, endpoint: &str) {
        self.ca_endpoints
            .insert(host.to_string(), endpoint.to_string());
    }

    /// Request a certificate for `target_url` from `ca_endpoint` and cache it.
    async fn enroll(&self, target_url: &str, ca_endpoint: &str) -> Result<String> {
        let csr = make_csr(&self.cert_data, &self.key_pem)?;

        let response = self
            .http
            .post(ca_endpoint)
            .header("Content-Type", "application/x-pem-file")
            .body(csr)
            .send()
            .await
            .map_err(|e| SyncError::http(ca_endpoint, e.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::http(
                ca_endpoint,
                format!("unexpected status {}", response.status()),
            ));
        }

        let cert_pem = response
            .text()
            .await
            .map_err(|e| SyncError::http(ca_endpoint, e.to_string()))?;
        if !cert_pem.contains("-----BEGIN CERTIFICATE-----") {
            return Err(SyncError::http(ca_endpoint, "response is not a PEM certificate"));
        }

        self.store.add(target_url, &cert_pem).await?;
        info!(url = %target_url, ca = %ca_endpoint, "Enrolled certificate");
        Ok(cert_pem)
    }
}

#[async_trait]
impl CertificateProvider for CertDirectory {
    async fn credentials_for(&self, host: &str) -> Result<ClientCredentials> {
        let target_url = format!("https://{}", host);

        let cert_pem = match self.store.fetch(&target_url).await {
            Ok(pem) => {
                debug!(host = %host, "Using stored certificate");
                pem
            }
            Err(SyncError::NotFound(_)) => {
                let ca_endpoint = self
                    .ca_endpoints
                    .get(host)
                    .map(|e| e.value().clone())
                    .ok_or_else(|| {
                        SyncError::Config(format!("no CA endpoint registered for {}", host))
                    })?;
                self.enroll(&target_url, &ca_endpoint).await?
            }
            Err(e) => return Err(e),
        };

        Ok(ClientCredentials {
            ca_pem: self.ca_pem.clone(),
            cert_pem,
            key_pem: self.key_pem.clone(),
        })
    }
}

fn write_key_file(path: &str, pem: &str) -> Result<()> {
    std::fs::write(path, pem)
        .map_err(|e| SyncError::Config(format!("cannot write private key '{}': {}", path, e)))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| SyncError::Config(format!("cannot set key permissions: {}", e)))?;
    }
    Ok(())
}

/// Build a PEM CSR from the configured subject and the client key.
fn make_csr(data: &CertData, key_pem: &str) -> Result<String> {
    let key_pair = rcgen::KeyPair::from_pem(key_pem)
        .map_err(|e| SyncError::Internal(format!("parsing private key: {}", e)))?;

    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CountryName, data.country.clone());
    dn.push(rcgen::DnType::StateOrProvinceName, data.province.clone());
    dn.push(rcgen::DnType::LocalityName, data.locality.clone());
    dn.push(rcgen::DnType::OrganizationName, data.organization.clone());
    dn.push(
        rcgen::DnType::OrganizationalUnitName,
        data.organizational_unit.clone(),
    );
    dn.push(rcgen::DnType::CommonName, data.common_name.clone());

    let mut san = Vec::new();
    for name in data.dns_names.split(',') {
        let name = name.trim();
        if !name.is_empty() {
            san.push(rcgen::SanType::DnsName(name.to_string()));
        }
    }
    for ip in data.ip_addresses.split(',') {
        let ip = ip.trim();
        if ip.is_empty() {
            continue;
        }
        let parsed: std::net::IpAddr = ip
            .parse()
            .map_err(|e| SyncError::Config(format!("invalid IP address '{}': {}", ip, e)))?;
        san.push(rcgen::SanType::IpAddress(parsed));
    }

    let mut params = rcgen::CertificateParams::default();
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
    params.distinguished_name = dn;
    params.subject_alt_names = san;
    params.key_pair = Some(key_pair);

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| SyncError::Internal(format!("building csr: {}", e)))?;
    cert.serialize_request_pem()
        .map_err(|e| SyncError::Internal(format!("serializing csr: {}", e)))
}
