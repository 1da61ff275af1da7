//! Configuration for the synchronization service.
//!
//! Loaded from a JSON file and overridable through `SYNC_`-prefixed
//! environment variables. Validation runs once at boot and is fatal:
//! a service with a broken endpoint or missing certificate files has
//! nothing useful to do.
//!
//! # Modes
//!
//! Exactly one of `destination` and `tdd` must be set:
//!
//! - **Fixed destination**: every series in the source registry is
//!   mirrored to one destination HDS. TLS material is static
//!   (`tls.ca`/`tls.key`/`tls.cert` files).
//! - **Directory-driven**: the thing directory enumerates which series go
//!   to which replica hosts. Certificates are issued per replica via each
//!   host's CA endpoint and cached in the certificate store.
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "hds": "https://hds-a:8088",
//!   "tdd": { "endpoint": "https://tdd:8081" },
//!   "syncInterval": "0",
//!   "tls": {
//!     "ca": "certs/ca.pem",
//!     "key": "certs/key.pem",
//!     "cert": "certs/cert.pem",
//!     "certData": {
//!       "country": "DE", "province": "NRW", "locality": "Sankt Augustin",
//!       "organization": "Example", "organizationalUnit": "IoT",
//!       "commonName": "sync-client",
//!       "dnsNames": "sync.local", "ipAddresses": "127.0.0.1"
//!     }
//!   },
//!   "certStore": { "dsn": "certs.db", "type": "sqlite" }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SyncError};

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// URL of the source HDS.
    pub hds: String,

    /// URL of the fixed destination HDS (fixed-destination mode).
    pub destination: Option<String>,

    /// Thing-directory settings (directory-driven mode).
    pub tdd: Option<TddConfig>,

    /// Synchronization interval as a duration string. `"0"` means
    /// continuous (live subscription); anything else enables periodic
    /// pull-only sync.
    pub sync_interval: String,

    /// TLS material and CSR subject.
    pub tls: TlsConfig,

    /// Persistent certificate store (directory-driven mode).
    pub cert_store: Option<CertStoreConfig>,
}

/// Thing-directory polling settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TddConfig {
    /// Directory base URL; the watcher polls `<endpoint>/td`.
    pub endpoint: String,

    /// Optional static bearer token for the directory.
    pub token: Option<String>,
}

/// TLS file paths plus the CSR subject for dynamic enrolment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsConfig {
    /// CA certificate file (PEM).
    pub ca: String,
    /// Client private key file (PEM). Generated if absent in
    /// directory-driven mode.
    pub key: String,
    /// Client certificate file (PEM); fixed-destination mode only.
    pub cert: String,
    /// CA enrolment endpoint of the source HDS (directory-driven mode);
    /// replica CA endpoints come from the directory instead.
    pub source_hds_ca: Option<String>,
    /// CSR subject for dynamic enrolment.
    pub cert_data: CertData,
}

/// Subject fields for certificate signing requests.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CertData {
    pub country: String,
    pub province: String,
    pub locality: String,
    pub organization: String,
    pub organizational_unit: String,
    pub common_name: String,
    /// Comma-separated DNS SANs.
    pub dns_names: String,
    /// Comma-separated IP SANs.
    pub ip_addresses: String,
}

/// Persistent certificate store settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CertStoreConfig {
    /// Filesystem path of the store database.
    pub dsn: String,
    /// Backend type; only `sqlite` is supported.
    #[serde(rename = "type")]
    pub store_type: String,
}

impl SyncConfig {
    /// Load from a JSON file, apply `SYNC_` environment overrides, and
    /// validate. Any failure here is fatal at boot.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SyncError::Config(format!(
                "cannot read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut config: SyncConfig = serde_json::from_str(&raw)
            .map_err(|e| SyncError::Config(format!("malformed config: {}", e)))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Override loaded values from `SYNC_`-prefixed environment variables.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SYNC_HDS") {
            self.hds = v;
        }
        if let Ok(v) = std::env::var("SYNC_DESTINATION") {
            self.destination = Some(v);
        }
        if let Ok(v) = std::env::var("SYNC_TDD_ENDPOINT") {
            self.tdd.get_or_insert_with(TddConfig::default).endpoint = v;
        }
        if let Ok(v) = std::env::var("SYNC_SYNC_INTERVAL") {
            self.sync_interval = v;
        }
        if let Ok(v) = std::env::var("SYNC_TLS_CA") {
            self.tls.ca = v;
        }
        if let Ok(v) = std::env::var("SYNC_TLS_KEY") {
            self.tls.key = v;
        }
        if let Ok(v) = std::env::var("SYNC_TLS_CERT") {
            self.tls.cert = v;
        }
        if let Ok(v) = std::env::var("SYNC_CERT_STORE_DSN") {
            self.cert_store
                .get_or_insert_with(CertStoreConfig::default)
                .dsn = v;
        }
    }

    /// Validate endpoints, mode exclusivity, interval syntax, and file
    /// presence.
    pub fn validate(&self) -> Result<()> {
        if self.hds.is_empty() {
            return Err(SyncError::Config("source HDS endpoint must be defined".into()));
        }
        let hds_url = Url::parse(&self.hds)
            .map_err(|e| SyncError::Config(format!("HDS endpoint is not a valid URL: {}", e)))?;
        if hds_url.host_str().is_none() {
            return Err(SyncError::Config(
                "missing schema or hostname in HDS endpoint".into(),
            ));
        }

        match (&self.destination, &self.tdd) {
            (None, None) => {
                return Err(SyncError::Config(
                    "either a destination HDS or a TDD endpoint must be defined".into(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(SyncError::Config(
                    "destination and TDD endpoints are mutually exclusive".into(),
                ))
            }
            (Some(dst), None) => {
                Url::parse(dst).map_err(|e| {
                    SyncError::Config(format!("destination endpoint is not a valid URL: {}", e))
                })?;
                // Static TLS: all three files must be present.
                require_file(&self.tls.ca, "CA")?;
                require_file(&self.tls.key, "key")?;
                require_file(&self.tls.cert, "cert")?;
            }
            (None, Some(tdd)) => {
                if tdd.endpoint.is_empty() {
                    return Err(SyncError::Config("TDD endpoint must be defined".into()));
                }
                Url::parse(&tdd.endpoint).map_err(|e| {
                    SyncError::Config(format!("TDD endpoint is not a valid URL: {}", e))
                })?;
                require_file(&self.tls.ca, "CA")?;
                let store = self.cert_store.as_ref().ok_or_else(|| {
                    SyncError::Config("certificate store must be configured in TDD mode".into())
                })?;
                if store.store_type != "sqlite" {
                    return Err(SyncError::Config(format!(
                        "certificate store backend is not supported: {}",
                        store.store_type
                    )));
                }
                if store.dsn.is_empty() {
                    return Err(SyncError::Config("certificate store dsn must be defined".into()));
                }
            }
        }

        // Interval must at least parse.
        self.sync_interval()?;
        Ok(())
    }

    /// The parsed synchronization interval. `None` means continuous.
    pub fn sync_interval(&self) -> Result<Option<Duration>> {
        let raw = self.sync_interval.trim();
        if raw.is_empty() || raw == "0" {
            return Ok(None);
        }
        let parsed = humantime::parse_duration(raw).map_err(|e| {
            SyncError::Config(format!("unable to parse sync interval '{}': {}", raw, e))
        })?;
        if parsed.is_zero() {
            return Ok(None);
        }
        Ok(Some(parsed))
    }

    /// The source host (`host[:port]`) the gRPC clients dial.
    pub fn source_host(&self) -> Result<String> {
        host_of(&self.hds)
    }

    /// The fixed destination host, when in fixed-destination mode.
    pub fn destination_host(&self) -> Result<Option<String>> {
        match &self.destination {
            Some(dst) => Ok(Some(host_of(dst)?)),
            None => Ok(None),
        }
    }

    /// A minimal config for tests: no file checks ever run against it.
    pub fn for_testing(hds: &str) -> Self {
        Self {
            hds: hds.to_string(),
            sync_interval: "0".to_string(),
            ..Default::default()
        }
    }
}

fn require_file(path: &str, what: &str) -> Result<()> {
    if path.is_empty() || !Path::new(path).is_file() {
        return Err(SyncError::Config(format!(
            "{} file '{}' does not exist",
            what, path
        )));
    }
    Ok(())
}

fn host_of(url_str: &str) -> Result<String> {
    let url = Url::parse(url_str)
        .map_err(|e| SyncError::Config(format!("invalid URL '{}': {}", url_str, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| SyncError::Config(format!("missing host in URL '{}'", url_str)))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
