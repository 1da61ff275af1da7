//! Service entry point.
//!
//! Loads configuration, builds the certificate provider and connection
//! pool for the selected mode, starts the controller (and, in
//! directory-driven mode, the topology watcher), and runs until SIGINT or
//! SIGTERM triggers an orderly stop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hds_sync::certs::{CertDirectory, CertificateProvider, SqliteCertStore, StaticCertProvider};
use hds_sync::pool::{ConnectionPool, GrpcConnector};
use hds_sync::sync::Controller;
use hds_sync::topology::{StaticToken, TopologyWatcher};
use hds_sync::{Result, SyncConfig, SyncError};

/// How long shutdown waits for background tasks to drain.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "hds-sync", about = "HDS time-series synchronization service")]
struct Args {
    /// Configuration file path.
    #[arg(short = 'c', long = "conf", default_value = "conf/conf.json")]
    conf: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %e, "Fatal");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = SyncConfig::load(&args.conf)?;
    let interval = config.sync_interval()?;
    let source_host = config.source_host()?;

    info!(
        source = %config.hds,
        interval = %config.sync_interval,
        "Starting hds-sync"
    );

    // Certificate provider: static files in fixed-destination mode,
    // store-backed enrolment in directory-driven mode.
    let mut cert_store: Option<Arc<SqliteCertStore>> = None;
    let mut cert_directory: Option<Arc<CertDirectory>> = None;
    let provider: Arc<dyn CertificateProvider> = if config.tdd.is_some() {
        let store_cfg = config
            .cert_store
            .as_ref()
            .ok_or_else(|| SyncError::Config("certificate store missing".into()))?;
        let store = Arc::new(SqliteCertStore::open(&store_cfg.dsn).await?);
        cert_store = Some(Arc::clone(&store));

        let directory = Arc::new(CertDirectory::new(&config.tls, store)?);
        if let Some(ca) = &config.tls.source_hds_ca {
            directory.register_ca_endpoint(&source_host, ca);
        }
        cert_directory = Some(Arc::clone(&directory));
        directory
    } else {
        Arc::new(StaticCertProvider::from_files(&config.tls)?)
    };

    let pool = Arc::new(ConnectionPool::new(Arc::new(GrpcConnector::new(provider))));

    let src = pool.get_or_connect(&source_host).await?;

    let fixed_dst = match config.destination_host()? {
        Some(host) => {
            let client = pool.get_or_connect(&host).await?;
            Some((host, client))
        }
        None => None,
    };
    let fixed_mode = fixed_dst.is_some();

    let controller = Arc::new(Controller::new(src, Arc::clone(&pool), fixed_dst, interval));

    let root_cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    if fixed_mode {
        tasks.push(Arc::clone(&controller).start_sync_for_all());
    }

    if let Some(tdd) = &config.tdd {
        let mut watcher = TopologyWatcher::new(&tdd.endpoint, &config.hds);
        if let Some(token) = &tdd.token {
            watcher = watcher.with_token(Arc::new(StaticToken(token.clone())));
        }
        if let Some(directory) = cert_directory {
            watcher = watcher.with_cert_directory(directory);
        }
        let controller = Arc::clone(&controller);
        let cancel = root_cancel.clone();
        tasks.push(tokio::spawn(watcher.run(controller, cancel)));
    }

    info!("Service running");
    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");

    root_cancel.cancel();
    controller.stop_sync_for_all().await;

    for task in tasks {
        let _ = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, task).await;
    }

    if let Some(store) = cert_store {
        store.close().await;
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
