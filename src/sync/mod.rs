// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synchronization supervision.
//!
//! The [`Controller`] decides *which* series are synchronized and to
//! *where*; each [`Synchronizer`] decides *how*. Two feeds drive the
//! controller:
//!
//! 1. **Source registry** (fixed-destination mode): every series known to
//!    the source is mirrored to one destination HDS. The registry is
//!    re-enumerated once a minute; series that appear get a synchronizer,
//!    series that vanish are cleared.
//! 2. **Thing directory** (directory-driven mode): the
//!    [`TopologyWatcher`](crate::topology::TopologyWatcher) hands
//!    `(series, replica hosts)` tuples to
//!    [`Controller::add_or_update_series`], which diffs them against the
//!    running state.
//!
//! # Registry propagation
//!
//! A series is always created on the destination (`registry_add`, where
//! `AlreadyExists` counts as success) *before* its synchronizer spawns, so
//! the first submit never races the series' existence. Creations are paced
//! about a second apart to smooth burst registration load.

mod replica;
mod synchronizer;

pub use synchronizer::{Command, Synchronizer};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{SeriesInfo, TimeSeriesClient};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::pool::ConnectionPool;

/// How often the source registry is re-enumerated.
const REGISTRY_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Registry page size for enumeration.
const REGISTRY_PAGE_SIZE: usize = 100;

/// Pause between synchronizer creations within one refresh round.
const CREATION_PACING: Duration = Duration::from_secs(1);

/// A series under synchronization plus the replica hosts it targets.
struct SeriesEntry {
    sync: Synchronizer,
    hosts: HashSet<String>,
}

/// Creates and destroys per-series synchronizers.
pub struct Controller {
    /// Map of series with active synchronization.
    sync_map: Mutex<HashMap<String, SeriesEntry>>,

    /// Source client, shared by every synchronizer.
    src: Arc<dyn TimeSeriesClient>,

    /// Fixed destination (host, client) when the set of destinations is
    /// decided at boot rather than by the directory.
    fixed_dst: Option<(String, Arc<dyn TimeSeriesClient>)>,

    /// Shared client pool for directory-provided replica hosts.
    pool: Arc<ConnectionPool>,

    /// Per-series sync interval; `None` means continuous.
    interval: Option<Duration>,

    /// Stop signal for every controller task.
    cancel: CancellationToken,
}

impl Controller {
    pub fn new(
        src: Arc<dyn TimeSeriesClient>,
        pool: Arc<ConnectionPool>,
        fixed_dst: Option<(String, Arc<dyn TimeSeriesClient>)>,
        interval: Option<Duration>,
    ) -> Self {
        Self {
            sync_map: Mutex::new(HashMap::new()),
            src,
            fixed_dst,
            pool,
            interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the periodic registry refresh (fixed-destination mode).
    ///
    /// Runs one refresh immediately, then every minute until
    /// [`stop_sync_for_all`](Self::stop_sync_for_all).
    pub fn start_sync_for_all(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REGISTRY_REFRESH_INTERVAL);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.update_syncing().await {
                            Ok(()) => {}
                            Err(e) if e.is_canceled() => break,
                            Err(e) => warn!(error = %e, "Registry refresh failed"),
                        }
                    }
                }
            }
            debug!("Registry refresh task stopped");
        })
    }

    /// One registry enumeration round.
    ///
    /// Pages through the source registry, creates missing series on the
    /// destination and spawns their synchronizers, and clears series that
    /// no longer exist at the source.
    pub async fn update_syncing(&self) -> Result<()> {
        let Some((dst_host, dst)) = self.fixed_dst.as_ref() else {
            return Ok(());
        };

        info!("Fetching source registry");
        let mut present: HashSet<String> = HashSet::new();
        let mut page = 1usize;
        let mut fetched = 0usize;

        loop {
            let (series_list, total) = self
                .src
                .registry_get_many(page, REGISTRY_PAGE_SIZE, self.cancel.clone())
                .await?;
            fetched += series_list.len();
            let page_len = series_list.len();

            for series in series_list {
                present.insert(series.name.clone());

                if self.sync_map.lock().await.contains_key(&series.name) {
                    continue;
                }

                match dst.registry_add(&series, self.cancel.clone()).await {
                    Ok(()) => {
                        info!(series = %series.name, "Created series in destination");
                        metrics::record_registry_create(&series.name, "created");
                    }
                    Err(SyncError::AlreadyExists(_)) => {
                        info!(series = %series.name, "Continuing with existing series in destination");
                        metrics::record_registry_create(&series.name, "exists");
                    }
                    Err(e) if e.is_canceled() => return Err(e),
                    Err(e) => {
                        warn!(series = %series.name, error = %e, "Failed to create series in destination");
                        continue;
                    }
                }

                // Pace creations to smooth burst registration load.
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(SyncError::Canceled),
                    _ = tokio::time::sleep(CREATION_PACING) => {}
                }

                let mut destinations: HashMap<String, Arc<dyn TimeSeriesClient>> = HashMap::new();
                destinations.insert(dst_host.clone(), Arc::clone(dst));
                let sync = Synchronizer::spawn(
                    series.name.clone(),
                    Arc::clone(&self.src),
                    destinations,
                    self.interval,
                );

                let mut map = self.sync_map.lock().await;
                map.insert(
                    series.name.clone(),
                    SeriesEntry {
                        sync,
                        hosts: HashSet::from([dst_host.clone()]),
                    },
                );
                info!(series = %series.name, "Started synchronization");
            }

            if page_len == 0 || fetched >= total {
                break;
            }
            page += 1;
        }

        // Clear series that vanished from the source registry.
        let removed: Vec<SeriesEntry> = {
            let mut map = self.sync_map.lock().await;
            let stale: Vec<String> = map
                .keys()
                .filter(|name| !present.contains(*name))
                .cloned()
                .collect();
            let removed = stale
                .into_iter()
                .filter_map(|name| {
                    info!(series = %name, "Series gone from source registry, stopping");
                    map.remove(&name)
                })
                .collect();
            metrics::set_active_series(map.len());
            removed
        };
        for entry in removed {
            entry.sync.clear();
        }

        Ok(())
    }

    /// Reconcile one series against the replica hosts the directory lists
    /// for it (directory-driven mode).
    ///
    /// Unreachable hosts are skipped with a warning and picked up on a
    /// later poll. New replicas are registry-propagated before the
    /// synchronizer learns about them; departed replicas are canceled.
    pub async fn add_or_update_series(&self, series: &str, replica_hosts: &[String]) {
        if self.cancel.is_cancelled() {
            return;
        }

        let mut resolved: HashMap<String, Arc<dyn TimeSeriesClient>> = HashMap::new();
        for host in replica_hosts {
            match self.pool.get_or_connect(host).await {
                Ok(client) => {
                    metrics::record_dial(host, true);
                    resolved.insert(host.clone(), client);
                }
                Err(e) => {
                    metrics::record_dial(host, false);
                    warn!(series = %series, replica = %host, error = %e, "Skipping unreachable replica");
                }
            }
        }

        let requested: HashSet<String> = replica_hosts.iter().cloned().collect();
        let mut map = self.sync_map.lock().await;

        use std::collections::hash_map::Entry;
        match map.entry(series.to_string()) {
            Entry::Vacant(slot) => {
                if resolved.is_empty() {
                    debug!(series = %series, "No reachable replicas, not starting synchronization");
                    return;
                }
                let ready = self.propagate_registry(series, resolved).await;
                if ready.is_empty() {
                    return;
                }
                let hosts: HashSet<String> = ready.keys().cloned().collect();
                let sync = Synchronizer::spawn(
                    series.to_string(),
                    Arc::clone(&self.src),
                    ready,
                    self.interval,
                );
                info!(series = %series, replicas = hosts.len(), "Started synchronization");
                slot.insert(SeriesEntry { sync, hosts });
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let to_delete: Vec<String> = entry
                    .hosts
                    .iter()
                    .filter(|host| !requested.contains(*host))
                    .cloned()
                    .collect();
                let new_hosts: HashMap<String, Arc<dyn TimeSeriesClient>> = resolved
                    .into_iter()
                    .filter(|(host, _)| !entry.hosts.contains(host))
                    .collect();
                let to_add = self.propagate_registry(series, new_hosts).await;

                if to_add.is_empty() && to_delete.is_empty() {
                    return;
                }
                for host in &to_delete {
                    entry.hosts.remove(host);
                }
                for host in to_add.keys() {
                    entry.hosts.insert(host.clone());
                }
                entry.sync.update_destinations(to_add, to_delete).await;
            }
        }
        metrics::set_active_series(map.len());
    }

    /// Create the series on each new destination; hosts whose create
    /// fails (other than already-exists) are dropped for this round.
    async fn propagate_registry(
        &self,
        series: &str,
        candidates: HashMap<String, Arc<dyn TimeSeriesClient>>,
    ) -> HashMap<String, Arc<dyn TimeSeriesClient>> {
        let descriptor = SeriesInfo::named(series);
        let mut ready = HashMap::new();
        for (host, client) in candidates {
            match client.registry_add(&descriptor, self.cancel.clone()).await {
                Ok(()) => {
                    info!(series = %series, replica = %host, "Created series in destination");
                    metrics::record_registry_create(series, "created");
                    ready.insert(host, client);
                }
                Err(SyncError::AlreadyExists(_)) => {
                    metrics::record_registry_create(series, "exists");
                    ready.insert(host, client);
                }
                Err(e) => {
                    warn!(series = %series, replica = %host, error = %e, "Failed to create series in destination");
                }
            }
        }
        ready
    }

    /// Names of the series currently under synchronization.
    pub async fn active_series(&self) -> Vec<String> {
        self.sync_map.lock().await.keys().cloned().collect()
    }

    /// Stop everything: fire the stop signal, clear every synchronizer,
    /// and close the pool. After this returns, no further writes are
    /// issued to any destination.
    pub async fn stop_sync_for_all(&self) {
        info!("Stopping synchronization for all series");
        self.cancel.cancel();

        let entries: Vec<SeriesEntry> = {
            let mut map = self.sync_map.lock().await;
            map.drain().map(|(_, entry)| entry).collect()
        };
        join_all(entries.into_iter().map(|entry| entry.sync.stop())).await;

        self.pool.close();
        metrics::set_active_series(0);
        info!("Synchronization stopped");
    }
}
