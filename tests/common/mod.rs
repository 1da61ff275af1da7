//! Mock HDS for testing.
//!
//! An in-memory [`TimeSeriesClient`] that behaves like a real endpoint:
//! records live in a per-series table with `(name, time)` dedup
//! (idempotent submits), range queries filter and sort, and
//! subscriptions are fed by [`MockHds::publish`]. Failures are injected
//! per operation to exercise restart paths.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use hds_sync::client::{Query, SeriesInfo, SubmitStream, TimeSeriesClient};
use hds_sync::error::{Result, SyncError};
use hds_sync::senml::{Pack, Record, Timestamp};

/// In-memory HDS endpoint.
pub struct MockHds {
    /// Stored records per series.
    data: RwLock<HashMap<String, Vec<Record>>>,
    /// Live subscribers per series.
    subscribers: RwLock<HashMap<String, Vec<mpsc::Sender<Result<Pack>>>>>,
    /// Registry entries.
    registry: RwLock<Vec<SeriesInfo>>,

    /// Unary submits received (after dedup application).
    submits: RwLock<Vec<Pack>>,
    /// Packs received over submit streams.
    stream_submits: RwLock<Vec<Pack>>,

    /// Number of subscribe calls.
    subscribe_calls: AtomicUsize,
    /// Fail the next N unary submits.
    fail_submits: AtomicUsize,
    /// Artificial delay per streamed query chunk, in milliseconds.
    query_stream_delay_ms: AtomicU64,
    /// Records per streamed query chunk.
    query_stream_chunk: AtomicUsize,

    /// Back-reference so submit streams can outlive the borrow.
    weak_self: Weak<MockHds>,
}

impl MockHds {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            data: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            registry: RwLock::new(Vec::new()),
            submits: RwLock::new(Vec::new()),
            stream_submits: RwLock::new(Vec::new()),
            subscribe_calls: AtomicUsize::new(0),
            fail_submits: AtomicUsize::new(0),
            query_stream_delay_ms: AtomicU64::new(0),
            query_stream_chunk: AtomicUsize::new(50),
            weak_self: weak.clone(),
        })
    }

    // =========================================================================
    // Test-side controls
    // =========================================================================

    /// Insert records without notifying subscribers (data that existed
    /// before the engine looked, or that arrived during an outage).
    pub async fn add_records(&self, series: &str, seconds: &[f64]) {
        let mut data = self.data.write().await;
        let rows = data.entry(series.to_string()).or_default();
        for s in seconds {
            upsert(rows, Record::new(series, Timestamp::from_senml(*s), *s));
        }
    }

    /// Insert records and deliver them to live subscribers as one pack.
    pub async fn publish(&self, series: &str, seconds: &[f64]) {
        self.add_records(series, seconds).await;
        let pack: Pack = seconds
            .iter()
            .map(|s| Record::new(series, Timestamp::from_senml(*s), *s))
            .collect();

        let mut subs = self.subscribers.write().await;
        if let Some(senders) = subs.get_mut(series) {
            let mut alive = Vec::new();
            for tx in senders.drain(..) {
                if tx.send(Ok(pack.clone())).await.is_ok() {
                    alive.push(tx);
                }
            }
            *senders = alive;
        }
    }

    /// Deliver a transport error to every subscriber of a series and
    /// close their channels (simulated source loss).
    pub async fn fail_subscription(&self, series: &str) {
        let mut subs = self.subscribers.write().await;
        if let Some(senders) = subs.remove(series) {
            for tx in senders {
                let _ = tx
                    .send(Err(SyncError::transport_msg("Subscribe", "stream reset")))
                    .await;
            }
        }
    }

    /// Fail the next `n` unary submits with a transport error.
    pub fn fail_next_submits(&self, n: usize) {
        self.fail_submits.store(n, Ordering::SeqCst);
    }

    /// Slow down streamed queries (per chunk) to hold a backfill open.
    pub fn set_query_stream_delay(&self, delay: Duration) {
        self.query_stream_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Records per streamed chunk.
    pub fn set_query_stream_chunk(&self, chunk: usize) {
        self.query_stream_chunk.store(chunk.max(1), Ordering::SeqCst);
    }

    /// Pre-register series in the registry.
    pub async fn register_series(&self, names: &[&str]) {
        let mut registry = self.registry.write().await;
        for name in names {
            if !registry.iter().any(|s| s.name == *name) {
                registry.push(SeriesInfo::named(*name));
            }
        }
    }

    /// Drop a series from the registry (topology removal).
    pub async fn unregister_series(&self, name: &str) {
        self.registry.write().await.retain(|s| s.name != name);
    }

    // =========================================================================
    // Assertion helpers
    // =========================================================================

    /// Stored timestamps for a series, sorted, in decimal seconds.
    pub async fn times(&self, series: &str) -> Vec<f64> {
        let data = self.data.read().await;
        let mut times: Vec<f64> = data
            .get(series)
            .map(|rows| rows.iter().map(|r| r.time.to_senml()).collect())
            .unwrap_or_default();
        times.sort_by(|a, b| a.partial_cmp(b).unwrap());
        times
    }

    /// Number of stored records for a series.
    pub async fn record_count(&self, series: &str) -> usize {
        self.data
            .read()
            .await
            .get(series)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// Unary submit packs received so far.
    pub async fn submit_count(&self) -> usize {
        self.submits.read().await.len()
    }

    /// Packs received over submit streams so far.
    pub async fn stream_submit_count(&self) -> usize {
        self.stream_submits.read().await.len()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Whether a series currently has live subscribers.
    pub async fn has_subscriber(&self, series: &str) -> bool {
        self.subscribers
            .read()
            .await
            .get(series)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    /// Registry names, sorted.
    pub async fn registry_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .read()
            .await
            .iter()
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }

    async fn apply_pack(&self, pack: &Pack) {
        let mut data = self.data.write().await;
        for record in pack.records() {
            let rows = data.entry(record.name.clone()).or_default();
            upsert(rows, record.clone());
        }
    }

    fn filtered(&self, rows: &[Record], query: &Query) -> Vec<Record> {
        let mut hits: Vec<Record> = rows
            .iter()
            .filter(|r| r.time >= query.from && r.time <= query.to)
            .cloned()
            .collect();
        if query.sort_asc {
            hits.sort_by_key(|r| r.time);
        } else {
            hits.sort_by_key(|r| std::cmp::Reverse(r.time));
        }
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        hits
    }
}

/// Idempotent insert: identical `(name, time)` overwrites.
fn upsert(rows: &mut Vec<Record>, record: Record) {
    rows.retain(|r| !(r.name == record.name && r.time == record.time));
    rows.push(record);
}

#[async_trait]
impl TimeSeriesClient for MockHds {
    async fn subscribe(
        &self,
        series: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<Pack>>> {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .write()
            .await
            .entry(series.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn query(&self, series: &str, query: &Query, cancel: CancellationToken) -> Result<Pack> {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        let data = self.data.read().await;
        let rows = data.get(series).map(|r| r.as_slice()).unwrap_or(&[]);
        Ok(Pack::from_records(self.filtered(rows, query)))
    }

    async fn query_stream(
        &self,
        series: &str,
        query: &Query,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<Pack>>> {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        let data = self.data.read().await;
        let rows = data.get(series).map(|r| r.as_slice()).unwrap_or(&[]);
        let hits = self.filtered(rows, query);
        drop(data);

        let chunk = self.query_stream_chunk.load(Ordering::SeqCst);
        let delay = Duration::from_millis(self.query_stream_delay_ms.load(Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            for window in hits.chunks(chunk) {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                let pack = Pack::from_records(window.to_vec());
                if tx.send(Ok(pack)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn submit(&self, pack: &Pack, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        let remaining = self.fail_submits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_submits.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::transport_msg("Submit", "injected failure"));
        }
        self.apply_pack(pack).await;
        self.submits.write().await.push(pack.clone());
        Ok(())
    }

    async fn create_submit_stream(
        &self,
        cancel: CancellationToken,
    ) -> Result<Box<dyn SubmitStream>> {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        let hds = self
            .weak_self
            .upgrade()
            .ok_or_else(|| SyncError::Internal("mock endpoint dropped".to_string()))?;
        Ok(Box::new(MockSubmitStream { hds }))
    }

    async fn registry_get_many(
        &self,
        page: usize,
        per_page: usize,
        cancel: CancellationToken,
    ) -> Result<(Vec<SeriesInfo>, usize)> {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        let registry = self.registry.read().await;
        let total = registry.len();
        let start = (page.saturating_sub(1)) * per_page;
        let slice = registry
            .iter()
            .skip(start)
            .take(per_page)
            .cloned()
            .collect();
        Ok((slice, total))
    }

    async fn registry_add(&self, series: &SeriesInfo, cancel: CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SyncError::Canceled);
        }
        let mut registry = self.registry.write().await;
        if registry.iter().any(|s| s.name == series.name) {
            return Err(SyncError::AlreadyExists(series.name.clone()));
        }
        registry.push(series.clone());
        Ok(())
    }
}

struct MockSubmitStream {
    hds: Arc<MockHds>,
}

#[async_trait]
impl SubmitStream for MockSubmitStream {
    async fn submit(&mut self, pack: &Pack) -> Result<()> {
        self.hds.apply_pack(pack).await;
        self.hds.stream_submits.write().await.push(pack.clone());
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// A pool connector that hands out pre-built mock endpoints by host.
pub struct MockConnector {
    hosts: std::sync::Mutex<HashMap<String, Arc<MockHds>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            hosts: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, host: &str, hds: Arc<MockHds>) {
        self.hosts.lock().unwrap().insert(host.to_string(), hds);
    }
}

#[async_trait]
impl hds_sync::pool::Connector for MockConnector {
    async fn connect(&self, host: &str) -> Result<Arc<dyn TimeSeriesClient>> {
        let found = self.hosts.lock().unwrap().get(host).cloned();
        match found {
            Some(hds) => Ok(hds as Arc<dyn TimeSeriesClient>),
            None => Err(SyncError::transport_msg(
                "Dial",
                format!("{}: connection refused", host),
            )),
        }
    }
}

/// Wait until `condition` holds or the timeout elapses; panics on timeout.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
