// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-series synchronization state machine.
//!
//! One [`Synchronizer`] exists per series under replication. It owns a
//! supervisor task that merges two progress paths:
//!
//! ```text
//!              ┌─────────────────────────────────────────────────┐
//!              │              supervisor task                    │
//!              │                                                 │
//!  Subscribe ──┼──► live packs ──┬── gate open ──► Submit        │
//!  (source)    │                 │                 (replica)     │
//!              │                 └── gate closed ─► buffer       │
//!              │                                      │          │
//!              │   backfill task  ── done event ──► flush        │
//!              │   (QueryStream ► SubmitStream)                  │
//!              └─────────────────────────────────────────────────┘
//! ```
//!
//! # Modes
//!
//! - **Continuous** (`interval == None`): a live subscription plus an
//!   asynchronous backfill per replica that is behind. Live records for a
//!   replica whose backfill is still running are buffered and submitted as
//!   one pack when the backfill's done event arrives.
//! - **Periodic** (`interval == Some(d)`): no subscription; every `d` both
//!   cursors are probed and a range migration copies the gap.
//!
//! # Restart policy
//!
//! A failed round logs with series context, sleeps one second, and starts
//! over. Cancellation exits silently at any suspension point.
//!
//! # Destinations
//!
//! The supervisor owns the replica map. Cross-task changes (replica added
//! or removed by the controller) arrive as [`Command`]s on a channel and
//! are applied between suspension points, never by direct map mutation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::client::{Query, TimeSeriesClient};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::senml::{Pack, Timestamp};
use crate::sync::replica::{Cursor, Replica};

/// Delay before restarting a failed round.
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Capacity of the controller→worker command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// Capacity of the backfill completion channel.
const GATE_EVENT_CAPACITY: usize = 16;

/// Cross-task instructions for the supervisor.
pub enum Command {
    /// Atomically add and remove destinations.
    UpdateDestinations {
        to_add: HashMap<String, Arc<dyn TimeSeriesClient>>,
        to_delete: Vec<String>,
    },
}

/// Handle to a running per-series synchronization.
///
/// Dropping the handle does not stop the worker; call [`clear`](Self::clear)
/// (fire-and-forget) or [`stop`](Self::stop) (joins the task).
pub struct Synchronizer {
    series: String,
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl Synchronizer {
    /// Spawn the supervisor task for a series.
    ///
    /// `interval` of `None` selects continuous mode; `Some(d)` polls every
    /// `d`. Destinations are keyed by replica host.
    pub fn spawn(
        series: impl Into<String>,
        src: Arc<dyn TimeSeriesClient>,
        destinations: HashMap<String, Arc<dyn TimeSeriesClient>>,
        interval: Option<Duration>,
    ) -> Self {
        let series = series.into();
        let cancel = CancellationToken::new();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (gate_tx, gate_rx) = mpsc::channel(GATE_EVENT_CAPACITY);

        let replicas = destinations
            .into_iter()
            .map(|(host, client)| (host, Replica::new(client, &cancel)))
            .collect();

        let worker = Worker {
            series: series.clone(),
            src,
            destinations: replicas,
            interval,
            cancel: cancel.clone(),
            cmd_rx,
            gate_tx,
            gate_rx,
        };

        let span = info_span!("synchronizer", series = %series);
        let handle = tokio::spawn(worker.run().instrument(span));

        Self {
            series,
            cmd_tx,
            cancel,
            handle,
        }
    }

    /// The series this synchronizer owns.
    pub fn series(&self) -> &str {
        &self.series
    }

    /// Atomically add and remove destinations.
    ///
    /// Added replicas start with a zero cursor and an immediate backfill
    /// from the epoch to now; removed replicas have their in-flight
    /// streams canceled. The live subscription is not interrupted.
    pub async fn update_destinations(
        &self,
        to_add: HashMap<String, Arc<dyn TimeSeriesClient>>,
        to_delete: Vec<String>,
    ) {
        if to_add.is_empty() && to_delete.is_empty() {
            return;
        }
        if self
            .cmd_tx
            .send(Command::UpdateDestinations { to_add, to_delete })
            .await
            .is_err()
        {
            warn!(series = %self.series, "Worker gone, destination update dropped");
        }
    }

    /// Stop synchronization for this series.
    ///
    /// Fires the cancellation cascade: the supervisor and every per-replica
    /// stream abort at their next suspension point. After this returns, no
    /// further writes are issued for the series (buffered packs are
    /// dropped; the source reissues them on the next subscription).
    pub fn clear(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the worker to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Everything in the select loop resolves to one of these first, so the
/// handler below can borrow the worker freely.
enum Event {
    Canceled,
    Command(Option<Command>),
    GateOpened(String),
    Live(Option<Result<Pack>>),
}

struct Worker {
    series: String,
    src: Arc<dyn TimeSeriesClient>,
    destinations: HashMap<String, Replica>,
    interval: Option<Duration>,
    cancel: CancellationToken,
    cmd_rx: mpsc::Receiver<Command>,
    /// Backfill tasks report completion here (value = replica host).
    gate_tx: mpsc::Sender<String>,
    gate_rx: mpsc::Receiver<String>,
}

impl Worker {
    async fn run(mut self) {
        let mode = match self.interval {
            None => "continuous".to_string(),
            Some(d) => format!("every {:?}", d),
        };
        debug!(mode = %mode, "Synchronizer started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let result = match self.interval {
                None => self.subscribe_and_publish().await,
                Some(_) => self.periodic_round().await,
            };

            let delay = match result {
                Err(e) if e.is_canceled() => break,
                Err(e) => {
                    warn!(error = %e, "Synchronization round failed, restarting");
                    metrics::record_worker_restart(&self.series);
                    RESTART_DELAY
                }
                Ok(()) => match self.interval {
                    Some(d) => d,
                    None => RESTART_DELAY,
                },
            };

            if self.idle(delay).await {
                break;
            }
        }

        // No background work outlives the worker: cancel every replica.
        for replica in self.destinations.values() {
            replica.cancel.cancel();
        }
        debug!("Synchronizer stopped");
    }

    /// Sleep between rounds while staying responsive to cancellation,
    /// destination updates, and late backfill completions.
    ///
    /// Returns `true` when canceled.
    async fn idle(&mut self, duration: Duration) -> bool {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => Event::Canceled,
                _ = &mut sleep => return false,
                cmd = self.cmd_rx.recv() => Event::Command(cmd),
                Some(host) = self.gate_rx.recv() => Event::GateOpened(host),
            };
            match event {
                Event::Canceled => return true,
                Event::Command(None) => return true,
                Event::Command(Some(cmd)) => self.apply_command(cmd),
                Event::GateOpened(host) => self.on_gate_opened(&host).await,
                Event::Live(_) => unreachable!("no subscription while idle"),
            }
        }
    }

    /// Continuous mode: one subscription round.
    ///
    /// The subscription is opened before the cursors are probed, so no
    /// record can fall between the snapshot and the first live pack; the
    /// overlap around the snapshot is absorbed by destination idempotence.
    async fn subscribe_and_publish(&mut self) -> Result<()> {
        let mut live_rx = self
            .src
            .subscribe(&self.series, self.cancel.clone())
            .await?;
        info!("Subscribed to source");

        let now = Timestamp::now();
        let mut src_latest = get_last_time(
            &*self.src,
            &self.series,
            Timestamp::ZERO,
            now,
            now,
            &self.cancel,
        )
        .await?;

        for (host, replica) in self.destinations.iter() {
            let dst_latest = get_last_time(
                &*replica.client,
                &self.series,
                Timestamp::ZERO,
                now,
                Timestamp::ZERO,
                &replica.cancel,
            )
            .await?;
            replica.cursor.advance(dst_latest);
            let dst_latest = replica.cursor.load();

            if dst_latest < src_latest {
                info!(
                    replica = %host,
                    src_latest = %src_latest,
                    dst_latest = %dst_latest,
                    "Destination behind source, starting backfill"
                );
                self.start_backfill(host, replica, dst_latest, src_latest);
            }
        }

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => Event::Canceled,
                cmd = self.cmd_rx.recv() => Event::Command(cmd),
                Some(host) = self.gate_rx.recv() => Event::GateOpened(host),
                item = live_rx.recv() => Event::Live(item),
            };
            match event {
                Event::Canceled | Event::Command(None) => return Err(SyncError::Canceled),
                Event::Command(Some(cmd)) => self.apply_command(cmd),
                Event::GateOpened(host) => self.on_gate_opened(&host).await,
                Event::Live(None) => {
                    info!("Subscription ended");
                    return Ok(());
                }
                Event::Live(Some(Err(e))) => return Err(e),
                Event::Live(Some(Ok(pack))) => {
                    self.handle_live_pack(pack, &mut src_latest).await?;
                }
            }
        }
    }

    /// Forward one live pack to every destination.
    ///
    /// The pack joins each replica's buffer first; replicas with an open
    /// gate flush the whole buffer as a single submit. Records at or below
    /// the cursor are submitted anyway (the destination deduplicates) and
    /// the cursor only ever advances to the pack maximum.
    async fn handle_live_pack(&mut self, pack: Pack, src_latest: &mut Timestamp) -> Result<()> {
        if pack.is_empty() {
            return Ok(());
        }
        let Some(latest_in_pack) = pack.latest() else {
            return Ok(());
        };
        debug!(
            records = pack.len(),
            latest_in_pack = %latest_in_pack,
            src_latest = %*src_latest,
            "Live pack received"
        );

        let series = self.series.clone();
        let mut attempted = 0usize;
        let mut failed = 0usize;

        for (host, replica) in self.destinations.iter_mut() {
            replica.buffer.extend_from(&pack);

            if replica.gate.is_running() {
                metrics::record_buffered_records(&series, host, pack.len());
                debug!(
                    replica = %host,
                    buffered = replica.buffer.len(),
                    "Buffering while backfill runs"
                );
                continue;
            }

            attempted += 1;
            if let Err(e) = flush_buffer(&series, host, replica).await {
                if e.is_canceled() {
                    return Err(e);
                }
                failed += 1;
                warn!(replica = %host, error = %e, "Failed to copy live pack to replica");
            }
        }

        *src_latest = latest_in_pack;

        // A lone misbehaving replica does not take down its peers; when
        // every reachable replica rejects, restart the whole round.
        if attempted > 0 && failed == attempted {
            return Err(SyncError::transport_msg(
                "Submit",
                "all destinations rejected the live pack",
            ));
        }
        Ok(())
    }

    /// A backfill finished; flush whatever the replica buffered meanwhile.
    async fn on_gate_opened(&mut self, host: &str) {
        let series = self.series.clone();
        let Some(replica) = self.destinations.get_mut(host) else {
            return;
        };
        if replica.gate.is_running() {
            // A newer backfill reclaimed the gate before the event arrived.
            return;
        }
        if let Err(e) = flush_buffer(&series, host, replica).await {
            if !e.is_canceled() {
                warn!(replica = %host, error = %e, "Failed to flush buffer after backfill");
            }
        }
    }

    fn apply_command(&mut self, cmd: Command) {
        match cmd {
            Command::UpdateDestinations { to_add, to_delete } => {
                for host in to_delete {
                    if let Some(replica) = self.destinations.remove(&host) {
                        replica.cancel.cancel();
                        info!(replica = %host, "Removed destination");
                    }
                }

                let now = Timestamp::now();
                for (host, client) in to_add {
                    if self.destinations.contains_key(&host) {
                        continue;
                    }
                    let replica = Replica::new(client, &self.cancel);
                    // New replicas catch up over the full history.
                    self.start_backfill(&host, &replica, Timestamp::ZERO, now);
                    info!(replica = %host, "Added destination");
                    self.destinations.insert(host, replica);
                }
            }
        }
    }

    /// Launch an asynchronous backfill for one replica.
    ///
    /// No-op when one is already running for this replica. The gate stays
    /// closed until the task exits, at which point a done event reopens it.
    fn start_backfill(&self, host: &str, replica: &Replica, from: Timestamp, to: Timestamp) {
        if !replica.gate.try_start() {
            debug!(replica = %host, "Backfill already in progress");
            return;
        }

        let series = self.series.clone();
        let host = host.to_string();
        let src = Arc::clone(&self.src);
        let dst = Arc::clone(&replica.client);
        let cursor = Arc::clone(&replica.cursor);
        let gate = Arc::clone(&replica.gate);
        let cancel = replica.cancel.clone();
        let gate_tx = self.gate_tx.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            match backfill(&series, &host, &*src, &*dst, &cursor, from, to, &cancel).await {
                Ok(copied) => {
                    info!(
                        series = %series,
                        replica = %host,
                        copied,
                        dst_latest = %cursor.load(),
                        "Backfill complete"
                    );
                    metrics::record_backfill(&series, &host, started.elapsed());
                }
                Err(e) if e.is_canceled() => {}
                Err(e) => {
                    warn!(series = %series, replica = %host, error = %e, "Backfill aborted");
                }
            }
            gate.finish();
            let _ = gate_tx.send(host).await;
        });
    }

    /// Periodic mode: probe both cursors and copy the gap.
    async fn periodic_round(&mut self) -> Result<()> {
        let now = Timestamp::now();
        let src_latest = get_last_time(
            &*self.src,
            &self.series,
            Timestamp::ZERO,
            now,
            now,
            &self.cancel,
        )
        .await?;

        for (host, replica) in self.destinations.iter() {
            let dst_latest = match get_last_time(
                &*replica.client,
                &self.series,
                Timestamp::ZERO,
                now,
                Timestamp::ZERO,
                &replica.cancel,
            )
            .await
            {
                Ok(ts) => ts,
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    warn!(replica = %host, error = %e, "Failed to read destination cursor");
                    continue;
                }
            };
            replica.cursor.advance(dst_latest);
            let dst_latest = replica.cursor.load();

            debug!(
                replica = %host,
                src_latest = %src_latest,
                dst_latest = %dst_latest,
                "Periodic cursor check"
            );

            if src_latest > dst_latest {
                match migrate(
                    &self.series,
                    host,
                    &*self.src,
                    &*replica.client,
                    &replica.cursor,
                    dst_latest,
                    src_latest,
                    &replica.cancel,
                )
                .await
                {
                    Ok(copied) => {
                        info!(replica = %host, copied, "Periodic migrate complete");
                    }
                    Err(e) if e.is_canceled() => return Err(e),
                    Err(e) => {
                        warn!(replica = %host, error = %e, "Periodic migrate aborted");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Latest timestamp in `[from, to]`, or `empty_default` when the range
/// holds no records.
///
/// The source probe defaults to `to` (nothing to copy, subscribe from
/// now); a destination probe defaults to the epoch so an empty replica
/// reads as maximally behind and the initial backfill covers everything.
async fn get_last_time(
    client: &dyn TimeSeriesClient,
    series: &str,
    from: Timestamp,
    to: Timestamp,
    empty_default: Timestamp,
    cancel: &CancellationToken,
) -> Result<Timestamp> {
    let pack = client
        .query(series, &Query::latest_in(from, to), cancel.clone())
        .await?;
    Ok(pack.latest().unwrap_or(empty_default))
}

/// Submit a replica's buffer as one pack and advance its cursor.
///
/// On failure the buffer is kept intact so the next flush retries the
/// same records (at-least-once).
async fn flush_buffer(series: &str, host: &str, replica: &mut Replica) -> Result<()> {
    if replica.buffer.is_empty() {
        return Ok(());
    }
    let count = replica.buffer.len();
    let latest = replica.buffer.latest();

    replica
        .client
        .submit(&replica.buffer, replica.cancel.clone())
        .await?;

    replica.buffer = Pack::new();
    if let Some(ts) = latest {
        replica.cursor.advance(ts);
        metrics::set_destination_cursor(series, host, replica.cursor.load().to_senml());
    }
    metrics::record_live_records(series, host, count);
    debug!(
        series = %series,
        replica = %host,
        records = count,
        dst_latest = %replica.cursor.load(),
        "Copied records to replica"
    );
    Ok(())
}

/// Catch-up copy for one replica, with the already-updated pre-check.
#[allow(clippy::too_many_arguments)]
async fn backfill(
    series: &str,
    host: &str,
    src: &dyn TimeSeriesClient,
    dst: &dyn TimeSeriesClient,
    cursor: &Cursor,
    from: Timestamp,
    to: Timestamp,
    cancel: &CancellationToken,
) -> Result<usize> {
    // Skip only when a real record at `to` already exists; an empty
    // destination must still be filled.
    let probe = dst
        .query(series, &Query::latest_in(from, to), cancel.clone())
        .await?;
    if probe.latest() == Some(to) {
        debug!(series = %series, replica = %host, "Destination already up to date, skipping backfill");
        return Ok(0);
    }

    migrate(series, host, src, dst, cursor, from, to, cancel).await
}

/// Copy `[from, to]` from the source to one destination via streams.
///
/// Both endpoints are shifted forward one microsecond before the query to
/// compensate for endpoint-inclusive float comparisons server-side.
/// Ascending order; each received pack is pushed onto the destination's
/// submit stream and the cursor advanced to the pack maximum.
#[allow(clippy::too_many_arguments)]
async fn migrate(
    series: &str,
    host: &str,
    src: &dyn TimeSeriesClient,
    dst: &dyn TimeSeriesClient,
    cursor: &Cursor,
    from: Timestamp,
    to: Timestamp,
    cancel: &CancellationToken,
) -> Result<usize> {
    let from = from.saturating_add(Timestamp::MICROSECOND);
    let to = to.saturating_add(Timestamp::MICROSECOND);

    info!(
        series = %series,
        replica = %host,
        from = %from,
        to = %to,
        "Starting migrate"
    );

    let mut sink = dst.create_submit_stream(cancel.clone()).await?;
    let mut source_rx = src
        .query_stream(series, &Query::range_asc(from, to), cancel.clone())
        .await?;

    let mut total = 0usize;
    let mut failure: Option<SyncError> = None;

    while let Some(item) = source_rx.recv().await {
        match item {
            Ok(pack) => {
                if pack.is_empty() {
                    continue;
                }
                if let Err(e) = sink.submit(&pack).await {
                    failure = Some(e);
                    break;
                }
                if let Some(latest) = pack.latest() {
                    cursor.advance(latest);
                }
                total += pack.len();
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    let closed = sink.close().await;

    if let Some(e) = failure {
        return Err(e);
    }
    closed?;

    metrics::record_migrated_records(series, host, total);
    info!(
        series = %series,
        replica = %host,
        migrated = total,
        dst_latest = %cursor.load(),
        "Migrate finished"
    );
    Ok(total)
}
