// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-replica synchronization state.
//!
//! Each (series, replica) pair carries a destination cursor, a backfill
//! gate, and a buffer of live records awaiting the gate. The cursor and
//! gate are shared with the backfill task; the buffer belongs to the
//! supervisor alone.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::client::TimeSeriesClient;
use crate::senml::{Pack, Timestamp};

/// A monotone destination cursor: the latest timestamp confirmed written.
///
/// Advancing is a `fetch_max`, so the cursor never decreases regardless of
/// which task (live path or backfill) observes a write first.
#[derive(Debug, Default)]
pub struct Cursor(AtomicI64);

impl Cursor {
    pub fn new(ts: Timestamp) -> Self {
        Cursor(AtomicI64::new(ts.as_nanos()))
    }

    /// Current cursor value.
    pub fn load(&self) -> Timestamp {
        Timestamp::from_nanos(self.0.load(Ordering::Acquire))
    }

    /// Advance to `ts` if it is later than the current value.
    pub fn advance(&self, ts: Timestamp) {
        self.0.fetch_max(ts.as_nanos(), Ordering::AcqRel);
    }
}

/// Non-reentrancy gate for backfills.
///
/// At most one backfill runs per (series, replica) at any instant; a
/// second start attempt is a no-op. While the gate is closed, live records
/// for the replica are buffered instead of forwarded.
#[derive(Debug, Default)]
pub struct BackfillGate {
    running: AtomicBool,
}

impl BackfillGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate. Returns `false` if a backfill is already running.
    pub fn try_start(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the gate when the backfill exits.
    pub fn finish(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// True while a backfill holds the gate.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// State for one destination replica of one series.
///
/// Owned by the synchronizer's supervisor task; the `Arc`ed pieces are
/// shared with the backfill task spawned for this replica.
pub(crate) struct Replica {
    /// Destination client, shared via the connection pool.
    pub client: Arc<dyn TimeSeriesClient>,
    /// Latest timestamp confirmed written to this replica.
    pub cursor: Arc<Cursor>,
    /// Backfill non-reentrancy gate.
    pub gate: Arc<BackfillGate>,
    /// Child of the synchronizer's token; canceling it aborts this
    /// replica's in-flight streams without touching its peers.
    pub cancel: CancellationToken,
    /// Live records received while the gate was closed, or left over from
    /// a failed submit; flushed as one pack.
    pub buffer: Pack,
}

impl Replica {
    pub fn new(client: Arc<dyn TimeSeriesClient>, parent: &CancellationToken) -> Self {
        Self {
            client,
            cursor: Arc::new(Cursor::new(Timestamp::ZERO)),
            gate: Arc::new(BackfillGate::new()),
            cancel: parent.child_token(),
            buffer: Pack::new(),
        }
    }
}
