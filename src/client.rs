//! Historical data store client traits.
//!
//! Defines the capability set the engine needs from an HDS endpoint, for
//! both the source and the destination side. The gRPC implementation lives
//! in [`crate::grpc`]; tests drive the engine through in-memory mocks.
//!
//! All operations take the caller's [`CancellationToken`]; implementations
//! must abort in-flight work when it fires and surface
//! [`SyncError::Canceled`](crate::error::SyncError::Canceled).
//!
//! # Streams
//!
//! `subscribe` and `query_stream` return an [`mpsc::Receiver`] of
//! `Result<Pack>`: a transport failure is delivered as the final `Err`
//! item, after which the channel closes. Ordering within a stream is the
//! order received on the wire; no ordering holds between a subscription
//! and a concurrent range query.
//!
//! # Idempotence
//!
//! `submit` is assumed idempotent with respect to identical
//! `(series, timestamp, value)` triples: the destination deduplicates or
//! overwrites. The engine relies on this to resolve the overlap between a
//! backfill and the live subscription.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::senml::{Pack, Timestamp};

/// Denormalization mask for range queries.
///
/// Tells the server which per-record fields to materialize instead of
/// leaving them base-value-compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DenormMask(u32);

impl DenormMask {
    pub const NONE: DenormMask = DenormMask(0);
    pub const NAME: DenormMask = DenormMask(1);
    pub const TIME: DenormMask = DenormMask(2);
    pub const UNIT: DenormMask = DenormMask(4);

    /// Combine masks.
    pub const fn with(self, other: DenormMask) -> DenormMask {
        DenormMask(self.0 | other.0)
    }

    /// Raw wire value.
    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// A bounded range query against one series.
#[derive(Debug, Clone)]
pub struct Query {
    /// Inclusive lower bound.
    pub from: Timestamp,
    /// Inclusive upper bound.
    pub to: Timestamp,
    /// Maximum records to return; `None` means unlimited.
    pub limit: Option<usize>,
    /// Ascending time order when true, descending otherwise.
    pub sort_asc: bool,
    /// Fields to denormalize in the response.
    pub denormalize: DenormMask,
}

impl Query {
    /// The cursor probe: latest single record in `[from, to]`.
    pub fn latest_in(from: Timestamp, to: Timestamp) -> Self {
        Self {
            from,
            to,
            limit: Some(1),
            sort_asc: false,
            denormalize: DenormMask::NONE,
        }
    }

    /// An ascending full-range read for migration, with name, time and
    /// unit denormalized so every record stands alone.
    pub fn range_asc(from: Timestamp, to: Timestamp) -> Self {
        Self {
            from,
            to,
            limit: None,
            sort_asc: true,
            denormalize: DenormMask::NAME.with(DenormMask::TIME).with(DenormMask::UNIT),
        }
    }
}

/// A registry descriptor for one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesInfo {
    /// Series name; unique within an HDS, doubles as the subscription topic.
    pub name: String,
    /// Optional unit.
    pub unit: Option<String>,
    /// Optional declared value type.
    pub value_type: Option<String>,
}

impl SeriesInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: None,
            value_type: None,
        }
    }
}

/// A handle to an open chunked-submit stream on a destination.
#[async_trait]
pub trait SubmitStream: Send {
    /// Submit one pack on the stream.
    async fn submit(&mut self, pack: &Pack) -> Result<()>;

    /// Close the stream and wait for the server's acknowledgement.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// The capability set the engine needs from an HDS endpoint.
///
/// One instance per host, shared across every series that targets that
/// host (see [`crate::pool::ConnectionPool`]).
#[async_trait]
pub trait TimeSeriesClient: Send + Sync {
    /// Open a live subscription for a series.
    ///
    /// The receiver yields packs as the source publishes them and closes
    /// on cancel or after delivering a transport error.
    async fn subscribe(
        &self,
        series: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<Pack>>>;

    /// Materialize a bounded range query.
    async fn query(&self, series: &str, query: &Query, cancel: CancellationToken) -> Result<Pack>;

    /// Stream a bounded range query, pack by pack.
    async fn query_stream(
        &self,
        series: &str,
        query: &Query,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<Pack>>>;

    /// Submit one pack (unary). Idempotent on identical records.
    async fn submit(&self, pack: &Pack, cancel: CancellationToken) -> Result<()>;

    /// Open a chunked submit stream.
    async fn create_submit_stream(&self, cancel: CancellationToken) -> Result<Box<dyn SubmitStream>>;

    /// Page through the registry. Returns the page of descriptors and the
    /// total number of series known to the server.
    async fn registry_get_many(
        &self,
        page: usize,
        per_page: usize,
        cancel: CancellationToken,
    ) -> Result<(Vec<SeriesInfo>, usize)>;

    /// Create a series in the registry.
    ///
    /// Surfaces [`SyncError::AlreadyExists`](crate::error::SyncError::AlreadyExists)
    /// when the series is present; callers treat that as success.
    async fn registry_add(&self, series: &SeriesInfo, cancel: CancellationToken) -> Result<()>;
}
