//! # HDS Sync
//!
//! A per-series synchronization engine that mirrors time-series
//! measurements from a source historical data store (HDS) to one or more
//! destination replicas, with near-real-time freshness while the source
//! is reachable and automatic catch-up after either end was not.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              hds-sync                                │
//! │                                                                      │
//! │  ┌─────────────────┐    ┌────────────┐    ┌───────────────────────┐  │
//! │  │ TopologyWatcher │───►│ Controller │───►│ Synchronizer (1/series)│ │
//! │  │ (TDD polling)   │    │ (SyncMap)  │    │ live + backfill merge │  │
//! │  └─────────────────┘    └─────┬──────┘    └──────────┬────────────┘  │
//! │                               │                      │               │
//! │                               ▼                      ▼               │
//! │  ┌──────────────────┐   ┌────────────────┐   ┌──────────────────┐    │
//! │  │ CertificateProv. │──►│ ConnectionPool │──►│ TimeSeriesClient │    │
//! │  │ (static / CSR)   │   │ (1 client/host)│   │ (gRPC, mTLS)     │    │
//! │  └──────────────────┘   └────────────────┘   └──────────────────┘    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two-Path Synchronization
//!
//! 1. **Live path**: a long-lived gRPC subscription per series forwards
//!    packs to every replica as they arrive.
//! 2. **Backfill path**: a bounded range query copies `[dst_latest,
//!    src_latest]` through a streaming submit whenever a replica is
//!    behind; live records are buffered per replica until its backfill
//!    completes.
//!
//! Delivery is at-least-once; destinations deduplicate on
//! `(series, timestamp, value)`. At steady state the destination cursor
//! of every replica equals the source cursor.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use hds_sync::sync::Synchronizer;
//! # async fn example(src: Arc<dyn hds_sync::client::TimeSeriesClient>,
//! #                  dst: Arc<dyn hds_sync::client::TimeSeriesClient>) {
//! let mut destinations: HashMap<String, Arc<dyn hds_sync::client::TimeSeriesClient>> =
//!     HashMap::new();
//! destinations.insert("hds-b:8088".to_string(), dst);
//!
//! // Continuous mode: live subscription plus backfill.
//! let sync = Synchronizer::spawn("kitchen/temp", src, destinations, None);
//! // ... later:
//! sync.stop().await;
//! # }
//! ```

pub mod certs;
pub mod client;
pub mod config;
pub mod error;
pub mod grpc;
pub mod metrics;
pub mod pool;
pub mod senml;
pub mod sync;
pub mod topology;

// Re-exports for convenience
pub use client::{DenormMask, Query, SeriesInfo, SubmitStream, TimeSeriesClient};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use pool::{ConnectionPool, Connector, GrpcConnector};
pub use senml::{Pack, Record, Timestamp, Value};
pub use sync::{Controller, Synchronizer};
pub use topology::TopologyWatcher;
