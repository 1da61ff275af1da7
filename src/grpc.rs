// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! gRPC-backed [`TimeSeriesClient`].
//!
//! Wraps the generated tonic clients for the HDS `Data` and `Registry`
//! services behind the engine's client trait. Server-streaming responses
//! (subscriptions, range-query streams) are pumped into bounded channels
//! by forwarder tasks that observe the caller's cancellation token, so a
//! canceled series never leaves a stream reader running.
//!
//! # Wire times
//!
//! The wire carries SenML decimal seconds with a rolling base-time; records
//! are resolved to absolute integer-nanosecond [`Timestamp`]s on receive
//! and written back fully denormalized (zero base-time) on send.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, ClientTlsConfig};
use tracing::debug;

use crate::client::{Query, SeriesInfo, SubmitStream, TimeSeriesClient};
use crate::error::{Result, SyncError};
use crate::senml::{Pack, Record, Timestamp, Value};

/// Generated protobuf/tonic types for the HDS wire.
pub mod proto {
    tonic::include_proto!("hds");
}

use proto::data_client::DataClient;
use proto::registry_client::RegistryClient;

/// Capacity of the channels fronting server streams. Small: the consumer
/// is the per-series worker, and backpressure onto the wire is desired.
const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Resolve a wire pack to absolute-time records.
///
/// `base_time`, once set on a record, applies to that record and all
/// subsequent records in the pack.
pub(crate) fn pack_from_proto(wire: proto::Pack) -> Pack {
    let mut base = 0.0_f64;
    let mut records = Vec::with_capacity(wire.records.len());
    for r in wire.records {
        if r.base_time != 0.0 {
            base = r.base_time;
        }
        let value = match r.value {
            Some(proto::record::Value::FloatValue(v)) => Value::Float(v),
            Some(proto::record::Value::StringValue(v)) => Value::String(v),
            Some(proto::record::Value::BoolValue(v)) => Value::Bool(v),
            Some(proto::record::Value::DataValue(v)) => Value::Data(v),
            None => Value::default(),
        };
        records.push(Record {
            name: r.name,
            time: Timestamp::from_senml(base + r.time),
            unit: if r.unit.is_empty() { None } else { Some(r.unit) },
            value,
        });
    }
    Pack::from_records(records)
}

/// Serialize a pack with absolute per-record times (no base compression).
pub(crate) fn pack_to_proto(pack: &Pack) -> proto::Pack {
    let records = pack
        .records()
        .iter()
        .map(|r| proto::Record {
            base_time: 0.0,
            name: r.name.clone(),
            time: r.time.to_senml(),
            unit: r.unit.clone().unwrap_or_default(),
            value: Some(match &r.value {
                Value::Float(v) => proto::record::Value::FloatValue(*v),
                Value::String(v) => proto::record::Value::StringValue(v.clone()),
                Value::Bool(v) => proto::record::Value::BoolValue(*v),
                Value::Data(v) => proto::record::Value::DataValue(v.clone()),
            }),
        })
        .collect();
    proto::Pack { records }
}

fn query_to_proto(series: &str, query: &Query) -> proto::QueryRequest {
    proto::QueryRequest {
        series: series.to_string(),
        from: query.from.to_senml(),
        to: query.to.to_senml(),
        limit: query.limit.unwrap_or(0) as u32,
        sort_asc: query.sort_asc,
        denormalize: query.denormalize.bits(),
    }
}

/// A `TimeSeriesClient` talking gRPC to one HDS host.
///
/// Cloning is cheap: tonic clients multiplex over the shared channel.
#[derive(Clone)]
pub struct GrpcTimeSeriesClient {
    host: String,
    data: DataClient<Channel>,
    registry: RegistryClient<Channel>,
}

impl GrpcTimeSeriesClient {
    /// Dial a host with the given TLS configuration.
    ///
    /// `host` is `host[:port]`; the scheme is always `https` since every
    /// HDS endpoint speaks mTLS.
    pub async fn connect(host: &str, tls: ClientTlsConfig) -> Result<Self> {
        let uri = format!("https://{}", host);
        let channel = Channel::from_shared(uri.clone())
            .map_err(|e| SyncError::Config(format!("invalid endpoint {}: {}", uri, e)))?
            .tls_config(tls)
            .map_err(|e| SyncError::Config(format!("tls config for {}: {}", host, e)))?
            .connect()
            .await
            .map_err(|e| SyncError::transport_msg("Dial", format!("{}: {}", host, e)))?;

        debug!(host = %host, "Connected gRPC channel");
        Ok(Self::from_channel(host, channel))
    }

    /// Wrap an already-established channel (plaintext test servers).
    pub fn from_channel(host: &str, channel: Channel) -> Self {
        Self {
            host: host.to_string(),
            data: DataClient::new(channel.clone()),
            registry: RegistryClient::new(channel),
        }
    }

    /// The host this client is bound to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Pump a server stream into a channel until it ends, errors, or the
    /// token fires. A transport error is delivered as the final item.
    fn spawn_forwarder(
        mut stream: tonic::Streaming<proto::Pack>,
        cancel: CancellationToken,
        operation: &'static str,
    ) -> mpsc::Receiver<Result<Pack>> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = stream.message() => message,
                };
                match message {
                    Ok(Some(wire)) => {
                        if tx.send(Ok(pack_from_proto(wire))).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        let _ = tx.send(Err(SyncError::from_status(operation, status))).await;
                        break;
                    }
                }
            }
        });
        rx
    }
}

#[async_trait::async_trait]
impl TimeSeriesClient for GrpcTimeSeriesClient {
    async fn subscribe(
        &self,
        series: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<Pack>>> {
        let mut data = self.data.clone();
        let request = proto::SubscribeRequest {
            series: series.to_string(),
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Canceled),
            response = data.subscribe(request) => response,
        };
        let stream = response
            .map_err(|s| SyncError::from_status("Subscribe", s))?
            .into_inner();
        Ok(Self::spawn_forwarder(stream, cancel, "Subscribe"))
    }

    async fn query(&self, series: &str, query: &Query, cancel: CancellationToken) -> Result<Pack> {
        let mut data = self.data.clone();
        let request = query_to_proto(series, query);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Canceled),
            response = data.query(request) => response,
        };
        let wire = response
            .map_err(|s| SyncError::from_status("Query", s))?
            .into_inner();
        Ok(pack_from_proto(wire))
    }

    async fn query_stream(
        &self,
        series: &str,
        query: &Query,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Result<Pack>>> {
        let mut data = self.data.clone();
        let request = query_to_proto(series, query);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Canceled),
            response = data.query_stream(request) => response,
        };
        let stream = response
            .map_err(|s| SyncError::from_status("QueryStream", s))?
            .into_inner();
        Ok(Self::spawn_forwarder(stream, cancel, "QueryStream"))
    }

    async fn submit(&self, pack: &Pack, cancel: CancellationToken) -> Result<()> {
        let mut data = self.data.clone();
        let request = pack_to_proto(pack);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Canceled),
            response = data.submit(request) => response,
        };
        response.map_err(|s| SyncError::from_status("Submit", s))?;
        Ok(())
    }

    async fn create_submit_stream(
        &self,
        cancel: CancellationToken,
    ) -> Result<Box<dyn SubmitStream>> {
        let mut data = self.data.clone();
        let (tx, rx) = mpsc::channel::<proto::Pack>(STREAM_CHANNEL_CAPACITY);

        // The RPC future resolves once the request stream is closed and the
        // server acknowledges; `close()` joins it for the final verdict.
        let call = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(SyncError::Canceled),
                response = data.submit_stream(ReceiverStream::new(rx)) => response
                    .map(|_| ())
                    .map_err(|s| SyncError::from_status("SubmitStream", s)),
            }
        });

        Ok(Box::new(GrpcSubmitStream { tx: Some(tx), call }))
    }

    async fn registry_get_many(
        &self,
        page: usize,
        per_page: usize,
        cancel: CancellationToken,
    ) -> Result<(Vec<SeriesInfo>, usize)> {
        let mut registry = self.registry.clone();
        let request = proto::GetManyRequest {
            page: page as u32,
            per_page: per_page as u32,
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Canceled),
            response = registry.get_many(request) => response,
        };
        let inner = response
            .map_err(|s| SyncError::from_status("GetMany", s))?
            .into_inner();
        let series = inner
            .series
            .into_iter()
            .map(|d| SeriesInfo {
                name: d.name,
                unit: if d.unit.is_empty() { None } else { Some(d.unit) },
                value_type: if d.value_type.is_empty() {
                    None
                } else {
                    Some(d.value_type)
                },
            })
            .collect();
        Ok((series, inner.total as usize))
    }

    async fn registry_add(&self, series: &SeriesInfo, cancel: CancellationToken) -> Result<()> {
        let mut registry = self.registry.clone();
        let request = proto::SeriesDescriptor {
            name: series.name.clone(),
            unit: series.unit.clone().unwrap_or_default(),
            value_type: series.value_type.clone().unwrap_or_default(),
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Canceled),
            response = registry.add(request) => response,
        };
        response.map_err(|s| SyncError::from_status("Add", s))?;
        Ok(())
    }
}

/// Handle for an open client-streaming submit.
struct GrpcSubmitStream {
    tx: Option<mpsc::Sender<proto::Pack>>,
    call: tokio::task::JoinHandle<Result<()>>,
}

#[async_trait::async_trait]
impl SubmitStream for GrpcSubmitStream {
    async fn submit(&mut self, pack: &Pack) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SyncError::Internal("submit on closed stream".to_string()))?;
        tx.send(pack_to_proto(pack))
            .await
            .map_err(|_| SyncError::transport_msg("SubmitStream", "stream closed by server"))
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        // Dropping the sender ends the request stream; the call future then
        // resolves with the server's acknowledgement.
        self.tx.take();
        match self.call.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::Internal(format!("submit stream task: {}", e))),
        }
    }
}
