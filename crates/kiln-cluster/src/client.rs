//! gRPC runner client — the lb side of the submit protocol.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, warn};

use kiln_core::{ApiError, ApiResult};
use kiln_placement::{Runner, RunnerCall};

use crate::proto;
use crate::proto::runner_protocol_client::RunnerProtocolClient;

/// Request body frames are chunked to this size.
const DATA_CHUNK: usize = 64 * 1024;

/// One pure-runner endpoint reachable over gRPC.
pub struct GrpcRunner {
    address: String,
    tls: Option<ClientTlsConfig>,
    /// Lazily established, reused across calls.
    client: Mutex<Option<RunnerProtocolClient<Channel>>>,
}

impl GrpcRunner {
    pub fn new(address: &str, tls: Option<ClientTlsConfig>) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            tls,
            client: Mutex::new(None),
        })
    }

    async fn connect(&self) -> ApiResult<RunnerProtocolClient<Channel>> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", self.address))
            .map_err(|e| ApiError::Validation(format!("bad runner address: {e}")))?;
        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|e| ApiError::Internal(format!("runner tls: {e}")))?;
        }
        let channel = endpoint.connect().await.map_err(|e| {
            debug!(runner = %self.address, error = %e, "runner unreachable");
            // An unreachable runner is a placement detail, not a call
            // failure; let the placer rotate.
            ApiError::ResourceUnavailable
        })?;
        let client = RunnerProtocolClient::new(channel);
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn drop_connection(&self) {
        *self.client.lock().await = None;
    }
}

#[async_trait]
impl Runner for GrpcRunner {
    fn address(&self) -> &str {
        &self.address
    }

    async fn try_exec(&self, call: &dyn RunnerCall) -> ApiResult<bool> {
        let mut client = self.connect().await?;

        let deadline_ms = call
            .deadline()
            .saturating_duration_since(Instant::now())
            .as_millis() as u64;

        // Outbound: header frame, then chunked body, then eof.
        let (tx, rx) = tokio::sync::mpsc::channel::<proto::ClientMsg>(16);
        let header = proto::ClientMsg {
            body: Some(proto::client_msg::Body::TryCall(proto::TryCall {
                metadata_json: call.metadata_json(),
                slot_key: call.slot_key().to_string(),
                deadline_ms,
            })),
        };
        let input = call.input();
        let feeder = tokio::spawn(async move {
            if tx.send(header).await.is_err() {
                return;
            }
            let chunks: Vec<Vec<u8>> = if input.is_empty() {
                vec![Vec::new()]
            } else {
                input.chunks(DATA_CHUNK).map(|c| c.to_vec()).collect()
            };
            let last = chunks.len() - 1;
            for (i, data) in chunks.into_iter().enumerate() {
                let frame = proto::ClientMsg {
                    body: Some(proto::client_msg::Body::Data(proto::DataFrame {
                        data,
                        eof: i == last,
                    })),
                };
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
        });

        let outcome = self
            .engage_stream(&mut client, ReceiverStream::new(rx), call)
            .await;
        feeder.abort();

        if matches!(outcome, Err(ApiError::Upstream(_))) {
            // Stream-level failure; force a reconnect next time.
            self.drop_connection().await;
        }
        outcome
    }
}

impl GrpcRunner {
    async fn engage_stream(
        &self,
        client: &mut RunnerProtocolClient<Channel>,
        outbound: ReceiverStream<proto::ClientMsg>,
        call: &dyn RunnerCall,
    ) -> ApiResult<bool> {
        let mut inbound = client
            .engage(outbound)
            .await
            .map_err(|e| {
                warn!(runner = %self.address, error = %e, "engage failed");
                ApiError::Upstream(format!("runner {}: {e}", self.address))
            })?
            .into_inner();

        // Acknowledgement first.
        match next_body(&mut inbound, &self.address).await? {
            proto::runner_msg::Body::Acknowledged(ack) => {
                if !ack.committed {
                    debug!(runner = %self.address, reason = %ack.details, "call rejected");
                    return Ok(false);
                }
            }
            _ => {
                return Err(ApiError::Upstream(format!(
                    "runner {} skipped acknowledgement",
                    self.address
                )))
            }
        }

        // Header, data frames, trailer.
        let mut status: u16 = 200;
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut body = BytesMut::new();
        loop {
            match next_body(&mut inbound, &self.address).await? {
                proto::runner_msg::Body::Header(header) => {
                    status = u16::try_from(header.status_code).unwrap_or(502);
                    headers = header
                        .headers
                        .into_iter()
                        .map(|p| (p.key, p.value))
                        .collect();
                }
                proto::runner_msg::Body::Data(data) => {
                    body.extend_from_slice(&data.data);
                }
                proto::runner_msg::Body::Finished(finished) => {
                    if finished.success {
                        call.respond(status, headers, body.freeze()).await?;
                        return Ok(true);
                    }
                    return Err(kind_to_error(&finished.details));
                }
                proto::runner_msg::Body::Acknowledged(_) => {
                    return Err(ApiError::Upstream(format!(
                        "runner {} repeated acknowledgement",
                        self.address
                    )))
                }
            }
        }
    }
}

async fn next_body(
    inbound: &mut tonic::Streaming<proto::RunnerMsg>,
    address: &str,
) -> ApiResult<proto::runner_msg::Body> {
    match inbound.message().await {
        Ok(Some(proto::RunnerMsg { body: Some(body) })) => Ok(body),
        Ok(Some(proto::RunnerMsg { body: None })) | Ok(None) => Err(ApiError::Upstream(
            format!("runner {address} closed the stream early"),
        )),
        Err(status) => Err(ApiError::Upstream(format!(
            "runner {address} stream error: {status}"
        ))),
    }
}

/// Map a Finished trailer's error kind back into the taxonomy the
/// placer understands.
fn kind_to_error(kind: &str) -> ApiError {
    match kind {
        "resource-unavailable" => ApiError::ResourceUnavailable,
        "slot-timeout" => ApiError::SlotTimeout,
        "deadline-exceeded" => ApiError::DeadlineExceeded,
        "node-draining" => ApiError::NodeDraining,
        "function-error" => ApiError::FunctionError { exit: -1 },
        "container-error" => ApiError::ContainerError("reported by runner".into()),
        other => ApiError::Upstream(format!("runner failure: {other}")),
    }
}
