//! Pure-runner gRPC service.
//!
//! Holds no catalog: the TryCall header frame is trusted as resolved
//! metadata. The server enforces only its own capacity and the call
//! deadline. Rejections happen before any allocation so an lb can
//! immediately try another runner.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use kiln_agent::{Agent, CallMetadata, Invocation, NodeAgent};
use kiln_core::ApiError;
use kiln_pool::{SlotKey, SlotPool};

use crate::proto;
use crate::proto::runner_protocol_server::{RunnerProtocol, RunnerProtocolServer};

/// Response body frames are chunked to this size.
const DATA_CHUNK: usize = 64 * 1024;

/// gRPC implementation of the submit protocol.
pub struct PureRunnerServer {
    agent: Arc<NodeAgent>,
    pool: Arc<SlotPool>,
    /// Trips the node's cancellation fan-in on fatal server errors.
    fatal: watch::Sender<bool>,
}

impl PureRunnerServer {
    pub fn new(agent: Arc<NodeAgent>, pool: Arc<SlotPool>) -> (Self, watch::Receiver<bool>) {
        let (fatal, fatal_rx) = watch::channel(false);
        (Self { agent, pool, fatal }, fatal_rx)
    }

    pub fn into_service(self) -> RunnerProtocolServer<Self> {
        RunnerProtocolServer::new(self)
    }

    /// Signal the node that the grpc server hit an unrecoverable error.
    pub fn fatal_handle(&self) -> watch::Sender<bool> {
        self.fatal.clone()
    }
}

#[tonic::async_trait]
impl RunnerProtocol for PureRunnerServer {
    type EngageStream = ReceiverStream<Result<proto::RunnerMsg, Status>>;

    async fn engage(
        &self,
        request: Request<Streaming<proto::ClientMsg>>,
    ) -> Result<Response<Self::EngageStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<Result<proto::RunnerMsg, Status>>(16);

        let agent = self.agent.clone();
        let pool = self.pool.clone();

        tokio::spawn(async move {
            if let Err(status) = engage_one(agent, pool, &mut inbound, &tx).await {
                let _ = tx.send(Err(status)).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn status(
        &self,
        _request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::RunnerStatus>, Status> {
        Ok(Response::new(proto::RunnerStatus {
            free_memory_mb: self.pool.free_memory_mb().await,
            active_slots: self.pool.live_slots().await as u64,
        }))
    }
}

/// Drive one invocation stream to completion.
async fn engage_one(
    agent: Arc<NodeAgent>,
    pool: Arc<SlotPool>,
    inbound: &mut Streaming<proto::ClientMsg>,
    tx: &mpsc::Sender<Result<proto::RunnerMsg, Status>>,
) -> Result<(), Status> {
    // 1. Header frame.
    let try_call = match inbound.message().await? {
        Some(proto::ClientMsg {
            body: Some(proto::client_msg::Body::TryCall(tc)),
        }) => tc,
        _ => return Err(Status::invalid_argument("first frame must be TryCall")),
    };

    let metadata: CallMetadata = serde_json::from_str(&try_call.metadata_json)
        .map_err(|e| Status::invalid_argument(format!("bad metadata: {e}")))?;
    let slot_key = SlotKey::from_wire(try_call.slot_key.clone());
    let deadline = Instant::now() + Duration::from_millis(try_call.deadline_ms);

    // 2. Capacity gate, before any allocation.
    if !pool.can_admit(&slot_key, metadata.memory_mb).await {
        debug!(call_id = %metadata.call.id, "rejecting call, no capacity");
        send_msg(
            tx,
            proto::runner_msg::Body::Acknowledged(proto::Acknowledged {
                committed: false,
                details: ApiError::ResourceUnavailable.kind().to_string(),
            }),
        )
        .await?;
        return Ok(());
    }
    send_msg(
        tx,
        proto::runner_msg::Body::Acknowledged(proto::Acknowledged {
            committed: true,
            details: String::new(),
        }),
    )
    .await?;

    // 3. Body frames until eof, bounded by the deadline.
    let mut input = BytesMut::new();
    loop {
        let frame = tokio::time::timeout_at(deadline, inbound.message())
            .await
            .map_err(|_| Status::deadline_exceeded("deadline elapsed reading body"))??;
        match frame {
            Some(proto::ClientMsg {
                body: Some(proto::client_msg::Body::Data(data)),
            }) => {
                input.extend_from_slice(&data.data);
                if data.eof {
                    break;
                }
            }
            Some(_) => return Err(Status::invalid_argument("expected Data frame")),
            // Client went away mid-body: nothing started, nothing to undo.
            None => return Ok(()),
        }
    }

    // 4. Run it. The cancel token trips if the outbound stream dies
    // (client disconnected) — agent suspension points observe it.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let call_id = metadata.call.id.clone();
    let invocation = Invocation {
        slot_key,
        deadline,
        cancel: cancel_rx,
        input: input.freeze(),
        metadata,
    };

    let watchdog = {
        let tx = tx.clone();
        tokio::spawn(async move {
            tx.closed().await;
            let _ = cancel_tx.send(true);
        })
    };

    let outcome = agent.submit(invocation).await;
    watchdog.abort();

    // 5. Stream the result back.
    match outcome {
        Ok(result) => {
            send_msg(
                tx,
                proto::runner_msg::Body::Header(proto::ResultHeader {
                    status_code: i32::from(result.status),
                    headers: result
                        .headers
                        .iter()
                        .map(|(k, v)| proto::HeaderPair {
                            key: k.clone(),
                            value: v.clone(),
                        })
                        .collect(),
                }),
            )
            .await?;

            for chunk in result.body.chunks(DATA_CHUNK) {
                send_msg(
                    tx,
                    proto::runner_msg::Body::Data(proto::DataFrame {
                        data: chunk.to_vec(),
                        eof: false,
                    }),
                )
                .await?;
            }

            let usage = result.call.stats.as_ref().map(|s| proto::CallUsage {
                memory_mb: s.memory_mb,
                cpu_shares: s.cpu_shares,
                duration_ms: s.duration_ms,
            });
            send_msg(
                tx,
                proto::runner_msg::Body::Finished(proto::Finished {
                    success: true,
                    details: String::new(),
                    usage,
                }),
            )
            .await?;
            debug!(call_id = %call_id, "call finished");
        }
        Err(err) => {
            warn!(call_id = %call_id, error = %err, "call failed on runner");
            send_msg(
                tx,
                proto::runner_msg::Body::Finished(proto::Finished {
                    success: false,
                    details: err.kind().to_string(),
                    usage: None,
                }),
            )
            .await?;
        }
    }
    Ok(())
}

async fn send_msg(
    tx: &mpsc::Sender<Result<proto::RunnerMsg, Status>>,
    body: proto::runner_msg::Body,
) -> Result<(), Status> {
    tx.send(Ok(proto::RunnerMsg { body: Some(body) }))
        .await
        .map_err(|_| Status::cancelled("client closed the stream"))
}

/// Serve the protocol on `addr` until `shutdown` trips. Fatal bind or
/// serve errors flip the server's fatal channel so the node exits.
pub async fn serve(
    server: PureRunnerServer,
    addr: std::net::SocketAddr,
    tls: Option<tonic::transport::ServerTlsConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let fatal = server.fatal_handle();
    info!(%addr, "pure-runner grpc server starting");

    let mut builder = tonic::transport::Server::builder();
    if let Some(tls) = tls {
        builder = match builder.tls_config(tls) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "invalid grpc tls configuration");
                let _ = fatal.send(true);
                return;
            }
        };
    }

    let result = builder
        .add_service(server.into_service())
        .serve_with_shutdown(addr, async {
            let _ = shutdown.changed().await;
        })
        .await;

    if let Err(e) = result {
        warn!(error = %e, "pure-runner grpc server failed");
        let _ = fatal.send(true);
    } else {
        info!("pure-runner grpc server stopped");
    }
}
