//! Role assembly and node lifecycle.
//!
//! Each role builds exactly the components its `NodeRole` variant
//! carries, mounts the matching routers, and hands everything to the
//! shared serve loop. Shutdown is a fan-in: OS signals and any
//! registered subsystem cancellation close one done-channel, after
//! which the node stops HTTP intake, closes the agent (draining the
//! slot pool), and exits.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::sync::watch;
use tracing::{info, warn};

use kiln_agent::{run_async_worker, Agent, LbAgent, NodeAgent};
use kiln_api::{
    admin_router, cache_admin_router, catalog_router, cors_layer, invoke_router, ping_router,
    AdminState, CatalogState, InvokeState, RequestBasedAnnotator, StaticUrlAnnotator,
    TriggerAnnotator,
};
use kiln_cluster::{server as grpc_server, PureRunnerServer, StaticRunnerPool, TlsMaterial};
use kiln_dataaccess::{CachedAccess, DataAccess, DirectAccess, HybridClient, NopAccess};
use kiln_metrics::Registry;
use kiln_placement::{ChPlacer, NaivePlacer, Placer, RunnerPool};
use kiln_pool::{PoolConfig, ProcessDriver, SlotPool};
use kiln_state::{LogStore, MessageQueue};

use crate::config::{CommonConfig, ExecConfig, NodeRole, PlacerKind, TlsPaths};

/// Everything the serve loop needs from a role.
struct NodeParts {
    node_type: &'static str,
    main_router: Router,
    metrics: Arc<Registry>,
    agent: Option<Arc<dyn Agent>>,
    /// Additional cancellation sources (e.g. the grpc server's fatal
    /// channel); any of them stops the node.
    extra_cancel: Vec<watch::Receiver<bool>>,
}

pub async fn run(common: CommonConfig, role: NodeRole) -> anyhow::Result<()> {
    if let Some(url) = &common.zipkin_url {
        info!(%url, "zipkin collector configured; span export is handled externally");
    }
    if let Some(url) = &common.jaeger_url {
        info!(%url, "jaeger collector configured; span export is handled externally");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx.clone());

    let parts = match role {
        NodeRole::Full {
            db_url,
            logstore_url,
            mq_url,
            public_lb_url,
            exec,
        } => build_full(&common, &db_url, logstore_url.as_deref(), &mq_url, public_lb_url, exec, &shutdown_rx)?,
        NodeRole::Api {
            db_url,
            logstore_url,
            mq_url,
            public_lb_url,
        } => build_api(&common, &db_url, logstore_url.as_deref(), &mq_url, public_lb_url)?,
        NodeRole::Lb {
            runner_api_url,
            runner_addresses,
            placer,
            tls,
        } => build_lb(&common, &runner_api_url, &runner_addresses, placer, tls)?,
        NodeRole::Runner {
            runner_api_url,
            exec,
        } => build_runner(&common, &runner_api_url, exec, &shutdown_rx)?,
        NodeRole::PureRunner {
            grpc_port,
            tls,
            exec,
        } => build_pure_runner(&common, grpc_port, tls, exec, &shutdown_rx)?,
    };

    serve(common, parts, shutdown_tx, shutdown_rx).await
}

// ── Role builders ──────────────────────────────────────────────

fn annotator_for(public_lb_url: Option<String>) -> Arc<dyn TriggerAnnotator> {
    match public_lb_url {
        Some(base) => {
            info!(%base, "trigger urls use the static lb base");
            Arc::new(StaticUrlAnnotator::new(&base))
        }
        None => Arc::new(RequestBasedAnnotator),
    }
}

fn build_exec(
    exec: &ExecConfig,
    metrics: &Arc<Registry>,
) -> anyhow::Result<Arc<SlotPool>> {
    let driver = Arc::new(ProcessDriver::new(&exec.container_supervisor)?);
    info!(
        supervisor = %exec.container_supervisor,
        memory_mb = exec.capacity_memory_mb,
        cpu_shares = exec.capacity_cpu_shares,
        "container slot pool configured"
    );
    Ok(SlotPool::new(
        driver,
        PoolConfig {
            capacity_memory_mb: exec.capacity_memory_mb,
            capacity_cpu_shares: exec.capacity_cpu_shares,
            ..PoolConfig::default()
        },
        metrics.clone(),
    ))
}

fn open_stores(
    db_url: &str,
    logstore_url: Option<&str>,
) -> anyhow::Result<(Arc<kiln_state::RedbStore>, Arc<dyn LogStore>)> {
    if let Some(parent) = db_url
        .strip_prefix("redb://")
        .and_then(|p| std::path::Path::new(p).parent().map(|d| d.to_path_buf()))
    {
        std::fs::create_dir_all(&parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let ds = kiln_state::datastore_from_url(db_url)?;
    let ls: Arc<dyn LogStore> = match logstore_url {
        // The datastore satisfies the log-store capability; a distinct
        // url gets its own store.
        Some(url) => kiln_state::datastore_from_url(url)?,
        None => ds.clone(),
    };
    Ok((ds, ls))
}

fn build_full(
    common: &CommonConfig,
    db_url: &str,
    logstore_url: Option<&str>,
    mq_url: &str,
    public_lb_url: Option<String>,
    exec: ExecConfig,
    shutdown_rx: &watch::Receiver<bool>,
) -> anyhow::Result<NodeParts> {
    let (ds, ls) = open_stores(db_url, logstore_url)?;
    let mq: Arc<dyn MessageQueue> = kiln_state::queue_from_url(mq_url)?;

    let metrics = Registry::new();
    let da: Arc<dyn DataAccess> = Arc::new(CachedAccess::new(DirectAccess::new(
        ds.clone(),
        ls.clone(),
        mq.clone(),
    )));
    let pool = build_exec(&exec, &metrics)?;
    let agent = NodeAgent::new(pool, da.clone(), metrics.clone());

    tokio::spawn(run_async_worker(
        agent.clone(),
        da.clone(),
        shutdown_rx.clone(),
    ));

    let catalog = catalog_router(CatalogState {
        datastore: ds,
        logstore: ls,
        queue: mq,
        annotator: annotator_for(public_lb_url),
    });
    let invoke = invoke_router(InvokeState {
        da,
        agent: agent.clone(),
        rid_header: common.rid_header.clone(),
    });

    Ok(NodeParts {
        node_type: "full",
        main_router: ping_router().merge(catalog).merge(invoke),
        metrics,
        agent: Some(agent),
        extra_cancel: Vec::new(),
    })
}

fn build_api(
    common: &CommonConfig,
    db_url: &str,
    logstore_url: Option<&str>,
    mq_url: &str,
    public_lb_url: Option<String>,
) -> anyhow::Result<NodeParts> {
    let _ = common;
    let (ds, ls) = open_stores(db_url, logstore_url)?;
    let mq: Arc<dyn MessageQueue> = kiln_state::queue_from_url(mq_url)?;
    let metrics = Registry::new();

    let catalog = catalog_router(CatalogState {
        datastore: ds,
        logstore: ls,
        queue: mq,
        annotator: annotator_for(public_lb_url),
    });

    Ok(NodeParts {
        node_type: "api",
        main_router: ping_router().merge(catalog),
        metrics,
        agent: None,
        extra_cancel: Vec::new(),
    })
}

fn build_lb(
    common: &CommonConfig,
    runner_api_url: &str,
    runner_addresses: &str,
    placer: PlacerKind,
    tls: Option<TlsPaths>,
) -> anyhow::Result<NodeParts> {
    let metrics = Registry::new();
    let cached = Arc::new(CachedAccess::new(HybridClient::new(runner_api_url)?));

    let client_tls = tls
        .map(|paths| TlsMaterial::load(&paths.cert, &paths.key, &paths.authority))
        .transpose()?
        .map(|material| material.client_config());
    let pool: Arc<dyn RunnerPool> =
        Arc::new(StaticRunnerPool::new(runner_addresses, client_tls));
    let placer: Arc<dyn Placer> = match placer {
        PlacerKind::ConsistentHash => {
            info!("placement algorithm: consistent-hash");
            Arc::new(ChPlacer::new())
        }
        PlacerKind::Naive => {
            info!("placement algorithm: naive rotation");
            Arc::new(NaivePlacer::new())
        }
    };

    let agent = LbAgent::new(cached.clone(), pool, placer, metrics.clone());
    let invoke = invoke_router(InvokeState {
        da: cached.clone(),
        agent: agent.clone(),
        rid_header: common.rid_header.clone(),
    });

    Ok(NodeParts {
        node_type: "lb",
        main_router: ping_router()
            .merge(invoke)
            .merge(cache_admin_router(cached)),
        metrics,
        agent: Some(agent),
        extra_cancel: Vec::new(),
    })
}

fn build_runner(
    common: &CommonConfig,
    runner_api_url: &str,
    exec: ExecConfig,
    shutdown_rx: &watch::Receiver<bool>,
) -> anyhow::Result<NodeParts> {
    let metrics = Registry::new();
    let cached = Arc::new(CachedAccess::new(HybridClient::new(runner_api_url)?));
    let pool = build_exec(&exec, &metrics)?;
    let agent = NodeAgent::new(pool, cached.clone(), metrics.clone());

    // Runner nodes also drain the api tier's async queue over the
    // hybrid client.
    tokio::spawn(run_async_worker(
        agent.clone(),
        cached.clone() as Arc<dyn DataAccess>,
        shutdown_rx.clone(),
    ));

    let invoke = invoke_router(InvokeState {
        da: cached.clone(),
        agent: agent.clone(),
        rid_header: common.rid_header.clone(),
    });

    Ok(NodeParts {
        node_type: "runner",
        main_router: ping_router()
            .merge(invoke)
            .merge(cache_admin_router(cached)),
        metrics,
        agent: Some(agent),
        extra_cancel: Vec::new(),
    })
}

fn build_pure_runner(
    common: &CommonConfig,
    grpc_port: u16,
    tls: Option<TlsPaths>,
    exec: ExecConfig,
    shutdown_rx: &watch::Receiver<bool>,
) -> anyhow::Result<NodeParts> {
    let _ = common;
    let metrics = Registry::new();
    let pool = build_exec(&exec, &metrics)?;
    let agent = NodeAgent::new(pool.clone(), Arc::new(NopAccess), metrics.clone());

    let (grpc, fatal_rx) = PureRunnerServer::new(agent.clone(), pool);
    let server_tls = tls
        .map(|paths| TlsMaterial::load(&paths.cert, &paths.key, &paths.authority))
        .transpose()?
        .map(|material| material.server_config());
    let addr = SocketAddr::from(([0, 0, 0, 0], grpc_port));
    tokio::spawn(grpc_server::serve(grpc, addr, server_tls, shutdown_rx.clone()));

    Ok(NodeParts {
        node_type: "pure-runner",
        // Pure runners have no invocation routes; grpc carries the work
        // and HTTP only serves the admin surface.
        main_router: ping_router(),
        metrics,
        agent: Some(agent),
        extra_cancel: vec![fatal_rx],
    })
}

// ── Lifecycle ──────────────────────────────────────────────────

fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGINT handler");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = interrupt.recv() => info!("interrupt received"),
            _ = terminate.recv() => info!("terminate received"),
        }
        let _ = shutdown.send(true);
    });
}

async fn serve(
    common: CommonConfig,
    parts: NodeParts,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    // Fan any registered cancellation into the one done-channel.
    for mut rx in parts.extra_cancel {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if rx.changed().await.is_ok() {
                warn!("subsystem cancellation, stopping node");
                let _ = tx.send(true);
            }
        });
    }

    let admin = admin_router(AdminState {
        metrics: parts.metrics.clone(),
        tracked_processes: common.tracked_processes.clone(),
        node_type: parts.node_type,
    });

    let mut router = parts.main_router;
    let shared_admin = common.admin_port == common.web_port;
    if shared_admin {
        router = router.merge(admin.clone());
    }
    if let Some(cors) = cors_layer(&common.cors_origins, &common.cors_headers) {
        router = router.layer(cors);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], common.web_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding web listener on {addr}"))?;
    info!(node_type = parts.node_type, %addr, "kiln serving");

    let mut admin_task = None;
    if !shared_admin {
        let admin_addr = SocketAddr::from(([0, 0, 0, 0], common.admin_port));
        let admin_listener = tokio::net::TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("binding admin listener on {admin_addr}"))?;
        info!(%admin_addr, "kiln admin serving");
        let mut rx = shutdown_rx.clone();
        admin_task = Some(tokio::spawn(async move {
            let result = axum::serve(admin_listener, admin)
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "admin server error");
            }
        }));
    }

    let mut rx = shutdown_rx.clone();
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = rx.changed().await;
        })
        .await;
    if let Err(e) = result {
        warn!(error = %e, "web server error");
        let _ = shutdown_tx.send(true);
    }

    // Intake is closed; drain execution state before exiting.
    if let Some(agent) = parts.agent {
        agent.close().await;
    }
    if let Some(task) = admin_task {
        let _ = task.await;
    }

    info!("kiln stopped");
    Ok(())
}
