//! Runner pools — the set of reachable pure-runners.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tonic::transport::ClientTlsConfig;
use tracing::{debug, info, warn};

use kiln_core::ApiResult;
use kiln_placement::{Runner, RunnerPool};

use crate::client::GrpcRunner;

/// Fixed membership from a comma-separated address list. The snapshot
/// never changes; health is observed implicitly by the placer.
pub struct StaticRunnerPool {
    runners: Vec<Arc<dyn Runner>>,
}

impl StaticRunnerPool {
    pub fn new(addresses: &str, tls: Option<ClientTlsConfig>) -> Self {
        let runners: Vec<Arc<dyn Runner>> = addresses
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(|addr| GrpcRunner::new(addr, tls.clone()) as Arc<dyn Runner>)
            .collect();
        info!(count = runners.len(), "static runner pool configured");
        Self { runners }
    }
}

#[async_trait]
impl RunnerPool for StaticRunnerPool {
    async fn runners(&self) -> Vec<Arc<dyn Runner>> {
        self.runners.clone()
    }

    async fn shutdown(&self) {}
}

/// Where a dynamic pool learns its membership from.
#[async_trait]
pub trait RunnerDiscovery: Send + Sync {
    async fn list(&self) -> ApiResult<Vec<String>>;
}

/// Periodically refreshed membership. Existing runner clients are kept
/// for addresses that persist across refreshes; in-flight work is never
/// rebalanced.
pub struct DynamicRunnerPool {
    runners: Arc<RwLock<Vec<Arc<dyn Runner>>>>,
    shutdown: watch::Sender<bool>,
}

impl DynamicRunnerPool {
    pub fn new(
        discovery: Arc<dyn RunnerDiscovery>,
        tls: Option<ClientTlsConfig>,
        refresh: Duration,
    ) -> Arc<Self> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let runners: Arc<RwLock<Vec<Arc<dyn Runner>>>> = Arc::new(RwLock::new(Vec::new()));

        let pool = Arc::new(Self {
            runners: runners.clone(),
            shutdown: shutdown_tx,
        });

        tokio::spawn(async move {
            let mut known: HashMap<String, Arc<dyn Runner>> = HashMap::new();
            loop {
                match discovery.list().await {
                    Ok(addresses) => {
                        let mut next: Vec<Arc<dyn Runner>> = Vec::with_capacity(addresses.len());
                        let mut next_known = HashMap::new();
                        for addr in addresses {
                            let runner = known
                                .get(&addr)
                                .cloned()
                                .unwrap_or_else(|| {
                                    GrpcRunner::new(&addr, tls.clone()) as Arc<dyn Runner>
                                });
                            next_known.insert(addr, runner.clone());
                            next.push(runner);
                        }
                        debug!(count = next.len(), "runner pool refreshed");
                        known = next_known;
                        *runners.write().await = next;
                    }
                    Err(e) => {
                        // Keep the previous snapshot on discovery failure.
                        warn!(error = %e, "runner discovery failed");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(refresh) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        pool
    }
}

#[async_trait]
impl RunnerPool for DynamicRunnerPool {
    async fn runners(&self) -> Vec<Arc<dyn Runner>> {
        self.runners.read().await.clone()
    }

    async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
