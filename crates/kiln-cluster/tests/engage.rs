//! End-to-end submit protocol: a pure-runner served over a local
//! socket, driven by the lb-side runner client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;

use kiln_agent::{CallMetadata, NodeAgent};
use kiln_cluster::{server, GrpcRunner, PureRunnerServer};
use kiln_core::models::Format;
use kiln_core::{ApiResult, App, Call};
use kiln_dataaccess::NopAccess;
use kiln_metrics::Registry;
use kiln_placement::{Runner, RunnerCall};
use kiln_pool::mock::MockDriver;
use kiln_pool::{PoolConfig, SlotPool};

struct TestCall {
    metadata_json: String,
    slot_key: String,
    deadline: Instant,
    input: Bytes,
    response: tokio::sync::Mutex<Option<(u16, Bytes)>>,
}

impl TestCall {
    fn new(metadata: &CallMetadata, input: &'static [u8]) -> Self {
        Self {
            metadata_json: serde_json::to_string(metadata).unwrap(),
            slot_key: metadata.slot_key().as_str().to_string(),
            deadline: Instant::now() + Duration::from_secs(10),
            input: Bytes::from_static(input),
            response: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl RunnerCall for TestCall {
    fn slot_key(&self) -> &str {
        &self.slot_key
    }

    fn metadata_json(&self) -> String {
        self.metadata_json.clone()
    }

    fn deadline(&self) -> Instant {
        self.deadline
    }

    fn input(&self) -> Bytes {
        self.input.clone()
    }

    async fn respond(
        &self,
        status: u16,
        _headers: Vec<(String, String)>,
        body: Bytes,
    ) -> ApiResult<()> {
        *self.response.lock().await = Some((status, body));
        Ok(())
    }
}

fn metadata(memory_mb: u64) -> CallMetadata {
    let app = App {
        id: "a-1".into(),
        name: "myapp".into(),
        config: BTreeMap::new(),
        annotations: BTreeMap::new(),
        created_at: 1,
        updated_at: 1,
    };
    let call = Call::new("c-1".into(), &app, Some("/hello".into()), None);
    CallMetadata {
        call,
        image: "hello:v1".into(),
        memory_mb,
        cpu_shares: 0,
        timeout_secs: 30,
        idle_timeout_secs: 30,
        format: Format::Json,
        env: BTreeMap::new(),
        label: "/hello".into(),
    }
}

/// Boot a pure-runner on an ephemeral port and return its address plus
/// the shutdown handle.
async fn start_runner(capacity_mb: u64, driver: Arc<MockDriver>) -> (String, watch::Sender<bool>) {
    let metrics = Registry::new();
    let pool = SlotPool::new(
        driver,
        PoolConfig {
            capacity_memory_mb: capacity_mb,
            drain_wait: Duration::from_millis(200),
            ..PoolConfig::default()
        },
        metrics.clone(),
    );
    let agent = NodeAgent::new(pool.clone(), Arc::new(NopAccess), metrics);
    let (srv, _fatal) = PureRunnerServer::new(agent, pool);

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server::serve(srv, addr, None, shutdown_rx));
    // Let the server bind before anyone dials.
    tokio::time::sleep(Duration::from_millis(100)).await;
    (addr.to_string(), shutdown_tx)
}

#[tokio::test]
async fn accepted_call_roundtrips() {
    let driver = Arc::new(MockDriver::new());
    let (addr, shutdown) = start_runner(1024, driver.clone()).await;

    let runner = GrpcRunner::new(&addr, None);
    let md = metadata(128);
    let call = TestCall::new(&md, b"ping");

    let placed = runner.try_exec(&call).await.unwrap();
    assert!(placed);

    let response = call.response.lock().await.take().unwrap();
    assert_eq!(response.0, 200);
    assert_eq!(&response.1[..], b"pong");
    assert_eq!(driver.launch_count(), 1);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn warm_slot_is_reused_across_streams() {
    let driver = Arc::new(MockDriver::new());
    let (addr, shutdown) = start_runner(1024, driver.clone()).await;

    let runner = GrpcRunner::new(&addr, None);
    let md = metadata(128);

    for _ in 0..2 {
        let call = TestCall::new(&md, b"ping");
        assert!(runner.try_exec(&call).await.unwrap());
    }
    assert_eq!(driver.launch_count(), 1);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn over_capacity_call_is_rejected_without_allocation() {
    let driver = Arc::new(MockDriver::new());
    let (addr, shutdown) = start_runner(64, driver.clone()).await;

    let runner = GrpcRunner::new(&addr, None);
    let md = metadata(128);
    let call = TestCall::new(&md, b"ping");

    // The runner answers rejected; the placer sees a retryable miss.
    let placed = runner.try_exec(&call).await.unwrap();
    assert!(!placed);
    assert_eq!(driver.launch_count(), 0);
    assert!(call.response.lock().await.is_none());

    let _ = shutdown.send(true);
}
