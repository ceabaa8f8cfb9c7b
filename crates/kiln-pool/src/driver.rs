//! Container driver — the seam to the container supervisor.
//!
//! The pool launches and terminates containers exclusively through
//! [`ContainerDriver`]; the in-tree [`ProcessDriver`] shells out to a
//! supervisor command (`docker` by default) and speaks the function I/O
//! formats over the container's stdio. The hot formats (`http`, `json`,
//! `cloudevent`) keep one long-lived child per slot; the `default`
//! format runs one child per invocation and the slot only carries the
//! launch spec.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, warn};

use kiln_core::models::Format;
use kiln_core::{ApiError, ApiResult};

/// Everything the supervisor needs to start a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub memory_mb: u64,
    pub cpu_shares: u64,
    pub format: Format,
    /// Environment passed to the function (app + route config).
    pub env: BTreeMap<String, String>,
}

/// One function response read back from a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Stderr collected during the invocation.
    pub log: Vec<u8>,
}

/// Launches containers. Implementations must be cheap to call
/// concurrently; the pool serializes per-slot usage itself.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn launch(&self, spec: &ContainerSpec) -> ApiResult<Box<dyn ContainerHandle>>;
}

/// An exclusive handle to one running (or runnable) container.
///
/// The pool guarantees a single busy holder, so `invoke` is never called
/// concurrently on one handle.
#[async_trait]
pub trait ContainerHandle: Send + Sync {
    /// Run one invocation: feed `input`, return the function's response.
    async fn invoke(&self, input: Bytes, deadline: Instant) -> ApiResult<ContainerResponse>;

    /// False once the container crashed or its stdio broke; unhealthy
    /// handles are drained instead of returning to the idle set.
    fn healthy(&self) -> bool;

    /// Stop the container: TERM, a grace window, then KILL.
    async fn terminate(&self);
}

// ── Process driver ─────────────────────────────────────────────

/// Shells out to a container supervisor.
pub struct ProcessDriver {
    supervisor: Vec<String>,
    term_grace: Duration,
}

impl ProcessDriver {
    /// `supervisor` is the command prefix, e.g. `"docker"` or
    /// `"podman --remote"`.
    pub fn new(supervisor: &str) -> ApiResult<Self> {
        let parts: Vec<String> = supervisor.split_whitespace().map(String::from).collect();
        if parts.is_empty() {
            return Err(ApiError::Validation(
                "container supervisor command must not be empty".into(),
            ));
        }
        Ok(Self {
            supervisor: parts,
            term_grace: Duration::from_secs(2),
        })
    }

    fn command(&self, spec: &ContainerSpec) -> Command {
        let mut cmd = Command::new(&self.supervisor[0]);
        cmd.args(&self.supervisor[1..]);
        cmd.arg("run").arg("--rm").arg("-i");
        cmd.arg("--memory").arg(format!("{}m", spec.memory_mb));
        if spec.cpu_shares > 0 {
            cmd.arg("--cpu-shares").arg(spec.cpu_shares.to_string());
        }
        for (k, v) in &spec.env {
            cmd.arg("-e").arg(format!("{k}={v}"));
        }
        cmd.arg("-e")
            .arg(format!("KILN_FORMAT={}", spec.format.as_str()));
        cmd.arg(&spec.image);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ContainerDriver for ProcessDriver {
    async fn launch(&self, spec: &ContainerSpec) -> ApiResult<Box<dyn ContainerHandle>> {
        match spec.format {
            Format::Default => {
                // Cold format: nothing to keep alive, the handle spawns
                // a child per invocation.
                Ok(Box::new(ColdHandle {
                    cmd_spec: spec.clone(),
                    driver: self.snapshot(),
                    healthy: AtomicBool::new(true),
                }))
            }
            Format::Http | Format::Json | Format::CloudEvent => {
                let mut child = self
                    .command(spec)
                    .spawn()
                    .map_err(|e| ApiError::ContainerError(format!("launch failed: {e}")))?;
                let stdin = child.stdin.take().ok_or_else(|| {
                    ApiError::ContainerError("container stdin unavailable".into())
                })?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    ApiError::ContainerError("container stdout unavailable".into())
                })?;
                let log = spawn_stderr_collector(&mut child);
                debug!(image = %spec.image, format = spec.format.as_str(), "container launched");
                Ok(Box::new(HotHandle {
                    format: spec.format,
                    io: tokio::sync::Mutex::new(HotIo {
                        child,
                        stdin,
                        stdout: BufReader::new(stdout),
                    }),
                    log,
                    healthy: AtomicBool::new(true),
                    term_grace: self.term_grace,
                }))
            }
        }
    }
}

impl ProcessDriver {
    fn snapshot(&self) -> ProcessDriver {
        ProcessDriver {
            supervisor: self.supervisor.clone(),
            term_grace: self.term_grace,
        }
    }
}

/// Collect a child's stderr into a shared buffer without blocking the
/// invocation path.
fn spawn_stderr_collector(child: &mut Child) -> Arc<std::sync::Mutex<Vec<u8>>> {
    let buf = Arc::new(std::sync::Mutex::new(Vec::new()));
    if let Some(stderr) = child.stderr.take() {
        let buf = buf.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            while let Ok(n) = reader.read_line(&mut line).await {
                if n == 0 {
                    break;
                }
                let mut guard = buf.lock().unwrap_or_else(|e| e.into_inner());
                guard.extend_from_slice(line.as_bytes());
                line.clear();
            }
        });
    }
    buf
}

fn drain_log(buf: &std::sync::Mutex<Vec<u8>>) -> Vec<u8> {
    std::mem::take(&mut *buf.lock().unwrap_or_else(|e| e.into_inner()))
}

// ── Cold (default format) handle ───────────────────────────────

struct ColdHandle {
    cmd_spec: ContainerSpec,
    driver: ProcessDriver,
    healthy: AtomicBool,
}

#[async_trait]
impl ContainerHandle for ColdHandle {
    async fn invoke(&self, input: Bytes, deadline: Instant) -> ApiResult<ContainerResponse> {
        let mut child = self
            .driver
            .command(&self.cmd_spec)
            .spawn()
            .map_err(|e| ApiError::ContainerError(format!("launch failed: {e}")))?;
        let log = spawn_stderr_collector(&mut child);

        let run = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(&input)
                    .await
                    .map_err(|e| ApiError::ContainerError(format!("stdin write: {e}")))?;
                drop(stdin); // EOF signals end of input
            }
            let mut body = Vec::new();
            if let Some(mut stdout) = child.stdout.take() {
                stdout
                    .read_to_end(&mut body)
                    .await
                    .map_err(|e| ApiError::ContainerError(format!("stdout read: {e}")))?;
            }
            let status = child
                .wait()
                .await
                .map_err(|e| ApiError::ContainerError(format!("wait: {e}")))?;
            Ok::<_, ApiError>((body, status))
        };

        // Bind before matching so the timeout future (which borrows the
        // child) is dropped before the child is touched again.
        let outcome = tokio::time::timeout_at(deadline, run).await;
        let (body, status) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                terminate_child(&mut child, self.driver.term_grace).await;
                return Err(ApiError::DeadlineExceeded);
            }
        };

        match status.code() {
            Some(0) => Ok(ContainerResponse {
                status: 200,
                headers: Vec::new(),
                body: Bytes::from(body),
                log: drain_log(&log),
            }),
            Some(exit) => Err(ApiError::FunctionError { exit }),
            None => Err(ApiError::ContainerError("container killed by signal".into())),
        }
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn terminate(&self) {
        // No persistent child to stop.
    }
}

// ── Hot handle ─────────────────────────────────────────────────

struct HotIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

struct HotHandle {
    format: Format,
    io: tokio::sync::Mutex<HotIo>,
    log: Arc<std::sync::Mutex<Vec<u8>>>,
    healthy: AtomicBool,
    term_grace: Duration,
}

#[async_trait]
impl ContainerHandle for HotHandle {
    async fn invoke(&self, input: Bytes, deadline: Instant) -> ApiResult<ContainerResponse> {
        let mut io = self.io.lock().await;
        let result = tokio::time::timeout_at(deadline, async {
            match self.format {
                Format::Http => http_roundtrip(&mut io, &input).await,
                Format::Json | Format::CloudEvent => {
                    json_roundtrip(&mut io, &input, self.format).await
                }
                Format::Default => unreachable!("default format uses the cold handle"),
            }
        })
        .await;

        match result {
            Ok(Ok(mut resp)) => {
                resp.log = drain_log(&self.log);
                Ok(resp)
            }
            Ok(Err(e)) => {
                // Broken framing means the hot container can't be trusted
                // for the next holder.
                self.healthy.store(false, Ordering::Relaxed);
                Err(e)
            }
            Err(_) => {
                self.healthy.store(false, Ordering::Relaxed);
                terminate_child(&mut io.child, self.term_grace).await;
                Err(ApiError::DeadlineExceeded)
            }
        }
    }

    fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn terminate(&self) {
        let mut io = self.io.lock().await;
        terminate_child(&mut io.child, self.term_grace).await;
    }
}

/// TERM, wait out the grace window, then KILL.
async fn terminate_child(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "container ignored TERM, killing");
    }
    let _ = child.kill().await;
}

// ── Hot format framings ────────────────────────────────────────

/// HTTP/1.1 over stdio: one request written, one response parsed.
async fn http_roundtrip(io: &mut HotIo, input: &[u8]) -> ApiResult<ContainerResponse> {
    let header = format!(
        "POST / HTTP/1.1\r\nHost: function\r\nContent-Length: {}\r\n\r\n",
        input.len()
    );
    io.stdin
        .write_all(header.as_bytes())
        .await
        .map_err(io_err)?;
    io.stdin.write_all(input).await.map_err(io_err)?;
    io.stdin.flush().await.map_err(io_err)?;

    // Status line.
    let mut line = String::new();
    io.stdout.read_line(&mut line).await.map_err(io_err)?;
    let status: u16 = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ApiError::ContainerError(format!("bad status line: {line:?}")))?;

    // Headers until the blank line.
    let mut headers = Vec::new();
    let mut content_length: usize = 0;
    loop {
        line.clear();
        io.stdout.read_line(&mut line).await.map_err(io_err)?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let Some((name, value)) = trimmed.split_once(':') else {
            return Err(ApiError::ContainerError(format!("bad header: {trimmed:?}")));
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .parse()
                .map_err(|_| ApiError::ContainerError("bad content-length".into()))?;
        }
        headers.push((name.to_string(), value.to_string()));
    }

    let mut body = vec![0u8; content_length];
    io.stdout.read_exact(&mut body).await.map_err(io_err)?;

    Ok(ContainerResponse {
        status,
        headers,
        body: Bytes::from(body),
        log: Vec::new(),
    })
}

/// JSON-lines framing; the cloudevent variant wraps the payload in an
/// event envelope.
async fn json_roundtrip(io: &mut HotIo, input: &[u8], format: Format) -> ApiResult<ContainerResponse> {
    let body_str = String::from_utf8_lossy(input);
    let envelope = match format {
        Format::CloudEvent => serde_json::json!({
            "eventType": "io.kiln.invoke",
            "data": body_str,
        }),
        _ => serde_json::json!({ "body": body_str }),
    };
    let mut frame = serde_json::to_vec(&envelope)
        .map_err(|e| ApiError::ContainerError(format!("encode request: {e}")))?;
    frame.push(b'\n');
    io.stdin.write_all(&frame).await.map_err(io_err)?;
    io.stdin.flush().await.map_err(io_err)?;

    let mut line = String::new();
    let n = io.stdout.read_line(&mut line).await.map_err(io_err)?;
    if n == 0 {
        return Err(ApiError::ContainerError("container closed stdout".into()));
    }
    let value: serde_json::Value = serde_json::from_str(line.trim_end())
        .map_err(|e| ApiError::ContainerError(format!("decode response: {e}")))?;

    let body_field = if format == Format::CloudEvent { "data" } else { "body" };
    let body = value
        .get(body_field)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let status = value
        .get("status_code")
        .and_then(|v| v.as_u64())
        .unwrap_or(200) as u16;
    let headers = value
        .get("headers")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Ok(ContainerResponse {
        status,
        headers,
        body: Bytes::from(body),
        log: Vec::new(),
    })
}

fn io_err(e: std::io::Error) -> ApiError {
    ApiError::ContainerError(format!("container i/o: {e}"))
}
