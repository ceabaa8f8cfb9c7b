//! Node configuration.
//!
//! All options are collected first, then validated once into a
//! [`NodeRole`] — a sum type carrying exactly the settings each role
//! may use. Configuration contradictions (an lb with a datastore, a
//! runner without an api url) are fatal at startup, never discovered
//! at runtime.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};

use kiln_core::logging::LogDest;

pub const DEFAULT_WEB_PORT: u16 = 8080;
pub const DEFAULT_GRPC_PORT: u16 = 9190;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NodeType {
    Full,
    Api,
    Lb,
    Runner,
    #[value(name = "pure-runner")]
    PureRunner,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Full => "full",
            NodeType::Api => "api",
            NodeType::Lb => "lb",
            NodeType::Runner => "runner",
            NodeType::PureRunner => "pure-runner",
        }
    }
}

/// Which placement algorithm an lb runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacerKind {
    Naive,
    ConsistentHash,
}

#[derive(Debug, Parser)]
#[command(name = "kilnd", about = "Kiln FaaS daemon", version)]
pub struct Cli {
    /// Node role.
    #[arg(long, value_enum, env = "KILN_NODE_TYPE", default_value = "full")]
    pub node_type: NodeType,

    /// HTTP listen port.
    #[arg(long, env = "KILN_WEB_PORT", default_value_t = DEFAULT_WEB_PORT)]
    pub web_port: u16,

    /// gRPC listen port (pure-runner).
    #[arg(long, env = "KILN_GRPC_PORT", default_value_t = DEFAULT_GRPC_PORT)]
    pub grpc_port: u16,

    /// Admin HTTP port; equal to the web port means shared listener.
    #[arg(long, env = "KILN_ADMIN_PORT")]
    pub admin_port: Option<u16>,

    /// Datastore url (`redb://<path>` or `mem://`).
    #[arg(long, env = "KILN_DB_URL")]
    pub db_url: Option<String>,

    /// Message queue url (`mem://`).
    #[arg(long, env = "KILN_MQ_URL")]
    pub mq_url: Option<String>,

    /// Log store url; defaults to the datastore.
    #[arg(long, env = "KILN_LOGSTORE_URL")]
    pub logstore_url: Option<String>,

    /// Api node url for runner and lb nodes.
    #[arg(long, env = "KILN_RUNNER_API_URL")]
    pub runner_api_url: Option<String>,

    /// Comma-separated pure-runner addresses for an lb node.
    #[arg(long, env = "KILN_RUNNER_ADDRESSES")]
    pub runner_addresses: Option<String>,

    /// Static base url for trigger annotations; absent derives
    /// per-request.
    #[arg(long, env = "KILN_PUBLIC_LB_URL")]
    pub public_lb_url: Option<String>,

    /// Placement algorithm: `ch` for consistent hashing, anything else
    /// selects the naive rotation.
    #[arg(long, env = "KILN_PLACER")]
    pub placer: Option<String>,

    /// Node certificate (PEM) for runner ↔ lb mTLS.
    #[arg(long, env = "KILN_NODE_CERT")]
    pub node_cert: Option<PathBuf>,

    /// Key for the node certificate.
    #[arg(long, env = "KILN_NODE_CERT_KEY")]
    pub node_cert_key: Option<PathBuf>,

    /// Certificate authority the peer is verified against.
    #[arg(long, env = "KILN_NODE_CERT_AUTHORITY")]
    pub node_cert_authority: Option<PathBuf>,

    /// Log level (EnvFilter syntax).
    #[arg(long, env = "KILN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log destination: `stderr`, `file://`, `udp://`, `tcp://`.
    #[arg(long, env = "KILN_LOG_DEST", default_value = "stderr")]
    pub log_dest: String,

    /// Prefix affixed to each log line.
    #[arg(long, env = "KILN_LOG_PREFIX", default_value = "")]
    pub log_prefix: String,

    /// Comma-separated CORS origins; empty disables CORS handling.
    #[arg(long, env = "KILN_CORS_ORIGINS", default_value = "")]
    pub cors_origins: String,

    /// Comma-separated CORS headers.
    #[arg(long, env = "KILN_CORS_HEADERS", default_value = "")]
    pub cors_headers: String,

    /// Zipkin collector url; accepted for parity, exporting is left to
    /// an external collector.
    #[arg(long, env = "KILN_ZIPKIN_URL")]
    pub zipkin_url: Option<String>,

    /// Jaeger collector url; accepted for parity, exporting is left to
    /// an external collector.
    #[arg(long, env = "KILN_JAEGER_URL")]
    pub jaeger_url: Option<String>,

    /// Header carrying the client-supplied request id.
    #[arg(long, env = "KILN_RID_HEADER")]
    pub rid_header: Option<String>,

    /// Space-separated command names for the process collector; empty
    /// disables, unset tracks the container daemons.
    #[arg(long, env = "KILN_PROCESS_COLLECTOR_LIST")]
    pub process_collector_list: Option<String>,

    /// Command prefix used to launch containers.
    #[arg(long, env = "KILN_CONTAINER_SUPERVISOR", default_value = "docker")]
    pub container_supervisor: String,

    /// Memory available for container slots, MiB. Defaults to detected
    /// system memory minus headroom.
    #[arg(long, env = "KILN_MAX_MEMORY_MB")]
    pub max_memory_mb: Option<u64>,

    /// CPU shares available for container slots; 0 disables CPU
    /// accounting.
    #[arg(long, env = "KILN_MAX_CPU_SHARES", default_value_t = 0)]
    pub max_cpu_shares: u64,
}

/// Settings shared by every role.
#[derive(Debug, Clone)]
pub struct CommonConfig {
    pub web_port: u16,
    pub admin_port: u16,
    pub log_level: String,
    pub log_dest: LogDest,
    pub log_prefix: String,
    pub cors_origins: String,
    pub cors_headers: String,
    pub rid_header: Option<String>,
    pub tracked_processes: Vec<String>,
    /// Tracing collector urls, carried for operators; span export is an
    /// external concern.
    pub zipkin_url: Option<String>,
    pub jaeger_url: Option<String>,
}

/// Execution settings for roles that run containers.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub container_supervisor: String,
    pub capacity_memory_mb: u64,
    pub capacity_cpu_shares: u64,
}

/// mTLS file paths, all-or-nothing.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub authority: PathBuf,
}

/// The validated role: each variant carries exactly what it needs.
#[derive(Debug)]
pub enum NodeRole {
    Full {
        db_url: String,
        logstore_url: Option<String>,
        mq_url: String,
        public_lb_url: Option<String>,
        exec: ExecConfig,
    },
    Api {
        db_url: String,
        logstore_url: Option<String>,
        mq_url: String,
        public_lb_url: Option<String>,
    },
    Lb {
        runner_api_url: String,
        runner_addresses: String,
        placer: PlacerKind,
        tls: Option<TlsPaths>,
    },
    Runner {
        runner_api_url: String,
        exec: ExecConfig,
    },
    PureRunner {
        grpc_port: u16,
        tls: Option<TlsPaths>,
        exec: ExecConfig,
    },
}

impl Cli {
    /// Validate everything once, after all options are collected.
    pub fn into_node_config(self) -> anyhow::Result<(CommonConfig, NodeRole)> {
        let common = CommonConfig {
            web_port: self.web_port,
            admin_port: self.admin_port.unwrap_or(self.web_port),
            log_level: self.log_level.clone(),
            log_dest: LogDest::parse(&self.log_dest).context("parsing log destination")?,
            log_prefix: self.log_prefix.clone(),
            cors_origins: self.cors_origins.clone(),
            cors_headers: self.cors_headers.clone(),
            rid_header: self.rid_header.clone(),
            tracked_processes: kiln_metrics::process::tracked_from_config(
                self.process_collector_list.as_deref(),
            ),
            zipkin_url: self.zipkin_url.clone(),
            jaeger_url: self.jaeger_url.clone(),
        };

        let tls = self.tls_paths()?;
        let exec = || ExecConfig {
            container_supervisor: self.container_supervisor.clone(),
            capacity_memory_mb: self.max_memory_mb.unwrap_or_else(detected_capacity_mb),
            capacity_cpu_shares: self.max_cpu_shares,
        };
        let placer = match self.placer.as_deref() {
            Some("ch") => PlacerKind::ConsistentHash,
            _ => PlacerKind::Naive,
        };

        let role = match self.node_type {
            NodeType::Full => NodeRole::Full {
                db_url: self.db_url.clone().unwrap_or_else(default_db_url),
                logstore_url: self.logstore_url.clone(),
                mq_url: self.mq_url.clone().unwrap_or_else(|| "mem://".to_string()),
                public_lb_url: self.public_lb_url.clone(),
                exec: exec(),
            },
            NodeType::Api => NodeRole::Api {
                db_url: self.db_url.clone().unwrap_or_else(default_db_url),
                logstore_url: self.logstore_url.clone(),
                mq_url: self.mq_url.clone().unwrap_or_else(|| "mem://".to_string()),
                public_lb_url: self.public_lb_url.clone(),
            },
            NodeType::Lb => {
                if self.db_url.is_some() {
                    bail!("lb nodes must not be configured with a datastore (--db-url)");
                }
                if self.mq_url.is_some() {
                    bail!("lb nodes must not be configured with a message queue (--mq-url)");
                }
                let runner_api_url = self
                    .runner_api_url
                    .clone()
                    .context("lb nodes require --runner-api-url")?;
                let runner_addresses = self
                    .runner_addresses
                    .clone()
                    .context("lb nodes require --runner-addresses")?;
                NodeRole::Lb {
                    runner_api_url,
                    runner_addresses,
                    placer,
                    tls,
                }
            }
            NodeType::Runner => {
                let runner_api_url = self
                    .runner_api_url
                    .clone()
                    .context("runner nodes require --runner-api-url")?;
                NodeRole::Runner {
                    runner_api_url,
                    exec: exec(),
                }
            }
            NodeType::PureRunner => {
                if self.db_url.is_some() {
                    bail!("pure-runner nodes must not be configured with a datastore (--db-url)");
                }
                if self.mq_url.is_some() {
                    bail!(
                        "pure-runner nodes must not be configured with a message queue (--mq-url)"
                    );
                }
                NodeRole::PureRunner {
                    grpc_port: self.grpc_port,
                    tls,
                    exec: exec(),
                }
            }
        };

        Ok((common, role))
    }

    fn tls_paths(&self) -> anyhow::Result<Option<TlsPaths>> {
        match (
            &self.node_cert,
            &self.node_cert_key,
            &self.node_cert_authority,
        ) {
            (Some(cert), Some(key), Some(authority)) => Ok(Some(TlsPaths {
                cert: cert.clone(),
                key: key.clone(),
                authority: authority.clone(),
            })),
            (None, None, None) => Ok(None),
            _ => bail!(
                "--node-cert, --node-cert-key, and --node-cert-authority must be set together"
            ),
        }
    }
}

fn default_db_url() -> String {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| ".".to_string());
    format!("redb://{cwd}/data/kiln.db")
}

/// Detected system memory minus a headroom share for the node itself.
fn detected_capacity_mb() -> u64 {
    let total = detect_total_memory().unwrap_or(8 * 1024 * 1024 * 1024);
    let mb = total / (1024 * 1024);
    (mb * 8 / 10).max(256)
}

/// Total physical memory via POSIX sysconf.
fn detect_total_memory() -> Option<u64> {
    unsafe {
        let pages = libc::sysconf(libc::_SC_PHYS_PAGES);
        let page_size = libc::sysconf(libc::_SC_PAGE_SIZE);
        if pages > 0 && page_size > 0 {
            Some(pages as u64 * page_size as u64)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("kilnd").chain(args.iter().copied()))
    }

    #[test]
    fn default_role_is_full_with_defaults() {
        let (common, role) = parse(&[]).into_node_config().unwrap();
        assert_eq!(common.web_port, DEFAULT_WEB_PORT);
        assert_eq!(common.admin_port, DEFAULT_WEB_PORT);
        match role {
            NodeRole::Full { db_url, mq_url, .. } => {
                assert!(db_url.starts_with("redb://"));
                assert_eq!(mq_url, "mem://");
            }
            other => panic!("expected full role, got {other:?}"),
        }
    }

    #[test]
    fn lb_rejects_datastore_configuration() {
        let cli = parse(&[
            "--node-type",
            "lb",
            "--db-url",
            "mem://",
            "--runner-api-url",
            "http://api:8080",
            "--runner-addresses",
            "r1:9190",
        ]);
        assert!(cli.into_node_config().is_err());
    }

    #[test]
    fn lb_requires_api_url_and_runners() {
        let cli = parse(&["--node-type", "lb", "--runner-addresses", "r1:9190"]);
        assert!(cli.into_node_config().is_err());

        let cli = parse(&["--node-type", "lb", "--runner-api-url", "http://api:8080"]);
        assert!(cli.into_node_config().is_err());

        let cli = parse(&[
            "--node-type",
            "lb",
            "--runner-api-url",
            "http://api:8080",
            "--runner-addresses",
            "r1:9190,r2:9190",
        ]);
        let (_, role) = cli.into_node_config().unwrap();
        match role {
            NodeRole::Lb { placer, .. } => assert_eq!(placer, PlacerKind::Naive),
            other => panic!("expected lb role, got {other:?}"),
        }
    }

    #[test]
    fn placer_ch_selects_consistent_hash() {
        let cli = parse(&[
            "--node-type",
            "lb",
            "--runner-api-url",
            "http://api:8080",
            "--runner-addresses",
            "r1:9190",
            "--placer",
            "ch",
        ]);
        let (_, role) = cli.into_node_config().unwrap();
        match role {
            NodeRole::Lb { placer, .. } => assert_eq!(placer, PlacerKind::ConsistentHash),
            other => panic!("expected lb role, got {other:?}"),
        }
    }

    #[test]
    fn pure_runner_rejects_queue_configuration() {
        let cli = parse(&["--node-type", "pure-runner", "--mq-url", "mem://"]);
        assert!(cli.into_node_config().is_err());

        let cli = parse(&["--node-type", "pure-runner"]);
        let (_, role) = cli.into_node_config().unwrap();
        match role {
            NodeRole::PureRunner { grpc_port, .. } => assert_eq!(grpc_port, DEFAULT_GRPC_PORT),
            other => panic!("expected pure-runner role, got {other:?}"),
        }
    }

    #[test]
    fn runner_requires_api_url() {
        assert!(parse(&["--node-type", "runner"]).into_node_config().is_err());
        assert!(parse(&[
            "--node-type",
            "runner",
            "--runner-api-url",
            "http://api:8080"
        ])
        .into_node_config()
        .is_ok());
    }

    #[test]
    fn tls_paths_are_all_or_nothing() {
        let cli = parse(&["--node-type", "pure-runner", "--node-cert", "/tmp/c.pem"]);
        assert!(cli.into_node_config().is_err());

        let cli = parse(&[
            "--node-type",
            "pure-runner",
            "--node-cert",
            "/tmp/c.pem",
            "--node-cert-key",
            "/tmp/k.pem",
            "--node-cert-authority",
            "/tmp/ca.pem",
        ]);
        assert!(cli.into_node_config().is_ok());
    }

    #[test]
    fn admin_port_defaults_to_web_port() {
        let (common, _) = parse(&["--web-port", "9000"]).into_node_config().unwrap();
        assert_eq!(common.admin_port, 9000);

        let (common, _) = parse(&["--web-port", "9000", "--admin-port", "9001"])
            .into_node_config()
            .unwrap();
        assert_eq!(common.admin_port, 9001);
    }

    #[test]
    fn process_collector_config_flows_through() {
        let (common, _) = parse(&[]).into_node_config().unwrap();
        assert_eq!(common.tracked_processes, vec!["dockerd", "docker-containerd"]);

        let (common, _) = parse(&["--process-collector-list", ""])
            .into_node_config()
            .unwrap();
        assert!(common.tracked_processes.is_empty());
    }
}
