//! kilnd — the Kiln FaaS daemon.
//!
//! A single binary that runs as one of five node roles:
//!
//! - **full** — catalog API plus local execution, all-in-one
//! - **api** — catalog only; owns datastore, log store, and queue
//! - **lb** — terminates invocations and dispatches to pure-runners
//! - **runner** — executes invocations, catalog via an api node
//! - **pure-runner** — executes invocations received over gRPC
//!
//! # Usage
//!
//! ```text
//! kilnd                                     # full node on :8080
//! kilnd --node-type api --db-url redb:///var/lib/kiln/kiln.db
//! kilnd --node-type lb --runner-api-url http://api:8080 \
//!       --runner-addresses r1:9190,r2:9190 --placer ch
//! kilnd --node-type pure-runner --grpc-port 9190
//! ```

mod config;
mod roles;

use clap::Parser;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let cli = config::Cli::parse();
    let (common, role) = cli.into_node_config()?;

    kiln_core::logging::init(&common.log_level, &common.log_dest, &common.log_prefix)?;

    // The machine id seeds call-id generation; process-wide, set once.
    let addr = kiln_core::id::local_ipv4();
    kiln_core::id::set_machine_id(addr, common.web_port);
    info!(ip = %addr, port = common.web_port, "machine id initialised");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(roles::run(common, role))
}
