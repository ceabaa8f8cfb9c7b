//! kiln-cluster — the runner ↔ lb wire.
//!
//! A pure-runner node exposes [`PureRunnerServer`] over gRPC; lb nodes
//! reach it through [`GrpcRunner`], which implements the placement
//! crate's `Runner` trait. Runner sets come from [`StaticRunnerPool`]
//! (fixed address list) or [`DynamicRunnerPool`] (periodic discovery
//! refresh). Node-to-node TLS material is loaded from PEM files.

pub mod client;
pub mod pool;
pub mod server;
pub mod tls;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("kiln.runner");
}

pub use client::GrpcRunner;
pub use pool::{DynamicRunnerPool, RunnerDiscovery, StaticRunnerPool};
pub use server::PureRunnerServer;
pub use tls::TlsMaterial;
