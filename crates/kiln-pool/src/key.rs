//! Slot keys.
//!
//! A slot key hashes everything that affects container startup: image,
//! resource limits, timeouts, I/O format, and the startup-relevant
//! configuration map. Invocations with equal keys can reuse each other's
//! warm containers.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

use kiln_core::models::Format;

/// Opaque, hashable identity of a container configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey(String);

impl SlotKey {
    /// Derive the key for a concrete container configuration.
    ///
    /// The config map is a `BTreeMap`, so iteration order is stable and
    /// equal maps always hash equally.
    pub fn derive(
        image: &str,
        memory_mb: u64,
        cpu_shares: u64,
        timeout_secs: u64,
        idle_timeout_secs: u64,
        format: Format,
        config: &BTreeMap<String, String>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(image.as_bytes());
        hasher.update([0]);
        hasher.update(memory_mb.to_be_bytes());
        hasher.update(cpu_shares.to_be_bytes());
        hasher.update(timeout_secs.to_be_bytes());
        hasher.update(idle_timeout_secs.to_be_bytes());
        hasher.update(format.as_str().as_bytes());
        for (k, v) in config {
            hasher.update([0]);
            hasher.update(k.as_bytes());
            hasher.update([1]);
            hasher.update(v.as_bytes());
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        SlotKey(hex)
    }

    /// Reconstruct a key from its wire form (the pure-runner protocol
    /// carries keys derived by the LB).
    pub fn from_wire(value: String) -> Self {
        SlotKey(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}
