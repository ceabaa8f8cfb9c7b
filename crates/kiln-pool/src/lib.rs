//! kiln-pool — the warm container slot pool.
//!
//! A slot is a running container instance keyed by the hash of the
//! invocation-invariant portion of a function's configuration. Two
//! invocations with identical slot keys may share a warm slot
//! sequentially, never concurrently. The pool owns all node resource
//! accounting: memory and CPU shares are deducted while a slot is
//! allocated and returned when its container has confirmably exited.
//!
//! # Slot lifecycle
//!
//! ```text
//! starting ──→ idle ⇄ busy ──→ draining ──→ dead
//!    │                  │
//!    └──→ dead (launch failure)
//!                       └─────→ dead (container crash)
//! ```

pub mod driver;
pub mod key;
pub mod mock;
pub mod pool;

pub use driver::{ContainerDriver, ContainerHandle, ContainerResponse, ContainerSpec, ProcessDriver};
pub use key::SlotKey;
pub use pool::{PoolConfig, SlotHandle, SlotPool, SlotResources};
