//! kiln-core — shared foundations for the Kiln FaaS platform.
//!
//! Holds the catalog data model (apps, routes, functions, triggers, call
//! records), the platform-wide error taxonomy, call-id generation, and
//! logging setup. Every other kiln crate depends on this one; it depends
//! on none of them.

pub mod error;
pub mod id;
pub mod logging;
pub mod models;

pub use error::{ApiError, ApiResult};
pub use models::{App, Call, CallStatus, Fn, Format, Route, RouteType, Trigger};
