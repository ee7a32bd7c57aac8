//! The composition and controller engine: a dynamic-kind controller runtime
//! (`engine`), a composite resource reconciler pipeline (`composite`), a
//! claim binder/connection propagator (`claim`) and a package revision
//! reconciler/activator (`packages`), built on a shared kind-aware client
//! and cache (`client`).

pub mod claim;
pub mod client;
pub mod composite;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod packages;
pub mod telemetry;
pub mod types;
pub mod xrd;

pub use error::{Error, Result};
