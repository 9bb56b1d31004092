//! app-launch - Resolve application identifiers and supervise their jobs
//!
//! Application ids are resolved across the click, legacy, libertine and snap
//! package backends. Launching, stopping, pausing and resuming go through an
//! external process supervisor, and lifecycle changes are published on an
//! observer bus that delivers on each subscriber's own context.

pub mod control;
pub mod core;
pub mod jobs;
pub mod packages;
pub mod platform;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::core::{
    AppId, Application, ApplicationWildcard, Error, Helper, HelperType, Instance, InstanceState,
    LaunchConfig, ObserverBus, OomScore, Registry, RegistryBuilder, Result,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install a fmt subscriber filtered by `RUST_LOG`. Does nothing if a
/// subscriber is already installed.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("app_launch=info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
