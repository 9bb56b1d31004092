//! Error types shared by the registry, applications, helpers and instances

use thiserror::Error;

/// Errors surfaced by the launch control plane.
///
/// External collaborators (supervisor buses, package clients) report
/// `anyhow::Error`; those are wrapped in [`Error::Ipc`] at the boundary so the
/// caller always sees this enum.
#[derive(Debug, Error)]
pub enum Error {
    /// A required argument was empty or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No package backend knows the requested package or application.
    #[error("not found: {0}")]
    NotFound(String),

    /// No running instance matched the request.
    #[error("no instances of {0}")]
    NoInstance(String),

    /// More than one instance matched a request that needs exactly one.
    #[error("expected a single instance of {id} but found {count}")]
    AmbiguousInstance { id: String, count: usize },

    /// A call into the supervisor, package client or cgroup manager failed.
    #[error("{operation} failed: {source}")]
    Ipc {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// The worker thread has exited and can no longer accept work.
    #[error("registry worker is no longer running")]
    WorkerGone,

    /// Work was submitted from the worker thread to itself.
    #[error("blocking call issued from the registry worker thread")]
    Reentrant,
}

impl Error {
    pub fn ipc(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Ipc { operation, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
