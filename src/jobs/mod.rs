//! Job backends - the external process supervisor
//!
//! Two supervisor flavors are supported: an event-driven one (upstart) and a
//! unit manager (systemd). Each maps a [`JobKey`] to its own naming scheme
//! and decodes its lifecycle signals into [`JobEvent`]s.

pub mod cgroup;
pub mod systemd;
pub mod upstart;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::appid::AppId;
use crate::core::environment::LaunchEnv;
use crate::core::error::{Error, Result};
use crate::platform::Pid;

pub use cgroup::{CgroupConnector, CgroupManager, CgroupSession, FsCgroupConnector};
pub use systemd::{SystemdBus, SystemdJobs, SystemdSignal};
pub use upstart::{UpstartBus, UpstartJobs, UpstartSignal};

/// Identity of one job instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    /// Application job name, or the helper type
    pub job: String,
    pub app_id: AppId,
    /// Empty for single-instance jobs
    pub instance_id: String,
    pub helper: bool,
}

impl JobKey {
    pub fn application(job: impl Into<String>, app_id: AppId, instance_id: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            app_id,
            instance_id: instance_id.into(),
            helper: false,
        }
    }

    pub fn helper(helper_type: impl Into<String>, app_id: AppId, instance_id: impl Into<String>) -> Self {
        Self {
            job: helper_type.into(),
            app_id,
            instance_id: instance_id.into(),
            helper: true,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.instance_id.is_empty() {
            write!(f, "{}/{}", self.job, self.app_id)
        } else {
            write!(f, "{}/{}/{}", self.job, self.app_id, self.instance_id)
        }
    }
}

/// Why an instance failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureType {
    Crash,
    StartFailure,
}

impl FailureType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::StartFailure => "start-failure",
        }
    }
}

/// Lifecycle transitions reported by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started(JobKey),
    Stopped(JobKey),
    Failed(JobKey, FailureType),
}

impl JobEvent {
    pub fn key(&self) -> &JobKey {
        match self {
            Self::Started(key) | Self::Stopped(key) | Self::Failed(key, _) => key,
        }
    }
}

/// A start request handed to the supervisor
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub key: JobKey,
    pub env: LaunchEnv,
}

/// The supervisor in use
pub enum JobBackend {
    Upstart(UpstartJobs),
    Systemd(SystemdJobs),
}

impl JobBackend {
    pub fn flavor(&self) -> &'static str {
        match self {
            Self::Upstart(_) => "upstart",
            Self::Systemd(_) => "systemd",
        }
    }

    pub fn start(&mut self, request: &JobRequest) -> Result<()> {
        debug!("Starting {} via {}", request.key, self.flavor());
        match self {
            Self::Upstart(jobs) => jobs.start(request),
            Self::Systemd(jobs) => jobs.start(request),
        }
        .map_err(|e| Error::ipc("start job", e))
    }

    pub fn stop(&mut self, key: &JobKey) -> Result<()> {
        debug!("Stopping {} via {}", key, self.flavor());
        match self {
            Self::Upstart(jobs) => jobs.stop(key),
            Self::Systemd(jobs) => jobs.stop(key),
        }
        .map_err(|e| Error::ipc("stop job", e))
    }

    /// Running instances of an application job, or of a helper type
    pub fn instances(&mut self, job: &str, helper: bool) -> Result<Vec<JobKey>> {
        match self {
            Self::Upstart(jobs) => jobs.instances(job, helper),
            Self::Systemd(jobs) => jobs.instances(job, helper),
        }
        .map_err(|e| Error::ipc("list instances", e))
    }

    pub fn primary_pid(&mut self, key: &JobKey) -> Result<Option<Pid>> {
        match self {
            Self::Upstart(jobs) => jobs.primary_pid(key),
            Self::Systemd(jobs) => jobs.primary_pid(key),
        }
        .map_err(|e| Error::ipc("primary pid", e))
    }

    pub fn environment(&mut self, key: &JobKey) -> Result<LaunchEnv> {
        match self {
            Self::Upstart(jobs) => jobs.environment(key),
            Self::Systemd(jobs) => jobs.environment(key),
        }
        .map_err(|e| Error::ipc("get environment", e))
    }

    /// Where the supervisor keeps the instance's console output. The
    /// systemd flavor logs to the journal and has no file.
    pub fn log_path(&self, key: &JobKey, cache_dir: &Path) -> Option<PathBuf> {
        match self {
            Self::Upstart(jobs) => Some(jobs.log_path(key, cache_dir)),
            Self::Systemd(_) => None,
        }
    }

    pub fn set_environment(&mut self, key: &JobKey, env: &LaunchEnv) -> Result<()> {
        match self {
            Self::Upstart(jobs) => jobs.set_environment(key, env),
            Self::Systemd(jobs) => jobs.set_environment(key, env),
        }
        .map_err(|e| Error::ipc("set environment", e))
    }

    /// cgroup controller and group holding the instance's processes
    pub fn cgroup_path(&mut self, key: &JobKey) -> Result<Option<(String, String)>> {
        match self {
            Self::Upstart(jobs) => Ok(Some((
                upstart::CGROUP_CONTROLLER.to_string(),
                jobs.cgroup_group(key),
            ))),
            Self::Systemd(jobs) => jobs
                .control_group(key)
                .map(|group| group.map(|g| (String::new(), g)))
                .map_err(|e| Error::ipc("control group", e)),
        }
    }

    /// Subscribe to lifecycle signals. Must be called inside a tokio runtime.
    pub fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<JobEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self {
            Self::Upstart(jobs) => {
                let mut raw = jobs.subscribe().map_err(|e| Error::ipc("subscribe", e))?;
                tokio::spawn(async move {
                    while let Some(signal) = raw.recv().await {
                        for event in upstart::decode_signal(&signal) {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                });
            }
            Self::Systemd(jobs) => {
                let mut raw = jobs.subscribe().map_err(|e| Error::ipc("subscribe", e))?;
                tokio::spawn(async move {
                    while let Some(signal) = raw.recv().await {
                        for event in systemd::decode_signal(&signal) {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        }
        Ok(rx)
    }

    /// Push out anything still queued on the connection
    pub fn flush(&mut self) {
        let result = match self {
            Self::Upstart(jobs) => jobs.flush(),
            Self::Systemd(jobs) => jobs.flush(),
        };
        if let Err(e) = result {
            debug!("Flushing {} connection failed: {}", self.flavor(), e);
        }
    }
}

impl fmt::Debug for JobBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobBackend({})", self.flavor())
    }
}
