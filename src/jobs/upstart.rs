//! Upstart-style supervisor: named jobs with instances, driven by events
//!
//! Application instances are named `<appid>-<instance_id>`. Every helper
//! type runs under the single `untrusted-helper` job with instances named
//! `<type>:<instance_id>:<appid>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{FailureType, JobEvent, JobKey, JobRequest};
use crate::core::appid::AppId;
use crate::core::environment::{self, LaunchEnv};
use crate::platform::Pid;

/// Controller the upstart cgroups live in
pub const CGROUP_CONTROLLER: &str = "freezer";
/// Job every helper type runs under
pub const HELPER_JOB: &str = "untrusted-helper";

/// An event emitted by the supervisor, with its `KEY=value` environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstartSignal {
    pub event: String,
    pub env: Vec<String>,
}

impl UpstartSignal {
    fn var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|e| {
            e.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

/// Connection to the upstart session bus
pub trait UpstartBus: Send {
    /// Object path of a job
    fn job_path(&mut self, job: &str) -> Result<String>;

    /// Names of the running instances of a job
    fn instance_names(&mut self, job_path: &str) -> Result<Vec<String>>;

    fn start(&mut self, job_path: &str, env: &[String]) -> Result<()>;

    fn stop(&mut self, job_path: &str, env: &[String]) -> Result<()>;

    /// Pid of the instance's main process
    fn main_pid(&mut self, job_path: &str, instance: &str) -> Result<Option<Pid>>;

    fn get_env(&mut self, job: &str, instance: &str) -> Result<Vec<String>>;

    fn set_env(&mut self, job: &str, instance: &str, vars: &[String]) -> Result<()>;

    /// Forward `started`/`stopped` events to `sink`
    fn subscribe(&mut self, sink: mpsc::UnboundedSender<UpstartSignal>) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Job upstart runs the key under
pub fn job_name(key: &JobKey) -> &str {
    if key.helper {
        HELPER_JOB
    } else {
        &key.job
    }
}

pub fn instance_name(key: &JobKey) -> String {
    if key.helper {
        format!("{}:{}:{}", key.job, key.instance_id, key.app_id)
    } else {
        format!("{}-{}", key.app_id, key.instance_id)
    }
}

/// Inverse of [`instance_name`] for application jobs
pub fn parse_app_instance(job: &str, instance: &str) -> Option<JobKey> {
    let (app, id) = instance.rsplit_once('-')?;
    if !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let app_id = AppId::parse(app);
    if app_id.is_empty() {
        return None;
    }
    Some(JobKey::application(job, app_id, id))
}

/// Inverse of [`instance_name`] for helpers
pub fn parse_helper_instance(instance: &str) -> Option<JobKey> {
    let mut parts = instance.splitn(3, ':');
    let helper_type = parts.next().filter(|t| !t.is_empty())?;
    let id = parts.next()?;
    let app_id = AppId::parse(parts.next()?);
    if app_id.is_empty() {
        return None;
    }
    Some(JobKey::helper(helper_type, app_id, id))
}

fn decode_key(job: &str, instance: &str) -> Option<JobKey> {
    if job == HELPER_JOB {
        parse_helper_instance(instance)
    } else if job.starts_with("application-") {
        parse_app_instance(job, instance)
    } else {
        None
    }
}

/// Translate a supervisor event. A failed `stopped` reports the failure
/// before the stop.
pub fn decode_signal(signal: &UpstartSignal) -> Vec<JobEvent> {
    let (Some(job), Some(instance)) = (signal.var("JOB"), signal.var("INSTANCE")) else {
        return Vec::new();
    };
    let Some(key) = decode_key(job, instance) else {
        debug!("Ignoring {} for {} instance '{}'", signal.event, job, instance);
        return Vec::new();
    };

    match signal.event.as_str() {
        "started" => vec![JobEvent::Started(key)],
        "stopped" if signal.var("RESULT") == Some("failed") => {
            let kind = match signal.var("PROCESS") {
                Some("pre-start") | Some("spawned") => FailureType::StartFailure,
                _ => FailureType::Crash,
            };
            vec![JobEvent::Failed(key.clone(), kind), JobEvent::Stopped(key)]
        }
        "stopped" => vec![JobEvent::Stopped(key)],
        _ => Vec::new(),
    }
}

pub struct UpstartJobs {
    bus: Box<dyn UpstartBus>,
    /// Job name to object path, filled once per job
    paths: HashMap<String, String>,
}

impl UpstartJobs {
    pub fn new(bus: Box<dyn UpstartBus>) -> Self {
        Self {
            bus,
            paths: HashMap::new(),
        }
    }

    fn path(&mut self, job: &str) -> Result<String> {
        if let Some(path) = self.paths.get(job) {
            return Ok(path.clone());
        }
        let path = self.bus.job_path(job)?;
        debug!("Job '{}' is at {}", job, path);
        self.paths.insert(job.to_string(), path.clone());
        Ok(path)
    }

    pub fn start(&mut self, request: &JobRequest) -> Result<()> {
        let path = self.path(job_name(&request.key))?;
        self.bus.start(&path, &request.env.to_strings())
    }

    pub fn stop(&mut self, key: &JobKey) -> Result<()> {
        let path = self.path(job_name(key))?;
        let mut env = LaunchEnv::new();
        env.set(environment::APP_ID, key.app_id.to_string());
        env.set(environment::INSTANCE_ID, key.instance_id.as_str());
        if key.helper {
            env.set(environment::HELPER_TYPE, key.job.as_str());
        }
        self.bus.stop(&path, &env.to_strings())
    }

    pub fn instances(&mut self, job: &str, helper: bool) -> Result<Vec<JobKey>> {
        let upstart_job = if helper { HELPER_JOB } else { job };
        let path = self.path(upstart_job)?;
        let mut keys = Vec::new();
        for name in self.bus.instance_names(&path)? {
            match decode_key(upstart_job, &name) {
                Some(key) if !helper || key.job == job => keys.push(key),
                Some(_) => {}
                None => warn!("Skipping malformed {} instance '{}'", upstart_job, name),
            }
        }
        Ok(keys)
    }

    pub fn primary_pid(&mut self, key: &JobKey) -> Result<Option<Pid>> {
        let path = self.path(job_name(key))?;
        self.bus.main_pid(&path, &instance_name(key))
    }

    pub fn environment(&mut self, key: &JobKey) -> Result<LaunchEnv> {
        let vars = self.bus.get_env(job_name(key), &instance_name(key))?;
        Ok(LaunchEnv::from_strings(&vars[..]))
    }

    pub fn set_environment(&mut self, key: &JobKey, env: &LaunchEnv) -> Result<()> {
        self.bus
            .set_env(job_name(key), &instance_name(key), &env.to_strings())
    }

    /// Upstart's per-instance console log under the user cache directory
    pub fn log_path(&self, key: &JobKey, cache_dir: &Path) -> PathBuf {
        cache_dir
            .join("upstart")
            .join(format!("{}-{}.log", job_name(key), instance_name(key)))
    }

    /// `upstart/<job>-<instance>`
    pub fn cgroup_group(&self, key: &JobKey) -> String {
        format!("upstart/{}-{}", job_name(key), instance_name(key))
    }

    pub fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<UpstartSignal>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus.subscribe(tx)?;
        Ok(rx)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.bus.flush()
    }
}
