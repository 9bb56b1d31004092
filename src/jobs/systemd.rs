//! systemd-style supervisor: one transient unit per instance
//!
//! Units are named `ubuntu-app-launch--<job>--<appid>--<instance_id>.service`
//! and run the exec tool, which reads `APP_EXEC` from the unit environment.

use std::path::PathBuf;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{FailureType, JobEvent, JobKey, JobRequest};
use crate::core::appid::AppId;
use crate::core::environment::LaunchEnv;
use crate::platform::Pid;

const UNIT_PREFIX: &str = "ubuntu-app-launch--";
const UNIT_SUFFIX: &str = ".service";

/// Unit lifecycle signals from the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemdSignal {
    UnitNew(String),
    UnitRemoved(String),
    /// The unit's `Result` property changed
    UnitResult { unit: String, result: String },
}

/// Connection to the systemd user manager
pub trait SystemdBus: Send {
    /// Names of all loaded units
    fn list_units(&mut self) -> Result<Vec<String>>;

    fn start_transient_unit(&mut self, name: &str, exec: &[String], env: &[String]) -> Result<()>;

    fn stop_unit(&mut self, name: &str) -> Result<()>;

    /// `MainPID`, zero when the unit has no main process
    fn main_pid(&mut self, name: &str) -> Result<Pid>;

    /// `ControlGroup` path relative to the cgroup root
    fn control_group(&mut self, name: &str) -> Result<Option<String>>;

    fn unit_environment(&mut self, name: &str) -> Result<Vec<String>>;

    fn set_unit_environment(&mut self, name: &str, vars: &[String]) -> Result<()>;

    fn subscribe(&mut self, sink: mpsc::UnboundedSender<SystemdSignal>) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn unit_name(key: &JobKey) -> String {
    format!(
        "{}{}--{}--{}{}",
        UNIT_PREFIX, key.job, key.app_id, key.instance_id, UNIT_SUFFIX
    )
}

/// Inverse of [`unit_name`]. Units from anything else yield `None`.
pub fn parse_unit_name(name: &str) -> Option<JobKey> {
    let body = name.strip_prefix(UNIT_PREFIX)?.strip_suffix(UNIT_SUFFIX)?;
    let (job, rest) = body.split_once("--")?;
    let (app, instance) = rest.rsplit_once("--")?;
    if job.is_empty() || !instance.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let app_id = AppId::parse(app);
    if app_id.is_empty() {
        return None;
    }
    if job.starts_with("application-") {
        Some(JobKey::application(job, app_id, instance))
    } else {
        Some(JobKey::helper(job, app_id, instance))
    }
}

/// How a unit `Result` maps onto a failure
pub fn failure_from_result(result: &str) -> Option<FailureType> {
    match result {
        "success" | "" => None,
        "resources" | "timeout" | "start-limit-hit" | "exec-condition" => {
            Some(FailureType::StartFailure)
        }
        _ => Some(FailureType::Crash),
    }
}

pub fn decode_signal(signal: &SystemdSignal) -> Vec<JobEvent> {
    match signal {
        SystemdSignal::UnitNew(unit) => parse_unit_name(unit)
            .map(JobEvent::Started)
            .into_iter()
            .collect(),
        SystemdSignal::UnitRemoved(unit) => parse_unit_name(unit)
            .map(JobEvent::Stopped)
            .into_iter()
            .collect(),
        SystemdSignal::UnitResult { unit, result } => {
            match (parse_unit_name(unit), failure_from_result(result)) {
                (Some(key), Some(kind)) => vec![JobEvent::Failed(key, kind)],
                _ => Vec::new(),
            }
        }
    }
}

pub struct SystemdJobs {
    bus: Box<dyn SystemdBus>,
    exec_tool: PathBuf,
}

impl SystemdJobs {
    pub fn new(bus: Box<dyn SystemdBus>, exec_tool: impl Into<PathBuf>) -> Self {
        Self {
            bus,
            exec_tool: exec_tool.into(),
        }
    }

    pub fn start(&mut self, request: &JobRequest) -> Result<()> {
        let name = unit_name(&request.key);
        let exec = vec![self.exec_tool.display().to_string()];
        debug!("Starting transient unit {}", name);
        self.bus
            .start_transient_unit(&name, &exec, &request.env.to_strings())
    }

    pub fn stop(&mut self, key: &JobKey) -> Result<()> {
        self.bus.stop_unit(&unit_name(key))
    }

    pub fn instances(&mut self, job: &str, helper: bool) -> Result<Vec<JobKey>> {
        let mut keys = Vec::new();
        for unit in self.bus.list_units()? {
            if !unit.starts_with(UNIT_PREFIX) {
                continue;
            }
            match parse_unit_name(&unit) {
                Some(key) if key.job == job && key.helper == helper => keys.push(key),
                Some(_) => {}
                None => warn!("Skipping malformed unit '{}'", unit),
            }
        }
        Ok(keys)
    }

    pub fn primary_pid(&mut self, key: &JobKey) -> Result<Option<Pid>> {
        let pid = self.bus.main_pid(&unit_name(key))?;
        Ok((pid > 0).then_some(pid))
    }

    pub fn environment(&mut self, key: &JobKey) -> Result<LaunchEnv> {
        let vars = self.bus.unit_environment(&unit_name(key))?;
        Ok(LaunchEnv::from_strings(&vars[..]))
    }

    pub fn set_environment(&mut self, key: &JobKey, env: &LaunchEnv) -> Result<()> {
        self.bus
            .set_unit_environment(&unit_name(key), &env.to_strings())
    }

    pub fn control_group(&mut self, key: &JobKey) -> Result<Option<String>> {
        self.bus.control_group(&unit_name(key))
    }

    pub fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<SystemdSignal>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus.subscribe(tx)?;
        Ok(rx)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.bus.flush()
    }
}
