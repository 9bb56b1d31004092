//! Instance management - one running (or starting) job of an application
//! or helper

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::appid::AppId;
use super::environment::LaunchEnv;
use super::error::{Error, Result};
use super::oom::OomScore;
use super::registry::Registry;
use crate::jobs::{FailureType, JobKey};
use crate::platform::{Pid, ProcessSignal, SignalOutcome};

/// Lifecycle of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Known but never seen by the supervisor
    None,
    /// Submitted, waiting for the started signal
    Starting,
    Running,
    /// Stop requested
    Stopping,
    Stopped,
    Failed(FailureType),
}

impl InstanceState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failed(FailureType::Crash) => "Crashed",
            Self::Failed(FailureType::StartFailure) => "Start failed",
        }
    }
}

static LAST_INSTANCE_ID: AtomicI64 = AtomicI64::new(0);

/// A fresh instance id: a microsecond timestamp, strictly increasing
/// within the process
pub fn next_instance_id() -> String {
    let now = chrono::Utc::now().timestamp_micros();
    let mut last = LAST_INSTANCE_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_INSTANCE_ID.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next.to_string(),
            Err(current) => last = current,
        }
    }
}

/// A job instance. PIDs are never cached; every query asks again.
pub struct Instance {
    registry: Arc<Registry>,
    key: JobKey,
    urls: Vec<String>,
    state: Mutex<InstanceState>,
}

impl Instance {
    fn new(registry: Arc<Registry>, key: JobKey, urls: Vec<String>, state: InstanceState) -> Self {
        Self {
            registry,
            key,
            urls,
            state: Mutex::new(state),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, InstanceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn app_id(&self) -> &AppId {
        &self.key.app_id
    }

    /// Application job name or helper type
    pub fn job(&self) -> &str {
        &self.key.job
    }

    /// Empty for single-instance applications
    pub fn instance_id(&self) -> &str {
        &self.key.instance_id
    }

    pub fn is_helper(&self) -> bool {
        self.key.helper
    }

    /// URLs the instance was launched with, if it was launched here
    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn state(&self) -> InstanceState {
        *self.lock_state()
    }

    pub(crate) fn set_state(&self, state: InstanceState) {
        let mut current = self.lock_state();
        if *current != state {
            debug!("{}: {} -> {}", self.key, current.label(), state.label());
            *current = state;
        }
    }

    /// Whether the supervisor still has processes for this instance
    pub fn is_running(&self) -> bool {
        match self.primary_pid() {
            Ok(Some(_)) => true,
            Ok(None) => !self.pids().is_empty(),
            Err(e) => {
                warn!("Unable to query {}: {}", self.key, e);
                false
            }
        }
    }

    /// Main process as reported by the supervisor
    pub fn primary_pid(&self) -> Result<Option<Pid>> {
        self.registry.primary_pid(&self.key)
    }

    /// Snapshot of every process in the instance's cgroup
    pub fn pids(&self) -> Vec<Pid> {
        self.registry.pids_for(&self.key)
    }

    pub fn has_pid(&self, pid: Pid) -> bool {
        if pid <= 0 {
            return false;
        }
        if matches!(self.primary_pid(), Ok(Some(primary)) if primary == pid) {
            return true;
        }
        self.pids().contains(&pid)
    }

    /// The environment the supervisor holds for this instance
    pub fn environment(&self) -> Result<LaunchEnv> {
        self.registry.job_environment(&self.key)
    }

    /// Console log file, when the supervisor writes one
    pub fn log_path(&self) -> Result<Option<PathBuf>> {
        self.registry.log_path(&self.key)
    }

    /// Stop every process and mark the primary one as the first to kill
    pub fn pause(&self) -> Result<Vec<Pid>> {
        let pids = self.signal_all(ProcessSignal::Stop);
        self.apply_oom(&OomScore::paused());
        info!("Paused {} ({} processes)", self.key, pids.len());
        self.registry.notify_paused(&self.key, &pids);
        Ok(pids)
    }

    /// Continue every process and restore the focused OOM score
    pub fn resume(&self) -> Result<Vec<Pid>> {
        let pids = self.signal_all(ProcessSignal::Continue);
        self.apply_oom(&OomScore::focused());
        info!("Resumed {} ({} processes)", self.key, pids.len());
        self.registry.notify_resumed(&self.key, &pids);
        Ok(pids)
    }

    /// Ask the supervisor to stop the job
    pub fn stop(&self) -> Result<()> {
        self.registry.stop_job(&self.key)?;
        self.set_state(InstanceState::Stopping);
        Ok(())
    }

    /// Apply `score` to the primary process
    pub fn set_oom_score(&self, score: &OomScore) -> Result<()> {
        let pid = self
            .primary_pid()?
            .ok_or_else(|| Error::NoInstance(self.key.to_string()))?;
        self.registry
            .processes()
            .set_oom_score(pid, score)
            .map_err(|e| Error::ipc("set oom score", e))?;
        Ok(())
    }

    /// Signal the current PID set, returning the PIDs that were signalled
    fn signal_all(&self, signal: ProcessSignal) -> Vec<Pid> {
        let pids = self.pids();
        let processes = self.registry.processes();
        for &pid in &pids {
            match processes.signal(pid, signal) {
                Ok(SignalOutcome::Delivered) => {}
                Ok(SignalOutcome::Gone) => debug!("Process {} exited before {:?}", pid, signal),
                Err(e) => warn!("Unable to send {:?} to {} of {}: {}", signal, pid, self.key, e),
            }
        }
        pids
    }

    fn apply_oom(&self, score: &OomScore) {
        let pid = match self.primary_pid() {
            Ok(Some(pid)) => pid,
            Ok(None) => return,
            Err(e) => {
                warn!("No primary process for {}: {}", self.key, e);
                return;
            }
        };
        match self.registry.processes().set_oom_score(pid, score) {
            Ok(_) => {}
            Err(e) => warn!("Unable to set {} OOM score on {}: {}", score.label(), pid, e),
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Live instances, so every handle to one job shares its state
#[derive(Default)]
pub struct InstanceTable {
    entries: Mutex<HashMap<JobKey, Weak<Instance>>>,
}

impl InstanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobKey, Weak<Instance>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The live instance for `key`, created in `state` when there is none
    pub fn intern(
        &self,
        registry: &Arc<Registry>,
        key: JobKey,
        urls: &[String],
        state: InstanceState,
    ) -> Arc<Instance> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        entries.retain(|_, weak| weak.strong_count() > 0);
        let instance = Arc::new(Instance::new(
            Arc::clone(registry),
            key.clone(),
            urls.to_vec(),
            state,
        ));
        entries.insert(key, Arc::downgrade(&instance));
        instance
    }

    pub fn get(&self, key: &JobKey) -> Option<Arc<Instance>> {
        self.lock().get(key).and_then(Weak::upgrade)
    }

    /// Move a live instance to `state`. A failed instance stays failed
    /// when its stop arrives.
    pub fn transition(&self, key: &JobKey, state: InstanceState) {
        if let Some(instance) = self.get(key) {
            let failed = matches!(instance.state(), InstanceState::Failed(_));
            if !(failed && state == InstanceState::Stopped) {
                instance.set_state(state);
            }
        }
        if state == InstanceState::Stopped {
            self.lock().remove(key);
        }
    }

    /// Live application instances of `app_id`, optionally one instance id
    pub fn find(&self, app_id: &AppId, instance_id: Option<&str>) -> Vec<Arc<Instance>> {
        self.lock()
            .iter()
            .filter(|(key, _)| !key.helper && &key.app_id == app_id)
            .filter(|(key, _)| instance_id.map_or(true, |id| key.instance_id == id))
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
