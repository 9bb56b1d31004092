//! Applications - an [`AppId`] resolved against the package backend that
//! owns it

use std::sync::Arc;

use tracing::info;

use super::appid::AppId;
use super::environment::{self, LaunchEnv};
use super::error::Result;
use super::instance::{next_instance_id, Instance};
use super::registry::Registry;
use crate::jobs::{JobKey, JobRequest};
use crate::packages::{AppInfo, BackendKind};

pub struct Application {
    registry: Arc<Registry>,
    app_id: AppId,
    kind: BackendKind,
    info: AppInfo,
    /// Backend additions to every launch environment
    extra_env: LaunchEnv,
}

impl Application {
    pub(crate) fn new(
        registry: Arc<Registry>,
        app_id: AppId,
        kind: BackendKind,
        info: AppInfo,
        extra_env: LaunchEnv,
    ) -> Self {
        Self {
            registry,
            app_id,
            kind,
            info,
            extra_env,
        }
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn info(&self) -> &AppInfo {
        &self.info
    }

    /// Supervisor job the application runs under
    pub fn job(&self) -> &'static str {
        self.kind.job_name()
    }

    /// Launch with `urls`. A single-instance application that is already
    /// running returns its existing instance.
    pub fn launch(&self, urls: &[String]) -> Result<Arc<Instance>> {
        self.start(urls, false)
    }

    /// Launch with the testability driver loaded
    pub fn launch_test(&self, urls: &[String]) -> Result<Arc<Instance>> {
        self.start(urls, true)
    }

    fn start(&self, urls: &[String], testing: bool) -> Result<Arc<Instance>> {
        let instance_id = if self.info.single_instance {
            if let Some(existing) = self.instances()?.into_iter().next() {
                info!("{} is single instance and already running", self.app_id);
                return Ok(existing);
            }
            String::new()
        } else {
            next_instance_id()
        };

        let mut env = LaunchEnv::for_job(&self.app_id, &instance_id, urls);
        env.set(environment::APP_EXEC, self.info.exec.as_str());
        for (key, value) in self.extra_env.vars() {
            env.set(key, value.as_str());
        }
        if testing {
            env.set(environment::TESTABILITY, "1");
        }

        let key = JobKey::application(self.job(), self.app_id.clone(), instance_id);
        info!("Launching {}", key);
        self.registry.start_job(JobRequest { key, env }, urls)
    }

    /// Running instances, as the supervisor reports them now
    pub fn instances(&self) -> Result<Vec<Arc<Instance>>> {
        let keys = self.registry.job_instances(self.job(), false)?;
        Ok(keys
            .into_iter()
            .filter(|key| key.app_id == self.app_id)
            .map(|key| self.registry.instance_for(key))
            .collect())
    }

    pub fn has_instances(&self) -> Result<bool> {
        Ok(!self.instances()?.is_empty())
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("app_id", &self.app_id)
            .field("kind", &self.kind)
            .finish()
    }
}
