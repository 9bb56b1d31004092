//! Helpers - typed background jobs that run on behalf of an application

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::appid::AppId;
use super::environment::{self, LaunchEnv};
use super::error::{Error, Result};
use super::instance::{next_instance_id, Instance};
use super::registry::Registry;
use crate::jobs::{JobKey, JobRequest};

/// Name of a class of helpers, e.g. `url-dispatcher`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HelperType(String);

impl HelperType {
    /// Fails on an empty type or one containing `:` or whitespace
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArgument("helper type is empty".to_string()));
        }
        if name.contains(':') || name.chars().any(char::is_whitespace) {
            return Err(Error::InvalidArgument(format!(
                "helper type '{}' contains a reserved character",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HelperType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One helper type bound to one application
pub struct Helper {
    registry: Arc<Registry>,
    helper_type: HelperType,
    app_id: AppId,
}

impl Helper {
    pub(crate) fn new(registry: Arc<Registry>, helper_type: HelperType, app_id: AppId) -> Self {
        Self {
            registry,
            helper_type,
            app_id,
        }
    }

    pub fn helper_type(&self) -> &HelperType {
        &self.helper_type
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    /// Start a new instance
    pub fn launch(&self, urls: &[String]) -> Result<Arc<Instance>> {
        self.start(urls, None)
    }

    /// Start a new instance that is handed `demangle_name` so its exec line
    /// runs through the demangler
    pub fn launch_session(&self, urls: &[String], demangle_name: &str) -> Result<Arc<Instance>> {
        if demangle_name.is_empty() {
            return Err(Error::InvalidArgument("demangle name is empty".to_string()));
        }
        self.start(urls, Some(demangle_name))
    }

    fn start(&self, urls: &[String], demangle_name: Option<&str>) -> Result<Arc<Instance>> {
        let instance_id = next_instance_id();
        let mut env = LaunchEnv::for_job(&self.app_id, &instance_id, urls);
        env.set(environment::HELPER_TYPE, self.helper_type.as_str());
        if let Some(name) = demangle_name {
            env.set(environment::DEMANGLE_NAME, name);
        }

        let key = JobKey::helper(self.helper_type.as_str(), self.app_id.clone(), instance_id);
        info!("Launching helper {}", key);
        self.registry.start_job(JobRequest { key, env }, urls)
    }

    /// Running instances of this helper for this application
    pub fn instances(&self) -> Result<Vec<Arc<Instance>>> {
        let keys = self
            .registry
            .job_instances(self.helper_type.as_str(), true)?;
        Ok(keys
            .into_iter()
            .filter(|key| key.app_id == self.app_id)
            .map(|key| self.registry.instance_for(key))
            .collect())
    }

    pub fn has_instances(&self) -> Result<bool> {
        Ok(!self.instances()?.is_empty())
    }

    /// The running instance with `instance_id`
    pub fn existing_instance(&self, instance_id: &str) -> Result<Arc<Instance>> {
        self.instances()?
            .into_iter()
            .find(|i| i.instance_id() == instance_id)
            .ok_or_else(|| {
                Error::NoInstance(format!(
                    "{} helper {} instance '{}'",
                    self.helper_type, self.app_id, instance_id
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_types_are_validated() {
        assert!(HelperType::new("untrusted-helper").is_ok());
        assert!(matches!(HelperType::new(""), Err(Error::InvalidArgument(_))));
        assert!(matches!(HelperType::new("a:b"), Err(Error::InvalidArgument(_))));
        assert!(matches!(HelperType::new("a b"), Err(Error::InvalidArgument(_))));
        assert_eq!(HelperType::new("url-dispatcher").map(|t| t.to_string()).ok(), Some("url-dispatcher".to_string()));
    }
}
