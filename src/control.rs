//! Control surface - flat boolean and optional results over the registry
//!
//! Nothing here returns an error. Failures are logged at warn level with the
//! operation and the identifier, and reported as `false`, `None`, `0` or an
//! empty list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::error::{Error, Result};
use crate::core::{AppId, Application, Helper, HelperType, Instance, Registry};
use crate::platform::Pid;

fn log_failure<T>(operation: &str, id: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{} failed for '{}': {}", operation, id, e);
            None
        }
    }
}

fn parse_id(app_id: &str) -> Result<AppId> {
    let id = AppId::parse(app_id);
    if id.is_empty() {
        return Err(Error::InvalidArgument(format!("'{}' is not an application id", app_id)));
    }
    Ok(id)
}

fn application(registry: &Arc<Registry>, app_id: &str) -> Result<Application> {
    registry.application(&parse_id(app_id)?)
}

fn helper(registry: &Arc<Registry>, helper_type: &str, app_id: &str) -> Result<Helper> {
    registry.helper(HelperType::new(helper_type)?, &parse_id(app_id)?)
}

/// The one running instance of an application
fn single_instance(app: &Application) -> Result<Arc<Instance>> {
    let mut instances = app.instances()?;
    match instances.len() {
        0 => Err(Error::NoInstance(app.app_id().to_string())),
        1 => Ok(instances.remove(0)),
        count => Err(Error::AmbiguousInstance {
            id: app.app_id().to_string(),
            count,
        }),
    }
}

pub fn start_application(registry: &Arc<Registry>, app_id: &str, uris: &[String]) -> bool {
    let result = application(registry, app_id).and_then(|app| app.launch(uris));
    log_failure("start application", app_id, result).is_some()
}

/// Start with the testability driver loaded
pub fn start_application_test(registry: &Arc<Registry>, app_id: &str, uris: &[String]) -> bool {
    let result = application(registry, app_id).and_then(|app| app.launch_test(uris));
    log_failure("start application test", app_id, result).is_some()
}

/// Stop every instance. False when none is running.
pub fn stop_application(registry: &Arc<Registry>, app_id: &str) -> bool {
    let result = application(registry, app_id).and_then(|app| {
        let instances = app.instances()?;
        if instances.is_empty() {
            return Err(Error::NoInstance(app_id.to_string()));
        }
        let mut stopped = true;
        for instance in instances {
            if let Err(e) = instance.stop() {
                warn!("Unable to stop {}: {}", instance.key(), e);
                stopped = false;
            }
        }
        Ok(stopped)
    });
    log_failure("stop application", app_id, result).unwrap_or(false)
}

pub fn pause_application(registry: &Arc<Registry>, app_id: &str) -> bool {
    let result = application(registry, app_id)
        .and_then(|app| single_instance(&app))
        .and_then(|instance| instance.pause());
    log_failure("pause application", app_id, result).is_some()
}

pub fn resume_application(registry: &Arc<Registry>, app_id: &str) -> bool {
    let result = application(registry, app_id)
        .and_then(|app| single_instance(&app))
        .and_then(|instance| instance.resume());
    log_failure("resume application", app_id, result).is_some()
}

pub fn start_helper(registry: &Arc<Registry>, helper_type: &str, app_id: &str, uris: &[String]) -> bool {
    let result = helper(registry, helper_type, app_id).and_then(|h| h.launch(uris));
    log_failure("start helper", app_id, result).is_some()
}

/// Start another helper instance, returning its instance id
pub fn start_multiple_helper(
    registry: &Arc<Registry>,
    helper_type: &str,
    app_id: &str,
    uris: &[String],
) -> Option<String> {
    let result = helper(registry, helper_type, app_id).and_then(|h| h.launch(uris));
    log_failure("start multiple helper", app_id, result).map(|i| i.instance_id().to_string())
}

/// Start a helper whose exec line runs through the demangler
pub fn start_session_helper(
    registry: &Arc<Registry>,
    helper_type: &str,
    demangle_name: &str,
    app_id: &str,
    uris: &[String],
) -> Option<String> {
    let result =
        helper(registry, helper_type, app_id).and_then(|h| h.launch_session(uris, demangle_name));
    log_failure("start session helper", app_id, result).map(|i| i.instance_id().to_string())
}

/// Stop every instance of a helper for an application
pub fn stop_helper(registry: &Arc<Registry>, helper_type: &str, app_id: &str) -> bool {
    let result = helper(registry, helper_type, app_id).and_then(|h| {
        let instances = h.instances()?;
        if instances.is_empty() {
            return Err(Error::NoInstance(app_id.to_string()));
        }
        for instance in instances {
            instance.stop()?;
        }
        Ok(())
    });
    log_failure("stop helper", app_id, result).is_some()
}

pub fn stop_multiple_helper(
    registry: &Arc<Registry>,
    helper_type: &str,
    app_id: &str,
    instance_id: &str,
) -> bool {
    let result = helper(registry, helper_type, app_id)
        .and_then(|h| h.existing_instance(instance_id))
        .and_then(|instance| instance.stop());
    log_failure("stop multiple helper", app_id, result).is_some()
}

/// Ids of every application with a running instance
pub fn list_running(registry: &Registry) -> Vec<String> {
    log_failure("list running", "", registry.running_apps())
        .unwrap_or_default()
        .iter()
        .map(AppId::to_string)
        .collect()
}

/// Ids of every application with a running helper of `helper_type`
pub fn list_helpers(registry: &Registry, helper_type: &str) -> Vec<String> {
    let result = HelperType::new(helper_type).and_then(|t| registry.running_helpers(&t));
    log_failure("list helpers", helper_type, result)
        .unwrap_or_default()
        .iter()
        .map(AppId::to_string)
        .collect()
}

pub fn list_helper_instances(registry: &Arc<Registry>, helper_type: &str, app_id: &str) -> Vec<String> {
    let result = helper(registry, helper_type, app_id).and_then(|h| h.instances());
    log_failure("list helper instances", app_id, result)
        .unwrap_or_default()
        .iter()
        .map(|i| i.instance_id().to_string())
        .collect()
}

/// Main process of the first running instance, 0 when there is none
pub fn get_primary_pid(registry: &Arc<Registry>, app_id: &str) -> Pid {
    let result = application(registry, app_id).and_then(|app| {
        for instance in app.instances()? {
            if let Some(pid) = instance.primary_pid()? {
                return Ok(pid);
            }
        }
        Ok(0)
    });
    log_failure("get primary pid", app_id, result).unwrap_or(0)
}

/// Every process of every running instance
pub fn get_pids(registry: &Arc<Registry>, app_id: &str) -> Vec<Pid> {
    let result = application(registry, app_id).and_then(|app| {
        let mut pids = Vec::new();
        for instance in app.instances()? {
            pids.extend(instance.pids());
        }
        Ok(pids)
    });
    log_failure("get pids", app_id, result).unwrap_or_default()
}

pub fn pid_in_app_id(registry: &Arc<Registry>, pid: Pid, app_id: &str) -> bool {
    if pid <= 0 {
        return false;
    }
    let result = application(registry, app_id)
        .and_then(|app| Ok(app.instances()?.iter().any(|i| i.has_pid(pid))));
    log_failure("pid in app id", app_id, result).unwrap_or(false)
}

/// Split a canonical id into (package, appname, version)
pub fn app_id_parse(app_id: &str) -> Option<(String, String, String)> {
    let id = AppId::parse(app_id);
    if id.is_empty() {
        debug!("'{}' is not an application id", app_id);
        return None;
    }
    Some((
        id.package().to_string(),
        id.appname().to_string(),
        id.version().to_string(),
    ))
}

/// Resolve a partial triplet to a full id. `appname` may be a wildcard
/// keyword.
pub fn triplet_to_app_id(
    registry: &Registry,
    package: &str,
    appname: Option<&str>,
    version: Option<&str>,
) -> Option<String> {
    let id = registry.discover(package, appname, version);
    (!id.is_empty()).then(|| id.to_string())
}

/// Application directory and desktop file
pub fn application_info(registry: &Arc<Registry>, app_id: &str) -> Option<(PathBuf, PathBuf)> {
    let app = log_failure("application info", app_id, application(registry, app_id))?;
    let info = app.info();
    let dir = info
        .app_dir
        .clone()
        .or_else(|| info.desktop_path.parent().map(Path::to_path_buf))?;
    Some((dir, info.desktop_path.clone()))
}

/// Console log of the first running instance
pub fn application_log_path(registry: &Arc<Registry>, app_id: &str) -> Option<PathBuf> {
    let result = application(registry, app_id).and_then(|app| {
        let instance = app
            .instances()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoInstance(app_id.to_string()))?;
        instance.log_path()
    });
    log_failure("application log path", app_id, result).flatten()
}

/// Called by a running helper to set its own exec line
pub fn helper_set_exec(registry: &Registry, exec: &str, dir: Option<&Path>) -> bool {
    log_failure("helper set exec", exec, registry.set_helper_exec(exec, dir)).is_some()
}
