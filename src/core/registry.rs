//! Registry - owns the supervisor connection, the package backends, the
//! worker thread and the observer bus
//!
//! There is no process-wide default registry. Build one with
//! [`RegistryBuilder`] and share the returned `Arc`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::appid::{discover_in, AppId, ApplicationWildcard, PackageLookup};
use super::application::Application;
use super::environment::{helper_exec_env, HelperContext, LaunchEnv};
use super::error::{Error, Result};
use super::helper::{Helper, HelperType};
use super::instance::{Instance, InstanceState, InstanceTable};
use super::observer::{AppEvent, FailedEvent, HelperEvent, ObserverBus, PidsEvent};
use super::settings::{LaunchConfig, SupervisorFlavor};
use super::watcher::DesktopWatcher;
use super::worker::{Worker, WorkerState};
use crate::jobs::{
    CgroupConnector, CgroupSession, FsCgroupConnector, JobBackend, JobEvent, JobKey, JobRequest,
    SystemdBus, SystemdJobs, UpstartBus, UpstartJobs,
};
use crate::packages::{
    BackendKind, ClickBackend, ClickDatabase, FsClickDatabase, FsLibertineService, IconCache,
    LegacyBackend, LibertineBackend, LibertineService, PackageBackend, SnapBackend, SnapdClient,
};
use crate::platform::{Pid, ProcessControl, SystemProcesses};

/// Explicit constructor for a [`Registry`]
pub struct RegistryBuilder {
    config: LaunchConfig,
    packages: Option<Vec<PackageBackend>>,
    click: Option<Box<dyn ClickDatabase>>,
    snapd: Option<Box<dyn SnapdClient>>,
    libertine: Option<Box<dyn LibertineService>>,
    upstart: Option<Box<dyn UpstartBus>>,
    systemd: Option<Box<dyn SystemdBus>>,
    cgroups: Option<Arc<dyn CgroupConnector>>,
    processes: Option<Arc<dyn ProcessControl>>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            config: LaunchConfig::default(),
            packages: None,
            click: None,
            snapd: None,
            libertine: None,
            upstart: None,
            systemd: None,
            cgroups: None,
            processes: None,
        }
    }

    pub fn with_config(mut self, config: LaunchConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default backend list entirely
    pub fn with_packages(mut self, packages: Vec<PackageBackend>) -> Self {
        self.packages = Some(packages);
        self
    }

    pub fn with_click_database(mut self, db: Box<dyn ClickDatabase>) -> Self {
        self.click = Some(db);
        self
    }

    /// Enables the snap backend
    pub fn with_snapd(mut self, client: Box<dyn SnapdClient>) -> Self {
        self.snapd = Some(client);
        self
    }

    pub fn with_libertine(mut self, service: Box<dyn LibertineService>) -> Self {
        self.libertine = Some(service);
        self
    }

    pub fn with_upstart_bus(mut self, bus: Box<dyn UpstartBus>) -> Self {
        self.upstart = Some(bus);
        self
    }

    pub fn with_systemd_bus(mut self, bus: Box<dyn SystemdBus>) -> Self {
        self.systemd = Some(bus);
        self
    }

    pub fn with_cgroup_connector(mut self, connector: Arc<dyn CgroupConnector>) -> Self {
        self.cgroups = Some(connector);
        self
    }

    pub fn with_processes(mut self, processes: Arc<dyn ProcessControl>) -> Self {
        self.processes = Some(processes);
        self
    }

    /// Backends in lookup order: click, legacy, libertine, snap
    fn default_packages(
        config: &LaunchConfig,
        click: Option<Box<dyn ClickDatabase>>,
        libertine: Option<Box<dyn LibertineService>>,
        snapd: Option<Box<dyn SnapdClient>>,
    ) -> Vec<PackageBackend> {
        let click = click.unwrap_or_else(|| Box::new(FsClickDatabase::new(&config.click_root)));
        let libertine = libertine.unwrap_or_else(|| {
            Box::new(FsLibertineService::new(
                &config.user_cache_dir,
                &config.user_data_dir,
            ))
        });

        let mut packages = vec![
            PackageBackend::Click(ClickBackend::new(click)),
            PackageBackend::Legacy(LegacyBackend::new(config.data_dirs())),
            PackageBackend::Libertine(LibertineBackend::new(
                libertine,
                &config.user_cache_dir,
                &config.user_data_dir,
            )),
        ];
        if let Some(client) = snapd {
            packages.push(PackageBackend::Snap(SnapBackend::new(
                client,
                &config.snap_root,
                &config.snap_desktop_dir,
                config.snap_basedir.clone(),
            )));
        }
        packages
    }

    pub fn build(self) -> Result<Arc<Registry>> {
        let mut config = self.config;
        config.validate();

        let jobs = match (self.upstart, self.systemd, config.supervisor) {
            (Some(bus), None, _) | (Some(bus), Some(_), SupervisorFlavor::Upstart) => {
                JobBackend::Upstart(UpstartJobs::new(bus))
            }
            (_, Some(bus), _) => JobBackend::Systemd(SystemdJobs::new(bus, &config.exec_tool)),
            (None, None, flavor) => {
                return Err(Error::InvalidArgument(format!(
                    "no {} bus connection supplied",
                    flavor.label()
                )))
            }
        };

        let packages = match self.packages {
            Some(packages) => packages,
            None => Self::default_packages(&config, self.click, self.libertine, self.snapd),
        };
        let watch_dirs: Vec<_> = packages.iter().flat_map(|p| p.watch_dirs()).collect();

        let connector = self
            .cgroups
            .unwrap_or_else(|| Arc::new(FsCgroupConnector::new(&config.cgroup_root)));
        let processes = self
            .processes
            .unwrap_or_else(|| Arc::new(SystemProcesses::new(&config.proc_root)));

        info!(
            "Starting registry with {} supervisor and {} package backends",
            jobs.flavor(),
            packages.len()
        );

        let state = WorkerState {
            packages,
            jobs,
            icons: IconCache::new(),
            cgroups: CgroupSession::new(
                connector,
                config.cgroup_connect_timeout(),
                config.cgroup_idle_timeout(),
            ),
        };
        let worker = Worker::spawn(state)?;

        let bus = Arc::new(ObserverBus::new());
        let instances = Arc::new(InstanceTable::new());
        {
            let bus = Arc::clone(&bus);
            let instances = Arc::clone(&instances);
            worker.watch(Box::new(move |_state: &mut WorkerState, event: JobEvent| {
                route_event(&bus, &instances, event);
            }))?;
        }

        let watcher = if config.watch_desktop_dirs {
            match DesktopWatcher::start(&watch_dirs, Arc::clone(&bus), config.watch_interval()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("Unable to watch desktop directories: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Arc::new(Registry {
            worker,
            bus,
            instances,
            processes,
            config,
            _watcher: Mutex::new(watcher),
        }))
    }
}

/// Turn a supervisor event into instance state and observer signals
fn route_event(bus: &ObserverBus, instances: &InstanceTable, event: JobEvent) {
    debug!("Supervisor event {:?}", event);
    let key = event.key().clone();

    match &event {
        JobEvent::Started(_) => instances.transition(&key, InstanceState::Running),
        JobEvent::Stopped(_) => instances.transition(&key, InstanceState::Stopped),
        JobEvent::Failed(_, kind) => instances.transition(&key, InstanceState::Failed(*kind)),
    }

    if key.helper {
        let helper_type = match HelperType::new(key.job.as_str()) {
            Ok(helper_type) => helper_type,
            Err(e) => {
                debug!("Ignoring helper event: {}", e);
                return;
            }
        };
        let helper_event = HelperEvent {
            helper_type,
            app_id: key.app_id,
            instance_id: key.instance_id,
        };
        match event {
            JobEvent::Started(_) => bus.emit_helper_started(&helper_event),
            JobEvent::Stopped(_) => bus.emit_helper_stopped(&helper_event),
            JobEvent::Failed(_, kind) => {
                warn!("Helper {} failed: {}", helper_event.helper_type, kind.label())
            }
        }
        return;
    }

    let app_event = AppEvent {
        app_id: key.app_id,
        instance_id: key.instance_id,
    };
    match event {
        JobEvent::Started(_) => bus.app_started().emit(&app_event),
        JobEvent::Stopped(_) => bus.app_stopped().emit(&app_event),
        JobEvent::Failed(_, kind) => bus.app_failed().emit(&FailedEvent {
            app_id: app_event.app_id,
            instance_id: app_event.instance_id,
            kind,
        }),
    }
}

/// Process-wide launch coordinator
pub struct Registry {
    worker: Worker,
    bus: Arc<ObserverBus>,
    instances: Arc<InstanceTable>,
    processes: Arc<dyn ProcessControl>,
    config: LaunchConfig,
    _watcher: Mutex<Option<DesktopWatcher>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn observers(&self) -> &ObserverBus {
        &self.bus
    }

    pub(crate) fn processes(&self) -> &dyn ProcessControl {
        self.processes.as_ref()
    }

    /// Resolve a possibly partial id. `appname` may be one of the wildcard
    /// keywords; otherwise an empty appname selects the first listed app.
    pub fn discover(&self, package: &str, appname: Option<&str>, version: Option<&str>) -> AppId {
        match appname.and_then(ApplicationWildcard::from_keyword) {
            Some(wildcard) => self.discover_with(package, None, version, wildcard),
            None => self.discover_with(package, appname, version, ApplicationWildcard::FirstListed),
        }
    }

    pub fn discover_with(
        &self,
        package: &str,
        appname: Option<&str>,
        version: Option<&str>,
        wildcard: ApplicationWildcard,
    ) -> AppId {
        let package = package.to_string();
        let appname = appname.map(str::to_string);
        let version = version.map(str::to_string);
        let result = self.worker.call(move |state| {
            discover_in(
                &state.packages,
                &package,
                appname.as_deref(),
                version.as_deref(),
                wildcard,
            )
        });
        match result {
            Ok(id) => id,
            Err(e) => {
                warn!("Discovery failed: {}", e);
                AppId::empty()
            }
        }
    }

    /// Resolve loose input: a full id, `package_appname`, or a bare package
    pub fn find(&self, input: &str) -> AppId {
        let full = AppId::parse(input);
        if !full.is_empty() {
            return full;
        }
        let parts: Vec<&str> = input.split('_').collect();
        match parts.as_slice() {
            [package] => self.discover(package, None, None),
            [package, appname] => self.discover(package, Some(appname), None),
            _ => AppId::empty(),
        }
    }

    /// The application `app_id`, resolved against its package backend
    pub fn application(self: &Arc<Self>, app_id: &AppId) -> Result<Application> {
        if app_id.is_empty() {
            return Err(Error::InvalidArgument("empty application id".to_string()));
        }
        let id = app_id.clone();
        let arch = self.config.arch.clone();
        let found = self.worker.call(move |state| {
            let backend = state.packages.iter().find(|b| b.has_app_id(&id))?;
            let info = match backend.info(&id, &mut state.icons) {
                Ok(info) => info,
                Err(e) => {
                    warn!("Unable to read info for {}: {}", id, e);
                    return None;
                }
            };
            let mut env = LaunchEnv::new();
            backend.launch_env(&info, arch.as_deref(), |key| std::env::var(key).ok(), &mut env);
            Some((backend.kind(), info, env))
        })?;

        let (kind, info, env) = found.ok_or_else(|| Error::NotFound(app_id.to_string()))?;
        Ok(Application::new(Arc::clone(self), app_id.clone(), kind, info, env))
    }

    pub fn helper(self: &Arc<Self>, helper_type: HelperType, app_id: &AppId) -> Result<Helper> {
        if app_id.is_empty() {
            return Err(Error::InvalidArgument("empty application id".to_string()));
        }
        Ok(Helper::new(Arc::clone(self), helper_type, app_id.clone()))
    }

    /// Every installed application across backends
    pub fn installed_apps(&self) -> Result<Vec<AppId>> {
        self.worker.call(|state| list_installed(&state.packages))
    }

    /// [`Registry::installed_apps`] without blocking the caller's runtime
    pub async fn installed_apps_async(&self) -> Result<Vec<AppId>> {
        self.worker
            .call_async(|state| list_installed(&state.packages))
            .await
    }

    /// Applications with at least one running instance
    pub fn running_apps(&self) -> Result<Vec<AppId>> {
        let mut ids = Vec::new();
        for job in BackendKind::app_jobs() {
            for key in self.job_instances(job, false)? {
                if !ids.contains(&key.app_id) {
                    ids.push(key.app_id);
                }
            }
        }
        Ok(ids)
    }

    /// Applications with at least one running helper of `helper_type`
    pub fn running_helpers(&self, helper_type: &HelperType) -> Result<Vec<AppId>> {
        let mut ids = Vec::new();
        for key in self.job_instances(helper_type.as_str(), true)? {
            if !ids.contains(&key.app_id) {
                ids.push(key.app_id);
            }
        }
        Ok(ids)
    }

    /// Record that the shell focused an application
    pub fn report_focus(&self, app_id: &AppId, instance_id: Option<&str>) {
        for instance in self.instances.find(app_id, instance_id) {
            instance.set_state(InstanceState::Running);
        }
        self.bus.app_focused().emit(&AppEvent {
            app_id: app_id.clone(),
            instance_id: instance_id.unwrap_or_default().to_string(),
        });
    }

    /// Set the exec line of the helper this process runs as, read from the
    /// environment the launcher gave it
    pub fn set_helper_exec(&self, exec: &str, dir: Option<&Path>) -> Result<()> {
        let context = HelperContext::from_env()
            .ok_or_else(|| Error::InvalidArgument("not running as a helper".to_string()))?;
        self.set_helper_exec_for(&context, exec, dir)
    }

    pub fn set_helper_exec_for(
        &self,
        context: &HelperContext,
        exec: &str,
        dir: Option<&Path>,
    ) -> Result<()> {
        if exec.is_empty() {
            return Err(Error::InvalidArgument("empty exec line".to_string()));
        }
        let key = JobKey::helper(
            context.helper_type.as_str(),
            context.app_id.clone(),
            context.instance_id.as_str(),
        );
        let env = helper_exec_env(
            exec,
            dir,
            context.demangle_name.as_deref(),
            &self.config.demangler,
        );
        debug!("Setting exec for {}", key);
        self.worker
            .call(move |state| state.jobs.set_environment(&key, &env))?
    }

    /// Submit a job and track its instance
    pub(crate) fn start_job(self: &Arc<Self>, request: JobRequest, urls: &[String]) -> Result<Arc<Instance>> {
        let instance = self
            .instances
            .intern(self, request.key.clone(), urls, InstanceState::None);
        if !request.key.helper {
            self.bus.app_starting().emit(&AppEvent {
                app_id: request.key.app_id.clone(),
                instance_id: request.key.instance_id.clone(),
            });
        }
        self.worker.call(move |state| state.jobs.start(&request))??;
        if instance.state() == InstanceState::None {
            instance.set_state(InstanceState::Starting);
        }
        Ok(instance)
    }

    pub(crate) fn stop_job(&self, key: &JobKey) -> Result<()> {
        let key = key.clone();
        self.worker.call(move |state| state.jobs.stop(&key))?
    }

    pub(crate) fn job_environment(&self, key: &JobKey) -> Result<LaunchEnv> {
        let key = key.clone();
        self.worker.call(move |state| state.jobs.environment(&key))?
    }

    pub(crate) fn log_path(&self, key: &JobKey) -> Result<Option<PathBuf>> {
        let key = key.clone();
        let cache_dir = self.config.user_cache_dir.clone();
        self.worker
            .call(move |state| state.jobs.log_path(&key, &cache_dir))
    }

    pub(crate) fn job_instances(&self, job: &str, helper: bool) -> Result<Vec<JobKey>> {
        let job = job.to_string();
        self.worker
            .call(move |state| state.jobs.instances(&job, helper))?
    }

    /// Handle for an instance the supervisor reports as running
    pub(crate) fn instance_for(self: &Arc<Self>, key: JobKey) -> Arc<Instance> {
        self.instances.intern(self, key, &[], InstanceState::Running)
    }

    pub(crate) fn primary_pid(&self, key: &JobKey) -> Result<Option<Pid>> {
        let key = key.clone();
        self.worker.call(move |state| state.jobs.primary_pid(&key))?
    }

    /// Cgroup snapshot for `key`. Empty on any failure.
    pub(crate) fn pids_for(&self, key: &JobKey) -> Vec<Pid> {
        let key = key.clone();
        let result = self.worker.call(move |state| match state.jobs.cgroup_path(&key) {
            Ok(Some((controller, group))) => state.cgroups.pids(&controller, &group),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("No cgroup for {}: {}", key, e);
                Vec::new()
            }
        });
        result.unwrap_or_else(|e| {
            warn!("Unable to list processes: {}", e);
            Vec::new()
        })
    }

    pub(crate) fn notify_paused(&self, key: &JobKey, pids: &[Pid]) {
        self.bus.app_paused().emit(&pids_event(key, pids));
    }

    pub(crate) fn notify_resumed(&self, key: &JobKey, pids: &[Pid]) {
        self.bus.app_resumed().emit(&pids_event(key, pids));
    }
}

fn pids_event(key: &JobKey, pids: &[Pid]) -> PidsEvent {
    PidsEvent {
        app_id: key.app_id.clone(),
        instance_id: key.instance_id.clone(),
        pids: pids.to_vec(),
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("supervisor", &self.config.supervisor)
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl AppId {
    /// [`Registry::discover`] as an associated function
    pub fn discover(
        registry: &Registry,
        package: &str,
        appname: Option<&str>,
        version: Option<&str>,
    ) -> AppId {
        registry.discover(package, appname, version)
    }

    /// [`Registry::find`] as an associated function
    pub fn find(registry: &Registry, input: &str) -> AppId {
        registry.find(input)
    }
}

fn list_installed(packages: &[PackageBackend]) -> Vec<AppId> {
    let mut ids = Vec::new();
    for backend in packages {
        for id in backend.list() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}
