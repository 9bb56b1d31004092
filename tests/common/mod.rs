//! Fakes for every external seam, plus a registry fixture built on them

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedSender;

use app_launch::core::oom::OomScore;
use app_launch::jobs::{
    CgroupConnector, CgroupManager, SystemdBus, SystemdSignal, UpstartBus, UpstartSignal,
};
use app_launch::packages::ClickDatabase;
use app_launch::platform::{Pid, ProcessControl, ProcessSignal, SignalOutcome};
use app_launch::core::SupervisorFlavor;
use app_launch::{LaunchConfig, Registry, RegistryBuilder};

fn env_value<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
    env.iter()
        .find_map(|e| e.split_once('=').filter(|(k, _)| *k == key).map(|(_, v)| v))
}

/// What the fake upstart session has seen and knows
#[derive(Default)]
pub struct UpstartState {
    pub path_lookups: Vec<String>,
    pub starts: Vec<(String, Vec<String>)>,
    pub stops: Vec<(String, Vec<String>)>,
    /// Job name to running instance names
    pub instances: HashMap<String, Vec<String>>,
    pub main_pid: Option<Pid>,
    pub env_sets: Vec<(String, String, Vec<String>)>,
    /// Launch environment by (job, instance name)
    pub envs: HashMap<(String, String), Vec<String>>,
    /// Refuse every start request
    pub refuse_starts: bool,
    pub sink: Option<UnboundedSender<UpstartSignal>>,
}

pub struct FakeUpstart {
    pub state: Arc<Mutex<UpstartState>>,
}

fn job_from_path(path: &str) -> String {
    path.rsplit('/').next().unwrap_or_default().to_string()
}

impl UpstartBus for FakeUpstart {
    fn job_path(&mut self, job: &str) -> Result<String> {
        self.state.lock().expect("lock").path_lookups.push(job.to_string());
        Ok(format!("/com/ubuntu/Upstart/jobs/{}", job))
    }

    fn instance_names(&mut self, job_path: &str) -> Result<Vec<String>> {
        let state = self.state.lock().expect("lock");
        Ok(state
            .instances
            .get(&job_from_path(job_path))
            .cloned()
            .unwrap_or_default())
    }

    fn start(&mut self, job_path: &str, env: &[String]) -> Result<()> {
        let job = job_from_path(job_path);
        let app_id = env_value(env, "APP_ID").unwrap_or_default();
        let instance_id = env_value(env, "INSTANCE_ID").unwrap_or_default();
        let name = match env_value(env, "HELPER_TYPE") {
            Some(helper_type) => format!("{}:{}:{}", helper_type, instance_id, app_id),
            None => format!("{}-{}", app_id, instance_id),
        };

        let mut state = self.state.lock().expect("lock");
        if state.refuse_starts {
            anyhow::bail!("job {} refused to start", job);
        }
        state.starts.push((job.clone(), env.to_vec()));
        state.envs.insert((job.clone(), name.clone()), env.to_vec());
        state.instances.entry(job).or_default().push(name);
        Ok(())
    }

    fn stop(&mut self, job_path: &str, env: &[String]) -> Result<()> {
        self.state
            .lock()
            .expect("lock")
            .stops
            .push((job_from_path(job_path), env.to_vec()));
        Ok(())
    }

    fn main_pid(&mut self, _job_path: &str, _instance: &str) -> Result<Option<Pid>> {
        Ok(self.state.lock().expect("lock").main_pid)
    }

    fn get_env(&mut self, job: &str, instance: &str) -> Result<Vec<String>> {
        let state = self.state.lock().expect("lock");
        Ok(state
            .envs
            .get(&(job.to_string(), instance.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn set_env(&mut self, job: &str, instance: &str, vars: &[String]) -> Result<()> {
        self.state.lock().expect("lock").env_sets.push((
            job.to_string(),
            instance.to_string(),
            vars.to_vec(),
        ));
        Ok(())
    }

    fn subscribe(&mut self, sink: UnboundedSender<UpstartSignal>) -> Result<()> {
        self.state.lock().expect("lock").sink = Some(sink);
        Ok(())
    }
}

/// What the fake systemd manager has seen
#[derive(Default)]
pub struct SystemdState {
    pub units: Vec<String>,
    pub started: Vec<(String, Vec<String>, Vec<String>)>,
    pub stopped: Vec<String>,
    pub main_pid: Pid,
    pub sink: Option<UnboundedSender<SystemdSignal>>,
}

pub struct FakeSystemd {
    pub state: Arc<Mutex<SystemdState>>,
}

impl SystemdBus for FakeSystemd {
    fn list_units(&mut self) -> Result<Vec<String>> {
        Ok(self.state.lock().expect("lock").units.clone())
    }

    fn start_transient_unit(&mut self, name: &str, exec: &[String], env: &[String]) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        state.units.push(name.to_string());
        state
            .started
            .push((name.to_string(), exec.to_vec(), env.to_vec()));
        Ok(())
    }

    fn stop_unit(&mut self, name: &str) -> Result<()> {
        self.state.lock().expect("lock").stopped.push(name.to_string());
        Ok(())
    }

    fn main_pid(&mut self, _name: &str) -> Result<Pid> {
        Ok(self.state.lock().expect("lock").main_pid)
    }

    fn control_group(&mut self, name: &str) -> Result<Option<String>> {
        Ok(Some(format!("user.slice/{}", name)))
    }

    fn unit_environment(&mut self, _name: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn set_unit_environment(&mut self, _name: &str, _vars: &[String]) -> Result<()> {
        Ok(())
    }

    fn subscribe(&mut self, sink: UnboundedSender<SystemdSignal>) -> Result<()> {
        self.state.lock().expect("lock").sink = Some(sink);
        Ok(())
    }
}

/// Connections opened and closed through [`FakeCgroups`]
#[derive(Default)]
pub struct CgroupStats {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
}

impl CgroupStats {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Every group holds the same PIDs
pub struct FakeCgroups {
    pub pids: Arc<Mutex<Vec<Pid>>>,
    pub stats: Arc<CgroupStats>,
}

struct FakeCgroupManager {
    pids: Arc<Mutex<Vec<Pid>>>,
    stats: Arc<CgroupStats>,
}

impl CgroupManager for FakeCgroupManager {
    fn tasks_recursive(&mut self, _controller: &str, _group: &str) -> Result<Vec<Pid>> {
        Ok(self.pids.lock().expect("lock").clone())
    }
}

impl Drop for FakeCgroupManager {
    fn drop(&mut self) {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl CgroupConnector for FakeCgroups {
    fn connect(&self) -> Result<Box<dyn CgroupManager>> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCgroupManager {
            pids: Arc::clone(&self.pids),
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// Records signals and OOM writes instead of touching processes
#[derive(Default)]
pub struct FakeProcesses {
    pub signals: Mutex<Vec<(Pid, ProcessSignal)>>,
    pub oom: Mutex<Vec<(Pid, i32)>>,
}

impl ProcessControl for FakeProcesses {
    fn signal(&self, pid: Pid, signal: ProcessSignal) -> Result<SignalOutcome> {
        self.signals.lock().expect("lock").push((pid, signal));
        Ok(SignalOutcome::Delivered)
    }

    fn set_oom_score(&self, pid: Pid, score: &OomScore) -> Result<SignalOutcome> {
        self.oom.lock().expect("lock").push((pid, score.value()));
        Ok(SignalOutcome::Delivered)
    }
}

/// In-memory click database over a package directory on disk
pub struct FakeClick {
    pub manifests: HashMap<String, Value>,
    pub root: PathBuf,
}

impl ClickDatabase for FakeClick {
    fn packages(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = self.manifests.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn manifest(&self, package: &str) -> Result<Value> {
        self.manifests
            .get(package)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no package {}", package))
    }

    fn package_dir(&self, package: &str) -> Result<PathBuf> {
        Ok(self.root.join(package))
    }
}

pub fn write_desktop(dir: &Path, name: &str, extra: &str) {
    fs::create_dir_all(dir).expect("mkdir");
    fs::write(
        dir.join(format!("{}.desktop", name)),
        format!(
            "[Desktop Entry]\nType=Application\nName={}\nExec={} %U\nIcon={}\n{}",
            name, name, name, extra
        ),
    )
    .expect("write desktop file");
}

fn click_packages(root: &Path) -> FakeClick {
    let mut manifests = HashMap::new();
    manifests.insert(
        "com.test.good".to_string(),
        json!({
            "name": "com.test.good",
            "version": "1.2.3",
            "hooks": { "application": { "desktop": "application.desktop" } }
        }),
    );
    manifests.insert(
        "com.test.multiple".to_string(),
        json!({
            "name": "com.test.multiple",
            "version": "2.3.4",
            "hooks": {
                "first": { "desktop": "first.desktop" },
                "second": { "desktop": "second.desktop" },
                "third": { "desktop": "third.desktop" }
            }
        }),
    );
    manifests.insert(
        "com.test.noversion".to_string(),
        json!({ "hooks": { "application": { "desktop": "application.desktop" } } }),
    );

    write_desktop(&root.join("com.test.good"), "application", "");
    for app in ["first", "second", "third"] {
        write_desktop(&root.join("com.test.multiple"), app, "");
    }

    FakeClick {
        manifests,
        root: root.to_path_buf(),
    }
}

pub struct Fixture {
    pub registry: Arc<Registry>,
    pub upstart: Arc<Mutex<UpstartState>>,
    pub processes: Arc<FakeProcesses>,
    pub cgroup_pids: Arc<Mutex<Vec<Pid>>>,
    pub cgroup_stats: Arc<CgroupStats>,
    pub tmp: TempDir,
}

pub fn test_config(tmp: &Path, supervisor: SupervisorFlavor) -> LaunchConfig {
    let mut config = LaunchConfig::default();
    config.supervisor = supervisor;
    config.user_data_dir = tmp.join("data");
    config.system_data_dirs = Vec::new();
    config.user_cache_dir = tmp.join("cache");
    config.arch = Some("x86_64-linux-gnu".to_string());
    config
}

/// A registry on fake upstart with legacy `single` and `multiple` apps and
/// the click packages `com.test.good` and `com.test.multiple`
pub fn upstart_fixture() -> Fixture {
    upstart_fixture_with(|_| {})
}

/// [`upstart_fixture`] with `configure` applied to the test configuration
pub fn upstart_fixture_with(configure: impl FnOnce(&mut LaunchConfig)) -> Fixture {
    let tmp = TempDir::new().expect("tempdir");
    let applications = tmp.path().join("data/applications");
    write_desktop(&applications, "single", "X-Ubuntu-Single-Instance=true\n");
    write_desktop(&applications, "multiple", "");

    let upstart = Arc::new(Mutex::new(UpstartState::default()));
    let processes = Arc::new(FakeProcesses::default());
    let cgroup_pids = Arc::new(Mutex::new(Vec::new()));
    let cgroup_stats = Arc::new(CgroupStats::default());

    let mut config = test_config(tmp.path(), SupervisorFlavor::Upstart);
    configure(&mut config);

    let registry = RegistryBuilder::new()
        .with_config(config)
        .with_click_database(Box::new(click_packages(&tmp.path().join("click"))))
        .with_upstart_bus(Box::new(FakeUpstart {
            state: Arc::clone(&upstart),
        }))
        .with_cgroup_connector(Arc::new(FakeCgroups {
            pids: Arc::clone(&cgroup_pids),
            stats: Arc::clone(&cgroup_stats),
        }))
        .with_processes(processes.clone())
        .build()
        .expect("registry");

    // Queued behind the subscription, so the sink is in place afterwards
    registry.installed_apps().expect("worker running");

    Fixture {
        registry,
        upstart,
        processes,
        cgroup_pids,
        cgroup_stats,
        tmp,
    }
}

impl Fixture {
    pub fn add_instance(&self, job: &str, name: &str) {
        self.upstart
            .lock()
            .expect("lock")
            .instances
            .entry(job.to_string())
            .or_default()
            .push(name.to_string());
    }

    pub fn emit(&self, event: &str, env: &[&str]) {
        let sink = self.upstart.lock().expect("lock").sink.clone();
        sink.expect("subscribed")
            .send(UpstartSignal {
                event: event.to_string(),
                env: env.iter().map(|e| e.to_string()).collect(),
            })
            .expect("worker listening");
    }
}
