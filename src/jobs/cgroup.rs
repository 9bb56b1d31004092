//! PID enumeration through the cgroup manager
//!
//! The manager connection is opened lazily with a bounded connect time and
//! dropped once it has been idle for a while. Every failure degrades to an
//! empty PID list: no PIDs is a normal, transient state.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::platform::Pid;

/// An open connection to the cgroup manager
pub trait CgroupManager: Send {
    /// Every task in `group` and its descendants
    fn tasks_recursive(&mut self, controller: &str, group: &str) -> Result<Vec<Pid>>;
}

/// Opens manager connections. May block; callers bound the wait.
pub trait CgroupConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn CgroupManager>>;
}

/// Reads `cgroup.procs` and `tasks` files under a cgroup filesystem root
#[derive(Debug, Clone)]
pub struct FsCgroupConnector {
    root: PathBuf,
}

impl FsCgroupConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl CgroupConnector for FsCgroupConnector {
    fn connect(&self) -> Result<Box<dyn CgroupManager>> {
        if !self.root.is_dir() {
            anyhow::bail!("cgroup root {} is not mounted", self.root.display());
        }
        Ok(Box::new(FsCgroupManager {
            root: self.root.clone(),
        }))
    }
}

struct FsCgroupManager {
    root: PathBuf,
}

impl CgroupManager for FsCgroupManager {
    fn tasks_recursive(&mut self, controller: &str, group: &str) -> Result<Vec<Pid>> {
        let mut dir = self.root.clone();
        if !controller.is_empty() {
            dir.push(controller);
        }
        dir.push(group.trim_start_matches('/'));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let mut pids = Vec::new();
        for entry in WalkDir::new(&dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let name = entry.file_name();
            if name != "cgroup.procs" && name != "tasks" {
                continue;
            }
            let content = match std::fs::read_to_string(entry.path()) {
                Ok(content) => content,
                Err(e) => {
                    debug!("Unable to read {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            for pid in content.lines().filter_map(|l| l.trim().parse::<Pid>().ok()) {
                if seen.insert(pid) {
                    pids.push(pid);
                }
            }
        }
        Ok(pids)
    }
}

type ConnectResult = Result<Box<dyn CgroupManager>>;

/// Lazily connected, idle-expiring manager connection. Lives on the worker.
///
/// At most one connect attempt is in flight. A connect that outlives its
/// timeout is picked up again by the next call instead of being retried.
pub struct CgroupSession {
    connector: Arc<dyn CgroupConnector>,
    manager: Option<Box<dyn CgroupManager>>,
    pending: Option<mpsc::Receiver<ConnectResult>>,
    last_used: Option<Instant>,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl CgroupSession {
    pub fn new(
        connector: Arc<dyn CgroupConnector>,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            manager: None,
            pending: None,
            last_used: None,
            connect_timeout,
            idle_timeout,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_some()
    }

    /// Snapshot of the PIDs in a group. Empty on any failure.
    pub fn pids(&mut self, controller: &str, group: &str) -> Vec<Pid> {
        self.last_used = Some(Instant::now());
        if self.manager.is_none() {
            self.manager = self.connect();
        }
        let Some(manager) = self.manager.as_mut() else {
            return Vec::new();
        };
        match manager.tasks_recursive(controller, group) {
            Ok(pids) => pids,
            Err(e) => {
                warn!("Unable to list tasks for cgroup '{}': {}", group, e);
                Vec::new()
            }
        }
    }

    /// Connect on a helper thread so a hung manager cannot stall the worker
    fn connect(&mut self) -> Option<Box<dyn CgroupManager>> {
        let rx = match self.pending.take() {
            Some(rx) => rx,
            None => self.spawn_connect()?,
        };

        match rx.recv_timeout(self.connect_timeout) {
            Ok(Ok(manager)) => {
                debug!("Connected to cgroup manager");
                Some(manager)
            }
            Ok(Err(e)) => {
                warn!("Unable to connect to cgroup manager: {}", e);
                None
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    "Timed out after {:?} connecting to cgroup manager",
                    self.connect_timeout
                );
                self.pending = Some(rx);
                None
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                warn!("Cgroup connect thread exited without an answer");
                None
            }
        }
    }

    fn spawn_connect(&self) -> Option<mpsc::Receiver<ConnectResult>> {
        let connector = Arc::clone(&self.connector);
        let (tx, rx) = mpsc::channel();
        let spawned = std::thread::Builder::new()
            .name("cgroup-connect".to_string())
            .spawn(move || {
                let _ = tx.send(connector.connect());
            });
        match spawned {
            Ok(_) => Some(rx),
            Err(e) => {
                warn!("Unable to spawn cgroup connect thread: {}", e);
                None
            }
        }
    }

    /// Whether a timed out connect attempt is still running
    pub fn is_connecting(&self) -> bool {
        self.pending.is_some()
    }

    /// When the connection should be dropped, if one is open
    pub fn deadline(&self) -> Option<Instant> {
        match (&self.manager, self.last_used) {
            (Some(_), Some(last)) => Some(last + self.idle_timeout),
            _ => None,
        }
    }

    /// Drop the connection if it has been idle long enough
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                info!("Closing idle cgroup manager connection");
                self.disconnect();
                true
            }
            _ => false,
        }
    }

    pub fn disconnect(&mut self) {
        self.manager = None;
        self.pending = None;
        self.last_used = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct SlowConnector;

    impl CgroupConnector for SlowConnector {
        fn connect(&self) -> Result<Box<dyn CgroupManager>> {
            std::thread::sleep(Duration::from_secs(2));
            anyhow::bail!("never answers in time")
        }
    }

    /// Hangs until the test releases it, then fails
    struct HungConnector {
        release: Mutex<mpsc::Receiver<()>>,
        connects: AtomicUsize,
    }

    impl CgroupConnector for HungConnector {
        fn connect(&self) -> Result<Box<dyn CgroupManager>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let _ = self.release.lock().expect("lock").recv();
            anyhow::bail!("manager went away")
        }
    }

    struct CountingConnector {
        root: PathBuf,
        connects: AtomicUsize,
    }

    impl CgroupConnector for CountingConnector {
        fn connect(&self) -> Result<Box<dyn CgroupManager>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            FsCgroupConnector::new(&self.root).connect()
        }
    }

    #[test]
    fn reads_tasks_recursively() {
        let tmp = TempDir::new().expect("tempdir");
        let group = tmp.path().join("freezer/upstart/application-legacy-multiple_multiple_0.0-2342345");
        fs::create_dir_all(group.join("child")).expect("mkdir");
        fs::write(group.join("tasks"), "100\n200\n").expect("write");
        fs::write(group.join("child/tasks"), "300\n200\n").expect("write");

        let mut manager = FsCgroupConnector::new(tmp.path()).connect().expect("connect");
        let pids = manager
            .tasks_recursive("freezer", "upstart/application-legacy-multiple_multiple_0.0-2342345")
            .expect("tasks");
        assert_eq!(pids, vec![300, 200, 100]);
        assert!(manager.tasks_recursive("freezer", "missing").expect("tasks").is_empty());
    }

    #[test]
    fn connect_timeout_yields_empty_list() {
        let mut session = CgroupSession::new(
            Arc::new(SlowConnector),
            Duration::from_millis(100),
            Duration::from_secs(300),
        );
        let started = Instant::now();
        assert!(session.pids("freezer", "anything").is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!session.is_connected());
    }

    #[test]
    fn idle_connection_expires_and_reconnects() {
        let tmp = TempDir::new().expect("tempdir");
        let connector = Arc::new(CountingConnector {
            root: tmp.path().to_path_buf(),
            connects: AtomicUsize::new(0),
        });
        let mut session = CgroupSession::new(
            connector.clone(),
            Duration::from_secs(1),
            Duration::from_secs(300),
        );

        session.pids("", "group");
        session.pids("", "group");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        let deadline = session.deadline().expect("deadline while connected");
        assert!(!session.expire(deadline - Duration::from_secs(1)));
        assert!(session.expire(deadline));
        assert!(session.deadline().is_none());

        session.pids("", "group");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hung_manager_gets_one_connect_attempt() {
        let (release, rx) = mpsc::channel();
        let connector = Arc::new(HungConnector {
            release: Mutex::new(rx),
            connects: AtomicUsize::new(0),
        });
        let mut session = CgroupSession::new(
            connector.clone(),
            Duration::from_millis(50),
            Duration::from_secs(300),
        );

        for _ in 0..5 {
            assert!(session.pids("freezer", "group").is_empty());
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(session.is_connecting());

        drop(release);
        session.connect_timeout = Duration::from_secs(5);
        assert!(session.pids("freezer", "group").is_empty());
        assert!(!session.is_connecting());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }
}
