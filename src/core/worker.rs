//! The registry's worker thread
//!
//! All supervisor traffic, package queries and cgroup reads run here, one
//! at a time. Callers hand the worker a closure over [`WorkerState`] and
//! block on the reply ([`Worker::call`]), await it ([`Worker::call_async`])
//! or fire and forget ([`Worker::post`]).

use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::thread::{JoinHandle, ThreadId};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::{Error, Result};
use crate::jobs::{CgroupSession, JobBackend, JobEvent};
use crate::packages::icons::IconCache;
use crate::packages::PackageBackend;

/// Everything owned by the worker thread
pub struct WorkerState {
    pub packages: Vec<PackageBackend>,
    pub jobs: JobBackend,
    pub icons: IconCache,
    pub cgroups: CgroupSession,
}

type Task = Box<dyn FnOnce(&mut WorkerState) + Send>;

/// Receives every supervisor event, on the worker
pub type EventHandler = Box<dyn FnMut(&mut WorkerState, JobEvent) + Send>;

enum Command {
    Run(Task),
    Watch(EventHandler),
    Shutdown,
}

pub struct Worker {
    sender: mpsc::UnboundedSender<Command>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn spawn(state: WorkerState) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| Error::ipc("start worker runtime", e.into()))?;
        let (sender, rx) = mpsc::unbounded_channel();

        let handle = std::thread::Builder::new()
            .name("app-launch-worker".to_string())
            .spawn(move || rt.block_on(run(state, rx)))
            .map_err(|e| Error::ipc("spawn worker thread", e.into()))?;

        Ok(Self {
            sender,
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn is_worker_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Queue `task` without waiting for it
    pub fn post(&self, task: impl FnOnce(&mut WorkerState) + Send + 'static) -> Result<()> {
        self.sender
            .send(Command::Run(Box::new(task)))
            .map_err(|_| Error::WorkerGone)
    }

    /// Run `task` on the worker and block until it returns
    ///
    /// Fails with [`Error::Reentrant`] when called from the worker itself.
    pub fn call<R, F>(&self, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkerState) -> R + Send + 'static,
    {
        if self.is_worker_thread() {
            return Err(Error::Reentrant);
        }
        let (tx, rx) = std_mpsc::sync_channel(1);
        self.post(move |state| {
            let _ = tx.send(task(state));
        })?;
        rx.recv().map_err(|_| Error::WorkerGone)
    }

    /// Run `task` on the worker and await the reply
    pub async fn call_async<R, F>(&self, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkerState) -> R + Send + 'static,
    {
        if self.is_worker_thread() {
            return Err(Error::Reentrant);
        }
        let (tx, rx) = oneshot::channel();
        self.post(move |state| {
            let _ = tx.send(task(state));
        })?;
        rx.await.map_err(|_| Error::WorkerGone)
    }

    /// Subscribe to the supervisor and route its events to `handler`
    pub fn watch(&self, handler: EventHandler) -> Result<()> {
        self.sender
            .send(Command::Watch(handler))
            .map_err(|_| Error::WorkerGone)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        if self.is_worker_thread() {
            return;
        }
        let handle = match self.handle.get_mut() {
            Ok(handle) => handle.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<JobEvent>>) -> Option<JobEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

async fn run(mut state: WorkerState, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut events = None;
    let mut handler: Option<EventHandler> = None;
    debug!("Worker started with {} supervisor", state.jobs.flavor());

    loop {
        let deadline = state.cgroups.deadline();
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Run(task)) => task(&mut state),
                Some(Command::Watch(h)) => match state.jobs.subscribe() {
                    Ok(stream) => {
                        events = Some(stream);
                        handler = Some(h);
                    }
                    Err(e) => warn!("Unable to subscribe to supervisor signals: {}", e),
                },
                Some(Command::Shutdown) | None => break,
            },
            event = next_event(&mut events) => match event {
                Some(event) => {
                    if let Some(h) = handler.as_mut() {
                        h(&mut state, event);
                    }
                }
                None => {
                    info!("Supervisor signal stream closed");
                    events = None;
                }
            },
            _ = idle(deadline) => {
                state.cgroups.expire(Instant::now());
            }
        }
    }

    state.cgroups.disconnect();
    state.jobs.flush();
    debug!("Worker stopped");
}
