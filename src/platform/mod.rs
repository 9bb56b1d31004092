//! Platform process control: signals and OOM adjustments

#[cfg(unix)]
pub mod unix;

use std::path::PathBuf;

use anyhow::Result;

use crate::core::oom::OomScore;

/// Process id as the kernel reports it
pub type Pid = i32;

/// Signals the control plane sends to application processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessSignal {
    Stop,
    Continue,
    Terminate,
}

/// What happened to a signal or OOM write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    /// The process exited first
    Gone,
}

/// Everything the instance lifecycle does to processes directly
pub trait ProcessControl: Send + Sync {
    fn signal(&self, pid: Pid, signal: ProcessSignal) -> Result<SignalOutcome>;

    fn set_oom_score(&self, pid: Pid, score: &OomScore) -> Result<SignalOutcome>;
}

/// Real processes, with OOM scores written below `proc_root`
#[derive(Debug, Clone)]
pub struct SystemProcesses {
    proc_root: PathBuf,
}

impl SystemProcesses {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl ProcessControl for SystemProcesses {
    fn signal(&self, pid: Pid, signal: ProcessSignal) -> Result<SignalOutcome> {
        #[cfg(unix)]
        {
            match signal {
                ProcessSignal::Stop => unix::suspend_process(pid),
                ProcessSignal::Continue => unix::resume_process(pid),
                ProcessSignal::Terminate => unix::terminate_process(pid),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (pid, signal);
            anyhow::bail!("Unsupported platform")
        }
    }

    fn set_oom_score(&self, pid: Pid, score: &OomScore) -> Result<SignalOutcome> {
        #[cfg(unix)]
        {
            unix::write_oom_score(&self.proc_root, pid, score.value())
        }
        #[cfg(not(unix))]
        {
            let _ = (pid, score);
            anyhow::bail!("Unsupported platform")
        }
    }
}
