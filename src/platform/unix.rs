//! Unix signal delivery and OOM score writes

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use super::{Pid, SignalOutcome};

fn send(pid: Pid, signal: libc::c_int, what: &str) -> Result<SignalOutcome> {
    if pid <= 0 {
        anyhow::bail!("Refusing to {} pid {}", what, pid);
    }
    // SAFETY: kill has no memory-safety preconditions
    let result = unsafe { libc::kill(pid, signal) };
    if result == 0 {
        return Ok(SignalOutcome::Delivered);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        debug!("Process {} exited before it could {}", pid, what);
        Ok(SignalOutcome::Gone)
    } else {
        anyhow::bail!("Failed to {} process {}: {}", what, pid, err)
    }
}

/// Stop a process (SIGSTOP)
pub fn suspend_process(pid: Pid) -> Result<SignalOutcome> {
    send(pid, libc::SIGSTOP, "suspend")
}

/// Continue a stopped process (SIGCONT)
pub fn resume_process(pid: Pid) -> Result<SignalOutcome> {
    send(pid, libc::SIGCONT, "resume")
}

/// Terminate a process gracefully (SIGTERM)
pub fn terminate_process(pid: Pid) -> Result<SignalOutcome> {
    send(pid, libc::SIGTERM, "terminate")
}

/// Check if a process is running
pub fn is_process_running(pid: Pid) -> bool {
    // SAFETY: signal 0 only checks for existence
    pid > 0 && unsafe { libc::kill(pid, 0) } == 0
}

/// Write `<proc_root>/<pid>/oom_score_adj`. A missing process is not an error.
pub fn write_oom_score(proc_root: &Path, pid: Pid, value: i32) -> Result<SignalOutcome> {
    let path = proc_root.join(pid.to_string()).join("oom_score_adj");
    if !path.parent().is_some_and(|p| p.is_dir()) {
        debug!("No proc entry for {}, skipping OOM adjustment", pid);
        return Ok(SignalOutcome::Gone);
    }
    std::fs::write(&path, value.to_string())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(SignalOutcome::Delivered)
}

/// Read back `<proc_root>/<pid>/oom_score_adj`
pub fn read_oom_score(proc_root: &Path, pid: Pid) -> Result<i32> {
    let path = proc_root.join(pid.to_string()).join("oom_score_adj");
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .trim()
        .parse()
        .with_context(|| format!("Invalid OOM score in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn oom_score_round_trip() {
        let tmp = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(tmp.path().join("1234")).expect("mkdir");
        assert_eq!(
            write_oom_score(tmp.path(), 1234, 900).expect("write"),
            SignalOutcome::Delivered
        );
        assert_eq!(read_oom_score(tmp.path(), 1234).expect("read"), 900);
        assert_eq!(
            write_oom_score(tmp.path(), 4321, 900).expect("missing pid"),
            SignalOutcome::Gone
        );
    }

    #[test]
    fn own_process_is_running() {
        assert!(is_process_running(std::process::id() as Pid));
        assert!(!is_process_running(0));
        assert!(suspend_process(0).is_err());
    }
}
