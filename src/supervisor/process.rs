//! OS process seam for the supervisor.
//!
//! Workers run as detached child processes of whoever launched them,
//! so the supervisor can only reason about them through pids: signal 0
//! for liveness, SIGTERM/SIGKILL for shutdown, /proc for memory.

use std::process::{Command, Stdio};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::model::LaneKey;

pub trait ProcessRunner: Send + Sync {
    /// Spawn a detached worker process for the lane. Returns its pid.
    fn spawn_worker(&self, lane: &LaneKey) -> Result<i32>;

    /// Whether the pid still refers to a live process.
    fn is_alive(&self, pid: i32) -> bool;

    /// Ask the process to terminate (SIGTERM).
    fn terminate(&self, pid: i32) -> Result<()>;

    /// Kill the process outright (SIGKILL).
    fn kill(&self, pid: i32) -> Result<()>;

    /// Resident memory in MB, if measurable.
    fn memory_mb(&self, pid: i32) -> Option<u64>;
}

/// Runner that re-executes the current binary with the internal `work`
/// subcommand. The child inherits the environment, so it picks up the
/// same store and collaborator configuration.
pub struct ExecRunner;

impl ProcessRunner for ExecRunner {
    fn spawn_worker(&self, lane: &LaneKey) -> Result<i32> {
        let exe = std::env::current_exe()?;
        let child = Command::new(exe)
            .arg("work")
            .arg("--lane")
            .arg(lane.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(child.id() as i32)
    }

    fn is_alive(&self, pid: i32) -> bool {
        match kill(Pid::from_raw(pid), None) {
            Ok(_) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn terminate(&self, pid: i32) -> Result<()> {
        kill(Pid::from_raw(pid), Signal::SIGTERM)
            .map_err(|e| Error::Other(format!("SIGTERM pid {pid}: {e}")))
    }

    fn kill(&self, pid: i32) -> Result<()> {
        kill(Pid::from_raw(pid), Signal::SIGKILL)
            .map_err(|e| Error::Other(format!("SIGKILL pid {pid}: {e}")))
    }

    fn memory_mb(&self, pid: i32) -> Option<u64> {
        let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        parse_vmrss_mb(&status)
    }
}

/// Extract VmRSS from /proc/<pid>/status content, converted to MB.
fn parse_vmrss_mb(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}
