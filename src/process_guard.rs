/// Single-instance guard.
///
/// The running service records its pid and parent pid in the save file. A
/// later start looks that pid up in the process table; if it still has the
/// same parent, the earlier service is alive and we refuse to start.
/// Best effort: on systems without /proc the lookup always misses.

use std::fs;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuardError {
    #[error("Another service (pid {pid}) is already running against this save folder")]
    AlreadyRunning { pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
}

impl ProcessInfo {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            ppid: parent_pid(),
        }
    }
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    // SAFETY: getppid has no preconditions and cannot fail
    let ppid = unsafe { libc::getppid() };
    ppid.max(0) as u32
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    0
}

/// Parent pid of `pid` from /proc, if that process exists.
pub fn parent_of(pid: u32) -> Option<u32> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat_ppid(&stat)
}

/// `/proc/<pid>/stat` is "pid (comm) state ppid ...". The command name may
/// itself contain spaces and parentheses, so fields are taken after the
/// last ')'.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// Refuse to start if the recorded process still looks alive.
pub fn check_single_instance(
    saved: Option<&ProcessInfo>,
    current: &ProcessInfo,
    lookup_parent: impl Fn(u32) -> Option<u32>,
) -> Result<(), GuardError> {
    let Some(saved) = saved else {
        return Ok(());
    };
    if saved.pid == current.pid {
        return Ok(());
    }
    match lookup_parent(saved.pid) {
        Some(ppid) if ppid == saved.ppid => Err(GuardError::AlreadyRunning { pid: saved.pid }),
        _ => {
            log::debug!(
                target: "process_guard",
                "Previous service pid {} is gone, taking over",
                saved.pid
            );
            Ok(())
        }
    }
}
