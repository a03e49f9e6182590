//! Process liveness check
//!
//! A pid is alive when `kill(pid, 0)` finds it and `/proc/<pid>/stat` does
//! not report it as a zombie. `EPERM` from `kill` still means the process
//! exists; it just belongs to someone else.

use std::fs;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use softmig_core::LivenessCheck;

/// Liveness through `kill(2)` and procfs
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcLiveness;

impl LivenessCheck for ProcLiveness {
    fn is_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        match kill(Pid::from_raw(pid), None) {
            Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
            Err(_) => false,
        }
    }
}

/// Does procfs report `pid` as a zombie (or already dead)?
///
/// The state field follows the parenthesized command name, which may
/// itself contain spaces and parentheses, so parsing starts after the last
/// `)`.
pub fn is_zombie(pid: i32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    parse_state(&stat).is_some_and(|s| s == 'Z' || s == 'X')
}

fn parse_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.trim_start().chars().next()
}
