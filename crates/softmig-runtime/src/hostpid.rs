//! Container to host pid translation
//!
//! `/proc/<pid>/status` lists a process's pid in every namespace it is
//! visible in on the `NSpid:` line, outermost first. When the line has more
//! than one entry, the first is the pid the management API reports. With a
//! single entry the procfs we see is the container's own and the host pid
//! is not recoverable from here.

use std::fs;

use softmig_core::HostPidResolver;

/// Resolver backed by the `NSpid:` line of procfs
#[derive(Debug, Clone, Copy, Default)]
pub struct NsPidResolver;

impl HostPidResolver for NsPidResolver {
    fn resolve(&self, container_pid: i32) -> Option<i32> {
        let status = fs::read_to_string(format!("/proc/{}/status", container_pid)).ok()?;
        outer_pid(&status)
    }
}

fn outer_pid(status: &str) -> Option<i32> {
    let line = status.lines().find(|l| l.starts_with("NSpid:"))?;
    let pids: Vec<i32> = line["NSpid:".len()..]
        .split_whitespace()
        .filter_map(|p| p.parse().ok())
        .collect();
    if pids.len() > 1 {
        pids.first().copied()
    } else {
        None
    }
}
