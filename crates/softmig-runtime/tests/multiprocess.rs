//! Properties that need real, separate processes
//!
//! Children are forked and leave through `_exit` so they never run the
//! parent's test harness teardown.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use softmig_core::{DeviceSpec, ProcStatus};
use softmig_runtime::signal::install_status_handlers;
use softmig_runtime::sim::SimDriver;
use softmig_runtime::{Allocator, LockConfig, RegionConfig, RegionHandle};

/// Forked children inherit every open pipe; one test at a time keeps
/// EOF on a release pipe meaningful
static SERIAL: Mutex<()> = Mutex::new(());

#[derive(Clone, Copy)]
struct Pipe {
    read: libc::c_int,
    write: libc::c_int,
}

impl Pipe {
    fn new() -> Self {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        Pipe {
            read: fds[0],
            write: fds[1],
        }
    }

    fn send(&self) {
        let b = [1u8];
        assert_eq!(unsafe { libc::write(self.write, b.as_ptr().cast(), 1) }, 1);
    }

    /// Blocks for one byte; false on EOF
    fn recv(&self) -> bool {
        let mut b = [0u8];
        unsafe { libc::read(self.read, b.as_mut_ptr().cast(), 1) == 1 }
    }

    fn close_read(&self) {
        unsafe { libc::close(self.read) };
    }

    fn close_write(&self) {
        unsafe { libc::close(self.write) };
    }
}

fn fork_child(f: impl FnOnce() -> i32) -> libc::pid_t {
    match unsafe { libc::fork() } {
        -1 => panic!("fork failed"),
        0 => {
            let code = catch_unwind(AssertUnwindSafe(f)).unwrap_or(101);
            unsafe { libc::_exit(code) }
        }
        pid => pid,
    }
}

fn wait_exit(pid: libc::pid_t) -> i32 {
    let mut status = 0;
    assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else {
        -1
    }
}

fn kill_and_reap(pid: libc::pid_t) {
    unsafe { libc::kill(pid, libc::SIGKILL) };
    wait_exit(pid);
}

fn sim_driver() -> Arc<SimDriver> {
    Arc::new(SimDriver::new(DeviceSpec::new(8, 1024), 1 << 40))
}

#[test]
fn test_cross_process_admission() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let cfg = RegionConfig::new()
        .path(dir.path().join("region.cache"))
        .memory_limit(0, 100);

    let ready = Pipe::new();
    let release = Pipe::new();
    let child_cfg = cfg.clone();
    let child = fork_child(move || {
        release.close_write();
        let region = Arc::new(RegionHandle::attach(child_cfg).unwrap());
        region.register_self().unwrap();
        let alloc = Allocator::new(region, sim_driver());
        if alloc.allocate(60).is_err() {
            return 2;
        }
        ready.send();
        release.recv();
        0
    });
    release.close_read();
    assert!(ready.recv());

    let region = Arc::new(RegionHandle::attach(cfg).unwrap());
    region.register_self().unwrap();
    let alloc = Allocator::new(region.clone(), sim_driver());
    assert_eq!(region.total_usage(0).unwrap(), 60);
    assert!(alloc.allocate(60).unwrap_err().is_out_of_memory());

    // Once the child is gone its usage is reclaimed on demand
    kill_and_reap(child);
    alloc.allocate(60).unwrap();
    assert_eq!(region.total_usage(0).unwrap(), 60);
    assert!(region.remove_self());
}

#[test]
fn test_lock_recovered_after_holder_killed() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let cfg = RegionConfig::new()
        .path(dir.path().join("region.cache"))
        .lock(
            LockConfig::new()
                .wait(Duration::from_millis(50))
                .retries(3),
        );

    let ready = Pipe::new();
    let child_cfg = cfg.clone();
    let child = fork_child(move || {
        let region = RegionHandle::attach(child_cfg).unwrap();
        let guard = region.lock();
        ready.send();
        // Die with the lock held
        loop {
            std::thread::sleep(Duration::from_secs(1));
            let _ = &guard;
        }
    });
    assert!(ready.recv());

    let region = RegionHandle::attach(cfg).unwrap();
    assert_eq!(region.lock_state().owner(), Some(child));
    kill_and_reap(child);

    let start = Instant::now();
    let guard = region.lock();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(region.lock_state().owner(), Some(region.pid()));
    drop(guard);

    // The lock is usable normally afterwards
    assert!(region.try_lock_for(Duration::from_millis(100)).is_some());
}

#[test]
fn test_racing_processes_never_exceed_limit() {
    let _serial = SERIAL.lock();
    const CHILDREN: usize = 4;
    const LIMIT: u64 = 1000;
    const CHUNK: u64 = 100;

    let dir = tempfile::tempdir().unwrap();
    let cfg = RegionConfig::new()
        .path(dir.path().join("region.cache"))
        .memory_limit(0, LIMIT);
    // Initialize before the race so children only attach
    let region = RegionHandle::attach(cfg.clone()).unwrap();

    let ready = Pipe::new();
    let release = Pipe::new();
    let children: Vec<_> = (0..CHILDREN)
        .map(|_| {
            let child_cfg = cfg.clone();
            fork_child(|| {
                release.close_write();
                let region = Arc::new(RegionHandle::attach(child_cfg).unwrap());
                region.register_self().unwrap();
                let alloc = Allocator::new(region, sim_driver());
                let mut held = 0;
                while alloc.allocate(CHUNK).is_ok() {
                    held += 1;
                }
                ready.send();
                release.recv();
                held
            })
        })
        .collect();
    release.close_read();

    for _ in 0..CHILDREN {
        assert!(ready.recv());
    }
    let usage = region.total_usage(0).unwrap();
    assert!(usage <= LIMIT, "usage {usage} exceeds {LIMIT}");
    release.close_write();

    let held: u64 = children.into_iter().map(|pid| wait_exit(pid) as u64).sum();
    assert!(held >= 1);
    assert!(held * CHUNK <= LIMIT);
    assert_eq!(held * CHUNK, usage);
}

fn wait_for_status(region: &RegionHandle, pid: i32, status: ProcStatus) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if region.find_by_pid(pid).map(|s| s.status()) == Some(status) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn test_suspend_and_resume_all() {
    let _serial = SERIAL.lock();
    let dir = tempfile::tempdir().unwrap();
    let cfg = RegionConfig::new().path(dir.path().join("region.cache"));

    let ready = Pipe::new();
    let release = Pipe::new();
    let child_cfg = cfg.clone();
    let child = fork_child(move || {
        release.close_write();
        let region = RegionHandle::attach(child_cfg).unwrap();
        region.register_self().unwrap();
        install_status_handlers(&region).unwrap();
        ready.send();
        // Handlers restart the read
        release.recv();
        0
    });
    release.close_read();
    assert!(ready.recv());

    let region = RegionHandle::attach(cfg).unwrap();
    region.register_self().unwrap();
    assert!(region.all_in_status(ProcStatus::Running));

    assert_eq!(region.suspend_all(), 1);
    assert!(wait_for_status(&region, child, ProcStatus::Suspended));
    assert!(region.all_in_status(ProcStatus::Suspended));
    // The caller is never signalled
    assert_eq!(region.status_self(), Some(ProcStatus::Running));

    assert_eq!(region.resume_all(), 1);
    assert!(wait_for_status(&region, child, ProcStatus::Running));

    release.close_write();
    assert_eq!(wait_exit(child), 0);
    assert!(region.remove_self());
}
