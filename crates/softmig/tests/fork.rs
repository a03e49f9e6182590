//! A forked child gets its own context and slot

use std::sync::Arc;

use softmig::{current_pid, ensure_initialized, Backend, DeviceSpec};
use softmig_runtime::sim::SimDriver;

fn fork_child(f: impl FnOnce() -> i32) -> libc::pid_t {
    match unsafe { libc::fork() } {
        -1 => panic!("fork failed"),
        0 => {
            let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).unwrap_or(101);
            unsafe { libc::_exit(code) }
        }
        pid => pid,
    }
}

#[test]
fn test_forked_child_registers_itself() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("CUDA_DEVICE_MEMORY_SHARED_CACHE", dir.path().join("region.cache"));
    std::env::set_var("CUDA_DEVICE_MEMORY_LIMIT", "1m");

    let driver = Arc::new(SimDriver::new(DeviceSpec::new(4, 256), 1 << 30));
    let backend = Backend::new(driver);
    let parent = ensure_initialized(&backend).unwrap();
    let parent_pid = current_pid();
    assert_eq!(parent.region().pid(), parent_pid);
    parent.allocate(256 << 10).unwrap();

    let child = fork_child(|| {
        let ctx = match ensure_initialized(&backend) {
            Ok(ctx) => ctx,
            Err(_) => return 2,
        };
        if Arc::ptr_eq(&ctx, &parent) || ctx.region().pid() != current_pid() {
            return 3;
        }
        if ctx.region().find_by_pid(current_pid()).is_none() || ctx.region().proc_num() != 2 {
            return 4;
        }
        // Same quota, shared with the parent's usage
        if ctx.allocate(512 << 10).is_err() || ctx.allocate(512 << 10).is_ok() {
            return 5;
        }
        if !ctx.shutdown() {
            return 6;
        }
        0
    });

    let mut status = 0;
    assert_eq!(unsafe { libc::waitpid(child, &mut status, 0) }, child);
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 0);

    // The parent keeps its own context and slot
    let again = ensure_initialized(&backend).unwrap();
    assert!(Arc::ptr_eq(&parent, &again));
    assert_eq!(parent.region().proc_num(), 1);
    assert_eq!(parent.total_usage(0).unwrap(), 256 << 10);
    assert!(parent.shutdown());
}
