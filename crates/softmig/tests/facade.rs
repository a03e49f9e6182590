//! Process-wide context behaviour
//!
//! Everything runs in one test so the environment is set before the
//! global context is first created.

use std::sync::Arc;

use softmig::{ensure_initialized, Backend, DeviceSpec, MemoryInfo};
use softmig_runtime::sim::{SimDriver, SimManagement};

#[test]
fn test_process_context_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("CUDA_DEVICE_MEMORY_SHARED_CACHE", dir.path().join("region.cache"));
    std::env::set_var("CUDA_DEVICE_MEMORY_LIMIT", "1m");
    std::env::set_var("CUDA_DEVICE_SM_LIMIT", "50");
    std::env::set_var("SOFTMIG_WATCH_INTERVAL_MS", "10");

    let driver = Arc::new(SimDriver::new(DeviceSpec::new(4, 256), 1 << 30));
    let backend = Backend::new(driver).management(Arc::new(SimManagement::new(1)));

    let ctx = ensure_initialized(&backend).unwrap();
    let again = ensure_initialized(&backend).unwrap();
    assert!(Arc::ptr_eq(&ctx, &again));

    assert_eq!(ctx.configured_limit(0).unwrap(), 1 << 20);
    assert_eq!(ctx.configured_sm_limit(0).unwrap(), 50);
    assert_eq!(ctx.region().proc_num(), 1);

    let p = ctx.allocate(512 << 10).unwrap();
    assert!(ctx.allocate(768 << 10).unwrap_err().is_out_of_memory());
    let physical = MemoryInfo { total: 1 << 30, used: 0, free: 1 << 30 };
    let info = ctx.memory_info(0, physical).unwrap();
    assert_eq!(info.total, 1 << 20);
    assert_eq!(info.free, 512 << 10);

    ctx.free(p).unwrap();
    assert_eq!(ctx.total_usage(0).unwrap(), 0);

    // The watcher was started for the partial SM limit
    assert!(ctx.stop_watcher().is_some());
    assert!(ctx.shutdown());
    assert_eq!(ctx.region().proc_num(), 0);
}
