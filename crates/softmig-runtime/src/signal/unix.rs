//! Unix signal handlers for SIGUSR1 (resume) and SIGUSR2 (suspend)

use std::ops::Range;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering};

use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use softmig_core::ProcStatus;
use tracing::debug;

use crate::error::{RegionError, RegionResult};
use crate::region::RegionHandle;

static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Status word of this process's slot, inside the shared mapping
static STATUS_TARGET: AtomicPtr<AtomicI32> = AtomicPtr::new(ptr::null_mut());

/// Signal sent to ask a process to resume
pub const RESUME_SIGNAL: Signal = Signal::SIGUSR1;

/// Signal sent to ask a process to release device memory
pub const SUSPEND_SIGNAL: Signal = Signal::SIGUSR2;

fn store_status(status: ProcStatus) {
    let target = STATUS_TARGET.load(Ordering::Acquire);
    if !target.is_null() {
        // Safety: cleared before the mapping goes away (RegionHandle::drop)
        unsafe { (*target).store(status.into(), Ordering::Release) };
    }
}

extern "C" fn on_resume(_: libc::c_int) {
    store_status(ProcStatus::Running);
}

extern "C" fn on_suspend(_: libc::c_int) {
    store_status(ProcStatus::Suspended);
}

/// Point the handlers at `handle`'s own slot and install them once
pub fn install_status_handlers(handle: &RegionHandle) -> RegionResult<()> {
    let slot = handle
        .my_slot()
        .ok_or(RegionError::SlotNotFound(handle.pid()))?;
    STATUS_TARGET.store(
        &slot.status as *const AtomicI32 as *mut AtomicI32,
        Ordering::Release,
    );

    if HANDLERS_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let resume = SigAction::new(
        SigHandler::Handler(on_resume),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let suspend = SigAction::new(
        SigHandler::Handler(on_suspend),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // Safety: the handlers only perform an atomic store
    unsafe {
        sigaction(RESUME_SIGNAL, &resume)?;
        sigaction(SUSPEND_SIGNAL, &suspend)?;
    }
    debug!(pid = handle.pid(), "installed suspend/resume handlers");
    Ok(())
}

/// Forget the status target if it lives in `range` (mapping teardown)
pub(crate) fn clear_status_target_in(range: Range<usize>) {
    let target = STATUS_TARGET.load(Ordering::Acquire);
    if !target.is_null() && range.contains(&(target as usize)) {
        let _ = STATUS_TARGET.compare_exchange(
            target,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Deliver the signal for `status` to `pid`
pub fn send_status_signal(pid: i32, status: ProcStatus) -> nix::Result<()> {
    let signal = match status {
        ProcStatus::Suspended => SUSPEND_SIGNAL,
        _ => RESUME_SIGNAL,
    };
    kill(Pid::from_raw(pid), signal)
}
