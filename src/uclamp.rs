// SPDX-License-Identifier: GPL-2.0
//
// The scheduling primitive: per-thread utilization floors via sched_setattr.

use log::{debug, warn};

/// Upper end of the kernel's utilization clamp scale.
pub const UCLAMP_MAX: u32 = 1024;

// Not exported by every libc version, so spelled out here.
const SCHED_FLAG_KEEP_ALL: u64 = 0x18;
const SCHED_FLAG_UTIL_CLAMP_MIN: u64 = 0x20;

// libc's `sched_attr` is truncated to the pre-uclamp layout and lacks the
// util_min/util_max fields, so the kernel ABI struct is spelled out here.
#[repr(C)]
#[derive(Default)]
struct sched_attr {
    size: u32,
    sched_policy: u32,
    sched_flags: u64,
    sched_nice: i32,
    sched_priority: u32,
    sched_runtime: u64,
    sched_deadline: u64,
    sched_period: u64,
    sched_util_min: u32,
    sched_util_max: u32,
}

/// Scheduler task profiles applied once per thread while any session
/// references it, and reverted when the last reference drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskProfile {
    /// Detach the thread from its cgroup-level clamp so the per-thread
    /// floor takes effect.
    ResetUclampGrp,
    /// Re-attach the thread to the cgroup-level clamp.
    NoResetUclampGrp,
}

/// Applies and reverts per-thread scheduling-utilization floors.
///
/// Implementations must be safe to call redundantly with the same value and
/// must never fail the caller: errors are logged and swallowed.
pub trait FloorSetter: Send + Sync {
    /// Set the minimum utilization floor for `tid`. `min` is clamped to the
    /// 0..=1024 scale before it reaches the kernel.
    fn set_min(&self, tid: i32, min: u32);

    /// Apply a scheduler task profile to `tid`. Returns false on failure so
    /// the registry can skip the refcount bookkeeping for that thread.
    fn set_task_profile(&self, tid: i32, profile: TaskProfile) -> bool;
}

/// Real implementation backed by sched_setattr(2).
#[derive(Default)]
pub struct SyscallFloorSetter;

impl SyscallFloorSetter {
    fn sched_setattr(tid: i32, attr: &sched_attr) -> i64 {
        // SAFETY: attr is a fully initialized sched_attr with a correct size
        // field; the kernel only reads `size` bytes from it.
        unsafe { libc::syscall(libc::SYS_sched_setattr, tid, attr as *const _, 0u32) }
    }
}

impl FloorSetter for SyscallFloorSetter {
    fn set_min(&self, tid: i32, min: u32) {
        let min = min.min(UCLAMP_MAX);

        let mut attr = sched_attr::default();
        attr.size = std::mem::size_of::<sched_attr>() as u32;
        attr.sched_flags = SCHED_FLAG_KEEP_ALL | SCHED_FLAG_UTIL_CLAMP_MIN;
        attr.sched_util_min = min;

        if Self::sched_setattr(tid, &attr) != 0 {
            warn!(
                "sched_setattr failed for thread {}, err={}",
                tid,
                std::io::Error::last_os_error()
            );
        }
    }

    fn set_task_profile(&self, tid: i32, profile: TaskProfile) -> bool {
        // Moving threads between clamp cgroups belongs to the platform's
        // cgroup glue; nothing to do here beyond making the transition
        // observable.
        debug!("task profile {:?} for tid {}", profile, tid);
        true
    }
}
