//! Dispatcher pool configuration

use std::time::Duration;

/// A generous ceiling on [`DispatcherConfig::thread_count`], carried over as a sanity check
/// only — nothing in the dispatcher actually requires staying under it.
pub const MAX_THREAD_COUNT: usize = 512;

/// Number of bits set in the calling process's CPU affinity mask, floored at 1. Used as the
/// default worker count when [`DispatcherConfig::thread_count`] is `0`, per the spec's "use the
/// count of bits set in the process CPU affinity mask" rule rather than the host's raw CPU
/// count — a process pinned to a subset of CPUs (`taskset`, a container CPU-set) should size its
/// pool to what it can actually run on.
#[cfg(target_os = "linux")]
fn affinity_mask_popcount() -> usize {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return 1;
        }
        let count = libc::CPU_COUNT(&set) as usize;
        count.max(1)
    }
}

#[cfg(not(target_os = "linux"))]
fn affinity_mask_popcount() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Tuning knobs for [`crate::dispatcher::Dispatcher`].
#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfig {
    /// Number of worker threads to spawn. `0` means derive a count from the process's CPU
    /// affinity mask (see [`affinity_mask_popcount`]).
    pub thread_count: usize,
    /// Timeout applied to each transact ioctl call, forwarded to
    /// [`crate::transport::Transport::set_transact_timeout`].
    pub transact_timeout: Duration,
}

impl DispatcherConfig {
    /// Resolve [`Self::thread_count`] into a concrete worker count, deriving it from the
    /// process's CPU affinity mask when `0` and clamping to [`MAX_THREAD_COUNT`].
    pub fn resolved_thread_count(&self) -> usize {
        let count = if self.thread_count == 0 {
            affinity_mask_popcount()
        } else {
            self.thread_count
        };
        count.min(MAX_THREAD_COUNT)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            thread_count: 0,
            transact_timeout: Duration::from_secs(30),
        }
    }
}
