//! Allocator hints.

/// Ask the allocator to return freed pages to the OS.
///
/// Start/stop cycles reconfigure in place on memory-constrained devices, so
/// the coordinator calls this before building a new engine. Only glibc has
/// `malloc_trim`; elsewhere this does nothing.
pub fn reclaim() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: malloc_trim only inspects allocator state.
        let released = unsafe { libc::malloc_trim(0) };
        tracing::trace!(released = released != 0, "malloc_trim");
    }
}
