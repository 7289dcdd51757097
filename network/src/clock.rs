// Time source for polling loops

/// Monotonic millisecond clock and blocking sleep
///
/// Every wait in the crate (connect, write, receive timeouts, DHCP and DNS
/// retries) is a poll loop built on these two calls.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin
    fn now_ms(&self) -> u64;

    /// Yield the calling context for roughly `ms` milliseconds
    fn sleep_ms(&self, ms: u32);
}

/// Check whether `timeout_ms` has elapsed since `start_ms`
pub fn elapsed(clock: &dyn Clock, start_ms: u64, timeout_ms: u32) -> bool {
    clock.now_ms().saturating_sub(start_ms) >= u64::from(timeout_ms)
}
