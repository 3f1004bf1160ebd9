use std::time::{Instant, SystemTime};

/// Returns the current unix timestamp in milliseconds, truncated to 32 bits as the wire
/// format requires (session-0 `tstamp` fields are `u32` milliseconds mod 2^32).
#[inline]
pub fn now_ms() -> u32 {
    let since_epoch = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock before unix epoch");
    (since_epoch.as_millis() & 0xFFFF_FFFF) as u32
}

/// Monotonic clock used for all session timers (age checks, KCP ticking). `Instant` never
/// goes backwards, unlike wall-clock time, which matters for timeout sweeps that run for
/// the lifetime of the process.
#[inline]
pub fn clock() -> Instant {
    Instant::now()
}

/// Milliseconds since an arbitrary fixed point, for feeding to `Kcp::update`/`Kcp::check`.
/// KCP only cares about deltas, so the epoch doesn't matter as long as it is stable for
/// the life of the process.
#[inline]
pub fn kcp_now_ms(epoch: Instant) -> u32 {
    (epoch.elapsed().as_millis() & 0xFFFF_FFFF) as u32
}
