//! # Tick Clock
//!
//! The kernel's notion of time is a monotonic tick counter advanced by the
//! periodic tick interrupt. Delays, timeouts and timer periods are all
//! expressed in ticks.

/// Absolute time in ticks since the kernel was created.
pub type Tick = u64;

/// How long a blocking call may wait, in ticks.
///
/// `0` polls without blocking and `u32::MAX` waits forever; every other
/// value is a relative tick count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timeout(u32);

impl Timeout {
    /// Poll once, never block.
    pub const NO_WAIT: Timeout = Timeout(0);
    /// Block until the operation completes.
    pub const FOREVER: Timeout = Timeout(u32::MAX);

    /// Longest wait that still expires.
    pub const MAX_FINITE: u32 = u32::MAX - 1;

    pub const fn ticks(ticks: u32) -> Self {
        Timeout(ticks)
    }

    /// A wait that always expires, clamped to [`Timeout::MAX_FINITE`].
    pub const fn finite(ticks: u64) -> Self {
        if ticks > Self::MAX_FINITE as u64 {
            Timeout(Self::MAX_FINITE)
        } else {
            Timeout(ticks as u32)
        }
    }

    /// Convert milliseconds to a tick timeout at `tick_hz`, rounding down
    /// but never below one tick for a non-zero duration.
    pub const fn from_millis(ms: u32, tick_hz: u32) -> Self {
        Timeout(ms_to_ticks(ms, tick_hz))
    }

    pub const fn is_no_wait(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_forever(&self) -> bool {
        self.0 == u32::MAX
    }

    pub const fn as_ticks(&self) -> u32 {
        self.0
    }

    /// Absolute deadline when starting to wait at `now`, `None` for
    /// [`Timeout::FOREVER`].
    pub fn deadline(&self, now: Tick) -> Option<Tick> {
        if self.is_forever() {
            None
        } else {
            Some(now + u64::from(self.0))
        }
    }
}

/// Milliseconds to ticks at the given tick rate.
pub const fn ms_to_ticks(ms: u32, tick_hz: u32) -> u32 {
    let ticks = (ms as u64 * tick_hz as u64) / 1000;
    if ticks == 0 && ms > 0 {
        1
    } else if ticks >= u32::MAX as u64 {
        u32::MAX - 1
    } else {
        ticks as u32
    }
}

/// Monotonic tick counter.
#[derive(Debug, Default)]
pub struct TickClock {
    now: Tick,
}

impl TickClock {
    pub const fn new() -> Self {
        Self { now: 0 }
    }

    #[inline]
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Advance by one tick and return the new time.
    #[inline]
    pub fn advance(&mut self) -> Tick {
        self.now += 1;
        self.now
    }
}
