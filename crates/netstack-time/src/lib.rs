//! Monotonic clock abstraction and the timeout wheel.
//!
//! The core never reads the wall clock directly; it consumes an [`Instant`] handed to it by the
//! port layer's monotonic clock. [`TimeoutWheel`] is a sorted list of `{deadline, payload}`
//! ordered by deadline: `schedule` inserts in order, `check` fires (returns) everything whose
//! deadline has passed.

use std::time::Duration;

/// A monotonic instant, expressed in milliseconds since some stack-chosen epoch (typically the
/// moment the stack was constructed). Mirrors the port clock's resolution guarantee of
/// `>= 1 ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(u64);

impl Instant {
    pub const ZERO: Instant = Instant(0);

    pub fn from_millis(ms: u64) -> Self {
        Instant(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn checked_duration_since(self, earlier: Instant) -> Option<Duration> {
        self.0
            .checked_sub(earlier.0)
            .map(Duration::from_millis)
    }
}

impl std::ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs.as_millis() as u64)
    }
}

impl std::ops::Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0.saturating_sub(rhs.as_millis() as u64))
    }
}

/// Supplies the current time. Hosted simulation uses [`SystemClock`]; tests use
/// [`VirtualClock`], which only advances when told to, matching a fault-injection harness's
/// need for deterministic timing.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wraps `std::time::Instant`, converting to the stack's millisecond epoch relative to
/// construction time. This is the "unix sim" / hosted port clock.
pub struct SystemClock {
    start: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::from_millis(self.start.elapsed().as_millis() as u64)
    }
}

/// A manually-advanced clock for deterministic tests (fault-injection harnesses that need to
/// drive retransmission timers, 2·MSL, etc. without sleeping).
#[derive(Debug, Clone, Copy)]
pub struct VirtualClock {
    now: Instant,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self { now: Instant::ZERO }
    }

    pub fn advance(&mut self, by: Duration) {
        self.now = self.now + by;
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.now
    }
}

/// A `Copy` handle identifying a scheduled timer, returned by [`TimeoutWheel::schedule`] so the
/// caller can later [`TimeoutWheel::cancel`] it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Entry<T> {
    id: TimerHandle,
    deadline: Instant,
    payload: T,
}

/// A per-scheduling-context sorted list of timers, driven by the port clock.
///
/// In threaded mode the owning thread's mailbox wait uses [`TimeoutWheel::next_deadline`] as its
/// receive timeout; on wake it calls [`TimeoutWheel::check`] before processing the next message.
/// In no-OS (callback) mode the application calls `check` from its main loop.
pub struct TimeoutWheel<T> {
    entries: Vec<Entry<T>>,
    next_id: u64,
}

impl<T> Default for TimeoutWheel<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

impl<T> TimeoutWheel<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a timer firing at `now + delay`, keeping `entries` sorted by deadline.
    pub fn schedule(&mut self, now: Instant, delay: Duration, payload: T) -> TimerHandle {
        let id = TimerHandle(self.next_id);
        self.next_id += 1;

        let deadline = now + delay;
        let pos = self
            .entries
            .partition_point(|e| e.deadline <= deadline);

        self.entries.insert(
            pos,
            Entry {
                id,
                deadline,
                payload,
            },
        );

        id
    }

    /// Removes a previously scheduled timer, if it hasn't already fired.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        let idx = self.entries.iter().position(|e| e.id == handle)?;
        Some(self.entries.remove(idx).payload)
    }

    /// Returns the deadline of the next timer to fire, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.deadline)
    }

    /// Removes and returns every timer whose deadline is `<= now`, in deadline order.
    pub fn check(&mut self, now: Instant) -> Vec<T> {
        let split = self.entries.partition_point(|e| e.deadline <= now);
        self.entries
            .drain(..split)
            .map(|e| e.payload)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order_regardless_of_insertion_order() {
        let mut wheel = TimeoutWheel::new();
        let now = Instant::ZERO;

        wheel.schedule(now, Duration::from_millis(300), "c");
        wheel.schedule(now, Duration::from_millis(100), "a");
        wheel.schedule(now, Duration::from_millis(200), "b");

        let fired = wheel.check(now + Duration::from_millis(250));
        assert_eq!(fired, vec!["a", "b"]);
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn cancel_removes_before_it_fires() {
        let mut wheel = TimeoutWheel::new();
        let now = Instant::ZERO;

        let handle = wheel.schedule(now, Duration::from_millis(100), 42);
        wheel.cancel(handle);

        assert!(wheel.check(now + Duration::from_millis(200)).is_empty());
    }

    #[test]
    fn next_deadline_drives_mailbox_wait() {
        let mut wheel: TimeoutWheel<()> = TimeoutWheel::new();
        let now = Instant::ZERO;
        assert_eq!(wheel.next_deadline(), None);

        wheel.schedule(now, Duration::from_millis(50), ());
        assert_eq!(wheel.next_deadline(), Some(now + Duration::from_millis(50)));
    }
}
