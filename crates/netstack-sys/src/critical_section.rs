//! `SYS_LIGHTWEIGHT_PROT`: the typed guard that protects state shared with driver interrupt
//! context (pbuf ref counts, pool free lists). This protects only that shared state — everything
//! else lives behind the protocol-task boundary and needs no lock.

#[cfg(not(feature = "callback-only"))]
use std::sync::{Mutex, MutexGuard};

/// Held for the duration of a mutation that must be atomic with respect to driver interrupt
/// context. In threaded mode this is a real mutex; in `callback-only` (`NO_SYS`) mode there is
/// only one execution context to begin with, so acquiring it is a no-op.
#[cfg(not(feature = "callback-only"))]
pub struct CriticalSection<'a> {
    _guard: MutexGuard<'a, ()>,
}

#[cfg(not(feature = "callback-only"))]
pub struct ProtectedRegion {
    lock: Mutex<()>,
}

#[cfg(not(feature = "callback-only"))]
impl ProtectedRegion {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    /// Enters the protected region, blocking if the driver interrupt path currently holds it.
    /// Poisoning (a prior panic while holding the lock) is treated as the stack having already
    /// failed irrecoverably, so it's surfaced by panicking again rather than silently ignored.
    pub fn enter(&self) -> CriticalSection<'_> {
        CriticalSection {
            _guard: self.lock.lock().expect("critical section poisoned"),
        }
    }
}

#[cfg(not(feature = "callback-only"))]
impl Default for ProtectedRegion {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "callback-only")]
pub struct CriticalSection<'a> {
    _marker: std::marker::PhantomData<&'a ()>,
}

/// No-OS builds run everything from one call stack (interrupt handler or bare main loop), so
/// there is no second context to race with; `enter` is a zero-cost marker.
#[cfg(feature = "callback-only")]
#[derive(Default)]
pub struct ProtectedRegion;

#[cfg(feature = "callback-only")]
impl ProtectedRegion {
    pub fn new() -> Self {
        Self
    }

    pub fn enter(&self) -> CriticalSection<'_> {
        CriticalSection { _marker: std::marker::PhantomData }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_and_drop_does_not_deadlock() {
        let region = ProtectedRegion::new();
        {
            let _g1 = region.enter();
        }
        let _g2 = region.enter();
    }
}
