// Process-wide serialization of schema-descriptor construction.
//
// The descriptor-compilation step behind the binary container writer uses
// a shared temporary resource keyed only by process identity, so two
// writers constructing schemas at the same time corrupt each other. Every
// schema construction in this process must go through
// `with_exclusive_schema_access`; contention blocks, it never errors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

static SCHEMA_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

// Test-observable high-water mark of concurrent schema compilations.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
static MAX_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Run `f` while holding the process-wide schema lock.
///
/// Any concurrent caller blocks until the lock is released. This is the
/// sole synchronization primitive between writer constructions.
pub fn with_exclusive_schema_access<T>(f: impl FnOnce() -> T) -> T {
    let lock = SCHEMA_LOCK.get_or_init(|| Mutex::new(()));
    // A poisoned lock only means a previous closure panicked; the guarded
    // resource itself holds no state between calls, so continue.
    let _guard = match lock.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };

    let now = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
    MAX_IN_FLIGHT.fetch_max(now, Ordering::SeqCst);
    let result = f();
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);

    result
}

/// Highest number of schema compilations ever observed in flight at once.
/// Stays at 1 no matter how many threads call the guard.
pub fn max_in_flight() -> usize {
    MAX_IN_FLIGHT.load(Ordering::SeqCst)
}
