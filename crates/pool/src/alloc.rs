//! Per-worker heap accounting.
//!
//! [`TrackingAllocator`] wraps the system allocator and charges every
//! allocation made on a worker thread to that worker's [`MemoryMeter`]. The
//! pool samples the meter while a task runs and fails the dispatch once the
//! task's peak crosses its ceiling.
//!
//! The binary installs it with:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: pool::TrackingAllocator = pool::TrackingAllocator;
//! ```
//!
//! Without it, meters stay at zero and only usage reported through
//! [`WorkerContext::record_memory`](crate::WorkerContext::record_memory)
//! counts.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

thread_local! {
    // Const-initialised and drop-free so the allocator can touch it safely.
    static METER: Cell<*const MemoryMeter> = const { Cell::new(ptr::null()) };
}

/// Live and peak heap bytes allocated by one worker thread since its last
/// reset.
#[derive(Debug, Default)]
pub struct MemoryMeter {
    live: AtomicI64,
    peak: AtomicU64,
}

impl MemoryMeter {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocated(&self, bytes: usize) {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        let live = self.live.fetch_add(bytes, Ordering::Relaxed).saturating_add(bytes);
        self.peak
            .fetch_max(u64::try_from(live).unwrap_or(0), Ordering::Relaxed);
    }

    fn freed(&self, bytes: usize) {
        self.live
            .fetch_sub(i64::try_from(bytes).unwrap_or(i64::MAX), Ordering::Relaxed);
    }

    /// Start a new task from zero.
    pub fn reset(&self) {
        self.live.store(0, Ordering::Relaxed);
        self.peak.store(0, Ordering::Relaxed);
    }

    /// Bytes currently held. Memory freed on another thread is not credited.
    pub fn live(&self) -> u64 {
        u64::try_from(self.live.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Highest `live` seen since the last reset.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Charges the current thread's allocations to `meter` until the returned
/// scope is dropped.
pub(crate) fn attach(meter: Arc<MemoryMeter>) -> MeterScope {
    METER.with(|current| current.set(Arc::as_ptr(&meter)));
    MeterScope { _meter: meter }
}

/// Keeps the attached meter alive while the thread points at it.
pub(crate) struct MeterScope {
    _meter: Arc<MemoryMeter>,
}

impl Drop for MeterScope {
    fn drop(&mut self) {
        let _ = METER.try_with(|current| current.set(ptr::null()));
    }
}

fn charge(f: impl FnOnce(&MemoryMeter)) {
    let _ = METER.try_with(|current| {
        let meter = current.get();
        if !meter.is_null() {
            // SAFETY: the pointer is only set by `attach`, and the `MeterScope`
            // holding the `Arc` clears it before the meter can be dropped.
            f(unsafe { &*meter });
        }
    });
}

/// System allocator that feeds the current worker's [`MemoryMeter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackingAllocator;

// SAFETY: every call is forwarded to `System` unchanged; the meter is only
// updated after a successful allocation and never allocates itself.
unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            charge(|meter| meter.allocated(layout.size()));
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            charge(|meter| meter.allocated(layout.size()));
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        charge(|meter| meter.freed(layout.size()));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let grown = System.realloc(ptr, layout, new_size);
        if !grown.is_null() {
            charge(|meter| {
                meter.freed(layout.size());
                meter.allocated(new_size);
            });
        }
        grown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hint::black_box;

    #[test]
    fn attached_thread_allocations_are_metered() {
        let meter = Arc::new(MemoryMeter::new());
        let worker = {
            let meter = Arc::clone(&meter);
            std::thread::spawn(move || {
                let _scope = attach(meter);
                let buffer = black_box(vec![1u8; 4 * 1024 * 1024]);
                drop(buffer);
            })
        };
        worker.join().unwrap();

        assert!(meter.peak() >= 4 * 1024 * 1024);
        assert!(meter.live() < 1024 * 1024);
    }

    #[test]
    fn detached_threads_are_not_metered() {
        let meter = Arc::new(MemoryMeter::new());
        let scope = attach(Arc::clone(&meter));
        drop(scope);
        black_box(vec![1u8; 1024 * 1024]);
        assert_eq!(meter.peak(), 0);
    }

    #[test]
    fn reset_starts_from_zero() {
        let meter = MemoryMeter::new();
        meter.allocated(100);
        meter.freed(40);
        assert_eq!((meter.live(), meter.peak()), (60, 100));
        meter.reset();
        assert_eq!((meter.live(), meter.peak()), (0, 0));
    }
}
