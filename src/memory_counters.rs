use core::sync::atomic::{AtomicUsize, Ordering};

use crate::modules::driver::MemoryKind;

#[derive(Default)]
struct Counter {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Counter {
    fn add(&self, bytes: usize) {
        let current = self.current.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak.fetch_max(current, Ordering::Relaxed);
    }

    fn sub(&self, bytes: usize) {
        self.current.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Process-wide byte-usage accounting, keyed by memory kind.
///
/// The crate reports allocation deltas into this but does not own its
/// lifecycle; share one instance via `Arc` across everything that should
/// be accounted together. Anything that is not device memory is counted
/// as pinned host.
#[derive(Default)]
pub struct MemoryCounters {
    device: Counter,
    pinned: Counter,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: MemoryKind) -> &Counter {
        match kind {
            MemoryKind::Device => &self.device,
            _ => &self.pinned,
        }
    }

    pub fn allocate(&self, kind: MemoryKind, bytes: usize) {
        self.counter(kind).add(bytes);
    }

    /// Must mirror a previous `allocate` of the same kind and size.
    pub fn deallocate(&self, kind: MemoryKind, bytes: usize) {
        self.counter(kind).sub(bytes);
    }

    pub fn current(&self, kind: MemoryKind) -> usize {
        self.counter(kind).current.load(Ordering::Relaxed)
    }

    pub fn peak(&self, kind: MemoryKind) -> usize {
        self.counter(kind).peak.load(Ordering::Relaxed)
    }
}
