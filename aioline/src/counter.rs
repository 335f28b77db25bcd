//! Sharded counters for hot-path metrics.
//!
//! Each loop thread writes to its own shard so counters touched on every
//! iteration never contend on a cache line; reads aggregate across shards.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

const SLOTS: usize = 8;
const NUM_SHARDS: usize = 32;

thread_local! {
    static SHARD: Cell<usize> = const { Cell::new(0) };
}

/// Bind the current thread to a shard. Workers call this once at startup
/// with their worker id; unbound threads share shard 0.
pub fn bind_thread_shard(id: usize) {
    SHARD.set(id % NUM_SHARDS);
}

#[repr(C, align(64))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

/// Sharded storage for up to [`SLOTS`] counters.
pub struct CounterGroup {
    shards: [Shard; NUM_SHARDS],
}

impl CounterGroup {
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        const SHARD: Shard = Shard { slots: [ZERO; SLOTS] };
        Self {
            shards: [SHARD; NUM_SHARDS],
        }
    }

    #[inline]
    fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS);
        self.shards[SHARD.get()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    fn value(&self, slot: usize) -> u64 {
        self.shards
            .iter()
            .map(|s| s.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for CounterGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// One counter slot in a [`CounterGroup`], registrable with metriken.
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    pub const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        Self { group, slot }
    }

    #[inline]
    pub fn increment(&self) {
        self.group.add(self.slot, 1);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        self.group.add(self.slot, value);
    }

    /// Aggregate across all shards.
    pub fn value(&self) -> u64 {
        self.group.value(self.slot)
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(Counter::value(self)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_read() {
        static GROUP: CounterGroup = CounterGroup::new();
        let c = Counter::new(&GROUP, 0);
        assert_eq!(c.value(), 0);
        c.increment();
        c.add(4);
        assert_eq!(c.value(), 5);
    }

    #[test]
    fn slots_are_independent(){
        static GROUP: CounterGroup = CounterGroup::new();
        let a = Counter::new(&GROUP, 1);
        let b = Counter::new(&GROUP, 2);
        a.add(7);
        b.increment();
        assert_eq!(a.value(), 7);
        assert_eq!(b.value(), 1);
    }

    #[test]
    fn aggregates_across_shards() {
        use std::sync::Arc;

        static GROUP: CounterGroup = CounterGroup::new();
        let c = Arc::new(Counter::new(&GROUP, 3));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    bind_thread_shard(i);
                    for _ in 0..100 {
                        c.increment();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.value(), 400);
    }
}
