//! Usage statistics for the tracking heap and the temp arenas.
//!
//! Counters are diagnostic only: nothing in the allocators reads them back
//! to make a decision.

use serde::Serialize;

/// A current value together with the highest value it has reached.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HighWater {
    pub current: u64,
    pub max: u64,
}

impl HighWater {
    /// Raise the current value, refreshing the peak.
    pub fn raise(&mut self, amount: u64) {
        self.current = self.current.saturating_add(amount);
        self.max = self.max.max(self.current);
    }

    /// Lower the current value. The peak never drops.
    pub fn lower(&mut self, amount: u64) {
        self.current = self.current.saturating_sub(amount);
    }

    /// Overwrite the current value, refreshing the peak.
    pub fn set(&mut self, value: u64) {
        self.current = value;
        self.max = self.max.max(value);
    }
}

/// Incremental mean: `avg += (x - avg) / n`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct RunningMean {
    pub mean: f64,
    pub samples: u64,
}

impl RunningMean {
    pub fn fold(&mut self, sample: f64) {
        self.samples += 1;
        self.mean += (sample - self.mean) / self.samples as f64;
    }
}

/// Process-wide counters for the tracking heap.
#[derive(Debug, Default, Clone)]
pub(crate) struct HeapCounters {
    pub total_num_allocs: u64,
    pub total_num_reallocs: u64,
    pub total_num_frees: u64,
    pub total_bytes_alloced: u64,
    pub total_bytes_freed: u64,
    pub num_allocs: HighWater,
    pub bytes_alloced: HighWater,
    pub lifespan: RunningMean,
}

impl HeapCounters {
    pub fn on_alloc(&mut self, size: usize) {
        self.total_num_allocs += 1;
        self.total_bytes_alloced += size as u64;
        self.num_allocs.raise(1);
        self.bytes_alloced.raise(size as u64);
    }

    pub fn on_realloc(&mut self, old_size: usize, new_size: usize) {
        self.total_num_reallocs += 1;
        if new_size >= old_size {
            let grown = (new_size - old_size) as u64;
            self.total_bytes_alloced += grown;
            self.bytes_alloced.raise(grown);
        } else {
            let shrunk = (old_size - new_size) as u64;
            self.total_bytes_freed += shrunk;
            self.bytes_alloced.lower(shrunk);
        }
    }

    pub fn on_free(&mut self, size: usize, lifespan_secs: u64) {
        self.total_num_frees += 1;
        self.total_bytes_freed += size as u64;
        self.num_allocs.lower(1);
        self.bytes_alloced.lower(size as u64);
        self.lifespan.fold(lifespan_secs as f64);
    }

    pub fn snapshot(&self) -> HeapStats {
        HeapStats {
            total_num_allocs: self.total_num_allocs,
            total_num_reallocs: self.total_num_reallocs,
            total_num_frees: self.total_num_frees,
            total_bytes_alloced: self.total_bytes_alloced,
            total_bytes_freed: self.total_bytes_freed,
            curr_num_allocs: self.num_allocs.current,
            curr_bytes_alloced: self.bytes_alloced.current,
            max_num_allocs: self.num_allocs.max,
            max_bytes_alloced: self.bytes_alloced.max,
            avg_alloc_lifespan: self.lifespan.mean,
        }
    }
}

/// Point-in-time snapshot of the heap counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct HeapStats {
    /// Tracked allocations since start.
    pub total_num_allocs: u64,
    pub total_num_reallocs: u64,
    pub total_num_frees: u64,
    pub total_bytes_alloced: u64,
    pub total_bytes_freed: u64,
    /// Live tracked allocations.
    pub curr_num_allocs: u64,
    /// Live tracked payload bytes.
    pub curr_bytes_alloced: u64,
    pub max_num_allocs: u64,
    pub max_bytes_alloced: u64,
    /// Mean lifetime of freed blocks, in whole seconds.
    pub avg_alloc_lifespan: f64,
}

/// Per-thread counters for a temp arena.
#[derive(Debug, Default, Clone)]
pub(crate) struct TempCounters {
    pub total_num_allocs: u64,
    pub total_num_full_resets: u64,
    pub total_bytes_alloced: u64,
    pub bytes_alloced: HighWater,
    pub total_num_leaks: u64,
    pub total_bytes_leaked: u64,
    pub num_allocs_since_full_reset: u64,
    pub bytes_alloced_since_full_reset: u64,
    pub allocs_per_cycle: RunningMean,
    pub bytes_per_cycle: RunningMean,
}

impl TempCounters {
    pub fn on_alloc(&mut self, size: usize, cursor: usize) {
        self.total_num_allocs += 1;
        self.total_bytes_alloced += size as u64;
        self.num_allocs_since_full_reset += 1;
        self.bytes_alloced_since_full_reset += size as u64;
        self.bytes_alloced.set(cursor as u64);
    }

    pub fn on_leak(&mut self, size: usize) {
        self.total_num_leaks += 1;
        self.total_bytes_leaked += size as u64;
    }

    pub fn on_reset(&mut self, cursor: usize) {
        self.bytes_alloced.set(cursor as u64);
        if cursor == 0 {
            self.total_num_full_resets += 1;
            self.allocs_per_cycle
                .fold(self.num_allocs_since_full_reset as f64);
            self.bytes_per_cycle
                .fold(self.bytes_alloced_since_full_reset as f64);
            self.num_allocs_since_full_reset = 0;
            self.bytes_alloced_since_full_reset = 0;
        }
    }

    pub fn snapshot(&self) -> TempStats {
        TempStats {
            total_num_allocs: self.total_num_allocs,
            total_num_full_resets: self.total_num_full_resets,
            total_bytes_alloced: self.total_bytes_alloced,
            curr_bytes_alloced: self.bytes_alloced.current,
            max_bytes_alloced: self.bytes_alloced.max,
            total_num_leaks: self.total_num_leaks,
            total_bytes_leaked: self.total_bytes_leaked,
            num_allocs_since_full_reset: self.num_allocs_since_full_reset,
            bytes_alloced_since_full_reset: self.bytes_alloced_since_full_reset,
            avg_num_allocs_per_reset_cycle: self.allocs_per_cycle.mean,
            avg_bytes_alloced_per_reset_cycle: self.bytes_per_cycle.mean,
        }
    }
}

/// Point-in-time snapshot of one thread's temp arena counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct TempStats {
    pub total_num_allocs: u64,
    pub total_num_full_resets: u64,
    pub total_bytes_alloced: u64,
    /// The arena cursor.
    pub curr_bytes_alloced: u64,
    /// Highest cursor reached.
    pub max_bytes_alloced: u64,
    /// Allocations that overflowed to the raw allocator.
    pub total_num_leaks: u64,
    pub total_bytes_leaked: u64,
    pub num_allocs_since_full_reset: u64,
    pub bytes_alloced_since_full_reset: u64,
    pub avg_num_allocs_per_reset_cycle: f64,
    pub avg_bytes_alloced_per_reset_cycle: f64,
}
