//! Canary-guarded tracking heap.
//!
//! Every allocation is padded with a header and a footer canary and
//! registered in a [`BlockRegistry`] ring. `reallocate` and `free` verify
//! both canaries before touching the block, so overruns and frees of stale
//! pointers are caught instead of corrupting the raw allocator.
//!
//! A `HeapTracker` is a plain context object (`&mut self` everywhere); the
//! process-wide instance lives behind a `parking_lot::Mutex` in [`crate::api`].

use std::collections::HashMap;
use std::fmt::Write as _;
use std::ptr::NonNull;

use serde::Serialize;
use serde_json::json;

use crate::assert::{SharedHook, hook_for};
use crate::canary;
use crate::config::global_config;
use crate::error::{CorruptRegion, MemError, Result};
use crate::log::{LogEntry, LogLevel, SharedSink, default_sink, format_hms, unix_secs};
use crate::raw::{RawAlloc, SystemAlloc};
use crate::registry::{BlockId, BlockRegistry, HeapBlock, Site};
use crate::stats::{HeapCounters, HeapStats};

/// Original allocation of a block that has since been reallocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockOrigin {
    pub size: usize,
    pub site: Site,
    pub time: u64,
}

/// One entry of a heap dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockReport {
    /// 1-based position in the ring walk.
    pub index: usize,
    pub addr: usize,
    pub size: usize,
    pub site: Site,
    pub time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realloced_from: Option<BlockOrigin>,
}

impl BlockReport {
    fn from_block(index: usize, block: &HeapBlock) -> Self {
        Self {
            index,
            addr: block.addr,
            size: block.size,
            site: block.site,
            time: block.time,
            realloced_from: block.was_reallocated().then_some(BlockOrigin {
                size: block.size0,
                site: block.site0,
                time: block.time0,
            }),
        }
    }
}

/// Lazy walk over the live blocks. Cloning restarts from the same point.
#[derive(Clone)]
pub struct HeapDump<'a> {
    ring: crate::registry::RingIter<'a>,
    index: usize,
}

impl Iterator for HeapDump<'_> {
    type Item = BlockReport;

    fn next(&mut self) -> Option<Self::Item> {
        let (_, block) = self.ring.next()?;
        self.index += 1;
        Some(BlockReport::from_block(self.index, block))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ring.size_hint()
    }
}

impl ExactSizeIterator for HeapDump<'_> {}

/// Tracking heap context.
///
/// Dropping a tracker with live blocks logs a `heap_leaks` event and leaves
/// those blocks allocated; callers may still hold pointers into them.
pub struct HeapTracker<A: RawAlloc = SystemAlloc> {
    raw: A,
    registry: BlockRegistry,
    /// Payload address -> registry slot.
    by_addr: HashMap<usize, BlockId>,
    counters: HeapCounters,
    sink: SharedSink,
    hook: SharedHook,
    clock: fn() -> u64,
}

impl HeapTracker<SystemAlloc> {
    /// Tracker over the system allocator, logging to stderr, asserting per
    /// the global config.
    #[must_use]
    pub fn new() -> Self {
        let sink = default_sink();
        let hook = hook_for(global_config().assert_mode, sink.clone());
        Self::with_parts(SystemAlloc, sink, hook)
    }
}

impl Default for HeapTracker<SystemAlloc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: RawAlloc> HeapTracker<A> {
    #[must_use]
    pub fn with_parts(raw: A, sink: SharedSink, hook: SharedHook) -> Self {
        Self {
            raw,
            registry: BlockRegistry::new(),
            by_addr: HashMap::new(),
            counters: HeapCounters::default(),
            sink,
            hook,
            clock: unix_secs,
        }
    }

    /// Replace the timestamp source (whole seconds).
    #[must_use]
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Allocate `size` tracked bytes. Zero bytes yields `None`.
    pub fn allocate(&mut self, size: usize, site: Site) -> Result<Option<NonNull<u8>>> {
        if size == 0 {
            return Ok(None);
        }
        let layout = canary::guarded_layout(size).ok_or(MemError::OutOfMemory { size })?;
        let Some(raw) = self.raw.alloc(layout) else {
            return Err(self.out_of_memory("alloc", site, size));
        };

        // SAFETY: `raw` was allocated with the guarded layout for `size`.
        let payload = unsafe { canary::payload_of(raw) };
        // SAFETY: same block.
        unsafe { canary::arm(payload, size) };

        let addr = payload.as_ptr() as usize;
        let id = self
            .registry
            .insert(HeapBlock::new(addr, size, site, (self.clock)()));
        self.by_addr.insert(addr, id);
        self.counters.on_alloc(size);
        Ok(Some(payload))
    }

    /// Resize a tracked block. `None` allocates; zero frees and returns `None`.
    pub fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        site: Site,
    ) -> Result<Option<NonNull<u8>>> {
        let Some(payload) = ptr else {
            return self.allocate(new_size, site);
        };
        if new_size == 0 {
            self.free(Some(payload), site)?;
            return Ok(None);
        }

        let (id, old_size) = self.checked_block(payload, "realloc", site)?;
        let old_layout =
            canary::guarded_layout(old_size).ok_or(MemError::OutOfMemory { size: old_size })?;
        let new_layout = canary::guarded_layout(new_size).ok_or(MemError::OutOfMemory {
            size: new_size,
        })?;

        // SAFETY: the block is registered, so `payload` came from `payload_of`
        // on a block allocated by `self.raw` with `old_layout`.
        let moved = unsafe {
            self.raw
                .realloc(canary::raw_of(payload), old_layout, new_layout.size())
        };
        let Some(new_raw) = moved else {
            return Err(self.out_of_memory("realloc", site, new_size));
        };

        // SAFETY: `new_raw` holds the guarded layout for `new_size`.
        let new_payload = unsafe { canary::payload_of(new_raw) };
        // SAFETY: same block.
        unsafe { canary::arm(new_payload, new_size) };

        let old_addr = payload.as_ptr() as usize;
        let new_addr = new_payload.as_ptr() as usize;
        if old_addr != new_addr {
            self.by_addr.remove(&old_addr);
            self.by_addr.insert(new_addr, id);
        }

        let now = (self.clock)();
        if let Some(block) = self.registry.get_mut(id) {
            block.addr = new_addr;
            block.size = new_size;
            block.site = site;
            block.time = now;
        }
        self.counters.on_realloc(old_size, new_size);
        Ok(Some(new_payload))
    }

    /// Release a tracked block. `None` is a no-op.
    pub fn free(&mut self, ptr: Option<NonNull<u8>>, site: Site) -> Result<()> {
        let Some(payload) = ptr else {
            return Ok(());
        };
        let (id, _) = self.checked_block(payload, "free", site)?;
        let Some(block) = self.registry.remove(id) else {
            return Err(self.corruption("free", site, payload, CorruptRegion::Unregistered));
        };
        self.by_addr.remove(&block.addr);

        let lifespan = (self.clock)().saturating_sub(block.time0);
        self.counters.on_free(block.size, lifespan);

        if let Some(layout) = canary::guarded_layout(block.size) {
            // SAFETY: registered blocks were allocated by `self.raw` with the
            // guarded layout for their current size.
            unsafe { self.raw.dealloc(canary::raw_of(payload), layout) };
        }
        Ok(())
    }

    /// Walk the live blocks once around the ring.
    #[must_use]
    pub fn dump(&self) -> HeapDump<'_> {
        HeapDump {
            ring: self.registry.iter(),
            index: 0,
        }
    }

    /// Human-readable listing of [`Self::dump`].
    #[must_use]
    pub fn render_dump(&self) -> String {
        let mut out = String::new();
        if self.registry.is_empty() {
            out.push_str("no allocated memory\n");
            return out;
        }
        for report in self.dump() {
            let _ = writeln!(
                out,
                "{}: {} bytes @ {}:{} ({}) {}",
                report.index,
                report.size,
                report.site.file,
                report.site.line,
                report.site.func,
                format_hms(report.time)
            );
            if let Some(origin) = report.realloced_from {
                let _ = writeln!(
                    out,
                    "   .. realloced from {} bytes @ {}:{} ({}) {}",
                    origin.size,
                    origin.site.file,
                    origin.site.line,
                    origin.site.func,
                    format_hms(origin.time)
                );
            }
        }
        out
    }

    /// Check every live block's canaries without raising.
    #[must_use]
    pub fn check_all(&self) -> Vec<(BlockReport, CorruptRegion)> {
        self.dump()
            .filter_map(|report| {
                let payload = NonNull::new(report.addr as *mut u8)?;
                // SAFETY: live blocks keep their guarded layout until freed.
                unsafe { canary::inspect(payload, report.size) }
                    .err()
                    .map(|region| (report, region))
            })
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.counters.snapshot()
    }

    /// Live tracked blocks.
    #[must_use]
    pub fn live_blocks(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    fn checked_block(
        &self,
        payload: NonNull<u8>,
        symbol: &'static str,
        site: Site,
    ) -> Result<(BlockId, usize)> {
        let addr = payload.as_ptr() as usize;
        let verdict = match self
            .by_addr
            .get(&addr)
            .and_then(|&id| self.registry.get(id).map(|b| (id, b.size)))
        {
            None => Err(CorruptRegion::Unregistered),
            // SAFETY: registered payloads sit in a guarded block of `size`.
            Some((id, size)) => unsafe { canary::inspect(payload, size) }.map(|()| (id, size)),
        };
        verdict.map_err(|region| self.corruption(symbol, site, payload, region))
    }

    fn corruption(
        &self,
        symbol: &'static str,
        site: Site,
        payload: NonNull<u8>,
        region: CorruptRegion,
    ) -> MemError {
        let err = MemError::CorruptionDetected {
            addr: payload.as_ptr() as usize,
            region,
        };
        self.sink.log(
            &LogEntry::new(LogLevel::Error, "heap_corruption", err.to_string())
                .with_symbol(symbol)
                .with_site(site.to_string()),
        );
        self.hook.check(false, &err.to_string());
        err
    }

    fn out_of_memory(&self, symbol: &'static str, site: Site, size: usize) -> MemError {
        let err = MemError::OutOfMemory { size };
        self.sink.log(
            &LogEntry::new(LogLevel::Error, "heap_oom", err.to_string())
                .with_symbol(symbol)
                .with_site(site.to_string())
                .with_details(json!({ "size": size })),
        );
        err
    }
}

impl<A: RawAlloc> Drop for HeapTracker<A> {
    fn drop(&mut self) {
        if self.registry.is_empty() {
            return;
        }
        let leaked: usize = self.dump().map(|r| r.size).sum();
        self.sink.log(
            &LogEntry::new(
                LogLevel::Warn,
                "heap_leaks",
                format!(
                    "{} tracked blocks ({leaked} bytes) still live at teardown",
                    self.registry.len()
                ),
            )
            .with_details(json!({ "blocks": self.registry.len(), "bytes": leaked })),
        );
    }
}
