//! Heap entry points that call sites use.
//!
//! Code allocates through [`HeapApi`] with an explicit [`Site`]. The
//! process-wide instance from [`global_heap`] is a [`HeapTracker`] when
//! `track_heap` is on and a [`PlainHeap`] otherwise; the `tracked_*` macros
//! capture the site and lock it for one call.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::config::global_config;
use crate::error::{MemError, Result};
use crate::heap::{BlockReport, HeapTracker};
use crate::raw::{RawAlloc, SystemAlloc};
use crate::registry::Site;
use crate::stats::HeapStats;

/// Allocate, resize and release payload memory.
///
/// `None` is the null pointer: allocating zero bytes returns it, and
/// reallocating or freeing it degenerates to allocate or no-op.
pub trait HeapApi {
    fn allocate(&mut self, size: usize, site: Site) -> Result<Option<NonNull<u8>>>;

    fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        site: Site,
    ) -> Result<Option<NonNull<u8>>>;

    fn free(&mut self, ptr: Option<NonNull<u8>>, site: Site) -> Result<()>;

    /// Whether blocks are registered and canary-checked.
    fn is_tracking(&self) -> bool;
}

impl<A: RawAlloc> HeapApi for HeapTracker<A> {
    fn allocate(&mut self, size: usize, site: Site) -> Result<Option<NonNull<u8>>> {
        HeapTracker::allocate(self, size, site)
    }

    fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        site: Site,
    ) -> Result<Option<NonNull<u8>>> {
        HeapTracker::reallocate(self, ptr, new_size, site)
    }

    fn free(&mut self, ptr: Option<NonNull<u8>>, site: Site) -> Result<()> {
        HeapTracker::free(self, ptr, site)
    }

    fn is_tracking(&self) -> bool {
        true
    }
}

/// Size prefix in front of every [`PlainHeap`] payload.
const PREFIX: usize = 16;

/// Untracked passthrough to the raw allocator.
///
/// Each block carries its payload size in a small prefix so `free` and
/// `reallocate` can rebuild the layout. No canaries, no registry.
#[derive(Debug, Default)]
pub struct PlainHeap<A: RawAlloc = SystemAlloc> {
    raw: A,
}

impl<A: RawAlloc> PlainHeap<A> {
    #[must_use]
    pub fn new(raw: A) -> Self {
        Self { raw }
    }

    fn layout(size: usize) -> Result<Layout> {
        size.checked_add(PREFIX)
            .and_then(|total| Layout::from_size_align(total, PREFIX).ok())
            .ok_or(MemError::OutOfMemory { size })
    }

    /// Write the size prefix and return the payload pointer.
    ///
    /// # Safety
    ///
    /// `raw` must point to a block of at least `PREFIX + size` bytes.
    unsafe fn finish(raw: NonNull<u8>, size: usize) -> NonNull<u8> {
        // SAFETY: the block starts 16-aligned and holds the prefix.
        unsafe {
            raw.cast::<usize>().write(size);
            raw.add(PREFIX)
        }
    }

    /// Recover the raw block and its payload size.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by this heap and not yet freed.
    unsafe fn split(payload: NonNull<u8>) -> (NonNull<u8>, usize) {
        // SAFETY: the prefix sits `PREFIX` bytes before every payload.
        unsafe {
            let raw = payload.sub(PREFIX);
            (raw, raw.cast::<usize>().read())
        }
    }
}

impl<A: RawAlloc> HeapApi for PlainHeap<A> {
    fn allocate(&mut self, size: usize, _site: Site) -> Result<Option<NonNull<u8>>> {
        if size == 0 {
            return Ok(None);
        }
        let layout = Self::layout(size)?;
        let raw = self.raw.alloc(layout).ok_or(MemError::OutOfMemory { size })?;
        // SAFETY: `raw` holds `PREFIX + size` bytes.
        Ok(Some(unsafe { Self::finish(raw, size) }))
    }

    fn reallocate(
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

        // SAFETY: `payload` is a live block of this heap.
        let (raw, old_size) = unsafe { Self::split(payload) };
        let old_layout = Self::layout(old_size)?;
        let new_total = Self::layout(new_size)?.size();
        // SAFETY: `raw` was allocated with `old_layout`; `new_total` fits a
        // valid layout.
        let moved = unsafe { self.raw.realloc(raw, old_layout, new_total) }
            .ok_or(MemError::OutOfMemory { size: new_size })?;
        // SAFETY: `moved` holds `PREFIX + new_size` bytes.
        Ok(Some(unsafe { Self::finish(moved, new_size) }))
    }

    fn free(&mut self, ptr: Option<NonNull<u8>>, _site: Site) -> Result<()> {
        let Some(payload) = ptr else {
            return Ok(());
        };
        // SAFETY: `payload` is a live block of this heap.
        let (raw, size) = unsafe { Self::split(payload) };
        let layout = Self::layout(size)?;
        // SAFETY: `raw` was allocated with `layout`.
        unsafe { self.raw.dealloc(raw, layout) };
        Ok(())
    }

    fn is_tracking(&self) -> bool {
        false
    }
}

/// The process-wide heap, picked once from the configuration.
pub enum GlobalHeap {
    Tracked(HeapTracker),
    Plain(PlainHeap),
}

impl GlobalHeap {
    /// The tracker, when tracking is on.
    #[must_use]
    pub fn tracker(&self) -> Option<&HeapTracker> {
        match self {
            Self::Tracked(tracker) => Some(tracker),
            Self::Plain(_) => None,
        }
    }

    fn inner(&mut self) -> &mut dyn HeapApi {
        match self {
            Self::Tracked(tracker) => tracker,
            Self::Plain(plain) => plain,
        }
    }
}

impl HeapApi for GlobalHeap {
    fn allocate(&mut self, size: usize, site: Site) -> Result<Option<NonNull<u8>>> {
        self.inner().allocate(size, site)
    }

    fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
        site: Site,
    ) -> Result<Option<NonNull<u8>>> {
        self.inner().reallocate(ptr, new_size, site)
    }

    fn free(&mut self, ptr: Option<NonNull<u8>>, site: Site) -> Result<()> {
        self.inner().free(ptr, site)
    }

    fn is_tracking(&self) -> bool {
        matches!(self, Self::Tracked(_))
    }
}

static GLOBAL_HEAP: OnceLock<Mutex<GlobalHeap>> = OnceLock::new();

/// Get the process heap (created on first call from [`global_config`]).
pub fn global_heap() -> &'static Mutex<GlobalHeap> {
    GLOBAL_HEAP.get_or_init(|| {
        let heap = if global_config().track_heap {
            GlobalHeap::Tracked(HeapTracker::new())
        } else {
            GlobalHeap::Plain(PlainHeap::default())
        };
        Mutex::new(heap)
    })
}

/// Stats of the process heap; `None` when it is not tracking.
#[must_use]
pub fn heap_stats() -> Option<HeapStats> {
    global_heap().lock().tracker().map(HeapTracker::stats)
}

/// Descriptors of every live block of the process heap.
#[must_use]
pub fn heap_dump() -> Vec<BlockReport> {
    global_heap()
        .lock()
        .tracker()
        .map(|tracker| tracker.dump().collect())
        .unwrap_or_default()
}

/// The [`Site`] of the macro invocation.
#[macro_export]
macro_rules! site {
    () => {
        $crate::registry::Site::new(::std::file!(), ::std::module_path!(), ::std::line!())
    };
}

/// Allocate `size` bytes from the process heap at this call site.
#[macro_export]
macro_rules! tracked_alloc {
    ($size:expr) => {
        $crate::api::HeapApi::allocate(
            &mut *$crate::api::global_heap().lock(),
            $size,
            $crate::site!(),
        )
    };
}

#[macro_export]
macro_rules! tracked_realloc {
    ($ptr:expr, $new_size:expr) => {
        $crate::api::HeapApi::reallocate(
            &mut *$crate::api::global_heap().lock(),
            $ptr,
            $new_size,
            $crate::site!(),
        )
    };
}

#[macro_export]
macro_rules! tracked_free {
    ($ptr:expr) => {
        $crate::api::HeapApi::free(&mut *$crate::api::global_heap().lock(), $ptr, $crate::site!())
    };
}
