//! The general-purpose allocator underneath both the arena fallback and the
//! tracking heap.
//!
//! Everything in this crate that touches real memory goes through
//! [`RawAlloc`], so tests can swap in [`CountingAlloc`] to observe how many
//! raw blocks are outstanding.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// A general-purpose allocator.
///
/// # Safety
///
/// Implementations must return blocks valid for reads and writes of
/// `layout.size()` bytes, aligned to `layout.align()`, that stay valid until
/// passed back to `dealloc` or `realloc`.
pub unsafe trait RawAlloc {
    /// Allocate a block for `layout`. Zero-sized layouts yield `None`.
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Resize a block, possibly moving it. On failure the old block is left
    /// untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator with exactly `layout`, and
    /// `new_size` must be non-zero and, rounded up to `layout.align()`, must
    /// not overflow `isize`.
    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>>;

    /// Release a block.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator with exactly `layout` and must not
    /// be used afterwards.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);
}

/// [`RawAlloc`] backed by [`std::alloc::System`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAlloc;

// SAFETY: delegates to `System`, which upholds the `GlobalAlloc` contract.
unsafe impl RawAlloc for SystemAlloc {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: the layout is not zero-sized.
        NonNull::new(unsafe { System.alloc(layout) })
    }

    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: contract forwarded to the caller.
        NonNull::new(unsafe { System.realloc(ptr.as_ptr(), layout, new_size) })
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: contract forwarded to the caller.
        unsafe { System.dealloc(ptr.as_ptr(), layout) }
    }
}

/// Wraps another [`RawAlloc`] and counts live blocks and bytes.
#[derive(Debug, Default)]
pub struct CountingAlloc<A = SystemAlloc> {
    inner: A,
    live_blocks: AtomicU64,
    live_bytes: AtomicU64,
}

impl<A: RawAlloc> CountingAlloc<A> {
    #[must_use]
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            live_blocks: AtomicU64::new(0),
            live_bytes: AtomicU64::new(0),
        }
    }

    /// Raw blocks handed out and not yet released.
    pub fn live_blocks(&self) -> u64 {
        self.live_blocks.load(Ordering::Relaxed)
    }

    /// Raw bytes handed out and not yet released, overhead included.
    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::Relaxed)
    }
}

// SAFETY: every call is forwarded unchanged to `inner`.
unsafe impl<A: RawAlloc> RawAlloc for CountingAlloc<A> {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = self.inner.alloc(layout)?;
        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        self.live_bytes
            .fetch_add(layout.size() as u64, Ordering::Relaxed);
        Some(ptr)
    }

    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: contract forwarded to the caller.
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) }?;
        self.live_bytes
            .fetch_sub(layout.size() as u64, Ordering::Relaxed);
        self.live_bytes.fetch_add(new_size as u64, Ordering::Relaxed);
        Some(new_ptr)
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: contract forwarded to the caller.
        unsafe { self.inner.dealloc(ptr, layout) };
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes
            .fetch_sub(layout.size() as u64, Ordering::Relaxed);
    }
}

// SAFETY: same forwarding as the owned impl.
unsafe impl<A: RawAlloc + ?Sized> RawAlloc for &A {
    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).alloc(layout)
    }

    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        layout: Layout,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: contract forwarded to the caller.
        unsafe { (**self).realloc(ptr, layout, new_size) }
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: contract forwarded to the caller.
        unsafe { (**self).dealloc(ptr, layout) }
    }
}
