//! Thread-local temp arena.
//!
//! A fixed-capacity buffer with a bump cursor. Scratch memory is handed out
//! with [`talloc`] and reclaimed in bulk with [`temp_reset`]: either back to
//! a [`Mark`] taken earlier, or to zero once per frame/cycle.
//!
//! When the buffer is exhausted the allocation falls back to the raw
//! allocator. That memory is never reclaimed; the leak is logged and counted
//! so the capacity can be tuned.

use std::alloc::{Layout, handle_alloc_error};
use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;

use serde_json::json;

use crate::assert::{SharedHook, ensure, hook_for};
use crate::config::{MemConfig, global_config};
use crate::error::{MemError, Result};
use crate::log::{LogEntry, LogLevel, SharedSink, default_sink};
use crate::raw::{RawAlloc, SystemAlloc};
use crate::stats::{TempCounters, TempStats};

/// Alignment of the arena buffer itself.
const BUFFER_ALIGN: usize = 64;

/// Snapshot of an arena cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Mark(usize);

impl Mark {
    /// The empty arena. Resetting to it is a full reset.
    pub const START: Mark = Mark(0);

    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }
}

pub struct TempArena<A: RawAlloc = SystemAlloc> {
    raw: A,
    base: NonNull<u8>,
    capacity: usize,
    offset: usize,
    default_align: usize,
    clear_on_reset: bool,
    counters: TempCounters,
    /// Overflow notices not yet handed to the sink.
    notices: Vec<LogEntry>,
    sink: SharedSink,
    hook: SharedHook,
}

impl TempArena<SystemAlloc> {
    #[must_use]
    pub fn new(config: &MemConfig) -> Self {
        let sink = default_sink();
        let hook = hook_for(config.assert_mode, sink.clone());
        Self::with_parts(SystemAlloc, config, sink, hook)
    }
}

impl<A: RawAlloc> TempArena<A> {
    /// Build an arena over `raw`. Aborts via [`handle_alloc_error`] if the
    /// buffer itself cannot be allocated.
    #[must_use]
    pub fn with_parts(raw: A, config: &MemConfig, sink: SharedSink, hook: SharedHook) -> Self {
        let (base, capacity) = match Layout::from_size_align(config.temp_capacity, BUFFER_ALIGN) {
            Ok(layout) if layout.size() > 0 => match raw.alloc(layout) {
                Some(ptr) => (ptr, layout.size()),
                None => handle_alloc_error(layout),
            },
            _ => (NonNull::dangling(), 0),
        };
        Self {
            raw,
            base,
            capacity,
            offset: 0,
            default_align: config.default_align,
            clear_on_reset: config.clear_on_reset,
            counters: TempCounters::default(),
            notices: Vec::new(),
            sink,
            hook,
        }
    }

    /// Bump-allocate `size` bytes aligned to `align` (0 means the configured
    /// default). Never fails for lack of space: overflow falls back to the
    /// raw allocator.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let result = self.bump(size, align);
        self.flush_notices();
        result
    }

    /// [`Self::allocate`] without delivering overflow notices.
    fn bump(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let align = if align == 0 { self.default_align } else { align };
        ensure(
            self.hook.as_ref(),
            align.is_power_of_two(),
            MemError::InvalidAlignment { align },
        )?;

        let base = self.base.as_ptr() as usize;
        let fits = (base + self.offset)
            .checked_next_multiple_of(align)
            .map(|addr| addr - base)
            .and_then(|start| Some((start, start.checked_add(size)?)))
            .filter(|&(_, end)| end <= self.capacity);

        match fits {
            Some((start, end)) => {
                // SAFETY: start <= end <= capacity, inside the buffer.
                let ptr = unsafe { self.base.add(start) };
                self.offset = end;
                self.counters.on_alloc(size, end);
                Ok(ptr)
            }
            None => self.overflow(size, align),
        }
    }

    fn overflow(&mut self, size: usize, align: usize) -> Result<NonNull<u8>> {
        let overflow = MemError::ArenaOverflow {
            requested: size,
            remaining: self.remaining(),
            capacity: self.capacity,
        };
        self.notices.push(
            LogEntry::new(
                LogLevel::Warn,
                "temp_overflow",
                format!("leaked {size} bytes of temp memory"),
            )
            .with_symbol("talloc")
            .with_details(json!({
                "requested": size,
                "remaining": self.remaining(),
                "capacity": self.capacity,
                "reason": overflow.to_string(),
            })),
        );
        self.counters.on_leak(size);

        let layout = Layout::from_size_align(size.max(1), align)
            .map_err(|_| MemError::OutOfMemory { size })?;
        self.raw
            .alloc(layout)
            .ok_or(MemError::OutOfMemory { size })
    }

    fn flush_notices(&mut self) {
        for entry in self.notices.drain(..) {
            self.sink.log(&entry);
        }
    }

    /// Pending notices and the sink they go to, for delivery once the
    /// thread-local borrow is released.
    fn take_notices(&mut self) -> Option<(SharedSink, Vec<LogEntry>)> {
        if self.notices.is_empty() {
            return None;
        }
        Some((self.sink.clone(), std::mem::take(&mut self.notices)))
    }

    #[must_use]
    pub fn mark(&self) -> Mark {
        Mark(self.offset)
    }

    /// Roll the cursor back to `mark`. `Mark::START` is a full reset and
    /// closes the current cycle.
    ///
    /// A mark past the cursor is rejected through the assert hook and leaves
    /// the arena untouched.
    pub fn reset(&mut self, mark: Mark) -> Result<()> {
        ensure(
            self.hook.as_ref(),
            mark.0 <= self.offset,
            MemError::InvalidMark {
                mark: mark.0,
                offset: self.offset,
            },
        )?;

        if self.clear_on_reset && mark.0 < self.offset {
            // SAFETY: [mark, offset) lies inside the buffer.
            unsafe {
                std::ptr::write_bytes(self.base.as_ptr().add(mark.0), 0, self.offset - mark.0);
            }
        }
        self.offset = mark.0;
        self.counters.on_reset(mark.0);
        Ok(())
    }

    /// Format into exactly as many arena bytes as the output needs.
    pub fn format_into(&mut self, args: fmt::Arguments<'_>) -> Result<NonNull<str>> {
        let result = self.format_pending(args);
        self.flush_notices();
        result
    }

    fn format_pending(&mut self, args: fmt::Arguments<'_>) -> Result<NonNull<str>> {
        let len = measure(args);
        let ptr = self.bump(len, 1)?;
        // SAFETY: `ptr` is fresh and valid for `len` bytes.
        Ok(unsafe { write_formatted(ptr, len, args) })
    }

    #[must_use]
    pub fn stats(&self) -> TempStats {
        self.counters.snapshot()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.offset
    }

    /// Start of the buffer, for offset arithmetic in diagnostics.
    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }
}

impl<A: RawAlloc> Drop for TempArena<A> {
    fn drop(&mut self) {
        if self.capacity == 0 {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(self.capacity, BUFFER_ALIGN) {
            // SAFETY: the buffer was allocated by `self.raw` with this layout.
            unsafe { self.raw.dealloc(self.base, layout) };
        }
    }
}

/// Formatted length of `args`.
fn measure(args: fmt::Arguments<'_>) -> usize {
    let mut counter = ByteCounter(0);
    // Counting never fails; a failing Display impl just shortens the output.
    let _ = fmt::write(&mut counter, args);
    counter.0
}

/// Format `args` into `len` bytes at `ptr`.
///
/// # Safety
///
/// `ptr` must be valid for writes of `len` bytes that nothing else
/// references.
unsafe fn write_formatted(ptr: NonNull<u8>, len: usize, args: fmt::Arguments<'_>) -> NonNull<str> {
    // SAFETY: forwarded to the caller.
    let buf = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) };
    let mut writer = SliceWriter { buf, pos: 0 };
    let _ = fmt::write(&mut writer, args);

    let written = NonNull::slice_from_raw_parts(ptr, writer.pos);
    // SAFETY: the writer only copies whole `str` pieces, so the prefix is
    // valid UTF-8; the pointer is non-null.
    unsafe { NonNull::new_unchecked(written.as_ptr() as *mut str) }
}

struct ByteCounter(usize);

impl fmt::Write for ByteCounter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl fmt::Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.pos + s.len();
        if end > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.pos..end].copy_from_slice(s.as_bytes());
        self.pos = end;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-thread instance
// ---------------------------------------------------------------------------

thread_local! {
    static TEMP_ARENA: RefCell<Option<TempArena>> = const { RefCell::new(None) };
}

/// Run `f` on this thread's arena, creating it from the global config on
/// first use.
///
/// # Panics
///
/// If `f` calls back into this function. [`talloc`] and [`temp_format`]
/// tolerate being called from inside it.
pub fn with_temp_arena<F, R>(f: F) -> R
where
    F: FnOnce(&mut TempArena) -> R,
{
    TEMP_ARENA.with(|cell| {
        let mut slot = cell.borrow_mut();
        f(slot.get_or_insert_with(|| TempArena::new(&global_config())))
    })
}

/// Like [`with_temp_arena`], but `None` while the arena is already in use
/// on this thread.
fn try_with_temp_arena<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut TempArena) -> R,
{
    TEMP_ARENA.with(|cell| {
        let mut slot = cell.try_borrow_mut().ok()?;
        Some(f(slot.get_or_insert_with(|| TempArena::new(&global_config()))))
    })
}

fn deliver(notices: Option<(SharedSink, Vec<LogEntry>)>) {
    if let Some((sink, entries)) = notices {
        for entry in &entries {
            sink.log(entry);
        }
    }
}

/// Scratch memory for a request made while the arena is busy (a log sink or
/// a `Display` impl calling back in). Comes from the raw allocator and is
/// neither reclaimed nor counted.
fn reentrant_alloc(size: usize, align: usize) -> Result<NonNull<u8>> {
    let align = if align == 0 {
        global_config().default_align
    } else {
        align
    };
    if !align.is_power_of_two() {
        return Err(MemError::InvalidAlignment { align });
    }
    let layout = Layout::from_size_align(size.max(1), align)
        .map_err(|_| MemError::OutOfMemory { size })?;
    SystemAlloc
        .alloc(layout)
        .ok_or(MemError::OutOfMemory { size })
}

/// Install `arena` as this thread's arena, returning the previous one.
pub fn replace_temp_arena(arena: TempArena) -> Option<TempArena> {
    TEMP_ARENA.with(|cell| cell.borrow_mut().replace(arena))
}

/// Allocate from this thread's arena.
pub fn talloc(size: usize, align: usize) -> Result<NonNull<u8>> {
    let attempt = try_with_temp_arena(|arena| {
        let result = arena.bump(size, align);
        (result, arena.take_notices())
    });
    match attempt {
        Some((result, notices)) => {
            deliver(notices);
            result
        }
        None => reentrant_alloc(size, align),
    }
}

#[must_use]
pub fn temp_mark() -> Mark {
    with_temp_arena(|arena| arena.mark())
}

pub fn temp_reset(mark: Mark) -> Result<()> {
    with_temp_arena(|arena| arena.reset(mark))
}

#[must_use]
pub fn temp_stats() -> TempStats {
    with_temp_arena(|arena| arena.stats())
}

pub fn temp_format(args: fmt::Arguments<'_>) -> Result<NonNull<str>> {
    let attempt = try_with_temp_arena(|arena| {
        let result = arena.format_pending(args);
        (result, arena.take_notices())
    });
    match attempt {
        Some((result, notices)) => {
            deliver(notices);
            result
        }
        None => {
            let len = measure(args);
            let ptr = reentrant_alloc(len, 1)?;
            // SAFETY: `ptr` is a fresh block of at least `len` bytes.
            Ok(unsafe { write_formatted(ptr, len, args) })
        }
    }
}

/// `format!` into this thread's temp arena.
#[macro_export]
macro_rules! tformat {
    ($($arg:tt)*) => {
        $crate::temp::temp_format(::std::format_args!($($arg)*))
    };
}
