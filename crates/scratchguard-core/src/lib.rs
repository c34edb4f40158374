//! Diagnostic memory layer: per-thread scratch arenas and a tracking heap.
//!
//! # Architecture
//!
//! - **Temp arena** (`temp`): fixed-capacity bump allocator per thread with
//!   mark/reset checkpoints and raw-allocator fallback on overflow
//! - **Tracking heap** (`heap`): wraps every block in `ORHEADER`/`ORFOOTER`
//!   canaries and keeps a registry of live blocks with their call sites
//! - **Block registry** (`registry`): circular ring of live block metadata
//! - **Canaries** (`canary`): guarded layout and canary checks
//! - **Statistics** (`stats`): counters, high-water marks, running means
//! - **Heap facade** (`api`): `HeapApi`, the process heap, `tracked_*!` macros
//! - **Collaborators** (`log`, `assert`): pluggable log sink and assert hook
//! - **Configuration** (`config`): environment-driven runtime settings
//! - **Raw allocator** (`raw`): the general-purpose allocator underneath

pub mod api;
pub mod assert;
pub mod canary;
pub mod config;
pub mod error;
pub mod heap;
pub mod log;
pub mod raw;
pub mod registry;
pub mod stats;
pub mod temp;

pub use api::{GlobalHeap, HeapApi, PlainHeap, global_heap, heap_dump, heap_stats};
pub use assert::{AssertHook, LogHook, PanicHook};
pub use config::{AssertMode, MemConfig, global_config};
pub use error::{CorruptRegion, MemError};
pub use heap::{BlockReport, HeapTracker};
pub use log::{LogEntry, LogLevel, LogSink};
pub use raw::{RawAlloc, SystemAlloc};
pub use registry::Site;
pub use stats::{HeapStats, TempStats};
pub use temp::{
    Mark, TempArena, talloc, temp_format, temp_mark, temp_reset, temp_stats, with_temp_arena,
};
