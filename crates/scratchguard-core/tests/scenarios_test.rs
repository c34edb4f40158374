use scratchguard_core::assert::LogHook;
use scratchguard_core::log::{JsonlSink, MemorySink};
use scratchguard_core::raw::{CountingAlloc, SystemAlloc};
use scratchguard_core::temp::replace_temp_arena;
use scratchguard_core::{
    CorruptRegion, HeapTracker, Mark, MemConfig, MemError, TempArena, site, talloc, temp_mark,
    temp_reset, temp_stats,
};
use std::sync::Arc;

fn logging_arena(capacity: usize, sink: &Arc<MemorySink>) -> TempArena {
    let config = MemConfig::default()
        .with_temp_capacity(capacity)
        .with_clear_on_reset(true);
    TempArena::with_parts(
        SystemAlloc,
        &config,
        sink.clone(),
        Arc::new(LogHook::new(sink.clone())),
    )
}

#[test]
fn overflow_falls_back_to_raw_allocator() {
    let sink = Arc::new(MemorySink::new());
    replace_temp_arena(logging_arena(1024, &sink));

    let first = talloc(600, 8).unwrap();
    let base = first.as_ptr() as usize;
    assert_eq!(temp_mark().offset(), 600);

    let second = talloc(600, 8).unwrap();
    let addr = second.as_ptr() as usize;
    assert!(addr < base || addr >= base + 1024);

    let stats = temp_stats();
    assert_eq!(stats.total_num_leaks, 1);
    assert_eq!(stats.total_bytes_leaked, 600);
    assert_eq!(stats.curr_bytes_alloced, 600);
    assert_eq!(sink.events("temp_overflow").len(), 1);

    // The fallback block stays usable after the arena is reset.
    temp_reset(Mark::START).unwrap();
    // SAFETY: the overflow block is 600 bytes and owned by this test.
    unsafe { std::ptr::write_bytes(second.as_ptr(), 0x11, 600) };
}

#[test]
fn reset_to_mark_reuses_offsets() {
    let sink = Arc::new(MemorySink::new());
    replace_temp_arena(logging_arena(4096, &sink));
    talloc(24, 8).unwrap();

    let mark = temp_mark();
    let a = talloc(32, 8).unwrap();
    talloc(48, 8).unwrap();
    talloc(16, 8).unwrap();
    temp_reset(mark).unwrap();

    assert_eq!(temp_mark(), mark);
    let again = talloc(96, 8).unwrap();
    assert_eq!(again, a);

    let stats = temp_stats();
    assert_eq!(stats.total_num_full_resets, 0);
    assert_eq!(stats.num_allocs_since_full_reset, 5);
    assert_eq!(stats.max_bytes_alloced, 24 + 96);
}

#[test]
fn invalid_mark_is_reported_and_ignored() {
    let sink = Arc::new(MemorySink::new());
    replace_temp_arena(logging_arena(256, &sink));
    talloc(64, 8).unwrap();
    let late = temp_mark();
    temp_reset(Mark::START).unwrap();

    assert_eq!(
        temp_reset(late),
        Err(MemError::InvalidMark { mark: 64, offset: 0 })
    );
    assert_eq!(temp_mark(), Mark::START);
    assert_eq!(sink.events("assert_failed").len(), 1);
}

#[test]
fn alloc_realloc_free_counts() {
    let raw = CountingAlloc::new(SystemAlloc);
    let sink = Arc::new(MemorySink::new());
    let mut heap = HeapTracker::with_parts(&raw, sink.clone(), Arc::new(LogHook::new(sink.clone())));

    let p = heap.allocate(64, site!()).unwrap();
    let p = heap.reallocate(p, 128, site!()).unwrap();
    heap.free(p, site!()).unwrap();

    let stats = heap.stats();
    assert_eq!(stats.total_num_allocs, 1);
    assert_eq!(stats.total_num_reallocs, 1);
    assert_eq!(stats.total_num_frees, 1);
    assert_eq!(stats.curr_num_allocs, 0);
    assert_eq!(stats.curr_bytes_alloced, 0);
    assert_eq!(stats.max_bytes_alloced, 128);
    assert_eq!(heap.render_dump(), "no allocated memory\n");
    assert_eq!(raw.live_blocks(), 0);
}

#[test]
fn footer_overrun_is_caught_on_free() {
    let raw = CountingAlloc::new(SystemAlloc);
    let sink = Arc::new(MemorySink::new());
    let mut heap = HeapTracker::with_parts(&raw, sink.clone(), Arc::new(LogHook::new(sink.clone())));

    let p = heap.allocate(20, site!()).unwrap().unwrap();
    // SAFETY: one byte past the payload is the first footer canary byte,
    // still inside the raw block.
    unsafe { *p.as_ptr().add(20) ^= 0xFF };

    let err = heap.free(Some(p), site!()).unwrap_err();
    assert_eq!(
        err,
        MemError::CorruptionDetected {
            addr: p.as_ptr() as usize,
            region: CorruptRegion::Footer,
        }
    );
    let reports = heap.check_all();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].1, CorruptRegion::Footer);
    assert_eq!(heap.live_blocks(), 1);
}

#[test]
fn double_free_is_caught() {
    let sink = Arc::new(MemorySink::new());
    let mut heap = HeapTracker::with_parts(
        SystemAlloc,
        sink.clone(),
        Arc::new(LogHook::new(sink.clone())),
    );
    let p = heap.allocate(8, site!()).unwrap();
    heap.free(p, site!()).unwrap();
    assert!(matches!(
        heap.free(p, site!()),
        Err(MemError::CorruptionDetected {
            region: CorruptRegion::Unregistered,
            ..
        })
    ));
    assert_eq!(heap.stats().total_num_frees, 1);
}

#[test]
fn leaks_at_teardown_are_logged_as_jsonl() {
    let jsonl = Arc::new(JsonlSink::new(Vec::new()));
    {
        let mut heap = HeapTracker::with_parts(
            SystemAlloc,
            jsonl.clone(),
            Arc::new(LogHook::new(jsonl.clone())),
        );
        heap.allocate(100, site!()).unwrap();
        heap.allocate(28, site!()).unwrap();
    }
    let Ok(sink) = Arc::try_unwrap(jsonl) else {
        panic!("sink still shared");
    };
    let out = String::from_utf8(sink.into_inner()).unwrap();
    let entry: serde_json::Value = serde_json::from_str(out.lines().next().unwrap()).unwrap();
    assert_eq!(entry["event"], "heap_leaks");
    assert_eq!(entry["level"], "warn");
    assert_eq!(entry["details"]["blocks"], 2);
    assert_eq!(entry["details"]["bytes"], 128);
}
