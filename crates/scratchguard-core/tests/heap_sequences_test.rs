use parking_lot::Mutex;
use scratchguard_core::assert::LogHook;
use scratchguard_core::log::MemorySink;
use scratchguard_core::raw::{CountingAlloc, SystemAlloc};
use scratchguard_core::{CorruptRegion, HeapTracker, MemError, Site};
use serde_json::json;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread;

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

const SITE: Site = Site::new("heap_sequences_test.rs", "sequence", 1);
const FILL: u8 = 0xC3;

fn tracker<'a>(raw: &'a CountingAlloc, sink: &Arc<MemorySink>) -> HeapTracker<&'a CountingAlloc> {
    HeapTracker::with_parts(raw, sink.clone(), Arc::new(LogHook::new(sink.clone())))
}

fn fill(ptr: NonNull<u8>, size: usize) {
    // SAFETY: callers pass a live payload of `size` bytes.
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), FILL, size) };
}

fn payload_intact(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: callers pass a live payload of `size` bytes.
    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
    bytes.iter().all(|&b| b == FILL)
}

#[test]
fn deterministic_heap_sequences_hold_core_invariants() {
    // Invariant pressure over a bounded random walk, not a fuzz campaign.
    const SEEDS: [u64; 4] = [1, 2, 3, 4];
    const STEPS: usize = 2_000;
    const SLOTS: usize = 32;

    for seed in SEEDS {
        let raw = CountingAlloc::new(SystemAlloc);
        let sink = Arc::new(MemorySink::new());
        let mut heap = tracker(&raw, &sink);
        let mut rng = XorShift64::new(seed);

        let mut ptrs: [Option<NonNull<u8>>; SLOTS] = [None; SLOTS];
        let mut sizes = [0_usize; SLOTS];
        let mut model_allocs = 0_u64;
        let mut model_reallocs = 0_u64;
        let mut model_frees = 0_u64;

        for step in 0..STEPS {
            let op = rng.gen_range_usize(0, 99);
            let idx = rng.gen_range_usize(0, SLOTS - 1);

            match op {
                // allocate (biased)
                0..=44 => {
                    if ptrs[idx].is_some() {
                        continue;
                    }
                    let size = rng.gen_range_usize(1, 2048);
                    let ptr = heap.allocate(size, SITE).expect("alloc").expect("non-null");
                    fill(ptr, size);
                    ptrs[idx] = Some(ptr);
                    sizes[idx] = size;
                    model_allocs += 1;
                }
                // reallocate
                45..=69 => {
                    let Some(ptr) = ptrs[idx] else {
                        continue;
                    };
                    let new_size = rng.gen_range_usize(1, 4096);
                    let moved = heap
                        .reallocate(Some(ptr), new_size, SITE)
                        .expect("realloc")
                        .expect("non-null");
                    let kept = sizes[idx].min(new_size);
                    assert!(
                        payload_intact(moved, kept),
                        "seed={seed} step={step}: realloc must preserve the payload prefix"
                    );
                    fill(moved, new_size);
                    ptrs[idx] = Some(moved);
                    sizes[idx] = new_size;
                    model_reallocs += 1;
                }
                // free
                _ => {
                    let Some(ptr) = ptrs[idx].take() else {
                        continue;
                    };
                    assert!(
                        payload_intact(ptr, sizes[idx]),
                        "seed={seed} step={step}: payload clobbered before free"
                    );
                    heap.free(Some(ptr), SITE).expect("free");
                    model_frees += 1;
                }
            }

            let live = ptrs.iter().flatten().count();
            assert!(
                heap.registry().is_consistent(),
                "seed={seed} step={step}: registry ring inconsistent"
            );
            assert_eq!(
                heap.live_blocks(),
                live,
                "seed={seed} step={step}: live block count"
            );
            assert_eq!(raw.live_blocks(), live as u64);
        }

        let live_bytes: usize = ptrs
            .iter()
            .zip(sizes)
            .filter(|(p, _)| p.is_some())
            .map(|(_, s)| s)
            .sum();
        let stats = heap.stats();
        assert_eq!(stats.total_num_allocs, model_allocs, "seed={seed}");
        assert_eq!(stats.total_num_reallocs, model_reallocs, "seed={seed}");
        assert_eq!(stats.total_num_frees, model_frees, "seed={seed}");
        assert_eq!(stats.curr_num_allocs, heap.live_blocks() as u64);
        assert_eq!(stats.curr_bytes_alloced, live_bytes as u64);
        assert_eq!(
            stats.total_bytes_alloced - stats.total_bytes_freed,
            live_bytes as u64,
            "seed={seed}: byte totals must net to the live bytes"
        );
        assert!(stats.max_bytes_alloced >= stats.curr_bytes_alloced);
        assert!(heap.check_all().is_empty(), "seed={seed}: no overruns expected");
        assert!(
            sink.events("heap_corruption").is_empty(),
            "seed={seed}: no corruption expected"
        );

        // Release the rest through the tracker so teardown reports nothing.
        for ptr in ptrs.iter_mut().filter_map(Option::take) {
            heap.free(Some(ptr), SITE).expect("final free");
        }
        drop(heap);
        assert_eq!(raw.live_blocks(), 0, "seed={seed}: raw blocks leaked");
        assert!(sink.events("heap_leaks").is_empty());
    }
}

#[test]
fn dump_is_stable_without_mutation() {
    let raw = CountingAlloc::new(SystemAlloc);
    let sink = Arc::new(MemorySink::new());
    let mut heap = tracker(&raw, &sink);
    let mut rng = XorShift64::new(7);
    let mut live = Vec::new();
    for _ in 0..16 {
        let size = rng.gen_range_usize(1, 512);
        live.push(heap.allocate(size, SITE).unwrap());
    }
    live[3] = heap.reallocate(live[3], 1000, SITE).unwrap();

    let first: Vec<_> = heap.dump().collect();
    let second: Vec<_> = heap.dump().collect();
    assert_eq!(first, second);
    assert_eq!(heap.render_dump(), heap.render_dump());
    assert_eq!(first.len(), 16);
    assert_eq!(first.iter().filter(|r| r.realloced_from.is_some()).count(), 1);

    for p in live {
        heap.free(p, SITE).unwrap();
    }
    assert_eq!(raw.live_blocks(), 0);
}

/// Race the same pointers through two waves of frees from many threads.
/// Exactly one free per pointer may succeed; every other attempt must be
/// reported as an unregistered pointer.
fn run_double_free_stress(blocks: usize, threads: usize) -> (usize, usize) {
    let sink = Arc::new(MemorySink::new());
    let heap = Arc::new(Mutex::new(HeapTracker::with_parts(
        SystemAlloc,
        sink.clone(),
        Arc::new(LogHook::new(sink.clone())),
    )));

    let addrs: Vec<usize> = {
        let mut guard = heap.lock();
        (0..blocks)
            .map(|i| {
                let size = 16 + (i % 64);
                let p = guard.allocate(size, SITE).unwrap().unwrap();
                p.as_ptr() as usize
            })
            .collect()
    };
    let addrs = Arc::new(addrs);

    let mut joins = Vec::new();
    for t in 0..threads {
        let heap = Arc::clone(&heap);
        let addrs = Arc::clone(&addrs);
        joins.push(thread::spawn(move || {
            let mut ok = 0_usize;
            let mut rejected = 0_usize;
            // Two threads share each stripe so every pointer is freed twice.
            for addr in addrs.iter().skip(t / 2).step_by(threads.div_ceil(2)) {
                let ptr = NonNull::new(*addr as *mut u8);
                match heap.lock().free(ptr, SITE) {
                    Ok(()) => ok += 1,
                    Err(MemError::CorruptionDetected {
                        region: CorruptRegion::Unregistered,
                        ..
                    }) => rejected += 1,
                    Err(other) => panic!("unexpected error {other:?}"),
                }
            }
            (ok, rejected)
        }));
    }

    let (ok, rejected) = joins
        .into_iter()
        .map(|j| j.join().expect("thread"))
        .fold((0, 0), |(a, b), (x, y)| (a + x, b + y));

    let guard = heap.lock();
    assert_eq!(guard.live_blocks(), 0);
    assert!(guard.registry().is_consistent());
    assert_eq!(guard.stats().total_num_frees, blocks as u64);
    assert_eq!(sink.events("heap_corruption").len(), rejected);
    (ok, rejected)
}

#[test]
fn concurrent_double_free_detection_8t() {
    let blocks = 2_000;
    let (ok, rejected) = run_double_free_stress(blocks, 8);
    assert_eq!(ok, blocks);
    assert_eq!(rejected, blocks);

    let payload = json!({
        "blocks": blocks,
        "threads": 8,
        "freed": ok,
        "rejected": rejected,
    });
    println!("DOUBLE_FREE_REPORT {payload}");
}
