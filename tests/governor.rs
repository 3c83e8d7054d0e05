//! Memory governor behaviour under concurrency and pressure.
//!
//! The hard rule under test: no pressure callback ever runs with a
//! governor lock held, so workers hammering `acquire`/`release` while a
//! callback itself allocates must terminate within a bounded time.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

use phono::pool::MemoryGovernor;

const WORKERS: usize = 4;
const ITERATIONS: usize = 500;
const DEADLINE: Duration = Duration::from_secs(30);

#[test]
fn no_deadlock_under_pressure_with_allocating_callback() {
    let governor = MemoryGovernor::global();
    // Tight limits so the workers actually cross pressure thresholds.
    governor.set_limits(8 * 1024 * 1024, 4 * 1024 * 1024);

    let callback_hits = Arc::new(AtomicUsize::new(0));
    let hits_in_callback = Arc::clone(&callback_hits);
    let callback_id = governor.register_pressure_callback(move |_level| {
        hits_in_callback.fetch_add(1, Ordering::SeqCst);
        // Allocating from within the callback must not deadlock.
        if let Ok(buffer) = MemoryGovernor::global().acquire(1024, "governor-test-callback") {
            MemoryGovernor::global().release(buffer);
        }
    });

    let (done_tx, done_rx) = mpsc::channel();
    for worker in 0..WORKERS {
        let done = done_tx.clone();
        thread::spawn(move || {
            let tag = format!("governor-test-{worker}");
            let governor = MemoryGovernor::global();
            let mut held = Vec::new();
            for iteration in 0..ITERATIONS {
                let size = 4 * 1024 << (iteration % 4);
                if let Ok(buffer) = governor.acquire(size, &tag) {
                    held.push(buffer);
                }
                if held.len() > 8 || iteration % 7 == 0 {
                    for buffer in held.drain(..) {
                        governor.release(buffer);
                    }
                }
                if iteration % 50 == 0 {
                    // Stats queries interleaved with allocation.
                    let _ = governor.stats();
                }
            }
            for buffer in held.drain(..) {
                governor.release(buffer);
            }
            done.send(worker).expect("report completion");
        });
    }
    drop(done_tx);

    for _ in 0..WORKERS {
        done_rx
            .recv_timeout(DEADLINE)
            .expect("worker finished in time (deadlock?)");
    }

    governor.unregister_pressure_callback(callback_id);

    // Every worker's buffers were returned.
    let stats = governor.stats();
    for worker in 0..WORKERS {
        let tag = format!("governor-test-{worker}");
        if let Some(tag_stats) = stats.per_tag.get(&tag) {
            assert_eq!(tag_stats.current, 0, "{tag} leaked buffers");
            assert_eq!(tag_stats.acquires, tag_stats.releases);
        }
    }
}

#[test]
fn audit_reports_outstanding_then_clean() {
    let governor = MemoryGovernor::global();

    let buffer = governor.acquire(16 * 1024, "governor-audit-test").expect("acquire");
    let report = governor.audit();
    assert!(report
        .outstanding
        .iter()
        .any(|(tag, bytes)| tag == "governor-audit-test" && *bytes >= 16 * 1024));

    governor.release(buffer);
    let report = governor.audit();
    assert!(!report
        .outstanding
        .iter()
        .any(|(tag, _)| tag == "governor-audit-test"));
}

#[test]
fn optimise_shrinks_pooled_memory() {
    let governor = MemoryGovernor::global();
    let buffer = governor.acquire(64 * 1024, "governor-optimise-test").expect("acquire");
    governor.release(buffer);

    let before: usize = governor
        .stats()
        .pool_free_bytes
        .iter()
        .map(|(_, bytes)| bytes)
        .sum();
    governor.optimise();
    let after: usize = governor
        .stats()
        .pool_free_bytes
        .iter()
        .map(|(_, bytes)| bytes)
        .sum();
    // Other tests may be releasing concurrently; optimise must never grow
    // the free set it observed.
    assert!(after <= before.max(64 * 1024));
}
