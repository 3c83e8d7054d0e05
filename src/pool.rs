//! Process-wide buffer pooling and memory accounting.
//!
//! The [`MemoryGovernor`] owns size-class pools of reusable byte buffers and
//! tracks every outstanding byte against an owner tag. Byte sources and
//! demuxers acquire their scratch space here so that one process-wide number
//! answers "how much is the pipeline holding right now".
//!
//! # Deadlock policy
//!
//! The governor's locks are fine-grained (one per pool, one for tag
//! accounting, one for the callback table) and **no user-visible callback
//! ever runs with any of them held**. Pressure callbacks are cloned out of
//! the table under the lock, the lock is released, and only then are they
//! invoked. A per-thread recursion guard makes a callback that allocates
//! (and would cross a threshold again) terminate instead of cascading.
//!
//! # Example
//!
//! ```rust
//! use phono::pool::MemoryGovernor;
//!
//! let governor = MemoryGovernor::global();
//! let buffer = governor.acquire(10_000, "example")?;
//! assert!(buffer.len() >= 10_000);
//! governor.release(buffer);
//! ```

use std::{
    cell::Cell,
    collections::HashMap,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Mutex, OnceLock,
    },
};

use crate::error::{Error, Result};

/// The pool size classes, smallest first.
pub const SIZE_CLASSES: [usize; 4] = [4 * 1024, 16 * 1024, 64 * 1024, 256 * 1024];

/// Maximum free buffers retained per pool before excess is dropped.
const MAX_FREE_PER_POOL: usize = 32;

/// Memory pressure level reported to callbacks.
///
/// Levels correspond to utilisation of the configured total limit:
/// 0 below 50%, 1 at 50%, 2 at 75%, 3 at 90%.
pub type PressureLevel = u8;

thread_local! {
    /// Set while this thread is inside a pressure callback dispatch.
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// A buffer on loan from the governor.
///
/// Dereferences to its byte slice. Returning it via
/// [`MemoryGovernor::release`] recycles it into the pool; dropping it
/// without release is also safe and is accounted identically.
pub struct PooledBuffer {
    data: Vec<u8>,
    /// Bytes charged against the owner (the class size, or the tight-fit
    /// length for over-class requests).
    charged: usize,
    tag: String,
    pooled: bool,
}

impl PooledBuffer {
    /// The owner tag this buffer is charged to.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        if !data.is_empty() {
            MemoryGovernor::global().recycle(data, self.charged, &self.tag, self.pooled);
        }
    }
}

/// Per-tag accounting entry.
#[derive(Clone, Debug, Default)]
pub struct TagStats {
    /// Bytes currently outstanding for this tag.
    pub current: usize,
    /// Highest outstanding byte count ever seen for this tag.
    pub peak: usize,
    /// Total successful acquisitions.
    pub acquires: u64,
    /// Total releases (explicit or by drop).
    pub releases: u64,
}

/// Point-in-time snapshot of governor state.
#[derive(Clone, Debug)]
pub struct GovernorStats {
    /// Bytes currently outstanding across all tags.
    pub current_bytes: usize,
    /// Highest outstanding byte count ever seen.
    pub peak_bytes: usize,
    /// Free (recycled, unclaimed) bytes held per size class.
    pub pool_free_bytes: Vec<(usize, usize)>,
    /// Accounting per owner tag.
    pub per_tag: HashMap<String, TagStats>,
}

/// Health report produced by [`MemoryGovernor::audit`].
///
/// Rust's ownership rules make a literal double release unrepresentable, so
/// the audit concentrates on leaks: tags with buffers still outstanding.
#[derive(Clone, Debug)]
pub struct AuditReport {
    /// Tags with outstanding buffers and their byte counts.
    pub outstanding: Vec<(String, usize)>,
    /// Total outstanding bytes.
    pub outstanding_bytes: usize,
    /// Free bytes parked in pools.
    pub pool_free_bytes: usize,
}

impl AuditReport {
    /// Whether nothing is leaked.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.outstanding.is_empty()
    }
}

/// Configured thresholds.
#[derive(Clone, Copy, Debug)]
struct Limits {
    total_max: usize,
    per_handler_max: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            total_max: 256 * 1024 * 1024,
            per_handler_max: 64 * 1024 * 1024,
        }
    }
}

type PressureCallback = std::sync::Arc<dyn Fn(PressureLevel) + Send + Sync>;

/// Process-wide buffer pool manager and memory accountant.
///
/// Obtain the singleton with [`MemoryGovernor::global`]. All methods take
/// `&self` and are safe to call from any thread, including from inside a
/// pressure callback.
pub struct MemoryGovernor {
    /// One free-list per size class, each behind its own lock.
    pools: [Mutex<Vec<Vec<u8>>>; 4],
    limits: Mutex<Limits>,
    current: AtomicUsize,
    peak: AtomicUsize,
    tags: Mutex<HashMap<String, TagStats>>,
    callbacks: Mutex<HashMap<u64, PressureCallback>>,
    next_callback_id: AtomicU64,
    last_level: AtomicU8,
}

static GOVERNOR: OnceLock<MemoryGovernor> = OnceLock::new();

impl MemoryGovernor {
    fn new() -> Self {
        Self {
            pools: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
            limits: Mutex::new(Limits::default()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            tags: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            next_callback_id: AtomicU64::new(1),
            last_level: AtomicU8::new(0),
        }
    }

    /// Returns the process-wide governor.
    #[must_use]
    pub fn global() -> &'static Self {
        GOVERNOR.get_or_init(Self::new)
    }

    /// Configures the total and per-tag byte limits.
    ///
    /// Takes effect for subsequent acquisitions; already-outstanding
    /// buffers are unaffected.
    pub fn set_limits(&self, total_max: usize, per_handler_max: usize) {
        if let Ok(mut limits) = self.limits.lock() {
            limits.total_max = total_max;
            limits.per_handler_max = per_handler_max;
        }
    }

    /// Acquires a buffer of at least `size` bytes charged to `owner_tag`.
    ///
    /// Sizes within the largest class are rounded up to a class and served
    /// from the matching pool; larger requests get a tight-fit allocation.
    /// Under pressure (above the 90% threshold) class requests also fall
    /// back to tight fit so the pool does not grow further.
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` when the acquisition would exceed the total
    /// or per-tag limit, after one attempt to shed free pool memory.
    pub fn acquire(&self, size: usize, owner_tag: &str) -> Result<PooledBuffer> {
        let limits = *self.limits.lock()?;
        let class = SIZE_CLASSES.iter().copied().find(|class| *class >= size);

        let level = self.level_for(self.current.load(Ordering::Acquire), limits.total_max);
        let tight_fit = class.is_none() || level >= 3;
        let charged = if tight_fit {
            size
        } else {
            class.unwrap_or(size)
        };

        if self
            .current
            .load(Ordering::Acquire)
            .saturating_add(charged)
            > limits.total_max
        {
            // Shed free pool memory once before giving up.
            self.optimise();
            if self
                .current
                .load(Ordering::Acquire)
                .saturating_add(charged)
                > limits.total_max
            {
                return Err(Error::out_of_memory(format!(
                    "allocation of {charged} bytes for {owner_tag} exceeds total limit"
                )));
            }
        }

        {
            let tags = self.tags.lock()?;
            let tag_current = tags.get(owner_tag).map_or(0, |stats| stats.current);
            if tag_current.saturating_add(charged) > limits.per_handler_max {
                return Err(Error::out_of_memory(format!(
                    "allocation of {charged} bytes exceeds per-handler limit for {owner_tag}"
                )));
            }
        }

        let data = if tight_fit {
            vec![0; size]
        } else {
            let index = SIZE_CLASSES
                .iter()
                .position(|candidate| Some(*candidate) == class)
                .unwrap_or(0);
            let recycled = self.pools[index].lock()?.pop();
            match recycled {
                Some(mut data) => {
                    data.resize(charged, 0);
                    data
                }
                None => vec![0; charged],
            }
        };

        let new_current = self.current.fetch_add(charged, Ordering::AcqRel) + charged;
        self.peak.fetch_max(new_current, Ordering::AcqRel);

        {
            let mut tags = self.tags.lock()?;
            let stats = tags.entry(owner_tag.to_string()).or_default();
            stats.current = stats.current.saturating_add(charged);
            stats.peak = stats.peak.max(stats.current);
            stats.acquires += 1;
        }

        self.check_pressure(new_current, limits.total_max);

        Ok(PooledBuffer {
            data,
            charged,
            tag: owner_tag.to_string(),
            pooled: !tight_fit,
        })
    }

    /// Returns a buffer to the governor.
    ///
    /// Equivalent to dropping it; provided so call sites can make the
    /// hand-back explicit.
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }

    /// Buffer hand-back path shared by `release` and `Drop`.
    fn recycle(&self, data: Vec<u8>, charged: usize, tag: &str, pooled: bool) {
        if pooled {
            let class = data.capacity();
            if let Some(index) = SIZE_CLASSES
                .iter()
                .position(|candidate| *candidate == class)
            {
                if let Ok(mut pool) = self.pools[index].lock() {
                    if pool.len() < MAX_FREE_PER_POOL {
                        pool.push(data);
                    }
                }
            }
        }

        self.current.fetch_sub(charged, Ordering::AcqRel);

        if let Ok(mut tags) = self.tags.lock() {
            if let Some(stats) = tags.get_mut(tag) {
                stats.current = stats.current.saturating_sub(charged);
                stats.releases += 1;
            }
        }
    }

    /// Registers a pressure callback and returns its id.
    ///
    /// The callback receives the pressure level (0..=3) whenever the
    /// governor crosses a threshold upward. It runs with no governor lock
    /// held and may call back into `acquire`/`release`/`stats` freely;
    /// nested threshold crossings within a callback do not re-dispatch.
    pub fn register_pressure_callback<F>(&self, callback: F) -> u64
    where
        F: Fn(PressureLevel) + Send + Sync + 'static,
    {
        let id = self.next_callback_id.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.insert(id, std::sync::Arc::new(callback));
        }
        id
    }

    /// Unregisters a pressure callback.
    ///
    /// Safe to call from within a callback: the current dispatch operates
    /// on a snapshot, so removal takes effect once it completes.
    pub fn unregister_pressure_callback(&self, id: u64) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.remove(&id);
        }
    }

    /// Releases all free pooled memory back to the allocator.
    pub fn optimise(&self) {
        for pool in &self.pools {
            if let Ok(mut pool) = pool.lock() {
                pool.clear();
                pool.shrink_to_fit();
            }
        }
    }

    /// Returns a point-in-time snapshot of counters and pools.
    ///
    /// Never blocks behind an in-flight acquisition on another pool.
    #[must_use]
    pub fn stats(&self) -> GovernorStats {
        let pool_free_bytes = SIZE_CLASSES
            .iter()
            .enumerate()
            .map(|(index, class)| {
                let free = self.pools[index].lock().map(|pool| pool.len()).unwrap_or(0);
                (*class, free * class)
            })
            .collect();

        GovernorStats {
            current_bytes: self.current.load(Ordering::Acquire),
            peak_bytes: self.peak.load(Ordering::Acquire),
            pool_free_bytes,
            per_tag: self.tags.lock().map(|tags| tags.clone()).unwrap_or_default(),
        }
    }

    /// Produces a health report of outstanding (potentially leaked) buffers.
    #[must_use]
    pub fn audit(&self) -> AuditReport {
        let stats = self.stats();
        let outstanding: Vec<(String, usize)> = stats
            .per_tag
            .iter()
            .filter(|(_, tag_stats)| tag_stats.current > 0)
            .map(|(tag, tag_stats)| (tag.clone(), tag_stats.current))
            .collect();

        AuditReport {
            outstanding,
            outstanding_bytes: stats.current_bytes,
            pool_free_bytes: stats.pool_free_bytes.iter().map(|(_, bytes)| bytes).sum(),
        }
    }

    /// Dispatches a pressure notification at the given level.
    ///
    /// Normally driven by threshold crossings inside `acquire`; exposed so
    /// embedders with external allocators can feed their own pressure
    /// signal through the same callback table.
    pub fn notify_pressure(&self, level: PressureLevel) {
        // A callback that allocates could cross a threshold again; cut the
        // cascade on this thread.
        if IN_CALLBACK.with(Cell::get) {
            return;
        }

        let snapshot: Vec<PressureCallback> = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.values().cloned().collect(),
            Err(_) => return,
        };
        // Lock released; now invoke.

        IN_CALLBACK.with(|guard| guard.set(true));
        for callback in snapshot {
            callback(level);
        }
        IN_CALLBACK.with(|guard| guard.set(false));
    }

    fn level_for(&self, current: usize, total_max: usize) -> PressureLevel {
        if total_max == 0 {
            return 3;
        }
        let percent = current.saturating_mul(100) / total_max;
        match percent {
            0..=49 => 0,
            50..=74 => 1,
            75..=89 => 2,
            _ => 3,
        }
    }

    fn check_pressure(&self, current: usize, total_max: usize) {
        let level = self.level_for(current, total_max);
        let previous = self.last_level.swap(level, Ordering::AcqRel);
        if level > previous {
            self.notify_pressure(level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn acquire_rounds_up_to_class() {
        let governor = MemoryGovernor::global();
        let buffer = governor.acquire(100, "test-class").expect("acquire");
        assert_eq!(buffer.len(), SIZE_CLASSES[0]);
        governor.release(buffer);
    }

    #[test]
    fn over_class_requests_are_tight_fit() {
        let governor = MemoryGovernor::global();
        let size = SIZE_CLASSES[3] + 1;
        let buffer = governor.acquire(size, "test-tight").expect("acquire");
        assert_eq!(buffer.len(), size);
        governor.release(buffer);
    }

    #[test]
    fn release_returns_bytes_to_tag() {
        let governor = MemoryGovernor::global();
        let buffer = governor.acquire(4096, "test-release").expect("acquire");
        governor.release(buffer);
        let stats = governor.stats();
        let tag = stats.per_tag.get("test-release").expect("tag present");
        assert_eq!(tag.current, 0);
        assert_eq!(tag.acquires, tag.releases);
    }

    #[test]
    fn callback_may_reenter_acquire() {
        let governor = MemoryGovernor::global();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_callback = Arc::clone(&hits);

        let id = governor.register_pressure_callback(move |_level| {
            hits_in_callback.fetch_add(1, Ordering::SeqCst);
            // Reentrant allocation must not deadlock.
            if let Ok(buffer) = MemoryGovernor::global().acquire(1024, "test-reenter") {
                MemoryGovernor::global().release(buffer);
            }
        });

        governor.notify_pressure(2);
        governor.unregister_pressure_callback(id);
        assert!(hits.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn unregister_from_within_callback() {
        let governor = MemoryGovernor::global();
        let slot = Arc::new(AtomicUsize::new(0));
        let slot_in_callback = Arc::clone(&slot);

        let id = Arc::new(AtomicUsize::new(0));
        let id_in_callback = Arc::clone(&id);
        let registered = governor.register_pressure_callback(move |_level| {
            slot_in_callback.fetch_add(1, Ordering::SeqCst);
            MemoryGovernor::global()
                .unregister_pressure_callback(id_in_callback.load(Ordering::SeqCst) as u64);
        });
        id.store(registered as usize, Ordering::SeqCst);

        governor.notify_pressure(1);
        governor.notify_pressure(1);
        assert_eq!(slot.load(Ordering::SeqCst), 1);
    }
}
