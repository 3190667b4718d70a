//! LightEpoch - epoch-based thread protection and deferred reclamation
//!
//! Threads reserve one slot each in a fixed entry table, publish the global
//! epoch they last observed while inside a protected region, and any thread
//! may advance the global epoch with an attached callback that fires once
//! every protected thread has moved past the pre-bump epoch.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread;

use parking_lot::Mutex;

use crate::config::{ConfigError, EpochConfig};
use crate::constants::{DEFAULT_TABLE_SIZE, DRAIN_LIST_SIZE, MAX_TABLE_SIZE, NUM_MARKERS};
use crate::status::Status;
use crate::utility::is_power_of_two;

use super::drain::DrainAction;
use super::table::{EntryTable, INVALID_INDEX, UNPROTECTED};

// ============ Thread ID Allocation ============

/// Global counter for allocating internal thread ids
///
/// Starts at 1: slot freeness in the entry table is detected by
/// `thread_id == 0`, so no live thread may ever carry id 0.
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

/// Recycled thread ids (returned when threads exit cleanly).
static FREE_THREAD_IDS: OnceLock<Mutex<Vec<u32>>> = OnceLock::new();

/// Global counter for epoch manager instance ids, used to key the
/// per-thread slot cache.
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

fn free_thread_ids() -> &'static Mutex<Vec<u32>> {
    FREE_THREAD_IDS.get_or_init(|| Mutex::new(Vec::new()))
}

#[derive(Debug)]
struct ThreadIdGuard {
    id: u32,
}

impl Drop for ThreadIdGuard {
    fn drop(&mut self) {
        // Recycle only when this thread holds no outstanding reservations:
        // a slot leaked by a thread that exited without `release()` keeps
        // its id, so occupied slots never share a thread id with a live
        // thread. TLS teardown order is unspecified, hence `try_with`.
        let no_outstanding = SLOTS
            .try_with(|slots| slots.borrow().is_empty())
            .unwrap_or(false);
        if no_outstanding {
            free_thread_ids().lock().push(self.id);
        }
    }
}

fn allocate_thread_id() -> ThreadIdGuard {
    if let Some(id) = free_thread_ids().lock().pop() {
        return ThreadIdGuard { id };
    }
    ThreadIdGuard {
        id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
    }
}

thread_local! {
    /// Internal id of the current thread, allocated on first use.
    static THREAD_ID: RefCell<Option<ThreadIdGuard>> = const { RefCell::new(None) };

    /// Per-thread handle: reserved entry index per epoch manager instance.
    /// Typically holds one pair, so the lookup is a short scan with no
    /// hashing on the hot path.
    static SLOTS: RefCell<Vec<(u64, usize)>> = const { RefCell::new(Vec::new()) };
}

/// Get the current thread's internal id, allocating one on first call.
fn current_thread_id() -> u32 {
    THREAD_ID.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(guard) = slot.as_ref() {
            return guard.id;
        }
        let guard = allocate_thread_id();
        let id = guard.id;
        *slot = Some(guard);
        id
    })
}

fn cached_slot(instance_id: u64) -> usize {
    SLOTS.with(|slots| {
        slots
            .borrow()
            .iter()
            .find(|(id, _)| *id == instance_id)
            .map(|&(_, index)| index)
            .unwrap_or(INVALID_INDEX)
    })
}

fn cache_slot(instance_id: u64, index: usize) {
    SLOTS.with(|slots| slots.borrow_mut().push((instance_id, index)));
}

fn evict_slot(instance_id: u64) -> usize {
    SLOTS.with(|slots| {
        let mut slots = slots.borrow_mut();
        match slots.iter().position(|(id, _)| *id == instance_id) {
            Some(pos) => slots.swap_remove(pos).1,
            None => INVALID_INDEX,
        }
    })
}

// ============ Epoch Manager ============

/// Lightweight epoch protection framework
///
/// Tracks which threads are inside protected regions and defers registered
/// actions until no thread can still observe the epoch they were registered
/// against. All operations are safe to call concurrently from any thread
/// that has [`acquire`](LightEpoch::acquire)d a slot.
pub struct LightEpoch {
    /// Per-thread protection records
    table: EntryTable,
    /// Deferred actions awaiting a safe epoch
    drain_list: Box<[DrainAction]>,
    /// Number of occupied drain slots
    drain_count: AtomicU32,
    /// Current global epoch
    current_epoch: AtomicI32,
    /// Cached safe-to-reclaim epoch
    safe_to_reclaim_epoch: AtomicI32,
    /// Key into the per-thread slot cache
    instance_id: u64,
    /// Set once by `dispose()`; later operations become benign no-ops
    disposed: AtomicBool,
}

impl LightEpoch {
    /// Create a new epoch manager with the default table size (128 slots)
    pub fn new() -> Self {
        Self::with_validated_size(DEFAULT_TABLE_SIZE)
    }

    /// Create a new epoch manager with `table_size` usable slots
    ///
    /// `table_size` bounds the number of threads that can hold slots at
    /// once. It must be a positive power of two, at most 32768.
    pub fn with_table_size(table_size: usize) -> Result<Self, Status> {
        if !is_power_of_two(table_size as u64) || table_size > MAX_TABLE_SIZE {
            return Err(Status::InvalidArgument);
        }
        Ok(Self::with_validated_size(table_size))
    }

    /// Create a new epoch manager from a loaded configuration
    pub fn from_config(config: &EpochConfig) -> Result<Self, ConfigError> {
        Ok(Self::with_validated_size(config.resolved_table_size()?))
    }

    fn with_validated_size(table_size: usize) -> Self {
        Self {
            table: EntryTable::new(table_size),
            drain_list: (0..DRAIN_LIST_SIZE)
                .map(|_| DrainAction::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            drain_count: AtomicU32::new(0),
            current_epoch: AtomicI32::new(1),
            safe_to_reclaim_epoch: AtomicI32::new(0),
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            disposed: AtomicBool::new(false),
        }
    }

    /// Current global epoch
    #[inline]
    pub fn current_epoch(&self) -> i32 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Cached safe-to-reclaim epoch
    ///
    /// Advisory: it is refreshed by whichever thread last drained, so a
    /// stale read delays reclamation but never endangers it.
    #[inline]
    pub fn safe_to_reclaim_epoch(&self) -> i32 {
        self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }

    /// Entry index reserved by the current thread, or the invalid sentinel
    #[inline]
    fn entry_index(&self) -> usize {
        cached_slot(self.instance_id)
    }

    /// Reserve an entry-table slot for the calling thread
    ///
    /// Idempotent: a second call by the same thread is a no-op. Returns
    /// [`Status::TableExhausted`] if the table has no room; that error is
    /// fatal and the table must be constructed larger.
    pub fn acquire(&self) -> Result<(), Status> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Status::AlreadyDisposed);
        }
        if self.entry_index() != INVALID_INDEX {
            return Ok(());
        }
        let thread_id = current_thread_id();
        let index = self.table.reserve(thread_id)?;
        cache_slot(self.instance_id, index);
        Ok(())
    }

    /// Give up the calling thread's slot
    ///
    /// Clears the whole record, so once every thread has released, the
    /// table is back in its initial all-zero state. The thread may acquire
    /// again later.
    pub fn release(&self) {
        let index = evict_slot(self.instance_id);
        if index == INVALID_INDEX {
            debug_assert!(false, "release by a thread that never acquired");
            return;
        }
        self.table.free(index);
    }

    /// Check if the calling thread is currently inside a protected region
    #[inline]
    pub fn is_protected(&self) -> bool {
        let index = self.entry_index();
        index != INVALID_INDEX && self.table.entry(index).is_protected()
    }

    /// Enter (or refresh) the protected region and service pending actions
    ///
    /// Publishes the current epoch into the calling thread's slot and, only
    /// if actions are pending, drains the ripe ones. This is the hot path:
    /// with nothing to drain it is wait-free and performs no allocation.
    /// Repeated calls simply overwrite the slot with the newest epoch.
    ///
    /// Returns the epoch just published, or [`UNPROTECTED`] after
    /// `dispose()`.
    #[inline]
    pub fn protect_and_drain(&self) -> i32 {
        if self.disposed.load(Ordering::Acquire) {
            return UNPROTECTED;
        }
        let index = self.entry_index();
        debug_assert!(
            index != INVALID_INDEX,
            "protect_and_drain by a thread that never acquired"
        );
        if index == INVALID_INDEX {
            return UNPROTECTED;
        }
        let epoch = self.current_epoch.load(Ordering::Acquire);
        self.table
            .entry(index)
            .local_epoch
            .store(epoch, Ordering::Release);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(epoch);
        }
        epoch
    }

    /// Leave the protected region without giving up the slot
    #[inline]
    pub fn unprotect(&self) {
        let index = self.entry_index();
        if index == INVALID_INDEX {
            debug_assert!(false, "unprotect by a thread that never acquired");
            return;
        }
        self.table
            .entry(index)
            .local_epoch
            .store(UNPROTECTED, Ordering::Release);
    }

    /// Protect for the duration of the returned guard
    pub fn guard(&self) -> EpochGuard<'_> {
        EpochGuard::new(self)
    }

    /// Increment the current epoch
    ///
    /// Returns the new epoch value; opportunistically drains.
    pub fn bump_current_epoch(&self) -> i32 {
        if self.disposed.load(Ordering::Acquire) {
            return self.current_epoch();
        }
        let next_epoch = self.current_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(next_epoch);
        }
        next_epoch
    }

    /// Increment the epoch and register a callback for when the pre-bump
    /// epoch becomes safe
    ///
    /// The callback fires exactly once, on whichever thread first observes
    /// that no slot still holds an epoch at or below the pre-bump value;
    /// that may be the calling thread itself. Returns the new epoch.
    ///
    /// A panic inside the callback propagates to the thread that fired it;
    /// the drain slot has already been released by then, so no state is
    /// corrupted.
    pub fn bump_current_epoch_with_action<F>(&self, callback: F) -> i32
    where
        F: FnOnce() + Send + 'static,
    {
        const MAX_FULL_WRAPS: usize = 500;

        if self.disposed.load(Ordering::Acquire) {
            return self.current_epoch();
        }

        let prior_epoch = self.bump_current_epoch() - 1;

        let mut callback = Some(callback);
        let mut i = 0;
        let mut full_wraps = 0usize;
        loop {
            let slot = &self.drain_list[i];
            let trigger_epoch = slot.trigger();

            if trigger_epoch == DrainAction::FREE {
                if let Some(cb) = callback.take() {
                    match slot.try_push(prior_epoch as i64, cb) {
                        Ok(()) => {
                            self.drain_count.fetch_add(1, Ordering::AcqRel);
                            break;
                        }
                        Err(returned_cb) => {
                            // CAS failed, restore the callback and try
                            // another slot
                            callback = Some(returned_cb);
                        }
                    }
                }
            } else if trigger_epoch != DrainAction::LOCKED
                && trigger_epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire) as i64
            {
                if let Some(cb) = callback.take() {
                    match slot.try_swap(trigger_epoch, prior_epoch as i64, cb) {
                        Ok(displaced) => {
                            // The ripe action this slot held fires here, in
                            // the enqueuing thread; occupancy is unchanged.
                            if let Some(ripe) = displaced {
                                ripe();
                            }
                            break;
                        }
                        Err(returned_cb) => {
                            callback = Some(returned_cb);
                        }
                    }
                }
            }

            i = (i + 1) % DRAIN_LIST_SIZE;
            if i == 0 {
                // Refresh our own pin and recompute safety before the next
                // wrap; otherwise an epoch this thread still holds could
                // keep every slot unripe forever.
                if self.entry_index() != INVALID_INDEX {
                    self.protect_and_drain();
                } else {
                    self.drain(self.current_epoch());
                }
                full_wraps += 1;
                if full_wraps == MAX_FULL_WRAPS {
                    tracing::warn!(
                        prior_epoch,
                        "drain list saturated; still scanning for a slot"
                    );
                }
                if full_wraps >= MAX_FULL_WRAPS {
                    thread::yield_now();
                }
            }
        }

        if self.entry_index() != INVALID_INDEX {
            self.protect_and_drain();
        }
        prior_epoch + 1
    }

    /// Fire every pending action whose trigger epoch has become safe
    fn drain(&self, reference_epoch: i32) {
        self.compute_safe_to_reclaim_epoch(reference_epoch);
        let safe_epoch = self.safe_to_reclaim_epoch.load(Ordering::Acquire) as i64;

        for slot in self.drain_list.iter() {
            let trigger_epoch = slot.trigger();
            if trigger_epoch == DrainAction::FREE
                || trigger_epoch == DrainAction::LOCKED
                || trigger_epoch > safe_epoch
            {
                continue;
            }
            if let Some(callback) = slot.try_pop(trigger_epoch) {
                let remaining = self.drain_count.fetch_sub(1, Ordering::AcqRel) - 1;
                callback();
                if remaining == 0 {
                    break;
                }
            }
        }
    }

    /// Recompute the safe-to-reclaim epoch by scanning all slots
    ///
    /// The new value is one less than the oldest epoch any protected
    /// thread still holds (or than `reference_epoch` if no thread is
    /// protected). Callers pass the current epoch, or the value a bump
    /// just returned.
    pub fn compute_safe_to_reclaim_epoch(&self, reference_epoch: i32) -> i32 {
        let mut oldest_ongoing = reference_epoch;
        for entry in self.table.slots() {
            let local = entry.local_epoch.load(Ordering::Acquire);
            if local != UNPROTECTED && local < oldest_ongoing {
                oldest_ongoing = local;
            }
        }
        let safe = oldest_ongoing - 1;
        self.safe_to_reclaim_epoch.store(safe, Ordering::Release);
        safe
    }

    /// Check if an epoch is safe to reclaim against the cached value
    #[inline]
    pub fn is_safe_to_reclaim(&self, epoch: i32) -> bool {
        epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }

    /// Recompute until the safe-to-reclaim epoch reaches `target_epoch`
    pub fn spin_wait_for_safe_to_reclaim(&self, reference_epoch: i32, target_epoch: i32) {
        loop {
            self.compute_safe_to_reclaim_epoch(reference_epoch);
            if self.safe_to_reclaim_epoch.load(Ordering::Acquire) >= target_epoch {
                break;
            }
            thread::yield_now();
        }
    }

    /// Stamp the calling thread's marker and check whether every protected
    /// thread has stamped the same version
    ///
    /// Callers iterate this across a multi-phase protocol, advancing
    /// `version` each phase; the scan itself is not a barrier for other
    /// threads. The calling thread must hold a slot.
    pub fn mark_and_check_is_complete(&self, marker_index: usize, version: i32) -> bool {
        if marker_index >= NUM_MARKERS {
            debug_assert!(false, "marker index out of range");
            return false;
        }
        let index = self.entry_index();
        if index == INVALID_INDEX {
            debug_assert!(false, "marker operation by a thread that never acquired");
            return false;
        }
        self.table.entry(index).markers[marker_index].store(version, Ordering::Release);

        for entry in self.table.slots() {
            if entry.is_protected()
                && entry.markers[marker_index].load(Ordering::Acquire) != version
            {
                return false;
            }
        }
        true
    }

    /// Zero one marker column across the whole table
    ///
    /// Used by phase drivers between protocols, so stale stamps from a
    /// finished protocol cannot satisfy the next one.
    pub fn reset_markers(&self, marker_index: usize) {
        if marker_index >= NUM_MARKERS {
            debug_assert!(false, "marker index out of range");
            return;
        }
        for entry in self.table.slots() {
            entry.markers[marker_index].store(0, Ordering::Release);
        }
    }

    /// Shut the manager down
    ///
    /// Pending actions are dropped without firing. Subsequent
    /// `protect_and_drain` calls become benign no-ops returning
    /// [`UNPROTECTED`]; `acquire` reports [`Status::AlreadyDisposed`].
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for slot in self.drain_list.iter() {
            loop {
                let trigger_epoch = slot.trigger();
                if trigger_epoch == DrainAction::FREE {
                    break;
                }
                if trigger_epoch == DrainAction::LOCKED {
                    // Another thread is mid-claim; wait for the slot to
                    // settle.
                    std::hint::spin_loop();
                    continue;
                }
                if slot.try_cancel(trigger_epoch) {
                    self.drain_count.fetch_sub(1, Ordering::AcqRel);
                    break;
                }
            }
        }
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LightEpoch {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// RAII guard for a protected region
///
/// Refreshes protection on construction and leaves the protected region on
/// drop; the slot itself stays reserved. The thread must have
/// [`acquire`](LightEpoch::acquire)d.
pub struct EpochGuard<'a> {
    epoch: &'a LightEpoch,
}

impl<'a> EpochGuard<'a> {
    /// Enter the protected region
    pub fn new(epoch: &'a LightEpoch) -> Self {
        epoch.protect_and_drain();
        Self { epoch }
    }

    /// Re-publish the newest epoch and service pending actions
    pub fn refresh(&self) -> i32 {
        self.epoch.protect_and_drain()
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.epoch.unprotect();
    }
}
