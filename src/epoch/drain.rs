//! Deferred-action slots for the drain list
//!
//! Each slot pairs a trigger epoch with a boxed callback. Slot ownership
//! moves through `EMPTY -> CLAIMING -> OCCUPIED -> CLAIMING -> EMPTY`, and
//! every transition is a CAS on the trigger word; the callback cell is only
//! touched by the thread that won the claim.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, Ordering};

/// Deferred callback type stored in a drain slot
pub(crate) type Callback = Box<dyn FnOnce() + Send>;

/// One slot of the drain list
pub(crate) struct DrainAction {
    /// Epoch after which the callback may fire; `FREE`/`LOCKED` are
    /// sentinels outside the legal epoch space
    trigger_epoch: AtomicI64,
    /// The deferred callback; `None` while the slot is free
    callback: UnsafeCell<Option<Callback>>,
}

impl DrainAction {
    /// Trigger value indicating this slot is empty
    pub(crate) const FREE: i64 = i64::MAX;
    /// Trigger value indicating this slot is being claimed
    pub(crate) const LOCKED: i64 = i64::MAX - 1;

    pub(crate) fn new() -> Self {
        Self {
            trigger_epoch: AtomicI64::new(Self::FREE),
            callback: UnsafeCell::new(None),
        }
    }

    /// Load the trigger word
    #[inline]
    pub(crate) fn trigger(&self) -> i64 {
        self.trigger_epoch.load(Ordering::Acquire)
    }

    /// Try to detach the callback of a ripe slot
    ///
    /// On success the slot has already been returned to `FREE` and the
    /// caller owns the callback; firing it after the slot is released means
    /// a panicking action cannot wedge the slot.
    pub(crate) fn try_pop(&self, expected_epoch: i64) -> Option<Callback> {
        match self.trigger_epoch.compare_exchange(
            expected_epoch,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // Safety: the CAS above made this thread the sole owner of
                // the callback cell until the trigger word is released.
                let callback = unsafe { (*self.callback.get()).take() };
                self.trigger_epoch.store(Self::FREE, Ordering::Release);
                callback
            }
            Err(_) => None,
        }
    }

    /// Try to lodge a callback in a free slot
    ///
    /// Returns `Err(callback)` if the claiming CAS failed, so the caller
    /// can retry with another slot.
    pub(crate) fn try_push<F>(&self, trigger_epoch: i64, callback: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.trigger_epoch.compare_exchange(
            Self::FREE,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // Safety: sole owner under the claim, as in `try_pop`.
                unsafe {
                    *self.callback.get() = Some(Box::new(callback));
                }
                self.trigger_epoch.store(trigger_epoch, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(callback),
        }
    }

    /// Try to replace a ripe slot's callback with a new one
    ///
    /// On success the caller receives the displaced callback and must fire
    /// it; the new callback is published at `trigger_epoch`. The occupancy
    /// count is unchanged by a swap.
    pub(crate) fn try_swap<F>(
        &self,
        expected_epoch: i64,
        trigger_epoch: i64,
        callback: F,
    ) -> Result<Option<Callback>, F>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.trigger_epoch.compare_exchange(
            expected_epoch,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // Safety: sole owner under the claim, as in `try_pop`.
                let displaced = unsafe { (*self.callback.get()).replace(Box::new(callback)) };
                self.trigger_epoch.store(trigger_epoch, Ordering::Release);
                Ok(displaced)
            }
            Err(_) => Err(callback),
        }
    }

    /// Try to discard an occupied slot's callback without firing it
    ///
    /// Used on disposal, where pending actions are dropped.
    pub(crate) fn try_cancel(&self, expected_epoch: i64) -> bool {
        match self.trigger_epoch.compare_exchange(
            expected_epoch,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // Safety: sole owner under the claim, as in `try_pop`.
                let callback = unsafe { (*self.callback.get()).take() };
                self.trigger_epoch.store(Self::FREE, Ordering::Release);
                drop(callback);
                true
            }
            Err(_) => false,
        }
    }
}

// Safety: the callback cell is only accessed by the thread that holds the
// claim on the trigger word, which is maintained with atomic CAS.
unsafe impl Send for DrainAction {}
unsafe impl Sync for DrainAction {}
