//! Single-slot, drop-oldest frame handoff between capture and encode.
//!
//! The capture callback publishes into one atomic slot and never waits;
//! a newer frame simply replaces an unconsumed older one. The encode
//! thread blocks in [`FrameExchange::take`] until a frame is present.
//!
//! Wakeups travel over a capacity-one token channel that is posted
//! after every swap, so a taker that observed an empty slot always
//! finds a token waiting for it.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::frame::RawFrame;

/// Overwrite-on-publish frame slot.
pub struct FrameExchange {
    slot: AtomicPtr<RawFrame>,
    closed: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl FrameExchange {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            slot: AtomicPtr::new(ptr::null_mut()),
            closed: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        }
    }

    /// Store `frame` as the newest frame, never blocking.
    ///
    /// Returns `true` if an unconsumed frame was overwritten. After
    /// [`close`](Self::close) the frame is discarded and `false` is returned.
    pub fn publish(&self, frame: RawFrame) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let new = Box::into_raw(Box::new(frame));
        let old = self.slot.swap(new, Ordering::AcqRel);
        self.wake();
        if old.is_null() {
            false
        } else {
            // SAFETY: every non-null pointer in the slot came from
            // `Box::into_raw` and the swap handed us sole ownership.
            drop(unsafe { Box::from_raw(old) });
            true
        }
    }

    /// Block until a frame is available and return the most recent one.
    ///
    /// Returns `None` once the exchange has been closed.
    pub fn take(&self) -> Option<RawFrame> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(frame) = self.try_take() {
                return Some(frame);
            }
            // We hold a sender ourselves, so this only returns on a token.
            if self.wake_rx.recv().is_err() {
                return None;
            }
        }
    }

    /// Take the pending frame without blocking.
    pub fn try_take(&self) -> Option<RawFrame> {
        let p = self.slot.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            None
        } else {
            // SAFETY: see `publish`.
            Some(*unsafe { Box::from_raw(p) })
        }
    }

    /// Whether a published frame is waiting to be taken.
    pub fn has_pending(&self) -> bool {
        !self.slot.load(Ordering::Acquire).is_null()
    }

    /// Close the exchange: wake a blocked taker and drop the pending frame.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake();
        drop(self.try_take());
    }

    fn wake(&self) {
        match self.wake_tx.try_send(()) {
            // A full channel already holds a pending wakeup.
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {}
        }
    }
}

impl Default for FrameExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrameExchange {
    fn drop(&mut self) {
        drop(self.try_take());
    }
}

// SAFETY: the slot only ever holds uniquely owned `Box<RawFrame>` values
// and `RawFrame` is `Send`; all access goes through atomic swaps.
unsafe impl Send for FrameExchange {}
unsafe impl Sync for FrameExchange {}

// ── Tests ────────────────────────────────────────────────────────
