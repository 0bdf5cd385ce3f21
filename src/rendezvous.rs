//! Single-slot rendezvous channels.
//!
//! The reader hands completed push frames to an external consumer through
//! a [`Rendezvous`]: `deliver` suspends the sender until a receiver takes
//! the value, so push dispatch stays FIFO relative to the byte stream and
//! a slow consumer backpressures the reader instead of growing a queue.
//!
//! The event channel reuses the same slot with [`Rendezvous::try_deliver`]:
//! an event is placed only when a receiver is already waiting and is
//! dropped otherwise.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{Error, Result};

struct Slot<T> {
    value: Option<T>,
    /// Receivers currently parked in `receive`.
    waiting_receivers: usize,
    /// Bumped by `cancel`; parked parties compare against their entry value.
    epoch: u64,
}

/// A single-slot, cancellable channel.
pub(crate) struct Rendezvous<T> {
    slot: Mutex<Slot<T>>,
    /// Wakes receivers: a value was placed or the channel was cancelled.
    on_value: Notify,
    /// Wakes senders: the value was taken or the channel was cancelled.
    on_taken: Notify,
}

impl<T> Rendezvous<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                waiting_receivers: 0,
                epoch: 0,
            }),
            on_value: Notify::new(),
            on_taken: Notify::new(),
        }
    }

    /// Place a value and suspend until a receiver takes it.
    ///
    /// Fails with [`Error::ChannelCancelled`] if `cancel` runs first; the
    /// value is dropped in that case.
    pub async fn deliver(&self, value: T) -> Result<()> {
        // Phase one: wait for a free slot. Only one sender exists per
        // channel in practice, but a sender dropped mid-delivery can
        // leave a value behind for the next receiver.
        let epoch = {
            let mut value = Some(value);
            loop {
                let notified = self.on_taken.notified();
                tokio::pin!(notified);
                {
                    let mut slot = self.slot.lock().unwrap();
                    if slot.value.is_none() {
                        slot.value = value.take();
                        self.on_value.notify_waiters();
                        break slot.epoch;
                    }
                }
                notified.await;
            }
        };

        // Phase two: wait until the value is taken.
        loop {
            let notified = self.on_taken.notified();
            tokio::pin!(notified);
            {
                let slot = self.slot.lock().unwrap();
                if slot.epoch != epoch {
                    return Err(Error::ChannelCancelled);
                }
                if slot.value.is_none() {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Place a value only when a receiver is already waiting.
    ///
    /// Never suspends; returns whether the value was placed. Used for
    /// events, which are drop-if-no-receiver.
    pub fn try_deliver(&self, value: T) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.waiting_receivers > 0 && slot.value.is_none() {
            slot.value = Some(value);
            self.on_value.notify_waiters();
            true
        } else {
            false
        }
    }

    /// Take the next value, suspending until one arrives.
    ///
    /// Fails with [`Error::ChannelCancelled`] when `cancel` runs while
    /// waiting.
    pub async fn receive(&self) -> Result<T> {
        let epoch = {
            let mut slot = self.slot.lock().unwrap();
            if let Some(v) = slot.value.take() {
                self.on_taken.notify_waiters();
                return Ok(v);
            }
            slot.waiting_receivers += 1;
            slot.epoch
        };
        let _guard = ReceiverGuard(self);

        loop {
            let notified = self.on_value.notified();
            tokio::pin!(notified);
            {
                let mut slot = self.slot.lock().unwrap();
                if slot.epoch != epoch {
                    return Err(Error::ChannelCancelled);
                }
                if let Some(v) = slot.value.take() {
                    self.on_taken.notify_waiters();
                    return Ok(v);
                }
            }
            notified.await;
        }
    }

    /// Wake every parked sender and receiver with `ChannelCancelled` and
    /// drop any undelivered value. The channel stays usable afterwards.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.epoch += 1;
        slot.value = None;
        self.on_value.notify_waiters();
        self.on_taken.notify_waiters();
    }
}

/// Keeps the waiting-receiver count accurate when a `receive` future is
/// dropped at an await point.
struct ReceiverGuard<'a, T>(&'a Rendezvous<T>);

impl<T> Drop for ReceiverGuard<'_, T> {
    fn drop(&mut self) {
        self.0.slot.lock().unwrap().waiting_receivers -= 1;
    }
}
