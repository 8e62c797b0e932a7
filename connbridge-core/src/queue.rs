//! Unbuffered handoff between hijacking producers and accepting consumers.
//!
//! A consumer announces itself by parking a one-shot slot in the waiter
//! list; a producer takes the next live slot and offers its item through it.
//! An item only changes hands when a consumer is actually waiting, so the
//! queue never holds items on its own.
//!
//! The offered item sits in a cell shared by both sides. The consumer claims
//! it and the producer reclaims it through the same lock, so exactly one of
//! them ends up with it. A producer reclaims on its deadline, on close, or
//! when the consumer drops the offer unclaimed; in the last case the item is
//! offered to the next waiter.

use crate::bridge::BridgeError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, oneshot, watch};

type Slot<T> = Arc<Mutex<Option<T>>>;
type Waiter<T> = oneshot::Sender<Offer<T>>;

struct Offer<T> {
    slot: Slot<T>,
    // Dropped together with the offer, which wakes the producer.
    _done: oneshot::Sender<()>,
}

impl<T> Offer<T> {
    fn new(item: T) -> (Self, Slot<T>, oneshot::Receiver<()>) {
        let slot = Arc::new(Mutex::new(Some(item)));
        let (done, done_rx) = oneshot::channel();
        let offer = Offer {
            slot: slot.clone(),
            _done: done,
        };
        (offer, slot, done_rx)
    }

    /// Takes the item, unless the producer already took it back.
    fn claim(self) -> Option<T> {
        take(&self.slot)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take<T>(slot: &Slot<T>) -> Option<T> {
    lock(slot).take()
}

pub struct HandoffQueue<T> {
    waiters: Mutex<VecDeque<Waiter<T>>>,
    registered: Notify,
    closed: watch::Sender<bool>,
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // The sender lives as long as the queue, so an error means it is gone.
    let _ = closed.wait_for(|c| *c).await;
}

impl<T: Send + 'static> HandoffQueue<T> {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            waiters: Mutex::new(VecDeque::new()),
            registered: Notify::new(),
            closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Marks the queue closed. Only the first call reports success.
    pub fn close(&self) -> Result<(), BridgeError> {
        let changed = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if changed {
            Ok(())
        } else {
            Err(BridgeError::Closed)
        }
    }

    /// Parks a consumer slot, dropping slots whose consumer already left.
    fn register(&self, waiter: Waiter<T>) {
        {
            let mut waiters = lock(&self.waiters);
            waiters.retain(|w| !w.is_closed());
            waiters.push_back(waiter);
        }
        self.registered.notify_one();
    }

    fn next_waiter(&self) -> Option<Waiter<T>> {
        let mut waiters = lock(&self.waiters);
        while let Some(waiter) = waiters.pop_front() {
            if !waiter.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        lock(&self.waiters).len()
    }

    /// Hands `item` to a waiting consumer.
    ///
    /// Waits at most `deadline` for a consumer to take the item, including
    /// the time an offer sits with a consumer that has not claimed it yet. On
    /// failure the item is returned to the caller together with the reason.
    pub async fn push(&self, item: T, deadline: Duration) -> Result<(), (BridgeError, T)> {
        let mut closed = self.closed.subscribe();
        let expired = tokio::time::sleep(deadline);
        tokio::pin!(expired);

        let mut item = item;
        loop {
            if self.is_closed() {
                return Err((BridgeError::Unavailable, item));
            }

            let waiter = loop {
                let registered = self.registered.notified();
                tokio::pin!(registered);
                registered.as_mut().enable();
                if let Some(waiter) = self.next_waiter() {
                    break waiter;
                }
                tokio::select! {
                    biased;
                    _ = wait_closed(&mut closed) => return Err((BridgeError::Unavailable, item)),
                    _ = &mut expired => return Err((BridgeError::Cancelled, item)),
                    _ = registered => {}
                }
            };

            let (offer, slot, mut done) = Offer::new(item);
            // A consumer that already left drops the offer at once.
            let _ = waiter.send(offer);
            let failure = tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => Some(BridgeError::Unavailable),
                _ = &mut expired => Some(BridgeError::Cancelled),
                _ = &mut done => None,
            };

            item = match (take(&slot), failure) {
                // Claimed.
                (None, _) => return Ok(()),
                (Some(item), Some(err)) => return Err((err, item)),
                (Some(item), None) => item,
            };
        }
    }

    /// Waits for the next item, or [`BridgeError::Closed`] once closed.
    pub async fn pop(&self) -> Result<T, BridgeError> {
        let mut closed = self.closed.subscribe();
        loop {
            if *closed.borrow_and_update() {
                return Err(BridgeError::Closed);
            }

            let (tx, rx) = oneshot::channel();
            self.register(tx);

            let offer = tokio::select! {
                biased;
                // Dropping `rx` hands any offer that raced in back to its producer.
                _ = wait_closed(&mut closed) => return Err(BridgeError::Closed),
                offer = rx => offer,
            };
            if self.is_closed() {
                return Err(BridgeError::Closed);
            }
            // An offer the producer already took back means waiting again.
            if let Some(item) = offer.ok().and_then(Offer::claim) {
                return Ok(item);
            }
        }
    }
}

impl<T: Send + 'static> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
