//! In-flight window: a bounded FIFO of delivered-but-unacknowledged items.
//!
//! The window is split into a [`WindowSender`] owned by the delivery path and a
//! [`WindowReceiver`] owned by the acknowledgement path. Room is reserved
//! before a message is handed to the client and given back only when the
//! popped [`InFlight`] entry is dropped, so the number of outstanding entries,
//! including the one the acknowledgement path is currently matching, never
//! exceeds the capacity.

use crate::session::{SessionError, SessionResult};
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

/// Create a window holding at most `capacity` outstanding entries
pub fn in_flight_window<T>(capacity: usize) -> SessionResult<(WindowSender<T>, WindowReceiver<T>)> {
    if capacity == 0 {
        return Err(SessionError::Configuration(
            "max in-flight must be at least 1".to_string(),
        ));
    }

    let permits = Arc::new(Semaphore::new(capacity));
    let (tx, rx) = mpsc::unbounded_channel();

    Ok((
        WindowSender {
            tx,
            permits: permits.clone(),
            capacity,
        },
        WindowReceiver {
            rx,
            permits,
            capacity,
        },
    ))
}

/// Delivery side of the window
pub struct WindowSender<T> {
    tx: mpsc::UnboundedSender<InFlight<T>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl<T> WindowSender<T> {
    /// Wait until the window has room for one more entry.
    ///
    /// Cancel safe: dropping the future gives nothing up.
    pub async fn reserve(&self) -> Slot<'_, T> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("window semaphore is never closed");
        Slot {
            tx: &self.tx,
            permit,
        }
    }

    /// Entries currently reserved or outstanding
    pub fn len(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room for exactly one entry, held between reserving and committing
pub struct Slot<'a, T> {
    tx: &'a mpsc::UnboundedSender<InFlight<T>>,
    permit: OwnedSemaphorePermit,
}

impl<T> Slot<'_, T> {
    /// Enqueue the entry. Returns false when the receiving side is gone.
    pub fn commit(self, item: T) -> bool {
        self.tx
            .send(InFlight {
                item,
                _permit: self.permit,
            })
            .is_ok()
    }
}

/// Acknowledgement side of the window
pub struct WindowReceiver<T> {
    rx: mpsc::UnboundedReceiver<InFlight<T>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl<T> WindowReceiver<T> {
    /// Take the oldest entry. Returns `None` once the sender is dropped and
    /// the window is drained.
    pub async fn pop(&mut self) -> Option<InFlight<T>> {
        self.rx.recv().await
    }

    /// Entries currently reserved or outstanding
    pub fn len(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An outstanding entry; its room in the window is released on drop
pub struct InFlight<T> {
    item: T,
    _permit: OwnedSemaphorePermit,
}

impl<T> Deref for InFlight<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}
