//! Unbuffered hand-off between one or more senders and a receiver.

use std::future::Future;
use tokio::sync::{mpsc, oneshot, Mutex};

struct Parcel<T> {
    value: T,
    taken: oneshot::Sender<()>,
}

/// A hand-off point where the sender waits until the receiver has the value.
///
/// Cancelling [`send`](Rendezvous::send) withdraws the offer: a receiver
/// that later pulls the parcel finds nobody waiting and skips it.
pub struct Rendezvous<T> {
    tx: mpsc::Sender<Parcel<T>>,
    rx: Mutex<mpsc::Receiver<Parcel<T>>>,
}

impl<T: Send> Rendezvous<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Offer `value` and wait until it is taken.
    ///
    /// Returns `false` if the value was discarded without being taken.
    pub async fn send(&self, value: T) -> bool {
        self.send_until(value, std::future::pending()).await
    }

    /// Offer `value` until it is taken or `cancel` completes.
    ///
    /// Returns `true` exactly when a receiver got the value, even if `cancel`
    /// completed at the same time.
    pub async fn send_until(&self, value: T, cancel: impl Future<Output = ()>) -> bool {
        let (taken, mut taken_rx) = oneshot::channel();
        tokio::pin!(cancel);

        tokio::select! {
            biased;
            _ = &mut cancel => return false,
            sent = self.tx.send(Parcel { value, taken }) => {
                if sent.is_err() {
                    return false;
                }
            }
        }

        tokio::select! {
            biased;
            taken = &mut taken_rx => taken.is_ok(),
            _ = &mut cancel => {
                // after close a receiver can no longer claim the parcel
                taken_rx.close();
                taken_rx.try_recv().is_ok()
            }
        }
    }

    /// Take the next value whose sender is still waiting.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;

        while let Some(parcel) = rx.recv().await {
            if parcel.taken.send(()).is_ok() {
                return Some(parcel.value);
            }
        }
        None
    }

    /// Remove every parked value without completing its hand-off. Their
    /// senders see `false`.
    pub async fn drain(&self) -> Vec<T> {
        let mut rx = self.rx.lock().await;
        let mut values = Vec::new();

        while let Ok(parcel) = rx.try_recv() {
            values.push(parcel.value);
        }
        values
    }
}

impl<T: Send> Default for Rendezvous<T> {
    fn default() -> Self {
        Self::new()
    }
}
