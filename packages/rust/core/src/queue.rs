//! Bounded FIFO work queue with drop-guard acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};

use contentsift_shared::{Result, SiftError};

/// Result of one [`WorkQueue::pull`].
pub enum Pull<T> {
    Item(T, Ack),
    /// Nothing arrived within the timeout.
    Empty,
    /// Closed and fully drained.
    Closed,
}

/// Marks one queued item as finished when dropped.
///
/// Dropping covers every exit path of a worker: success, timeout,
/// cancellation and panic unwinding.
pub struct Ack {
    pending: Arc<watch::Sender<usize>>,
}

impl Drop for Ack {
    fn drop(&mut self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Multi-consumer queue shared by a worker pool.
pub struct WorkQueue<T> {
    sender: mpsc::Sender<T>,
    receiver: Mutex<mpsc::Receiver<T>>,
    pending: Arc<watch::Sender<usize>>,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (pending, _) = watch::channel(0);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            pending: Arc::new(pending),
        }
    }

    /// Enqueue `item`, waiting while the queue is full.
    pub async fn push(&self, item: T) -> Result<()> {
        self.pending.send_modify(|n| *n += 1);
        if self.sender.send(item).await.is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            return Err(SiftError::validation("work queue is closed"));
        }
        Ok(())
    }

    /// Stop accepting items. Already-queued items can still be pulled.
    pub async fn close(&self) {
        self.receiver.lock().await.close();
    }

    /// Take the next item, waiting at most `timeout`.
    pub async fn pull(&self, timeout: Duration) -> Pull<T> {
        let mut receiver = self.receiver.lock().await;
        match tokio::time::timeout(timeout, receiver.recv()).await {
            Ok(Some(item)) => Pull::Item(
                item,
                Ack {
                    pending: self.pending.clone(),
                },
            ),
            Ok(None) => Pull::Closed,
            Err(_) => Pull::Empty,
        }
    }

    /// Items pushed but not yet acknowledged.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Wait until every pushed item has been acknowledged.
    pub async fn join(&self) {
        let mut pending = self.pending.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = pending.wait_for(|n| *n == 0).await;
    }

    /// Pull and discard everything still queued. Returns how many were dropped.
    pub async fn drain(&self) -> usize {
        let mut receiver = self.receiver.lock().await;
        let mut dropped = 0;
        while let Ok(item) = receiver.try_recv() {
            drop(item);
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            dropped += 1;
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_with_acknowledgement() {
        let queue = WorkQueue::new(4);
        queue.push(1).await.unwrap();
        queue.push(2).await.unwrap();
        assert_eq!(queue.pending(), 2);

        let Pull::Item(first, ack) = queue.pull(Duration::from_millis(10)).await else {
            panic!("expected an item");
        };
        assert_eq!(first, 1);
        assert_eq!(queue.pending(), 2);
        drop(ack);
        assert_eq!(queue.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_then_closed() {
        let queue: WorkQueue<u8> = WorkQueue::new(1);
        assert!(matches!(queue.pull(Duration::from_secs(1)).await, Pull::Empty));
        queue.close().await;
        assert!(matches!(queue.pull(Duration::from_secs(1)).await, Pull::Closed));
        assert!(queue.push(1).await.is_err());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn join_waits_for_acks() {
        let queue = Arc::new(WorkQueue::new(8));
        for i in 0..3 {
            queue.push(i).await.unwrap();
        }
        queue.close().await;

        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                while let Pull::Item(_, _ack) = queue.pull(Duration::from_secs(1)).await {
                    tokio::task::yield_now().await;
                }
            })
        };
        queue.join().await;
        assert_eq!(queue.pending(), 0);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn ack_runs_on_panic() {
        let queue = Arc::new(WorkQueue::new(2));
        queue.push("boom").await.unwrap();

        let q = queue.clone();
        let handle = tokio::spawn(async move {
            if let Pull::Item(item, _ack) = q.pull(Duration::from_secs(1)).await {
                panic!("{item}");
            }
        });
        assert!(handle.await.is_err());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn drain_releases_pending() {
        let queue = WorkQueue::new(4);
        queue.push('a').await.unwrap();
        queue.push('b').await.unwrap();
        assert_eq!(queue.drain().await, 2);
        assert_eq!(queue.pending(), 0);
    }
}
