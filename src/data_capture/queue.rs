//! Bounded capture queue shared by every capturing direction and the log writer.
//!
//! The queue is a bounded `mpsc` channel: insertion order is commit order, and
//! a producer pushing into a full queue waits for the writer to make room.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;

use crate::error_handling::types::CaptureError;

use super::types::CaptureEntry;

/// Creates a queue holding at most `capacity` entries.
pub fn capture_queue(capacity: usize) -> (CaptureSender, CaptureReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    debug!("Capture queue created (capacity {})", capacity);
    (CaptureSender { tx }, CaptureReceiver { rx })
}

/// Producer handle, cloned into every capturing direction.
#[derive(Debug, Clone)]
pub struct CaptureSender {
    tx: mpsc::Sender<CaptureEntry>,
}

impl CaptureSender {
    /// Appends an entry, waiting while the queue is full.
    ///
    /// Fails only once the consumer is gone.
    pub async fn push(&self, entry: CaptureEntry) -> Result<(), CaptureError> {
        self.tx
            .send(entry)
            .await
            .map_err(|_| CaptureError::QueueClosed)
    }
}

/// Result of a bounded wait on the queue.
#[derive(Debug)]
pub enum Pop {
    Entry(CaptureEntry),
    /// Nothing arrived within the wait.
    TimedOut,
    /// Every producer handle is gone and the queue is drained.
    Closed,
}

/// Consumer end, owned by the log writer.
#[derive(Debug)]
pub struct CaptureReceiver {
    rx: mpsc::Receiver<CaptureEntry>,
}

impl CaptureReceiver {
    pub async fn pop_timeout(&mut self, wait: Duration) -> Pop {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(entry)) => Pop::Entry(entry),
            Ok(None) => Pop::Closed,
            Err(_) => Pop::TimedOut,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

/// Process-wide "no new connections will produce entries" flag.
///
/// Set once when the proxy starts draining, read by the log writer each time
/// a pop times out.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    done: AtomicBool,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag; returns `false` if it was already set.
    pub fn set(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_capture::types::ConnectionId;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    fn entry(payload: &[u8]) -> CaptureEntry {
        CaptureEntry::new(
            ConnectionId::new(
                "127.0.0.1:1000".parse().unwrap(),
                "127.0.0.1:2000".parse().unwrap(),
            ),
            payload.to_vec(),
        )
    }

    async fn pop_payload(rx: &mut CaptureReceiver) -> Vec<u8> {
        match rx.pop_timeout(Duration::from_secs(1)).await {
            Pop::Entry(e) => e.payload().to_vec(),
            other => panic!("expected an entry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn entries_come_out_in_push_order() {
        let (tx, mut rx) = capture_queue(8);
        for p in [&b"one"[..], b"two", b"three"] {
            tx.push(entry(p)).await.unwrap();
        }
        assert_eq!(rx.len(), 3);

        assert_eq!(pop_payload(&mut rx).await, b"one");
        assert_eq!(pop_payload(&mut rx).await, b"two");
        assert_eq!(pop_payload(&mut rx).await, b"three");
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn full_queue_blocks_producer_until_one_pop() {
        let (tx, mut rx) = capture_queue(1);
        tx.push(entry(b"first")).await.unwrap();

        let mut blocked = task::spawn(tx.push(entry(b"second")));
        assert_pending!(blocked.poll());
        assert_pending!(blocked.poll());

        assert_eq!(pop_payload(&mut rx).await, b"first");

        assert!(blocked.is_woken());
        assert_ready_ok!(blocked.poll());
        assert_eq!(pop_payload(&mut rx).await, b"second");
    }

    #[tokio::test(start_paused = true)]
    async fn pop_times_out_on_empty_queue() {
        let (_tx, mut rx) = capture_queue(4);
        assert!(matches!(
            rx.pop_timeout(Duration::from_secs(2)).await,
            Pop::TimedOut
        ));
    }

    #[tokio::test]
    async fn pop_reports_closed_once_producers_are_gone() {
        let (tx, mut rx) = capture_queue(4);
        tx.push(entry(b"last")).await.unwrap();
        drop(tx);

        assert_eq!(pop_payload(&mut rx).await, b"last");
        assert!(matches!(
            rx.pop_timeout(Duration::from_secs(1)).await,
            Pop::Closed
        ));
    }

    #[tokio::test]
    async fn push_fails_without_consumer() {
        let (tx, rx) = capture_queue(4);
        drop(rx);
        assert!(matches!(
            tx.push(entry(b"lost")).await,
            Err(CaptureError::QueueClosed)
        ));
    }

    #[test]
    fn completion_signal_is_set_once() {
        let signal = CompletionSignal::new();
        assert!(!signal.is_set());
        assert!(signal.set());
        assert!(!signal.set());
        assert!(signal.is_set());
    }
}
