//! The single consumer of the capture queue.
//!
//! `LogWriter` owns the replay log for the lifetime of the proxy: it pops
//! entries with a bounded wait, appends each one as a binary frame right away
//! and flushes it, and stops once the proxy is draining and nothing is left
//! to write.
//!
//! A write failure ends the writer but not the queue: the receiver is handed
//! back in a [`WriterFailure`], so producers keep filling the queue and then
//! wait on it until whoever holds the failure drops it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use log::{debug, error, info, trace};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;

use crate::error_handling::types::CaptureError;

use super::queue::{CaptureReceiver, CompletionSignal, Pop};
use super::replay_log::ReplayLogCodec;
use super::types::CaptureEntry;

/// A writer that stopped on an error.
#[derive(Debug)]
pub struct WriterFailure {
    pub error: CaptureError,
    /// Nothing pops from it anymore. Dropping it makes every pending and
    /// later push fail with `CaptureError::QueueClosed`.
    pub queue: CaptureReceiver,
}

pub struct LogWriter<W> {
    frames: FramedWrite<W, ReplayLogCodec>,
    receiver: CaptureReceiver,
    completion: Arc<CompletionSignal>,
    pop_timeout: Duration,
}

impl LogWriter<File> {
    /// Opens (creating or truncating) the replay log at `path`.
    pub async fn create(
        path: &Path,
        receiver: CaptureReceiver,
        completion: Arc<CompletionSignal>,
        pop_timeout: Duration,
    ) -> Result<Self, CaptureError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| {
                error!("Failed to open replay log {}: {}", path.display(), e);
                CaptureError::LogOpen(e)
            })?;
        info!("Writing replay log to {}", path.display());
        Ok(Self::new(file, receiver, completion, pop_timeout))
    }
}

impl<W: AsyncWrite + Unpin> LogWriter<W> {
    pub fn new(
        output: W,
        receiver: CaptureReceiver,
        completion: Arc<CompletionSignal>,
        pop_timeout: Duration,
    ) -> Self {
        Self {
            frames: FramedWrite::new(output, ReplayLogCodec),
            receiver,
            completion,
            pop_timeout,
        }
    }

    /// Drains the queue until the proxy is done; returns the number of
    /// entries written.
    pub async fn run(mut self) -> Result<u64, WriterFailure> {
        let mut written = 0u64;
        loop {
            match self.receiver.pop_timeout(self.pop_timeout).await {
                Pop::Entry(entry) => {
                    if let Err(e) = self.write_entry(entry).await {
                        return Err(self.fail(e));
                    }
                    written += 1;
                }
                Pop::TimedOut => {
                    if self.completion.is_set() && self.receiver.is_empty() {
                        debug!("Capture queue drained after completion");
                        break;
                    }
                }
                Pop::Closed => {
                    debug!("All capture producers are gone");
                    break;
                }
            }
        }

        if let Err(e) = SinkExt::<CaptureEntry>::close(&mut self.frames).await {
            return Err(self.fail(as_write_error(e)));
        }
        info!("Replay log closed after {} entries", written);
        Ok(written)
    }

    /// Encodes and flushes one frame.
    async fn write_entry(&mut self, entry: CaptureEntry) -> Result<(), CaptureError> {
        let connection = entry.connection();
        let len = entry.payload().len();
        self.frames.send(entry).await.map_err(as_write_error)?;
        trace!("wrote {} byte chunk for {}", len, connection);
        Ok(())
    }

    fn fail(self, error: CaptureError) -> WriterFailure {
        error!(
            "Failed to append to replay log, {} entries left queued: {}",
            self.receiver.len(),
            error
        );
        WriterFailure {
            error,
            queue: self.receiver,
        }
    }
}

fn as_write_error(error: CaptureError) -> CaptureError {
    match error {
        CaptureError::IoError(e) => CaptureError::LogWrite(e),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_capture::queue::capture_queue;
    use crate::data_capture::replay_log::ReplayLogReader;
    use crate::data_capture::types::ConnectionId;
    use tempfile::TempDir;
    use tokio_test::{assert_pending, assert_ready_err, task};

    const POP: Duration = Duration::from_millis(50);

    fn entry(payload: &[u8]) -> CaptureEntry {
        CaptureEntry::new(
            ConnectionId::new(
                "127.0.0.1:1000".parse().unwrap(),
                "127.0.0.1:2000".parse().unwrap(),
            ),
            payload.to_vec(),
        )
    }

    async fn read_log(path: &Path) -> Vec<CaptureEntry> {
        let file = File::open(path).await.unwrap();
        ReplayLogReader::new(file).read_all().await.unwrap()
    }

    #[tokio::test]
    async fn writes_every_queued_entry_before_stopping() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay.bin");
        let (tx, rx) = capture_queue(16);
        let completion = Arc::new(CompletionSignal::new());

        let mut expected = Vec::new();
        for i in 0..10 {
            let e = entry(format!("chunk-{}", i).as_bytes());
            expected.push(e.clone());
            tx.push(e).await.unwrap();
        }
        // Draining already started: the writer still owes all ten entries.
        completion.set();

        let writer = LogWriter::create(&path, rx, Arc::clone(&completion), POP)
            .await
            .unwrap();
        let written = tokio::time::timeout(Duration::from_secs(5), writer.run())
            .await
            .expect("writer did not stop")
            .unwrap();

        assert_eq!(written, 10);
        assert_eq!(read_log(&path).await, expected);
        drop(tx);
    }

    #[tokio::test]
    async fn keeps_waiting_until_completion_is_set() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay.bin");
        let (tx, rx) = capture_queue(16);
        let completion = Arc::new(CompletionSignal::new());

        let writer = LogWriter::create(&path, rx, Arc::clone(&completion), POP)
            .await
            .unwrap();
        let handle = tokio::spawn(writer.run());

        tokio::time::sleep(POP * 4).await;
        assert!(!handle.is_finished());

        tx.push(entry(b"late")).await.unwrap();
        completion.set();

        let written = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("writer did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(read_log(&path).await[0].payload(), b"late");
    }

    #[tokio::test]
    async fn truncates_existing_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay.bin");
        std::fs::write(&path, b"stale bytes").unwrap();

        let (tx, rx) = capture_queue(4);
        drop(tx);
        let writer = LogWriter::create(&path, rx, Arc::new(CompletionSignal::new()), POP)
            .await
            .unwrap();
        assert_eq!(writer.run().await.unwrap(), 0);
        assert!(read_log(&path).await.is_empty());
    }

    #[tokio::test]
    async fn write_failure_stalls_producers_until_queue_is_dropped() {
        let output = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
            .build();
        let (tx, rx) = capture_queue(2);
        let writer = LogWriter::new(output, rx, Arc::new(CompletionSignal::new()), POP);

        tx.push(entry(b"doomed")).await.unwrap();
        let failure = writer.run().await.unwrap_err();
        assert!(matches!(failure.error, CaptureError::LogWrite(_)));

        // Producers keep going until the queue is full, then wait.
        tx.push(entry(b"first")).await.unwrap();
        tx.push(entry(b"second")).await.unwrap();
        let mut blocked = task::spawn(tx.push(entry(b"third")));
        assert_pending!(blocked.poll());

        drop(failure.queue);
        assert!(blocked.is_woken());
        assert!(matches!(
            assert_ready_err!(blocked.poll()),
            CaptureError::QueueClosed
        ));
    }
}
