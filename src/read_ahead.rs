use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::container::{ContainerError, LogStream, RecordReadResult};

/// One speculative multi-record read against the physical stream.
///
/// The read is issued immediately on construction and its buffers are held behind a
/// one-shot completion until consumed or invalidated.  Invalidated tasks run to
/// completion asynchronously; their results are simply discarded by the consumer.
pub(crate) struct ReadAheadTask {
    offset: i64,
    length: u32,
    valid: AtomicBool,
    completion: Mutex<Option<oneshot::Receiver<Result<RecordReadResult, ContainerError>>>>,
}

impl ReadAheadTask {
    /// Issues one multi-record read covering `[offset, offset + length)`.
    pub fn start(stream: Arc<dyn LogStream>, offset: i64, length: u32) -> Arc<Self> {
        let (sender, receiver) = oneshot::channel();
        tokio::spawn(async move {
            let result = stream.multi_record_read(offset + 1, length).await;
            // The receiver may already have been dropped by close; nothing to do then.
            let _ = sender.send(result);
        });

        Arc::new(Self {
            offset,
            length,
            valid: AtomicBool::new(true),
            completion: Mutex::new(Some(receiver)),
        })
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// False once the task has been invalidated by a truncate or overlapping write.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Whether `offset` falls within the range this task was issued for.
    pub fn is_in_range(&self, offset: i64) -> bool {
        offset >= self.offset && offset <= self.offset + self.length as i64
    }

    /// Invalidates the task if the given write range intersects its read range.
    /// Returns whether the task is still valid afterwards.
    pub fn handle_write_through(&self, write_offset: i64, write_length: i64) -> bool {
        let write_end = write_offset + write_length;
        if self.is_valid() && (self.is_in_range(write_offset) || self.is_in_range(write_end)) {
            self.invalidate();
        }
        self.is_valid()
    }

    /// Awaits the read and returns its buffers.
    ///
    /// Each task's results may be consumed at most once; a second consumption is a
    /// caller bug and panics.
    pub async fn results(&self) -> Result<RecordReadResult, ContainerError> {
        let receiver = self
            .completion
            .lock()
            .take()
            .expect("read-ahead results consumed more than once");
        receiver.await.unwrap_or(Err(ContainerError::Closed))
    }
}

impl std::fmt::Debug for ReadAheadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadAheadTask")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("valid", &self.is_valid())
            .finish_non_exhaustive()
    }
}
