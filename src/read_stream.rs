use std::sync::{
    atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering},
    Arc,
};

use tokio_util::sync::CancellationToken;

use crate::{
    common::SeekOrigin,
    container::MULTI_RECORD_READ_INTERFACE_VERSION,
    logical_log::{LogicalLog, LogicalLogError, ReadContext},
};

const STATE_OPEN: u8 = 0;
const STATE_CLOSED: u8 = 1;

/// A positioned cursor view over a [`LogicalLog`].
///
/// Each stream owns its own read context, so concurrent streams over the same log do
/// not disturb each other's position or cached buffers.  With a sequential-access read
/// size set (and a container that supports multi-record reads), reads keep one
/// speculative record fetch in flight.
pub struct LogReadStream {
    parent: Arc<LogicalLog>,
    interface_version: u16,
    sequential_access_read_size: AtomicI32,
    context: tokio::sync::Mutex<ReadContext>,
    /// Set by the owner when a truncate or overlapping write lands; consumed at the
    /// next read or seek by dropping the cached buffer.
    invalidated: AtomicBool,
    index: usize,
    state: AtomicU8,
}

impl LogReadStream {
    pub(crate) fn new(
        parent: Arc<LogicalLog>,
        interface_version: u16,
        sequential_access_read_size: i32,
        index: usize,
    ) -> Arc<Self> {
        let sequential_access_read_size =
            if interface_version >= MULTI_RECORD_READ_INTERFACE_VERSION {
                sequential_access_read_size
            } else {
                0
            };
        Arc::new(Self {
            parent,
            interface_version,
            sequential_access_read_size: AtomicI32::new(sequential_access_read_size),
            context: tokio::sync::Mutex::new(ReadContext::default()),
            invalidated: AtomicBool::new(false),
            index,
            state: AtomicU8::new(STATE_OPEN),
        })
    }

    /// Total length view for cursor arithmetic: the owner's write position.
    pub fn length(&self) -> i64 {
        self.parent.write_position()
    }

    /// Current cursor position.
    pub async fn position(&self) -> i64 {
        self.context.lock().await.read_location
    }

    pub(crate) fn invalidate_read_ahead(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    /// Sets the prefetch size used for sequential reads.  Ignored when the container
    /// interface predates multi-record reads.
    pub fn set_sequential_access_read_size(&self, sequential_access_read_size: i32) {
        if self.interface_version >= MULTI_RECORD_READ_INTERFACE_VERSION {
            self.sequential_access_read_size
                .store(sequential_access_read_size, Ordering::Release);
        } else {
            warn!(
                interface_version = self.interface_version,
                "ignoring sequential access read size, interface predates multi-record reads"
            );
        }
    }

    fn check_open(&self) -> Result<(), LogicalLogError> {
        if self.state.load(Ordering::Acquire) == STATE_OPEN {
            Ok(())
        } else {
            Err(LogicalLogError::Closed)
        }
    }

    async fn consume_invalidation(&self, context: &mut ReadContext) {
        if self.invalidated.swap(false, Ordering::AcqRel) {
            context.read_buffer = None;
            if let Some(task) = context.next_read_task.take() {
                self.parent.abandon_read_task(task).await;
            }
        }
    }

    /// Reads up to `buf.len()` bytes at the cursor, advancing it.
    pub async fn read(
        &self,
        buf: &mut [u8],
        token: &CancellationToken,
    ) -> Result<usize, LogicalLogError> {
        self.check_open()?;

        let bytes_to_read = self.sequential_access_read_size.load(Ordering::Acquire);
        let mut context = self.context.lock().await;
        self.consume_invalidation(&mut context).await;
        self.parent
            .internal_read(&mut context, buf, bytes_to_read.max(0) as u32, token)
            .await
    }

    /// Repositions the cursor.  Drops the cached buffer and any pending next-read
    /// task; other streams on the same log are unaffected.
    pub async fn seek(&self, offset: i64, origin: SeekOrigin) -> Result<i64, LogicalLogError> {
        self.check_open()?;

        let mut context = self.context.lock().await;
        self.consume_invalidation(&mut context).await;

        let new_location = match origin {
            SeekOrigin::Begin => offset,
            SeekOrigin::End => self.parent.write_position() + offset,
            SeekOrigin::Current => context.read_location + offset,
        };

        context.read_buffer = None;
        if let Some(task) = context.next_read_task.take() {
            self.parent.abandon_read_task(task).await;
        }

        context.read_location = new_location;
        Ok(new_location)
    }

    /// Drops the cached buffer; the next read refetches from the container.
    pub async fn flush(&self) -> Result<(), LogicalLogError> {
        self.check_open()?;
        let mut context = self.context.lock().await;
        context.read_buffer = None;
        Ok(())
    }

    /// Closes the stream and removes it from the owner's stream table.
    pub async fn close(&self) -> Result<(), LogicalLogError> {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return Ok(());
        }

        let mut context = self.context.lock().await;
        context.read_buffer = None;
        if let Some(task) = context.next_read_task.take() {
            self.parent.abandon_read_task(task).await;
        }
        drop(context);

        self.parent.remove_read_stream(self.index);
        Ok(())
    }
}

impl std::fmt::Debug for LogReadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReadStream")
            .field("index", &self.index)
            .field(
                "sequential_access_read_size",
                &self.sequential_access_read_size.load(Ordering::Acquire),
            )
            .finish_non_exhaustive()
    }
}
