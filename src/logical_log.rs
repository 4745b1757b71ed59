use std::sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, AtomicU64, Ordering},
    Arc, Weak,
};

use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    common::SeekOrigin,
    container::{
        ContainerError, LogStream, RecordReadResult, MULTI_RECORD_READ_INTERFACE_VERSION,
    },
    lifecycle::{ActivityGuard, BeginClose, ServiceLifecycle},
    manager::LogManager,
    read_ahead::ReadAheadTask,
    read_stream::LogReadStream,
    record::{record_overhead, ReadBuffer, RecordError, WriteBuffer},
};

/// How many consecutive zero-byte record reads the read loop tolerates before giving
/// up.  The first can be a buffer that ends exactly at the cursor, the second a
/// transient truncation race in a shared log; a third means the container is wedged.
/// This is belt-and-braces: a correct container contract should not require it.
const ZERO_BYTES_READ_LIMIT: u32 = 3;

/// Interface version of this consumer.  Version 1 adds multi-record reads.
const USER_INTERFACE_VERSION: u16 = MULTI_RECORD_READ_INTERFACE_VERSION;

/// Error that occurred during calls to [`LogicalLog`].
#[derive(Debug, Snafu)]
pub enum LogicalLogError {
    /// The logical log has been closed or is closing; the operation was not started.
    #[snafu(display("logical log is closed"))]
    Closed,

    /// Cooperative cancellation was observed at a suspension point.
    #[snafu(display("operation was cancelled"))]
    Cancelled,

    /// A caller-supplied offset or count was out of range.
    #[snafu(display("parameter '{}' was invalid: {}", param, reason))]
    InvalidParameter { param: &'static str, reason: String },

    /// The physical log container failed the operation.
    #[snafu(display("container error: {}", source))]
    Container { source: ContainerError },

    /// A record failed validation during read; the read cursor was not advanced.
    #[snafu(display("record failed validation: {}", source))]
    Record { source: RecordError },

    /// The read loop made no progress after the bounded number of attempts.
    #[snafu(display("read made no progress after {} attempts", attempts))]
    DeviceError { attempts: u32 },

    /// The operation is not implemented for this container binding, by design.
    #[snafu(display("operation is not implemented"))]
    NotImplemented,
}

/// Why a logical log is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenReason {
    Create,
    Recover,
}

/// Recoverable stream state, shared across the write path, read paths, and accessors.
///
/// Kept as atomics so length/position queries never contend with the async write lock.
#[derive(Debug)]
struct LogState {
    next_write_position: AtomicI64,
    next_operation_number: AtomicI64,
    head_truncation_point: AtomicI64,
    max_block_size: AtomicU32,
    maximum_read_record_size: AtomicU32,
    interface_version: AtomicU16,
    log_size: AtomicU64,
    log_space_remaining: AtomicU64,
}

impl LogState {
    fn new() -> Self {
        Self {
            next_write_position: AtomicI64::new(0),
            next_operation_number: AtomicI64::new(1),
            head_truncation_point: AtomicI64::new(-1),
            max_block_size: AtomicU32::new(0),
            maximum_read_record_size: AtomicU32::new(0),
            interface_version: AtomicU16::new(USER_INTERFACE_VERSION),
            log_size: AtomicU64::new(0),
            log_space_remaining: AtomicU64::new(0),
        }
    }

    fn next_write_position(&self) -> i64 {
        self.next_write_position.load(Ordering::Acquire)
    }

    fn advance_next_write_position(&self, amount: i64) {
        self.next_write_position.fetch_add(amount, Ordering::AcqRel);
    }

    fn set_next_write_position(&self, value: i64) {
        self.next_write_position.store(value, Ordering::Release);
    }

    fn next_operation_number(&self) -> i64 {
        self.next_operation_number.load(Ordering::Acquire)
    }

    fn increment_next_operation_number(&self) -> i64 {
        self.next_operation_number.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn set_next_operation_number(&self, value: i64) {
        self.next_operation_number.store(value, Ordering::Release);
    }

    fn head_truncation_point(&self) -> i64 {
        self.head_truncation_point.load(Ordering::Acquire)
    }

    fn set_head_truncation_point(&self, value: i64) {
        self.head_truncation_point.store(value, Ordering::Release);
    }

    fn max_block_size(&self) -> u32 {
        self.max_block_size.load(Ordering::Acquire)
    }

    fn maximum_read_record_size(&self) -> u32 {
        self.maximum_read_record_size.load(Ordering::Acquire)
    }

    fn interface_version(&self) -> u16 {
        self.interface_version.load(Ordering::Acquire)
    }

    fn set_size_and_space(&self, size: u64, space_remaining: u64) {
        self.log_size.store(size, Ordering::Release);
        self.log_space_remaining
            .store(space_remaining, Ordering::Release);
    }
}

/// Positioned read state: the cursor, the parsed record it sits in, and the speculative
/// next read.
#[derive(Debug, Default)]
pub(crate) struct ReadContext {
    pub read_location: i64,
    pub read_buffer: Option<ReadBuffer>,
    pub next_read_task: Option<Arc<ReadAheadTask>>,
}

enum FillOutcome {
    Filled,
    Retry,
}

/// One open logical stream multiplexed onto a physical log container.
///
/// Appends accumulate in a single framed write buffer; flush seals the buffer into one
/// record and hands it to the container.  Reads translate stream offsets to records,
/// with a one-record-ahead speculative read when the container supports multi-record
/// reads.  Head truncation is a lazy watermark; tail truncation writes a dedicated
/// empty barrier record.
pub struct LogicalLog {
    id: Uuid,
    owner_id: Uuid,
    owning_handle_id: i64,
    manager: Arc<LogManager>,
    stream: Arc<dyn LogStream>,
    block_metadata_size: u32,
    record_overhead: i64,
    state: LogState,
    write: tokio::sync::Mutex<Option<WriteBuffer>>,
    flush_in_progress: AtomicBool,
    read: tokio::sync::Mutex<ReadContext>,
    read_tasks: parking_lot::Mutex<Vec<Arc<ReadAheadTask>>>,
    streams: parking_lot::Mutex<Vec<Option<Weak<LogReadStream>>>>,
    lifecycle: Arc<ServiceLifecycle>,
}

impl LogicalLog {
    pub(crate) fn new(
        manager: Arc<LogManager>,
        owner_id: Uuid,
        owning_handle_id: i64,
        id: Uuid,
        stream: Arc<dyn LogStream>,
    ) -> Arc<Self> {
        let block_metadata_size = stream.reserved_metadata_size();
        Arc::new(Self {
            id,
            owner_id,
            owning_handle_id,
            manager,
            stream,
            block_metadata_size,
            record_overhead: record_overhead(block_metadata_size),
            state: LogState::new(),
            write: tokio::sync::Mutex::new(None),
            flush_in_progress: AtomicBool::new(false),
            read: tokio::sync::Mutex::new(ReadContext::default()),
            read_tasks: parking_lot::Mutex::new(Vec::new()),
            streams: parking_lot::Mutex::new(Vec::new()),
            lifecycle: ServiceLifecycle::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub fn owning_handle_id(&self) -> i64 {
        self.owning_handle_id
    }

    /// Readable byte count: `(next_write_position - head_truncation_point) - 1`.
    pub fn length(&self) -> i64 {
        (self.state.next_write_position() - self.state.head_truncation_point()) - 1
    }

    pub fn write_position(&self) -> i64 {
        self.state.next_write_position()
    }

    pub fn head_truncation_position(&self) -> i64 {
        self.state.head_truncation_point()
    }

    /// Largest user payload a single sealed record can carry.
    pub fn maximum_block_size(&self) -> i64 {
        self.state.max_block_size() as i64 - self.record_overhead
    }

    pub fn metadata_block_header_size(&self) -> u32 {
        self.block_metadata_size
    }

    /// Container-reported size of this stream, cached from the last physical write.
    pub fn size(&self) -> u64 {
        self.state.log_size.load(Ordering::Acquire)
    }

    /// Container-reported space remaining, cached from the last physical write.
    pub fn space_remaining(&self) -> u64 {
        self.state.log_space_remaining.load(Ordering::Acquire)
    }

    /// Position of this log's own read cursor.
    pub async fn read_position(&self) -> i64 {
        self.read.lock().await.read_location
    }

    /// Whether the log is open and its underlying stream can service operations.
    pub fn is_functional(&self) -> bool {
        match self.lifecycle.try_acquire_activity() {
            Some(_activity) => self.stream.is_functional(),
            None => false,
        }
    }

    pub(crate) async fn open(
        &self,
        reason: OpenReason,
        _token: &CancellationToken,
    ) -> Result<(), LogicalLogError> {
        self.verify_build_match().await?;

        let recovery = self
            .stream
            .query_recovery_info()
            .await
            .context(ContainerSnafu)?;

        let read_info = match self.stream.query_read_info().await {
            Ok(info) => info.maximum_read_record_size,
            Err(e) => {
                // An older container may not support the read query; fall back to the
                // documented default.
                info!(log_id = %self.id, error = %e, "read info query unsupported, using default");
                crate::common::DEFAULT_MAXIMUM_READ_RECORD_SIZE
            }
        };
        self.state
            .maximum_read_record_size
            .store(read_info, Ordering::Release);
        self.state
            .max_block_size
            .store(recovery.maximum_block_size, Ordering::Release);

        match reason {
            OpenReason::Create => {
                self.state.set_next_operation_number(1);
                self.state.set_next_write_position(0);
                self.state.set_head_truncation_point(-1);
            }
            OpenReason::Recover => {
                let mut head_truncation_point = recovery.head_truncation_point;
                if recovery.highest_operation == 0 {
                    // A recovered empty log.
                    assert_eq!(recovery.tail_asn, 1);
                    head_truncation_point = -1;
                }
                self.state
                    .set_next_operation_number(recovery.highest_operation + 1);
                self.state.set_next_write_position(recovery.tail_asn - 1);
                self.state.set_head_truncation_point(head_truncation_point);
            }
        }

        *self.write.lock().await = Some(WriteBuffer::open_write(
            self.block_metadata_size,
            self.state.max_block_size(),
            self.state.next_write_position(),
            self.state.next_operation_number(),
            self.id,
        ));

        let space = self
            .stream
            .query_size_and_space()
            .await
            .context(ContainerSnafu)?;
        self.state.set_size_and_space(space.size, space.space_remaining);

        self.lifecycle.open();

        debug!(
            log_id = %self.id,
            ?reason,
            write_position = self.state.next_write_position(),
            next_operation = self.state.next_operation_number(),
            head_truncation_point = self.state.head_truncation_point(),
            "opened logical log"
        );

        Ok(())
    }

    async fn verify_build_match(&self) -> Result<(), LogicalLogError> {
        let build = self
            .stream
            .query_build_info()
            .await
            .context(ContainerSnafu)?;

        // Build numbers cannot be enforced: a signed driver is routinely older than
        // this consumer.  Only the interface version matters.
        let version = build.interface_version().min(USER_INTERFACE_VERSION);
        self.state.interface_version.store(version, Ordering::Release);

        info!(
            log_id = %self.id,
            user_version = USER_INTERFACE_VERSION,
            container_build = build.build_number & 0xffff,
            container_version = build.interface_version(),
            container_is_free_build = build.is_free_build,
            "negotiated container interface"
        );

        Ok(())
    }

    fn acquire_activity(&self) -> Result<ActivityGuard, LogicalLogError> {
        self.lifecycle.try_acquire_activity().ok_or(LogicalLogError::Closed)
    }

    /// Appends `data` to the stream, flushing as many full records as needed.
    pub async fn append(
        &self,
        data: &[u8],
        token: &CancellationToken,
    ) -> Result<(), LogicalLogError> {
        let _activity = self.acquire_activity()?;
        check_cancelled(token)?;

        let mut write = self.write.lock().await;
        let mut offset = 0usize;
        while offset < data.len() {
            let buffer = write.as_mut().ok_or(LogicalLogError::Closed)?;
            let done = buffer.put(&data[offset..]);
            offset += done;
            self.state.advance_next_write_position(done as i64);

            if offset < data.len() {
                // The buffer filled mid-append.  No barrier: the caller issues its own
                // flush when the logical record completes.
                self.flush_locked(&mut write, false, token).await?;
            }
        }

        Ok(())
    }

    /// Flushes buffered bytes as one record, without a barrier marker.
    pub async fn flush(&self, token: &CancellationToken) -> Result<(), LogicalLogError> {
        let _activity = self.acquire_activity()?;
        let mut write = self.write.lock().await;
        self.flush_locked(&mut write, false, token).await
    }

    /// Flushes buffered bytes as one barrier record, demarcating a logical flush
    /// boundary.
    pub async fn flush_with_marker(
        &self,
        token: &CancellationToken,
    ) -> Result<(), LogicalLogError> {
        let _activity = self.acquire_activity()?;
        let mut write = self.write.lock().await;
        self.flush_locked(&mut write, true, token).await
    }

    async fn flush_locked(
        &self,
        write: &mut Option<WriteBuffer>,
        is_barrier: bool,
        token: &CancellationToken,
    ) -> Result<(), LogicalLogError> {
        check_cancelled(token)?;

        // Single-writer gate.  The async write lock already serializes flushes; the
        // test-and-set additionally lets a caller racing an in-flight flush return
        // immediately, subsumed by that flush.
        if self
            .flush_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(log_id = %self.id, "flush ignored, another flush is in progress");
            return Ok(());
        }
        let _gate = FlushGate(&self.flush_in_progress);

        let buffer = write.as_ref().ok_or(LogicalLogError::Closed)?;
        let sealed = buffer.seal(self.state.head_truncation_point(), is_barrier);

        if sealed.data_size == 0 {
            // Nothing buffered; no physical write is issued.
            return Ok(());
        }

        let receipt = self
            .stream
            .write(
                sealed.asn,
                sealed.operation,
                sealed.metadata_size,
                sealed.metadata,
                sealed.extent,
                0,
            )
            .await
            .context(ContainerSnafu)?;

        self.state
            .set_size_and_space(receipt.size, receipt.space_remaining);

        // The operation number advances only after a successful write, so a failed
        // write consumes nothing and a retry reuses the same record identity.
        let next_operation = self.state.increment_next_operation_number();
        debug_assert_eq!(sealed.operation, next_operation - 1);

        // A write that lands over a cached range (possible after tail truncation)
        // must not be served from stale read-ahead buffers.
        for task in self.read_tasks.lock().iter() {
            task.handle_write_through(sealed.asn - 1, sealed.data_size);
        }

        trace!(
            log_id = %self.id,
            asn = sealed.asn,
            operation = sealed.operation,
            data_size = sealed.data_size,
            is_barrier,
            "flushed record"
        );

        *write = Some(WriteBuffer::open_write(
            self.block_metadata_size,
            self.state.max_block_size(),
            self.state.next_write_position(),
            next_operation,
            self.id,
        ));

        Ok(())
    }

    /// Truncates the head of the stream at `truncation_point`.
    ///
    /// Lazy: the watermark becomes durable when the next sealed record carries it.
    /// A second call at or below the current watermark is a no-op.
    pub async fn truncate_head(&self, truncation_point: i64) -> Result<(), LogicalLogError> {
        let _activity = self.acquire_activity()?;

        info!(
            log_id = %self.id,
            truncation_point,
            head_truncation_point = self.state.head_truncation_point(),
            write_position = self.state.next_write_position(),
            "truncate head"
        );

        assert!(truncation_point <= self.state.next_write_position());

        if self.state.head_truncation_point() < truncation_point {
            self.stream
                .truncate(truncation_point + 1, truncation_point + 1)
                .await
                .context(ContainerSnafu)?;
            self.state.set_head_truncation_point(truncation_point);
            self.invalidate_all_reads();
        }

        Ok(())
    }

    /// Discards the stream's suffix from `stream_offset` onward.
    ///
    /// Pending writes are flushed, a dedicated empty barrier record is written at the
    /// new tail, and the container's end of file is pulled back.  Every cached read
    /// buffer and in-flight read-ahead task is invalidated.
    pub async fn truncate_tail(
        &self,
        stream_offset: i64,
        token: &CancellationToken,
    ) -> Result<(), LogicalLogError> {
        let _activity = self.acquire_activity()?;

        info!(
            log_id = %self.id,
            stream_offset,
            head_truncation_point = self.state.head_truncation_point(),
            write_position = self.state.next_write_position(),
            "truncate tail"
        );

        if stream_offset >= self.state.next_write_position() || stream_offset < 0 {
            return Err(LogicalLogError::InvalidParameter {
                param: "stream_offset",
                reason: format!(
                    "{} is at or above the write position {}",
                    stream_offset,
                    self.state.next_write_position()
                ),
            });
        }
        if stream_offset <= self.state.head_truncation_point() {
            return Err(LogicalLogError::InvalidParameter {
                param: "stream_offset",
                reason: format!(
                    "{} is at or below the head truncation point {}",
                    stream_offset,
                    self.state.head_truncation_point()
                ),
            });
        }

        {
            let mut write = self.write.lock().await;
            self.flush_locked(&mut write, false, token).await?;

            // The new tail is recorded durably by an empty barrier record at the
            // truncation offset.
            let null_buffer = WriteBuffer::open_write(
                self.block_metadata_size,
                self.state.max_block_size(),
                stream_offset,
                self.state.next_operation_number(),
                self.id,
            );
            let sealed = null_buffer.seal(self.state.head_truncation_point(), true);

            self.stream
                .write(
                    sealed.asn,
                    sealed.operation,
                    sealed.metadata_size,
                    sealed.metadata,
                    sealed.extent,
                    0,
                )
                .await
                .context(ContainerSnafu)?;

            let next_operation = self.state.increment_next_operation_number();

            self.stream
                .set_end_of_file(stream_offset)
                .await
                .context(ContainerSnafu)?;
            let aligned = (stream_offset + crate::record::FIXED_METADATA_SIZE as i64 - 1)
                / crate::record::FIXED_METADATA_SIZE as i64
                * crate::record::FIXED_METADATA_SIZE as i64;
            self.stream
                .set_file_size(aligned)
                .await
                .context(ContainerSnafu)?;

            self.state.set_next_write_position(stream_offset);

            *write = Some(WriteBuffer::open_write(
                self.block_metadata_size,
                self.state.max_block_size(),
                stream_offset,
                next_operation,
                self.id,
            ));
        }

        // No read may return pre-truncation bytes from a cache after this point.
        self.read.lock().await.read_buffer = None;
        self.invalidate_all_reads();

        Ok(())
    }

    /// Reads up to `buf.len()` bytes at this log's own read cursor.
    ///
    /// `bytes_to_read` is the prefetch hint for multi-record read-ahead; zero forces
    /// single-record reads.
    pub async fn read(
        &self,
        buf: &mut [u8],
        bytes_to_read: u32,
        token: &CancellationToken,
    ) -> Result<usize, LogicalLogError> {
        let _activity = self.acquire_activity()?;
        let mut context = self.read.lock().await;
        self.internal_read(&mut context, buf, bytes_to_read, token)
            .await
    }

    /// Repositions this log's own read cursor.
    pub async fn seek_for_read(
        &self,
        offset: i64,
        origin: SeekOrigin,
    ) -> Result<i64, LogicalLogError> {
        let _activity = self.acquire_activity()?;
        let mut context = self.read.lock().await;
        let new_location = match origin {
            SeekOrigin::Begin => offset,
            SeekOrigin::End => self.state.next_write_position() + offset,
            SeekOrigin::Current => context.read_location + offset,
        };

        // Reposition within the cached record when possible, otherwise drop it.
        let repositioned = match context.read_buffer.as_mut() {
            Some(buffer) if buffer.contains(new_location) => {
                let buffer_offset = new_location - buffer.base_position();
                buffer.set_position(buffer_offset).context(RecordSnafu)?;
                true
            }
            _ => false,
        };
        if !repositioned {
            context.read_buffer = None;
        }

        context.read_location = new_location;
        Ok(new_location)
    }

    /// Creates a positioned read stream over this log.
    pub async fn create_read_stream(
        self: &Arc<Self>,
        sequential_access_read_size: i32,
    ) -> Result<Arc<LogReadStream>, LogicalLogError> {
        let _activity = self.acquire_activity()?;

        let mut streams = self.streams.lock();
        let index = streams.iter().position(Option::is_none);
        let stream = match index {
            Some(index) => {
                let stream = LogReadStream::new(
                    Arc::clone(self),
                    self.state.interface_version(),
                    sequential_access_read_size,
                    index,
                );
                streams[index] = Some(Arc::downgrade(&stream));
                stream
            }
            None => {
                let stream = LogReadStream::new(
                    Arc::clone(self),
                    self.state.interface_version(),
                    sequential_access_read_size,
                    streams.len(),
                );
                streams.push(Some(Arc::downgrade(&stream)));
                stream
            }
        };

        Ok(stream)
    }

    pub(crate) fn remove_read_stream(&self, index: usize) {
        let mut streams = self.streams.lock();
        assert!(streams[index].is_some());
        streams[index] = None;
    }

    /// Sets the prefetch size a read stream uses for sequential access.  Ignored when
    /// the container interface predates multi-record reads.
    pub fn set_sequential_access_read_size(
        &self,
        stream: &LogReadStream,
        sequential_access_read_size: i32,
    ) {
        stream.set_sequential_access_read_size(sequential_access_read_size);
    }

    /// Routes writes to the dedicated log only.
    pub async fn configure_writes_to_only_dedicated_log(
        &self,
        _token: &CancellationToken,
    ) -> Result<(), LogicalLogError> {
        let _activity = self.acquire_activity()?;
        self.stream
            .set_write_destination(crate::container::WriteDestination::DedicatedOnly)
            .await
            .context(ContainerSnafu)
    }

    /// Routes writes to both the shared and dedicated logs.
    pub async fn configure_writes_to_shared_and_dedicated_log(
        &self,
        _token: &CancellationToken,
    ) -> Result<(), LogicalLogError> {
        let _activity = self.acquire_activity()?;
        self.stream
            .set_write_destination(crate::container::WriteDestination::SharedAndDedicated)
            .await
            .context(ContainerSnafu)
    }

    /// Percentage of the container's capacity this stream is using.
    pub async fn query_log_usage(
        &self,
        _token: &CancellationToken,
    ) -> Result<u32, LogicalLogError> {
        let _activity = self.acquire_activity()?;
        let usage = self.stream.query_usage().await.context(ContainerSnafu)?;
        Ok(usage.percentage_used)
    }

    /// Not implemented for the in-process container binding, by design.
    pub async fn wait_capacity_notification(
        &self,
        _percent_of_space_used: u32,
        _token: &CancellationToken,
    ) -> Result<(), LogicalLogError> {
        Err(LogicalLogError::NotImplemented)
    }

    /// Not implemented for the in-process container binding, by design.
    pub async fn wait_buffer_full_notification(
        &self,
        _token: &CancellationToken,
    ) -> Result<(), LogicalLogError> {
        Err(LogicalLogError::NotImplemented)
    }

    /// Closes this logical log; the last close of a physical log's children closes the
    /// physical log itself.
    pub async fn close(&self, _token: &CancellationToken) -> Result<(), LogicalLogError> {
        match self.lifecycle.begin_close() {
            BeginClose::NotOpen => Ok(()),
            BeginClose::AlreadyRequested => {
                self.lifecycle.wait_closed().await;
                Ok(())
            }
            BeginClose::Run => self.close_task().await,
            BeginClose::Drain => {
                self.lifecycle.wait_drained().await;
                self.close_task().await
            }
        }
    }

    /// Fire-and-forget close.
    pub fn abort(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.close(&CancellationToken::new()).await {
                warn!(log_id = %this.id, error = %e, "close failed during abort");
            }
        });
    }

    async fn close_task(&self) -> Result<(), LogicalLogError> {
        // Drain in-flight read-ahead tasks; their results are discarded.
        loop {
            let task = self.read_tasks.lock().pop();
            let Some(task) = task else { break };
            if let Err(e) = task.results().await {
                if e.is_not_found() {
                    info!(
                        log_id = %self.id,
                        offset = task.offset(),
                        length = task.length(),
                        "background read failed during close (not found)"
                    );
                } else {
                    warn!(
                        log_id = %self.id,
                        offset = task.offset(),
                        length = task.length(),
                        error = %e,
                        "background read failed during close"
                    );
                }
            }
        }

        let result = self.manager.on_logical_log_close(self).await;
        if let Err(e) = &result {
            warn!(log_id = %self.id, error = %e, "parent close propagation failed");
        }

        self.lifecycle.finish_close();
        result.map_err(|source| LogicalLogError::Container { source })
    }

    /// Invalidates every read stream and in-flight read-ahead task.  Invalidated tasks
    /// complete asynchronously and their buffers are discarded on consumption.
    fn invalidate_all_reads(&self) {
        for task in self.read_tasks.lock().iter() {
            task.invalidate();
        }
        for slot in self.streams.lock().iter().flatten() {
            if let Some(stream) = slot.upgrade() {
                stream.invalidate_read_ahead();
            }
        }
    }

    fn start_background_read(&self, offset: i64, length: u32) -> Arc<ReadAheadTask> {
        let task = ReadAheadTask::start(Arc::clone(&self.stream), offset, length);
        self.read_tasks.lock().push(Arc::clone(&task));
        task
    }

    async fn consume_read_task(
        &self,
        task: &Arc<ReadAheadTask>,
    ) -> Result<RecordReadResult, ContainerError> {
        {
            let mut tasks = self.read_tasks.lock();
            if let Some(index) = tasks.iter().position(|t| Arc::ptr_eq(t, task)) {
                tasks.remove(index);
            }
        }
        task.results().await
    }

    pub(crate) async fn abandon_read_task(&self, task: Arc<ReadAheadTask>) {
        task.invalidate();
        if let Err(e) = self.consume_read_task(&task).await {
            // A speculative read is allowed to fail; the foreground read retries.
            info!(
                log_id = %self.id,
                offset = task.offset(),
                length = task.length(),
                error = %e,
                "abandoned background read failed"
            );
        }
    }

    /// The shared read loop: translates the cursor to records, serves bytes from the
    /// cached buffer, and keeps one speculative read in flight.
    ///
    /// Holds its own activity so a read issued through a stream keeps the log from
    /// completing its close mid-loop.
    pub(crate) async fn internal_read(
        &self,
        context: &mut ReadContext,
        buf: &mut [u8],
        bytes_to_read: u32,
        token: &CancellationToken,
    ) -> Result<usize, LogicalLogError> {
        let _activity = self.acquire_activity()?;
        check_cancelled(token)?;

        let head = self.state.head_truncation_point();
        let next_write = self.state.next_write_position();
        if context.read_location <= head || context.read_location >= next_write {
            // Reads in truncated or unwritten space are a legal zero-byte result.
            info!(
                log_id = %self.id,
                read_location = context.read_location,
                head_truncation_point = head,
                write_position = next_write,
                "read in nonexistent space"
            );
            return Ok(0);
        }

        let prefetch = bytes_to_read.min(self.state.maximum_read_record_size());
        let mut todo = ((next_write - context.read_location) as usize).min(buf.len());
        let mut total = 0usize;
        let mut zero_reads = 0u32;

        while todo > 0 {
            check_cancelled(token)?;

            if context.read_buffer.is_none() {
                match self.fill_read_buffer(context, prefetch, next_write).await? {
                    FillOutcome::Filled => {}
                    FillOutcome::Retry => continue,
                }
            }

            let buffer = context
                .read_buffer
                .as_mut()
                .expect("read buffer present after fill");
            let done = buffer.get(&mut buf[total..total + todo]);

            if done == 0 {
                zero_reads += 1;
                if zero_reads == ZERO_BYTES_READ_LIMIT {
                    info!(
                        log_id = %self.id,
                        read_location = context.read_location,
                        todo,
                        "read made no progress after repeated attempts"
                    );
                    return Err(LogicalLogError::DeviceError {
                        attempts: ZERO_BYTES_READ_LIMIT,
                    });
                }
            } else {
                zero_reads = 0;
            }

            todo -= done;
            total += done;
            context.read_location += done as i64;

            if todo > 0 {
                context.read_buffer = None;
            }
        }

        Ok(total)
    }

    /// Obtains and parses the record covering the cursor, via the pending read-ahead
    /// task when it applies, or a fresh read otherwise.
    async fn fill_read_buffer(
        &self,
        context: &mut ReadContext,
        prefetch: u32,
        next_write: i64,
    ) -> Result<FillOutcome, LogicalLogError> {
        let multi_record = self.state.interface_version() >= MULTI_RECORD_READ_INTERFACE_VERSION
            && prefetch > 0;

        let (result, is_next_read) = if multi_record {
            let mut pending = None;
            if let Some(next) = context.next_read_task.take() {
                if next.is_valid() && next.is_in_range(context.read_location) {
                    pending = Some(next);
                } else {
                    info!(
                        log_id = %self.id,
                        offset = next.offset(),
                        length = next.length(),
                        "abandoning read-ahead (invalidated or out of range)"
                    );
                    self.abandon_read_task(next).await;
                }
            }

            let (task, is_next_read) = match pending {
                Some(task) => (task, true),
                None => (
                    self.start_background_read(context.read_location, prefetch),
                    false,
                ),
            };

            match self.consume_read_task(&task).await {
                Ok(result) => (result, is_next_read),
                Err(e) if is_next_read => {
                    // A failed speculative read is retried as a foreground read.
                    info!(
                        log_id = %self.id,
                        offset = task.offset(),
                        length = task.length(),
                        error = %e,
                        "read-ahead failed, retrying in foreground"
                    );
                    return Ok(FillOutcome::Retry);
                }
                Err(e) => {
                    warn!(
                        log_id = %self.id,
                        read_location = context.read_location,
                        prefetch,
                        error = %e,
                        "multi-record read failed"
                    );
                    return Err(LogicalLogError::Container { source: e });
                }
            }
        } else {
            trace!(
                log_id = %self.id,
                read_location = context.read_location,
                "single-record read"
            );
            let result = self
                .stream
                .read_containing(context.read_location + 1)
                .await
                .context(ContainerSnafu)?;
            (result, false)
        };

        let buffer = match ReadBuffer::open_read(
            self.block_metadata_size,
            context.read_location,
            result.metadata,
            result.extent,
        ) {
            Ok(buffer) => buffer,
            Err(e) if is_next_read => {
                warn!(
                    log_id = %self.id,
                    read_location = context.read_location,
                    error = %e,
                    "read-ahead returned an unusable record, retrying"
                );
                return Ok(FillOutcome::Retry);
            }
            Err(e) => return Err(LogicalLogError::Record { source: e }),
        };

        // A read-ahead may come back shorter than requested; make sure it actually
        // contains the cursor before trusting it.
        if is_next_read && !buffer.contains(context.read_location) {
            warn!(
                log_id = %self.id,
                read_location = context.read_location,
                record_base = buffer.base_position(),
                record_size = buffer.data_size(),
                "read-ahead returned a short record, retrying"
            );
            return Ok(FillOutcome::Retry);
        }

        if multi_record {
            // Prime the read of the following record.
            let next_offset = buffer.base_position() + buffer.data_size();
            if next_offset < next_write {
                context.next_read_task = Some(self.start_background_read(next_offset, prefetch));
            }
        }

        context.read_buffer = Some(buffer);
        Ok(FillOutcome::Filled)
    }
}

impl std::fmt::Debug for LogicalLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalLog")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("write_position", &self.state.next_write_position())
            .field("head_truncation_point", &self.state.head_truncation_point())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

fn check_cancelled(token: &CancellationToken) -> Result<(), LogicalLogError> {
    if token.is_cancelled() {
        Err(LogicalLogError::Cancelled)
    } else {
        Ok(())
    }
}

struct FlushGate<'a>(&'a AtomicBool);

impl Drop for FlushGate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
