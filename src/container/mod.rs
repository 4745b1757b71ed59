//! The physical log container contract.
//!
//! The logical log engine consumes a container through the narrow interfaces in this
//! module: a [`ContainerBinding`] creates/opens/deletes containers, a [`LogContainer`]
//! hosts streams and an alias table, and a [`LogStream`] carries the per-stream record
//! operations.  Metadata queries are typed methods returning typed records, not opaque
//! ioctl blobs.

use std::{io, path::Path, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use snafu::Snafu;
use uuid::Uuid;

use crate::common::LogCreationFlags;

mod inproc;

pub use inproc::InProcBinding;

/// Interface version at which multi-record reads became available.
pub(crate) const MULTI_RECORD_READ_INTERFACE_VERSION: u16 = 1;

/// Error surfaced by a container binding, container, or stream.
#[derive(Debug, Snafu)]
pub enum ContainerError {
    /// A general I/O error occurred against the container's backing storage.
    #[snafu(display("container I/O error: {}", source))]
    Io { source: io::Error },

    /// The named container, stream, or alias does not exist.
    #[snafu(display("{} was not found", what))]
    NotFound { what: String },

    /// Create was attempted for a container or stream that already exists.
    #[snafu(display("{} already exists", what))]
    AlreadyExists { what: String },

    /// The container or stream is transiently held by another owner.  Callers retry a
    /// bounded number of times.
    #[snafu(display("sharing violation on {}", what))]
    SharingViolation { what: String },

    /// The out-of-proc log driver is not loaded on this host.
    #[snafu(display("log driver is not loaded"))]
    DriverNotLoaded,

    /// On-disk state failed validation.
    #[snafu(display("container state corrupted: {}", reason))]
    Corrupted { reason: String },

    /// A caller-supplied argument was out of range.
    #[snafu(display("parameter '{}' was invalid: {}", param, reason))]
    InvalidArgument { param: &'static str, reason: String },

    /// The container or stream has been closed.
    #[snafu(display("container is closed"))]
    Closed,

    /// The operation is not supported by this binding, by design.
    #[snafu(display("operation is not implemented by this container binding"))]
    NotImplemented,
}

impl From<io::Error> for ContainerError {
    fn from(source: io::Error) -> Self {
        ContainerError::Io { source }
    }
}

impl ContainerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerError::NotFound { .. })
    }

    pub fn is_sharing_violation(&self) -> bool {
        matches!(self, ContainerError::SharingViolation { .. })
    }

    pub fn is_driver_not_loaded(&self) -> bool {
        matches!(self, ContainerError::DriverNotLoaded)
    }
}

/// Recovery state the container maintains for a stream, returned at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRecoveryInfo {
    /// 1-based ASN of the next byte to be written.
    pub tail_asn: i64,
    /// Operation number of the most recent record; zero for an empty stream.
    pub highest_operation: i64,
    /// Maximum sealed-record size the stream was created with.
    pub maximum_block_size: u32,
    /// Head-truncation watermark carried by the most recent record; -1 when none.
    pub head_truncation_point: i64,
}

/// Read sizing reported by the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReadInfo {
    pub maximum_read_record_size: u32,
}

/// Container build/interface identification.
///
/// The high 16 bits of `build_number` carry the interface version; version 1 adds
/// multi-record reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub build_number: u32,
    pub is_free_build: bool,
}

impl BuildInfo {
    pub fn interface_version(&self) -> u16 {
        (self.build_number >> 16) as u16
    }
}

/// Space usage reported by the container for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogUsageInfo {
    pub percentage_used: u32,
}

/// Size accounting returned by every write and by the size query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeAndSpaceRemaining {
    pub size: u64,
    pub space_remaining: u64,
}

/// Destination policy for writes on streams backed by a shared plus dedicated log pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDestination {
    DedicatedOnly,
    SharedAndDedicated,
}

/// Buffers returned by a single- or multi-record read.
#[derive(Debug, Clone)]
pub struct RecordReadResult {
    /// ASN of the first payload byte in the returned record.
    pub resulting_asn: i64,
    /// Operation number of the returned record.
    pub version: i64,
    /// Bytes of the metadata block in use.
    pub metadata_size: u32,
    /// The fixed-size metadata block.
    pub metadata: Bytes,
    /// The page-aligned data extent; empty for metadata-only records.
    pub extent: Bytes,
}

/// One open stream within a container.
#[async_trait]
pub trait LogStream: Send + Sync {
    fn id(&self) -> Uuid;

    /// Whether the stream can still service operations.
    fn is_functional(&self) -> bool;

    /// Bytes at the head of every metadata block reserved for the container's own
    /// framing; opaque to the record codec.
    fn reserved_metadata_size(&self) -> u32;

    /// Appends one sealed record and returns the stream's size accounting.
    ///
    /// A write at or below the current tail ASN logically truncates the stream to that
    /// point before the record is applied; this is how tail-truncation barrier records
    /// take effect.
    async fn write(
        &self,
        asn: i64,
        operation: i64,
        metadata_size: u32,
        metadata: Bytes,
        extent: Bytes,
        reservation: u64,
    ) -> Result<SizeAndSpaceRemaining, ContainerError>;

    /// Reads the smallest run of consecutive records covering `length` bytes starting
    /// at `starting_asn`, coalesced into a single synthesized record.
    async fn multi_record_read(
        &self,
        starting_asn: i64,
        length: u32,
    ) -> Result<RecordReadResult, ContainerError>;

    /// Reads the single record containing `asn`.
    async fn read_containing(&self, asn: i64) -> Result<RecordReadResult, ContainerError>;

    /// Discards records wholly below `asn`; `preferred_asn` is a hint the container may
    /// use to defer physical reclamation.
    async fn truncate(&self, asn: i64, preferred_asn: i64) -> Result<(), ContainerError>;

    /// Sets the stream's logical end of file to `asn`.
    async fn set_end_of_file(&self, asn: i64) -> Result<(), ContainerError>;

    /// Sets the stream's allocated size.
    async fn set_file_size(&self, size: i64) -> Result<(), ContainerError>;

    async fn query_recovery_info(&self) -> Result<StreamRecoveryInfo, ContainerError>;
    async fn query_read_info(&self) -> Result<StreamReadInfo, ContainerError>;
    async fn query_build_info(&self) -> Result<BuildInfo, ContainerError>;
    async fn query_usage(&self) -> Result<LogUsageInfo, ContainerError>;
    async fn query_size_and_space(&self) -> Result<SizeAndSpaceRemaining, ContainerError>;

    async fn set_write_destination(
        &self,
        destination: WriteDestination,
    ) -> Result<(), ContainerError>;

    async fn close(&self) -> Result<(), ContainerError>;
}

/// One open physical log container.
#[async_trait]
pub trait LogContainer: Send + Sync {
    fn id(&self) -> Uuid;

    fn is_functional(&self) -> bool;

    async fn create_stream(
        &self,
        id: Uuid,
        alias: Option<&str>,
        path: Option<&Path>,
        maximum_size: i64,
        maximum_block_size: u32,
        flags: LogCreationFlags,
    ) -> Result<Arc<dyn LogStream>, ContainerError>;

    async fn open_stream(&self, id: Uuid) -> Result<Arc<dyn LogStream>, ContainerError>;

    async fn delete_stream(&self, id: Uuid) -> Result<(), ContainerError>;

    /// Ids of every stream currently present in the container.
    async fn enumerate_streams(&self) -> Result<Vec<Uuid>, ContainerError>;

    async fn assign_alias(&self, alias: &str, id: Uuid) -> Result<(), ContainerError>;

    async fn resolve_alias(&self, alias: &str) -> Result<Uuid, ContainerError>;

    async fn remove_alias(&self, alias: &str) -> Result<(), ContainerError>;

    async fn close(&self) -> Result<(), ContainerError>;
}

/// Factory for containers: the in-process binding or the out-of-proc driver binding.
#[async_trait]
pub trait ContainerBinding: Send + Sync {
    /// Opens the binding itself; the driver binding reports `DriverNotLoaded` here when
    /// no driver is present, which the manager uses to downgrade to in-proc.
    async fn open(&self) -> Result<(), ContainerError>;

    async fn create_container(
        &self,
        path: &Path,
        id: Uuid,
        log_size: u64,
        maximum_number_streams: u32,
        maximum_record_size: u32,
        flags: LogCreationFlags,
    ) -> Result<Arc<dyn LogContainer>, ContainerError>;

    async fn open_container(
        &self,
        path: &Path,
        id: Uuid,
    ) -> Result<Arc<dyn LogContainer>, ContainerError>;

    async fn delete_container(&self, path: &Path, id: Uuid) -> Result<(), ContainerError>;

    async fn close(&self) -> Result<(), ContainerError>;
}

/// Binding for the out-of-proc log driver.
///
/// No platform this crate targets ships the driver, so `open` always reports
/// `DriverNotLoaded` and the manager falls back to the in-process binding.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverBinding;

#[async_trait]
impl ContainerBinding for DriverBinding {
    async fn open(&self) -> Result<(), ContainerError> {
        Err(ContainerError::DriverNotLoaded)
    }

    async fn create_container(
        &self,
        _path: &Path,
        _id: Uuid,
        _log_size: u64,
        _maximum_number_streams: u32,
        _maximum_record_size: u32,
        _flags: LogCreationFlags,
    ) -> Result<Arc<dyn LogContainer>, ContainerError> {
        Err(ContainerError::DriverNotLoaded)
    }

    async fn open_container(
        &self,
        _path: &Path,
        _id: Uuid,
    ) -> Result<Arc<dyn LogContainer>, ContainerError> {
        Err(ContainerError::DriverNotLoaded)
    }

    async fn delete_container(&self, _path: &Path, _id: Uuid) -> Result<(), ContainerError> {
        Err(ContainerError::DriverNotLoaded)
    }

    async fn close(&self) -> Result<(), ContainerError> {
        Ok(())
    }
}
