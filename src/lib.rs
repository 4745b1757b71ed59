//! # Logical log service
//!
//! This library multiplexes many append-only byte streams ("logical logs") onto a
//! shared physical log container, providing crash-consistent append, random read,
//! dual-sided truncation, and a read-ahead cache.  It is meant for higher layers
//! (replication engines, state providers) that need durable, ordered, recoverable
//! byte streams with bounded metadata overhead.
//!
//! ## Design constraints
//!
//! These constraints, or more often, invariants, are the groundwork for ensuring the
//! design stays simple and understandable:
//! - every record starts with a fixed 4096-byte metadata block; the payload overflow
//!   goes to a page-aligned extent rounded up to a multiple of that block size
//! - all records carry two CRC-64 checksums, one over the stream header and one over
//!   the payload
//! - stream positions are 0-based in memory and 1-based on disk (the ASN); every
//!   conversion between the two is `asn == position + 1`
//! - the log is append-only except for tail truncation, which is recorded durably by
//!   a dedicated empty barrier record
//! - head truncation is lazy: the watermark rides inside the next sealed record
//! - endianness of the files is based on the host system (records are read by the
//!   same platform's container that produced them)
//!
//! ## Record structure
//!
//! Records are framed with a fixed metadata block followed by the payload extent:
//!
//!   metadata block (4096 bytes):
//!     `reserved`:             uint8[R] (opaque to the codec, owned by the container)
//!     `metadata block header`: flags: uint32, offset to stream header: uint32
//!     `stream block header`:  signature: uint64, stream id: uint128,
//!                             stream offset (ASN): int64, highest operation: int64,
//!                             head truncation point: int64, data size: uint32,
//!                             reserved: uint32, header CRC-64, payload CRC-64
//!     `inline payload`:       up to 4096 - R - 80 bytes
//!   extent:
//!     remaining payload, rounded up to a multiple of 4096 bytes
//!
//! ## Lifecycle graph
//!
//! Consumers acquire a manager handle, open a physical log through it for a
//! physical-log handle, and create or open logical logs through that.  Every level is
//! a deferred-close service: outstanding operations and child objects hold activity
//! tokens that keep a parent alive until they complete, so closing the last consumer
//! tears the whole graph down in order, and the underlying container is closed
//! exactly once.

#[macro_use]
extern crate tracing;

pub mod common;
pub use common::{
    LogCreationFlags, LogManagerMode, SeekOrigin, SharedLogSettings, SharedLogSettingsBuilder,
    DEFAULT_APPLICATION_SHARED_LOG_ID,
};

pub mod container;

mod lifecycle;

mod logical_log;
pub use logical_log::{LogicalLog, LogicalLogError};

mod manager;
pub use manager::{LogManager, LogManagerHandle, ManagerError};

mod physical_log;
pub use physical_log::{PhysicalLog, PhysicalLogError, PhysicalLogHandle};

mod read_ahead;

mod read_stream;
pub use read_stream::LogReadStream;

mod record;
pub use record::{RecordError, FIXED_METADATA_SIZE};

#[cfg(test)]
mod tests;
