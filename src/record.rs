use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use snafu::Snafu;
use uuid::Uuid;

/// Size, in bytes, of the fixed metadata block that starts every record.
///
/// The first `block_metadata_size` bytes of the block are reserved for the physical log
/// container and are opaque to the codec; the block and stream headers follow, then as
/// much of the payload as fits.  The remainder of the payload goes to the page-aligned
/// data extent, rounded up to a multiple of this size.
pub const FIXED_METADATA_SIZE: usize = 4096;

/// Signature stamped into every stream block header.
pub(crate) const STREAM_BLOCK_SIGNATURE: u64 = 0x4c4c_4f47_424c_4b31; // "LLOGBLK1"

/// Metadata block header flag marking a barrier record (the end of a logical record).
pub(crate) const FLAG_END_OF_LOGICAL_RECORD: u32 = 0x1;

pub(crate) const METADATA_BLOCK_HEADER_LEN: usize = 8;
pub(crate) const STREAM_BLOCK_HEADER_LEN: usize = 72;

const CRC64: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_GO_ISO);

/// Per-record framing overhead: the container's reserved region plus the two headers.
pub(crate) fn record_overhead(block_metadata_size: u32) -> i64 {
    block_metadata_size as i64 + (METADATA_BLOCK_HEADER_LEN + STREAM_BLOCK_HEADER_LEN) as i64
}

pub(crate) fn crc64(bytes: &[u8]) -> u64 {
    CRC64.checksum(bytes)
}

/// Error that occurred while validating or addressing a record.
#[derive(Debug, Snafu)]
pub enum RecordError {
    /// The buffer was too short to contain the record framing it claims.
    #[snafu(display("record truncated: needed {} bytes, buffer has {}", needed, available))]
    Truncated { needed: usize, available: usize },

    /// The stream block header signature did not match.
    #[snafu(display("bad stream block signature: {:#018x}", actual))]
    BadSignature { actual: u64 },

    /// The stream block header checksum did not match the header bytes.
    #[snafu(display(
        "header checksum mismatch: calculated {:#018x}, stored {:#018x}",
        calculated,
        stored
    ))]
    HeaderChecksum { calculated: u64, stored: u64 },

    /// The payload checksum did not match the payload bytes.
    #[snafu(display(
        "payload checksum mismatch: calculated {:#018x}, stored {:#018x}",
        calculated,
        stored
    ))]
    PayloadChecksum { calculated: u64, stored: u64 },

    /// A cursor operation addressed a position outside the record.
    #[snafu(display("position {} out of bounds for record of {} bytes", position, limit))]
    OutOfBounds { position: i64, limit: usize },
}

/// First header in the metadata block, directly after the reserved region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetadataBlockHeader {
    pub flags: u32,
    pub offset_to_stream_header: u32,
}

impl MetadataBlockHeader {
    fn encode_into(&self, buf: &mut [u8]) {
        let mut buf = &mut buf[..METADATA_BLOCK_HEADER_LEN];
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.offset_to_stream_header);
    }

    fn decode(mut buf: &[u8]) -> Result<Self, RecordError> {
        if buf.len() < METADATA_BLOCK_HEADER_LEN {
            return Err(RecordError::Truncated {
                needed: METADATA_BLOCK_HEADER_LEN,
                available: buf.len(),
            });
        }
        Ok(Self {
            flags: buf.get_u32_le(),
            offset_to_stream_header: buf.get_u32_le(),
        })
    }
}

/// Second header in the metadata block.  Field order and widths are fixed; records are
/// written and read by the same host, so fields are stored little-endian native.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamBlockHeader {
    pub signature: u64,
    pub stream_id: Uuid,
    pub stream_offset: i64,
    pub highest_operation_id: i64,
    pub head_truncation_point: i64,
    pub data_size: u32,
    pub reserved: u32,
    pub header_crc64: u64,
    pub data_crc64: u64,
}

impl StreamBlockHeader {
    pub(crate) fn encode_into(&self, buf: &mut [u8]) {
        let mut buf = &mut buf[..STREAM_BLOCK_HEADER_LEN];
        buf.put_u64_le(self.signature);
        buf.put_u128_le(self.stream_id.as_u128());
        buf.put_i64_le(self.stream_offset);
        buf.put_i64_le(self.highest_operation_id);
        buf.put_i64_le(self.head_truncation_point);
        buf.put_u32_le(self.data_size);
        buf.put_u32_le(self.reserved);
        buf.put_u64_le(self.header_crc64);
        buf.put_u64_le(self.data_crc64);
    }

    pub(crate) fn decode(mut buf: &[u8]) -> Result<Self, RecordError> {
        if buf.len() < STREAM_BLOCK_HEADER_LEN {
            return Err(RecordError::Truncated {
                needed: STREAM_BLOCK_HEADER_LEN,
                available: buf.len(),
            });
        }
        Ok(Self {
            signature: buf.get_u64_le(),
            stream_id: Uuid::from_u128(buf.get_u128_le()),
            stream_offset: buf.get_i64_le(),
            highest_operation_id: buf.get_i64_le(),
            head_truncation_point: buf.get_i64_le(),
            data_size: buf.get_u32_le(),
            reserved: buf.get_u32_le(),
            header_crc64: buf.get_u64_le(),
            data_crc64: buf.get_u64_le(),
        })
    }

    /// CRC-64 of the encoded header with the `header_crc64` field treated as zero.
    pub(crate) fn computed_header_crc(&self) -> u64 {
        let zeroed = Self {
            header_crc64: 0,
            ..*self
        };
        let mut encoded = [0u8; STREAM_BLOCK_HEADER_LEN];
        zeroed.encode_into(&mut encoded);
        crc64(&encoded)
    }
}

/// A sealed record, ready to hand to the physical log.
///
/// `metadata` is always the full fixed-size metadata block; `extent` is the page-aligned
/// overflow, trimmed to a multiple of the metadata block size and empty when the payload
/// fit entirely inline.
#[derive(Debug, Clone)]
pub(crate) struct SealedRecord {
    pub metadata: Bytes,
    pub metadata_size: u32,
    pub extent: Bytes,
    pub data_size: i64,
    pub asn: i64,
    pub operation: i64,
}

/// Write-side framing buffer for a single record.
///
/// Holds one metadata block plus a page-aligned data extent totalling `max_block_size`
/// bytes, with the cursor positioned at the first payload byte.  `put` never blocks and
/// never spills; a short write tells the engine to flush and re-buffer.
#[derive(Debug)]
pub(crate) struct WriteBuffer {
    buf: BytesMut,
    position: usize,
    offset_to_data: usize,
    block_metadata_size: u32,
    header: StreamBlockHeader,
}

impl WriteBuffer {
    pub fn open_write(
        block_metadata_size: u32,
        max_block_size: u32,
        stream_position: i64,
        op_number: i64,
        stream_id: Uuid,
    ) -> Self {
        let offset_to_data = block_metadata_size as usize
            + METADATA_BLOCK_HEADER_LEN
            + STREAM_BLOCK_HEADER_LEN;
        assert!(offset_to_data <= FIXED_METADATA_SIZE);
        assert!(max_block_size as usize > FIXED_METADATA_SIZE);

        // The buffer is the full block size even though some payload lives in the
        // metadata portion: when the block is completely full the extent has a gap at
        // the end equal to the inline payload, and the round-up still needs that last
        // extent page.
        let mut buf = BytesMut::zeroed(max_block_size as usize);

        let header = StreamBlockHeader {
            signature: STREAM_BLOCK_SIGNATURE,
            stream_id,
            stream_offset: stream_position + 1,
            highest_operation_id: op_number,
            head_truncation_point: 0,
            data_size: 0,
            reserved: 0,
            header_crc64: 0,
            data_crc64: 0,
        };
        MetadataBlockHeader {
            flags: 0,
            offset_to_stream_header: (block_metadata_size as usize + METADATA_BLOCK_HEADER_LEN)
                as u32,
        }
        .encode_into(&mut buf[block_metadata_size as usize..]);
        header.encode_into(&mut buf[block_metadata_size as usize + METADATA_BLOCK_HEADER_LEN..]);

        Self {
            buf,
            position: offset_to_data,
            offset_to_data,
            block_metadata_size,
            header,
        }
    }

    /// Stream position of the first payload byte of this record.
    pub fn base_position(&self) -> i64 {
        self.header.stream_offset - 1
    }

    /// Payload bytes written so far.
    pub fn size_written(&self) -> i64 {
        (self.position - self.offset_to_data) as i64
    }

    /// Copies up to the remaining capacity from `data`, returning the bytes consumed.
    pub fn put(&mut self, data: &[u8]) -> usize {
        let todo = data.len().min(self.buf.len() - self.position);
        if todo > 0 {
            self.buf[self.position..self.position + todo].copy_from_slice(&data[..todo]);
            self.position += todo;
        }
        todo
    }

    /// Whether `[stream_offset, stream_offset + size)` overlaps the bytes buffered so far.
    pub fn intersects(&self, stream_offset: i64, size: i64) -> bool {
        debug_assert!(size > 0);
        let base = self.base_position();
        let written = self.size_written();
        !(stream_offset >= base + written || stream_offset + size <= base)
    }

    /// Snapshots this buffer into a write descriptor for the physical log.
    ///
    /// Finalizes the payload size, head-truncation watermark, and barrier flag, computes
    /// both checksums, and trims the extent view to whole metadata-block multiples.  The
    /// buffer itself is not consumed: on a successful write the engine discards it and
    /// anchors a fresh one, and on a failed write the buffered bytes survive for retry.
    pub fn seal(&self, head_truncation_point: i64, is_barrier: bool) -> SealedRecord {
        let data_size = (self.position - self.offset_to_data) as u32;

        let mut header = self.header;
        header.data_size = data_size;
        header.head_truncation_point = head_truncation_point;
        header.data_crc64 = crc64(&self.buf[self.offset_to_data..self.position]);
        header.header_crc64 = header.computed_header_crc();

        let mut metadata = BytesMut::zeroed(FIXED_METADATA_SIZE);
        let inline_end = self.position.min(FIXED_METADATA_SIZE);
        metadata[self.block_metadata_size as usize..inline_end]
            .copy_from_slice(&self.buf[self.block_metadata_size as usize..inline_end]);
        MetadataBlockHeader {
            flags: if is_barrier {
                FLAG_END_OF_LOGICAL_RECORD
            } else {
                0
            },
            offset_to_stream_header: (self.block_metadata_size as usize
                + METADATA_BLOCK_HEADER_LEN) as u32,
        }
        .encode_into(&mut metadata[self.block_metadata_size as usize..]);
        header.encode_into(
            &mut metadata[self.block_metadata_size as usize + METADATA_BLOCK_HEADER_LEN..],
        );

        let (metadata_size, extent) =
            if self.offset_to_data + data_size as usize <= FIXED_METADATA_SIZE {
                // The payload fits entirely inline; the physical write is metadata-only.
                ((self.offset_to_data + data_size as usize) as u32, Bytes::new())
            } else {
                let overflow = self.offset_to_data + data_size as usize - FIXED_METADATA_SIZE;
                let trim = overflow.div_ceil(FIXED_METADATA_SIZE) * FIXED_METADATA_SIZE;
                (
                    (FIXED_METADATA_SIZE - self.block_metadata_size as usize) as u32,
                    Bytes::copy_from_slice(
                        &self.buf[FIXED_METADATA_SIZE..FIXED_METADATA_SIZE + trim],
                    ),
                )
            };

        SealedRecord {
            metadata: metadata.freeze(),
            metadata_size,
            extent,
            data_size: data_size as i64,
            asn: header.stream_offset,
            operation: header.highest_operation_id,
        }
    }
}

/// Read-side view over one record returned by the physical log.
#[derive(Debug)]
pub(crate) struct ReadBuffer {
    data: Bytes,
    position: usize,
    limit: usize,
    offset_to_data: usize,
    header: StreamBlockHeader,
    flags: u32,
}

impl ReadBuffer {
    /// Parses a record and positions the cursor at `starting_stream_position`.
    ///
    /// The headers are validated (signature, header CRC, payload CRC) before any byte is
    /// served; a mismatch surfaces as a data-integrity error and yields no buffer.  A
    /// starting position at or past the record's end produces an empty buffer rather
    /// than an error, so callers can observe a legal zero-byte read.
    pub fn open_read(
        block_metadata_size: u32,
        starting_stream_position: i64,
        metadata: Bytes,
        extent: Bytes,
    ) -> Result<Self, RecordError> {
        let mut data = BytesMut::with_capacity(metadata.len() + extent.len());
        data.extend_from_slice(&metadata);
        data.extend_from_slice(&extent);
        let data = data.freeze();

        if data.len() < block_metadata_size as usize + METADATA_BLOCK_HEADER_LEN {
            return Err(RecordError::Truncated {
                needed: block_metadata_size as usize + METADATA_BLOCK_HEADER_LEN,
                available: data.len(),
            });
        }
        let md_header = MetadataBlockHeader::decode(&data[block_metadata_size as usize..])?;
        let header_offset = md_header.offset_to_stream_header as usize;
        if data.len() < header_offset + STREAM_BLOCK_HEADER_LEN {
            return Err(RecordError::Truncated {
                needed: header_offset + STREAM_BLOCK_HEADER_LEN,
                available: data.len(),
            });
        }
        let header = StreamBlockHeader::decode(&data[header_offset..])?;

        if header.signature != STREAM_BLOCK_SIGNATURE {
            return Err(RecordError::BadSignature {
                actual: header.signature,
            });
        }

        let calculated = header.computed_header_crc();
        if calculated != header.header_crc64 {
            return Err(RecordError::HeaderChecksum {
                calculated,
                stored: header.header_crc64,
            });
        }

        let offset_to_data = header_offset + STREAM_BLOCK_HEADER_LEN;
        let limit = offset_to_data + header.data_size as usize;
        if data.len() < limit {
            return Err(RecordError::Truncated {
                needed: limit,
                available: data.len(),
            });
        }

        // Older writers left the payload checksum at zero for records that fit
        // entirely in the metadata block; accept it only for the empty payload.
        let payload_crc = crc64(&data[offset_to_data..limit]);
        if payload_crc != header.data_crc64 && !(header.data_size == 0 && header.data_crc64 == 0)
        {
            return Err(RecordError::PayloadChecksum {
                calculated: payload_crc,
                stored: header.data_crc64,
            });
        }

        let relative = starting_stream_position - (header.stream_offset - 1);
        if relative < 0 {
            return Err(RecordError::OutOfBounds {
                position: starting_stream_position,
                limit,
            });
        }
        let position = (offset_to_data as i64 + relative).min(limit as i64) as usize;

        Ok(Self {
            data,
            position,
            limit,
            offset_to_data,
            header,
            flags: md_header.flags,
        })
    }

    /// Stream position of the record's first payload byte.
    pub fn base_position(&self) -> i64 {
        self.header.stream_offset - 1
    }

    pub fn data_size(&self) -> i64 {
        self.header.data_size as i64
    }

    /// Bytes remaining between the cursor and the end of the payload.
    pub fn size_left(&self) -> usize {
        self.limit - self.position
    }

    /// Whether `stream_offset` addresses a payload byte of this record.
    pub fn contains(&self, stream_offset: i64) -> bool {
        let base = self.base_position();
        stream_offset >= base && stream_offset < base + self.data_size()
    }

    /// Copies up to `dest.len()` payload bytes from the cursor, advancing it.
    pub fn get(&mut self, dest: &mut [u8]) -> usize {
        let todo = dest.len().min(self.size_left());
        if todo > 0 {
            dest[..todo].copy_from_slice(&self.data[self.position..self.position + todo]);
            self.position += todo;
        }
        todo
    }

    /// Repositions the cursor to `buffer_offset` bytes past the record base.
    pub fn set_position(&mut self, buffer_offset: i64) -> Result<(), RecordError> {
        if buffer_offset < 0 || buffer_offset as usize >= self.limit - self.offset_to_data {
            return Err(RecordError::OutOfBounds {
                position: buffer_offset,
                limit: self.limit - self.offset_to_data,
            });
        }
        self.position = self.offset_to_data + buffer_offset as usize;
        Ok(())
    }

    pub fn is_barrier(&self) -> bool {
        self.flags & FLAG_END_OF_LOGICAL_RECORD != 0
    }

    pub fn header(&self) -> &StreamBlockHeader {
        &self.header
    }
}
