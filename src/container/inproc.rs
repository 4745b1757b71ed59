//! In-process, file-backed container binding.
//!
//! A container is a directory: an advisory lock file, a fixed metadata file, an alias
//! table, and one file per stream.  A stream file starts with a 4096-byte header block
//! followed by the record log; each record is the metadata block exactly as sealed by
//! the codec, with the container's record frame written into the reserved region, then
//! the page-aligned extent.  Opening a stream scans the frames to rebuild the record
//! index and drops a torn final record.

use std::{
    collections::{HashMap, HashSet},
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use fslock::LockFile;
use parking_lot::Mutex;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use uuid::Uuid;

use super::{
    BuildInfo, ContainerBinding, ContainerError, LogContainer, LogStream, LogUsageInfo,
    RecordReadResult, SizeAndSpaceRemaining, StreamReadInfo, StreamRecoveryInfo,
    WriteDestination, MULTI_RECORD_READ_INTERFACE_VERSION,
};
use crate::{
    common::{LogCreationFlags, DEFAULT_MAXIMUM_READ_RECORD_SIZE},
    record::{crc64, StreamBlockHeader, WriteBuffer, FIXED_METADATA_SIZE},
};

const CONTAINER_META_FILE: &str = "container.meta";
const CONTAINER_LOCK_FILE: &str = "container.lock";
const ALIASES_FILE: &str = "aliases.meta";

const CONTAINER_META_MAGIC: u64 = 0x4c4c_4f47_4354_4e31; // "LLOGCTN1"
const STREAM_HEADER_MAGIC: u64 = 0x4c4c_4f47_5354_5231; // "LLOGSTR1"
const RECORD_FRAME_MAGIC: u64 = 0x4c4c_4f47_4652_4d31; // "LLOGFRM1"

/// Bytes at the head of every metadata block reserved for the record frame.
pub(crate) const BLOCK_METADATA_SIZE: u32 = 64;

const RECORD_FRAME_CRC_OFFSET: usize = 40;
const STREAM_HEADER_BLOCK_LEN: u64 = FIXED_METADATA_SIZE as u64;

const CONTAINER_BUILD_NUMBER: u32 = 10;

fn stream_file_name(id: Uuid) -> String {
    format!("stream-{}.log", id.as_simple())
}

/// The in-process container binding.
///
/// Stateless; each created or opened container owns its directory lock independently.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcBinding;

#[async_trait]
impl ContainerBinding for InProcBinding {
    async fn open(&self) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn create_container(
        &self,
        path: &Path,
        id: Uuid,
        log_size: u64,
        maximum_number_streams: u32,
        maximum_record_size: u32,
        flags: LogCreationFlags,
    ) -> Result<Arc<dyn LogContainer>, ContainerError> {
        tokio::fs::create_dir_all(path).await?;
        let lock = acquire_container_lock(path)?;

        let meta_path = path.join(CONTAINER_META_FILE);
        let meta = ContainerMeta {
            id,
            log_size,
            maximum_number_streams,
            maximum_record_size,
            flags: flags as u32,
        };

        let mut meta_file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&meta_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(ContainerError::AlreadyExists {
                    what: format!("container at {}", path.display()),
                });
            }
            Err(e) => return Err(e.into()),
        };
        meta_file.write_all(&meta.encode()).await?;
        meta_file.sync_all().await?;

        debug!(container_id = %id, path = %path.display(), "created container");

        Ok(FileLogContainer::new(path.to_path_buf(), meta, lock))
    }

    async fn open_container(
        &self,
        path: &Path,
        id: Uuid,
    ) -> Result<Arc<dyn LogContainer>, ContainerError> {
        let meta_path = path.join(CONTAINER_META_FILE);
        let encoded = match tokio::fs::read(&meta_path).await {
            Ok(encoded) => encoded,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ContainerError::NotFound {
                    what: format!("container at {}", path.display()),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let meta = ContainerMeta::decode(&encoded)?;
        // A nil id means "open by path": the caller does not know the container id.
        if !id.is_nil() && meta.id != id {
            return Err(ContainerError::NotFound {
                what: format!("container {} at {}", id, path.display()),
            });
        }

        let lock = acquire_container_lock(path)?;
        let container = FileLogContainer::new(path.to_path_buf(), meta, lock);
        container.load_aliases().await?;

        debug!(container_id = %id, path = %path.display(), "opened container");

        Ok(container)
    }

    async fn delete_container(&self, path: &Path, id: Uuid) -> Result<(), ContainerError> {
        let meta_path = path.join(CONTAINER_META_FILE);
        let encoded = match tokio::fs::read(&meta_path).await {
            Ok(encoded) => encoded,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ContainerError::NotFound {
                    what: format!("container at {}", path.display()),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let meta = ContainerMeta::decode(&encoded)?;
        if !id.is_nil() && meta.id != id {
            return Err(ContainerError::NotFound {
                what: format!("container {} at {}", id, path.display()),
            });
        }

        // Taking the lock ensures no open container survives underneath the delete.
        let lock = acquire_container_lock(path)?;
        tokio::fs::remove_dir_all(path).await?;
        drop(lock);

        info!(container_id = %id, path = %path.display(), "deleted container");
        Ok(())
    }

    async fn close(&self) -> Result<(), ContainerError> {
        Ok(())
    }
}

fn acquire_container_lock(path: &Path) -> Result<LockFile, ContainerError> {
    let lock_path = path.join(CONTAINER_LOCK_FILE);
    let mut lock = LockFile::open(&lock_path)?;
    if !lock.try_lock()? {
        return Err(ContainerError::SharingViolation {
            what: format!("container at {}", path.display()),
        });
    }
    Ok(lock)
}

/// Fixed container configuration persisted at create.
#[derive(Debug, Clone, Copy)]
struct ContainerMeta {
    id: Uuid,
    log_size: u64,
    maximum_number_streams: u32,
    maximum_record_size: u32,
    flags: u32,
}

impl ContainerMeta {
    const ENCODED_LEN: usize = 8 + 16 + 8 + 4 + 4 + 4 + 4 + 8;

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        buf.put_u64_le(CONTAINER_META_MAGIC);
        buf.put_u128_le(self.id.as_u128());
        buf.put_u64_le(self.log_size);
        buf.put_u32_le(self.maximum_number_streams);
        buf.put_u32_le(self.maximum_record_size);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(0);
        let crc = crc64(&buf);
        buf.put_u64_le(crc);
        buf
    }

    fn decode(mut buf: &[u8]) -> Result<Self, ContainerError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(ContainerError::Corrupted {
                reason: "container metadata file is too short".to_string(),
            });
        }
        let crc = crc64(&buf[..Self::ENCODED_LEN - 8]);

        let magic = buf.get_u64_le();
        if magic != CONTAINER_META_MAGIC {
            return Err(ContainerError::Corrupted {
                reason: format!("bad container metadata magic: {:#018x}", magic),
            });
        }
        let meta = Self {
            id: Uuid::from_u128(buf.get_u128_le()),
            log_size: buf.get_u64_le(),
            maximum_number_streams: buf.get_u32_le(),
            maximum_record_size: buf.get_u32_le(),
            flags: {
                let flags = buf.get_u32_le();
                buf.advance(4);
                flags
            },
        };
        let stored_crc = buf.get_u64_le();
        if stored_crc != crc {
            return Err(ContainerError::Corrupted {
                reason: "container metadata checksum mismatch".to_string(),
            });
        }
        Ok(meta)
    }
}

struct FileLogContainer {
    id: Uuid,
    path: PathBuf,
    meta: ContainerMeta,
    weak_self: Weak<FileLogContainer>,
    aliases: tokio::sync::Mutex<HashMap<String, Uuid>>,
    open_streams: Mutex<HashSet<Uuid>>,
    closed: AtomicBool,
    // Held for the lifetime of the container; dropping releases the directory lock.
    _lock: Mutex<LockFile>,
}

impl FileLogContainer {
    fn new(path: PathBuf, meta: ContainerMeta, lock: LockFile) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id: meta.id,
            path,
            meta,
            weak_self: weak.clone(),
            aliases: tokio::sync::Mutex::new(HashMap::new()),
            open_streams: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            _lock: Mutex::new(lock),
        })
    }

    fn check_open(&self) -> Result<(), ContainerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ContainerError::Closed)
        } else {
            Ok(())
        }
    }

    async fn load_aliases(&self) -> Result<(), ContainerError> {
        let alias_path = self.path.join(ALIASES_FILE);
        let encoded = match tokio::fs::read(&alias_path).await {
            Ok(encoded) => encoded,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut buf = &encoded[..];
        if buf.len() < 4 {
            return Err(ContainerError::Corrupted {
                reason: "alias table is too short".to_string(),
            });
        }
        let count = buf.get_u32_le();
        let mut aliases = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            if buf.len() < 20 {
                return Err(ContainerError::Corrupted {
                    reason: "alias table entry is too short".to_string(),
                });
            }
            let id = Uuid::from_u128(buf.get_u128_le());
            let name_len = buf.get_u32_le() as usize;
            if buf.len() < name_len {
                return Err(ContainerError::Corrupted {
                    reason: "alias table name is too short".to_string(),
                });
            }
            let name = std::str::from_utf8(&buf[..name_len])
                .map_err(|_| ContainerError::Corrupted {
                    reason: "alias table name is not valid UTF-8".to_string(),
                })?
                .to_string();
            buf.advance(name_len);
            aliases.insert(name, id);
        }

        *self.aliases.lock().await = aliases;
        Ok(())
    }

    /// Persists the alias table.  Written to a scratch file and renamed into place so a
    /// crash mid-write never leaves a half-written table.
    async fn persist_aliases(
        &self,
        aliases: &HashMap<String, Uuid>,
    ) -> Result<(), ContainerError> {
        let mut buf = Vec::new();
        buf.put_u32_le(aliases.len() as u32);
        for (name, id) in aliases {
            buf.put_u128_le(id.as_u128());
            buf.put_u32_le(name.len() as u32);
            buf.extend_from_slice(name.as_bytes());
        }

        let scratch = self.path.join(format!("{}.tmp", ALIASES_FILE));
        let mut file = File::create(&scratch).await?;
        file.write_all(&buf).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&scratch, self.path.join(ALIASES_FILE)).await?;
        Ok(())
    }

    fn stream_path(&self, id: Uuid) -> PathBuf {
        self.path.join(stream_file_name(id))
    }

    fn release_stream(&self, id: Uuid) {
        self.open_streams.lock().remove(&id);
    }
}

#[async_trait]
impl LogContainer for FileLogContainer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn is_functional(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn create_stream(
        &self,
        id: Uuid,
        alias: Option<&str>,
        path: Option<&Path>,
        maximum_size: i64,
        maximum_block_size: u32,
        flags: LogCreationFlags,
    ) -> Result<Arc<dyn LogStream>, ContainerError> {
        self.check_open()?;

        // Stream placement is driver policy; in-process streams always live in the
        // container directory.
        if let Some(path) = path {
            trace!(stream_id = %id, requested_path = %path.display(), "ignoring stream path");
        }

        let mut stream_count = 0;
        let mut dir = tokio::fs::read_dir(&self.path).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with("stream-") {
                stream_count += 1;
            }
        }
        if stream_count >= self.meta.maximum_number_streams {
            return Err(ContainerError::InvalidArgument {
                param: "maximum_number_streams",
                reason: format!(
                    "container already hosts {} streams",
                    self.meta.maximum_number_streams
                ),
            });
        }

        let maximum_block_size = if maximum_block_size == 0 {
            self.meta.maximum_record_size
        } else {
            maximum_block_size
        };
        if maximum_block_size as usize <= FIXED_METADATA_SIZE {
            return Err(ContainerError::InvalidArgument {
                param: "maximum_block_size",
                reason: format!("must exceed the metadata block size of {}", FIXED_METADATA_SIZE),
            });
        }

        let stream_path = self.stream_path(id);
        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&stream_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(ContainerError::AlreadyExists {
                    what: format!("stream {}", id),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let config = StreamConfig {
            maximum_block_size,
            maximum_size,
            flags: flags as u32,
        };
        let mut header_block = BytesMut::zeroed(STREAM_HEADER_BLOCK_LEN as usize);
        config.encode_into(id, &mut header_block);
        file.write_all(&header_block).await?;
        file.sync_all().await?;

        self.open_streams.lock().insert(id);

        if let Some(alias) = alias {
            let mut aliases = self.aliases.lock().await;
            aliases.insert(alias.to_string(), id);
            self.persist_aliases(&aliases).await?;
        }

        debug!(
            stream_id = %id,
            maximum_block_size,
            flags = config.flags,
            "created stream"
        );

        Ok(FileLogStream::build(self, id, config, file, Vec::new(), -1))
    }

    async fn open_stream(&self, id: Uuid) -> Result<Arc<dyn LogStream>, ContainerError> {
        self.check_open()?;

        if self.open_streams.lock().contains(&id) {
            return Err(ContainerError::SharingViolation {
                what: format!("stream {}", id),
            });
        }

        let stream_path = self.stream_path(id);
        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(&stream_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ContainerError::NotFound {
                    what: format!("stream {}", id),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let config = read_stream_header(&mut file, id).await?;
        let frames = scan_stream_records(&mut file, id).await?;

        // The durable head-truncation watermark rides in the most recent record.
        let last_head_truncation_point = match frames.last() {
            Some(last) => read_record_watermark(&mut file, last).await?,
            None => -1,
        };

        self.open_streams.lock().insert(id);

        debug!(stream_id = %id, records = frames.len(), "opened stream");

        Ok(FileLogStream::build(
            self,
            id,
            config,
            file,
            frames,
            last_head_truncation_point,
        ))
    }

    async fn delete_stream(&self, id: Uuid) -> Result<(), ContainerError> {
        self.check_open()?;

        match tokio::fs::remove_file(self.stream_path(id)).await {
            Ok(()) => {
                info!(stream_id = %id, "deleted stream");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ContainerError::NotFound {
                what: format!("stream {}", id),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn enumerate_streams(&self) -> Result<Vec<Uuid>, ContainerError> {
        self.check_open()?;

        let mut ids = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(simple) = name
                .strip_prefix("stream-")
                .and_then(|n| n.strip_suffix(".log"))
            {
                if let Ok(id) = Uuid::parse_str(simple) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    async fn assign_alias(&self, alias: &str, id: Uuid) -> Result<(), ContainerError> {
        self.check_open()?;
        let mut aliases = self.aliases.lock().await;
        aliases.insert(alias.to_string(), id);
        self.persist_aliases(&aliases).await
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Uuid, ContainerError> {
        self.check_open()?;
        self.aliases
            .lock()
            .await
            .get(alias)
            .copied()
            .ok_or_else(|| ContainerError::NotFound {
                what: format!("alias '{}'", alias),
            })
    }

    async fn remove_alias(&self, alias: &str) -> Result<(), ContainerError> {
        self.check_open()?;
        let mut aliases = self.aliases.lock().await;
        if aliases.remove(alias).is_none() {
            return Err(ContainerError::NotFound {
                what: format!("alias '{}'", alias),
            });
        }
        self.persist_aliases(&aliases).await
    }

    async fn close(&self) -> Result<(), ContainerError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Fixed stream configuration persisted in the stream file's header block.
#[derive(Debug, Clone, Copy)]
struct StreamConfig {
    maximum_block_size: u32,
    maximum_size: i64,
    flags: u32,
}

impl StreamConfig {
    fn encode_into(&self, id: Uuid, block: &mut [u8]) {
        let mut fields = Vec::with_capacity(48);
        fields.put_u64_le(STREAM_HEADER_MAGIC);
        fields.put_u128_le(id.as_u128());
        fields.put_u32_le(self.maximum_block_size);
        fields.put_u32_le(self.flags);
        fields.put_i64_le(self.maximum_size);
        let crc = crc64(&fields);
        fields.put_u64_le(crc);
        block[..fields.len()].copy_from_slice(&fields);
    }

    fn decode(mut buf: &[u8], expected_id: Uuid) -> Result<Self, ContainerError> {
        let crc = crc64(&buf[..40]);
        let magic = buf.get_u64_le();
        if magic != STREAM_HEADER_MAGIC {
            return Err(ContainerError::Corrupted {
                reason: format!("bad stream header magic: {:#018x}", magic),
            });
        }
        let id = Uuid::from_u128(buf.get_u128_le());
        if id != expected_id {
            return Err(ContainerError::Corrupted {
                reason: format!("stream header id {} does not match {}", id, expected_id),
            });
        }
        let config = Self {
            maximum_block_size: buf.get_u32_le(),
            flags: buf.get_u32_le(),
            maximum_size: buf.get_i64_le(),
        };
        if buf.get_u64_le() != crc {
            return Err(ContainerError::Corrupted {
                reason: "stream header checksum mismatch".to_string(),
            });
        }
        Ok(config)
    }
}

/// Index entry for one record in a stream file.
#[derive(Debug, Clone, Copy)]
struct RecordFrame {
    offset: u64,
    asn: i64,
    operation: i64,
    metadata_size: u32,
    extent_len: u32,
    data_size: u32,
}

impl RecordFrame {
    fn encode_into(&self, reserved: &mut [u8]) {
        let mut fields = Vec::with_capacity(48);
        fields.put_u64_le(RECORD_FRAME_MAGIC);
        fields.put_i64_le(self.asn);
        fields.put_i64_le(self.operation);
        fields.put_u32_le(self.metadata_size);
        fields.put_u32_le(self.extent_len);
        fields.put_u32_le(self.data_size);
        fields.put_u32_le(0);
        let crc = crc64(&fields);
        fields.put_u64_le(crc);
        reserved[..fields.len()].copy_from_slice(&fields);
    }

    fn decode(offset: u64, mut buf: &[u8]) -> Option<Self> {
        let crc = crc64(&buf[..RECORD_FRAME_CRC_OFFSET]);
        if buf.get_u64_le() != RECORD_FRAME_MAGIC {
            return None;
        }
        let frame = Self {
            offset,
            asn: buf.get_i64_le(),
            operation: buf.get_i64_le(),
            metadata_size: buf.get_u32_le(),
            extent_len: buf.get_u32_le(),
            data_size: {
                let data_size = buf.get_u32_le();
                buf.advance(4);
                data_size
            },
        };
        if buf.get_u64_le() != crc {
            return None;
        }
        Some(frame)
    }

    fn end_asn(&self) -> i64 {
        self.asn + self.data_size as i64
    }

    fn record_len(&self) -> u64 {
        FIXED_METADATA_SIZE as u64 + self.extent_len as u64
    }

    fn contains(&self, asn: i64) -> bool {
        asn >= self.asn && asn < self.end_asn()
    }
}

/// Reads the head-truncation watermark carried by the record at `frame`.
async fn read_record_watermark(
    file: &mut File,
    frame: &RecordFrame,
) -> Result<i64, ContainerError> {
    let mut block = vec![0u8; FIXED_METADATA_SIZE];
    file.seek(SeekFrom::Start(frame.offset)).await?;
    file.read_exact(&mut block).await?;

    let header_offset = BLOCK_METADATA_SIZE as usize + crate::record::METADATA_BLOCK_HEADER_LEN;
    let header =
        StreamBlockHeader::decode(&block[header_offset..]).map_err(|e| ContainerError::Corrupted {
            reason: format!("record at ASN {}: {}", frame.asn, e),
        })?;
    Ok(header.head_truncation_point)
}

async fn read_stream_header(file: &mut File, id: Uuid) -> Result<StreamConfig, ContainerError> {
    let mut block = vec![0u8; STREAM_HEADER_BLOCK_LEN as usize];
    file.seek(SeekFrom::Start(0)).await?;
    file.read_exact(&mut block).await.map_err(|_| {
        ContainerError::Corrupted {
            reason: "stream file is shorter than its header block".to_string(),
        }
    })?;
    StreamConfig::decode(&block, id)
}

/// Rebuilds the record index by walking the frames; a torn final record (incomplete
/// frame or short extent) ends the scan and is discarded by truncating the file.
async fn scan_stream_records(
    file: &mut File,
    id: Uuid,
) -> Result<Vec<RecordFrame>, ContainerError> {
    let len = file.metadata().await?.len();
    let mut frames = Vec::new();
    let mut offset = STREAM_HEADER_BLOCK_LEN;
    let mut block = vec![0u8; FIXED_METADATA_SIZE];

    while offset + FIXED_METADATA_SIZE as u64 <= len {
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut block).await?;

        let frame = match RecordFrame::decode(offset, &block) {
            Some(frame) => frame,
            None => break,
        };
        if offset + frame.record_len() > len {
            break;
        }

        offset += frame.record_len();
        frames.push(frame);
    }

    if offset < len {
        warn!(
            stream_id = %id,
            valid_end = offset,
            file_len = len,
            "dropping torn record at end of stream file"
        );
        file.set_len(offset).await?;
        file.sync_all().await?;
    }

    Ok(frames)
}

struct StreamInner {
    file: File,
    frames: Vec<RecordFrame>,
    end_offset: u64,
    /// Container-side head watermark from `truncate`; reclamation only.
    head_asn: i64,
    /// Watermark carried by the most recent record, returned at recovery.
    last_head_truncation_point: i64,
}

struct FileLogStream {
    id: Uuid,
    container: Weak<FileLogContainer>,
    config: StreamConfig,
    log_size_capacity: u64,
    inner: tokio::sync::Mutex<StreamInner>,
    closed: AtomicBool,
}

impl FileLogStream {
    fn build(
        container: &FileLogContainer,
        id: Uuid,
        config: StreamConfig,
        file: File,
        frames: Vec<RecordFrame>,
        last_head_truncation_point: i64,
    ) -> Arc<dyn LogStream> {
        let end_offset = frames
            .last()
            .map(|f| f.offset + f.record_len())
            .unwrap_or(STREAM_HEADER_BLOCK_LEN);

        Arc::new(FileLogStream {
            id,
            container: container.weak_self.clone(),
            config,
            log_size_capacity: container.meta.log_size,
            inner: tokio::sync::Mutex::new(StreamInner {
                file,
                frames,
                end_offset,
                head_asn: -1,
                last_head_truncation_point,
            }),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), ContainerError> {
        if self.closed.load(Ordering::Acquire) {
            Err(ContainerError::Closed)
        } else {
            Ok(())
        }
    }

    fn capacity(&self) -> u64 {
        if self.config.maximum_size > 0 {
            self.config.maximum_size as u64
        } else {
            self.log_size_capacity
        }
    }

    fn size_and_space(&self, inner: &StreamInner) -> SizeAndSpaceRemaining {
        let size = inner.end_offset;
        SizeAndSpaceRemaining {
            size,
            space_remaining: self.capacity().saturating_sub(size),
        }
    }

    /// Reads the record at `frame` and returns `(stream_header, payload)` after
    /// verifying the payload checksum.
    async fn read_record_payload(
        &self,
        inner: &mut StreamInner,
        frame: &RecordFrame,
    ) -> Result<(StreamBlockHeader, Vec<u8>), ContainerError> {
        let mut record = vec![0u8; frame.record_len() as usize];
        inner.file.seek(SeekFrom::Start(frame.offset)).await?;
        inner.file.read_exact(&mut record).await?;

        let header_offset = BLOCK_METADATA_SIZE as usize + crate::record::METADATA_BLOCK_HEADER_LEN;
        let header = StreamBlockHeader::decode(&record[header_offset..]).map_err(|e| {
            ContainerError::Corrupted {
                reason: format!("record at ASN {}: {}", frame.asn, e),
            }
        })?;

        let offset_to_data = header_offset + crate::record::STREAM_BLOCK_HEADER_LEN;
        let end = offset_to_data + header.data_size as usize;
        if record.len() < end {
            return Err(ContainerError::Corrupted {
                reason: format!("record at ASN {} is shorter than its payload", frame.asn),
            });
        }

        let payload = record[offset_to_data..end].to_vec();
        let payload_crc = crc64(&payload);
        if payload_crc != header.data_crc64 && !(header.data_size == 0 && header.data_crc64 == 0)
        {
            return Err(ContainerError::Corrupted {
                reason: format!("record at ASN {} failed its payload checksum", frame.asn),
            });
        }

        Ok((header, payload))
    }

    /// Reads the raw stored buffers for `frame` without re-validating the payload; the
    /// record codec on the consuming side performs full validation.
    async fn read_record_raw(
        &self,
        inner: &mut StreamInner,
        frame: &RecordFrame,
    ) -> Result<RecordReadResult, ContainerError> {
        let mut record = vec![0u8; frame.record_len() as usize];
        inner.file.seek(SeekFrom::Start(frame.offset)).await?;
        inner.file.read_exact(&mut record).await?;

        let record = Bytes::from(record);
        let metadata = record.slice(..FIXED_METADATA_SIZE);
        let extent = record.slice(FIXED_METADATA_SIZE..);

        Ok(RecordReadResult {
            resulting_asn: frame.asn,
            version: frame.operation,
            metadata_size: frame.metadata_size,
            metadata,
            extent,
        })
    }

    /// Index of the newest frame containing `asn`.  Newest wins because a record
    /// written after a tail truncation overlaps the stale tail of its predecessor.
    fn find_containing(frames: &[RecordFrame], asn: i64) -> Option<usize> {
        frames.iter().rposition(|frame| frame.contains(asn))
    }
}

#[async_trait]
impl LogStream for FileLogStream {
    fn id(&self) -> Uuid {
        self.id
    }

    fn is_functional(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.container
            .upgrade()
            .map(|c| c.is_functional())
            .unwrap_or(false)
    }

    fn reserved_metadata_size(&self) -> u32 {
        BLOCK_METADATA_SIZE
    }

    async fn write(
        &self,
        asn: i64,
        operation: i64,
        metadata_size: u32,
        metadata: Bytes,
        extent: Bytes,
        _reservation: u64,
    ) -> Result<SizeAndSpaceRemaining, ContainerError> {
        self.check_open()?;

        if metadata.len() != FIXED_METADATA_SIZE {
            return Err(ContainerError::InvalidArgument {
                param: "metadata",
                reason: format!("metadata block must be {} bytes", FIXED_METADATA_SIZE),
            });
        }
        if extent.len() % FIXED_METADATA_SIZE != 0 {
            return Err(ContainerError::InvalidArgument {
                param: "extent",
                reason: "extent must be a whole number of metadata blocks".to_string(),
            });
        }

        let header_offset = BLOCK_METADATA_SIZE as usize + crate::record::METADATA_BLOCK_HEADER_LEN;
        let header = StreamBlockHeader::decode(&metadata[header_offset..]).map_err(|e| {
            ContainerError::InvalidArgument {
                param: "metadata",
                reason: e.to_string(),
            }
        })?;

        let mut inner = self.inner.lock().await;

        let tail_asn = inner.frames.last().map(|f| f.end_asn()).unwrap_or(1);
        if asn > tail_asn {
            return Err(ContainerError::InvalidArgument {
                param: "asn",
                reason: format!("write at ASN {} would leave a gap before tail {}", asn, tail_asn),
            });
        }

        // A write at or below the tail supersedes everything from that point on; rewind
        // the file to the first superseded record before appending.
        if let Some(first_superseded) = inner.frames.iter().position(|f| f.asn >= asn) {
            let rewind_to = inner.frames[first_superseded].offset;
            trace!(
                stream_id = %self.id,
                asn,
                dropped = inner.frames.len() - first_superseded,
                "write below tail, rewinding stream file"
            );
            inner.frames.truncate(first_superseded);
            inner.file.set_len(rewind_to).await?;
            inner.end_offset = rewind_to;
        }

        let frame = RecordFrame {
            offset: inner.end_offset,
            asn,
            operation,
            metadata_size,
            extent_len: extent.len() as u32,
            data_size: header.data_size,
        };

        let mut output = BytesMut::with_capacity(FIXED_METADATA_SIZE + extent.len());
        output.extend_from_slice(&metadata);
        frame.encode_into(&mut output[..BLOCK_METADATA_SIZE as usize]);
        output.extend_from_slice(&extent);

        let end_offset = inner.end_offset;
        inner.file.seek(SeekFrom::Start(end_offset)).await?;
        inner.file.write_all(&output).await?;
        inner.file.sync_data().await?;

        inner.end_offset += frame.record_len();
        inner.frames.push(frame);
        inner.last_head_truncation_point = header.head_truncation_point;

        trace!(
            stream_id = %self.id,
            asn,
            operation,
            data_size = header.data_size,
            extent_len = extent.len(),
            "wrote record"
        );

        Ok(self.size_and_space(&inner))
    }

    async fn multi_record_read(
        &self,
        starting_asn: i64,
        length: u32,
    ) -> Result<RecordReadResult, ContainerError> {
        self.check_open()?;

        let padded = (length as usize)
            .div_ceil(FIXED_METADATA_SIZE)
            .max(1)
            * FIXED_METADATA_SIZE;

        let mut inner = self.inner.lock().await;

        let start = Self::find_containing(&inner.frames, starting_asn).ok_or_else(|| {
            ContainerError::NotFound {
                what: format!("record containing ASN {}", starting_asn),
            }
        })?;

        let base_asn = inner.frames[start].asn;
        let target = (starting_asn - base_asn) as usize + padded;
        let mut assembled: Vec<u8> = Vec::with_capacity(target);
        let mut highest_operation = inner.frames[start].operation;

        let mut index = start;
        while index < inner.frames.len() && assembled.len() < target {
            let frame = inner.frames[index];
            let (_, payload) = self.read_record_payload(&mut inner, &frame).await?;

            // A record written after a tail truncation overlaps the stale tail of its
            // predecessor; clip each contribution at the next record's ASN.
            let contribution = match inner.frames.get(index + 1) {
                Some(next) => payload.len().min((next.asn - frame.asn) as usize),
                None => payload.len(),
            };
            assembled.extend_from_slice(&payload[..contribution]);
            highest_operation = frame.operation;
            index += 1;
        }

        let head = inner.last_head_truncation_point;
        drop(inner);

        Ok(synthesize_record(
            self.id,
            base_asn,
            highest_operation,
            head,
            &assembled,
        ))
    }

    async fn read_containing(&self, asn: i64) -> Result<RecordReadResult, ContainerError> {
        self.check_open()?;

        let mut inner = self.inner.lock().await;
        let index = Self::find_containing(&inner.frames, asn).ok_or_else(|| {
            ContainerError::NotFound {
                what: format!("record containing ASN {}", asn),
            }
        })?;
        let frame = inner.frames[index];
        self.read_record_raw(&mut inner, &frame).await
    }

    async fn truncate(&self, asn: i64, _preferred_asn: i64) -> Result<(), ContainerError> {
        self.check_open()?;
        let mut inner = self.inner.lock().await;
        if asn > inner.head_asn {
            inner.head_asn = asn;

            // Records wholly below the watermark become unreachable; drop them from
            // the index.  File space is reclaimed when the stream is deleted.
            let before = inner.frames.len();
            inner.frames.retain(|frame| frame.end_asn() > asn);
            trace!(
                stream_id = %self.id,
                head_asn = asn,
                dropped = before - inner.frames.len(),
                "advanced head truncation watermark"
            );
        }
        Ok(())
    }

    async fn set_end_of_file(&self, asn: i64) -> Result<(), ContainerError> {
        self.check_open()?;
        let mut inner = self.inner.lock().await;

        // The tail-truncating write has already rewound the file; this trims anything
        // that somehow survived past the new tail record.
        if let Some(first_past) = inner.frames.iter().position(|f| f.asn > asn + 1) {
            let rewind_to = inner.frames[first_past].offset;
            inner.frames.truncate(first_past);
            inner.file.set_len(rewind_to).await?;
            inner.file.sync_all().await?;
            inner.end_offset = rewind_to;
        }
        Ok(())
    }

    async fn set_file_size(&self, size: i64) -> Result<(), ContainerError> {
        self.check_open()?;
        // Allocation sizing is a driver concern; the file already ends at the data.
        trace!(stream_id = %self.id, size, "set_file_size accepted");
        Ok(())
    }

    async fn query_recovery_info(&self) -> Result<StreamRecoveryInfo, ContainerError> {
        self.check_open()?;
        let inner = self.inner.lock().await;
        let (tail_asn, highest_operation, head_truncation_point) = match inner.frames.last() {
            Some(last) => (
                last.end_asn(),
                last.operation,
                inner.last_head_truncation_point,
            ),
            None => (1, 0, -1),
        };
        Ok(StreamRecoveryInfo {
            tail_asn,
            highest_operation,
            maximum_block_size: self.config.maximum_block_size,
            head_truncation_point,
        })
    }

    async fn query_read_info(&self) -> Result<StreamReadInfo, ContainerError> {
        self.check_open()?;
        Ok(StreamReadInfo {
            maximum_read_record_size: DEFAULT_MAXIMUM_READ_RECORD_SIZE,
        })
    }

    async fn query_build_info(&self) -> Result<BuildInfo, ContainerError> {
        self.check_open()?;
        Ok(BuildInfo {
            build_number: ((MULTI_RECORD_READ_INTERFACE_VERSION as u32) << 16)
                | CONTAINER_BUILD_NUMBER,
            is_free_build: true,
        })
    }

    async fn query_usage(&self) -> Result<LogUsageInfo, ContainerError> {
        self.check_open()?;
        let inner = self.inner.lock().await;
        let used = inner.end_offset.saturating_mul(100) / self.capacity().max(1);
        Ok(LogUsageInfo {
            percentage_used: used.min(100) as u32,
        })
    }

    async fn query_size_and_space(&self) -> Result<SizeAndSpaceRemaining, ContainerError> {
        self.check_open()?;
        let inner = self.inner.lock().await;
        Ok(self.size_and_space(&inner))
    }

    async fn set_write_destination(
        &self,
        destination: WriteDestination,
    ) -> Result<(), ContainerError> {
        self.check_open()?;
        // In-process streams have no shared/dedicated pair; the toggle is accepted and
        // has no effect.
        trace!(stream_id = %self.id, ?destination, "write destination accepted");
        Ok(())
    }

    async fn close(&self) -> Result<(), ContainerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let inner = self.inner.lock().await;
            inner.file.sync_all().await?;
        }
        if let Some(container) = self.container.upgrade() {
            container.release_stream(self.id);
        }
        Ok(())
    }
}

/// Builds a coalesced read result in record-codec format with fresh checksums.
fn synthesize_record(
    stream_id: Uuid,
    base_asn: i64,
    operation: i64,
    head_truncation_point: i64,
    payload: &[u8],
) -> RecordReadResult {
    let overhead = crate::record::record_overhead(BLOCK_METADATA_SIZE) as usize;
    let block_size = (payload.len() + overhead).div_ceil(FIXED_METADATA_SIZE) * FIXED_METADATA_SIZE
        + FIXED_METADATA_SIZE;

    let mut buffer = WriteBuffer::open_write(
        BLOCK_METADATA_SIZE,
        block_size as u32,
        base_asn - 1,
        operation,
        stream_id,
    );
    let copied = buffer.put(payload);
    debug_assert_eq!(copied, payload.len());

    let sealed = buffer.seal(head_truncation_point, false);
    RecordReadResult {
        resulting_asn: sealed.asn,
        version: sealed.operation,
        metadata_size: sealed.metadata_size,
        metadata: sealed.metadata,
        extent: sealed.extent,
    }
}
