use std::{future::Future, path::Path, sync::Arc};

use temp_dir::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    common::{LogCreationFlags, LogManagerMode, SeekOrigin},
    logical_log::LogicalLog,
    manager::{LogManager, LogManagerHandle},
    physical_log::PhysicalLogHandle,
};

mod invariants;
mod known_errors;
mod lifecycle;
mod truncation;

/*
    Helper code for getting tracing data from a test:

    install_tracing();
    RUST_LOG=logical_log=trace cargo test -- --nocapture
*/

#[allow(dead_code)]
pub(crate) fn install_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) const TEST_PARTITION_ID: Uuid = Uuid::from_u128(0xab5e_77ed_0000_0000_0000_0000_0000_0001);
pub(crate) const TEST_CONTAINER_ID: Uuid = Uuid::from_u128(0xc0de_0000_0000_0000_0000_0000_0000_0001);
pub(crate) const TEST_REPLICA_ID: i64 = 1;

pub(crate) const TEST_CONTAINER_SIZE: u64 = 256 * 1024 * 1024;
pub(crate) const TEST_MAX_STREAMS: u32 = 64;
pub(crate) const TEST_MAX_BLOCK_SIZE: u32 = 128 * 1024;

pub(crate) async fn with_temp_dir<F, Fut>(f: F)
where
    F: FnOnce(&Path) -> Fut,
    Fut: Future<Output = ()>,
{
    let dir = TempDir::new().expect("failed to create temp dir");
    f(dir.path()).await;
}

/// The full consumer chain: manager, manager handle, and one physical log handle.
pub(crate) struct TestChain {
    pub manager: Arc<LogManager>,
    pub manager_handle: Arc<LogManagerHandle>,
    pub physical_handle: Arc<PhysicalLogHandle>,
    pub token: CancellationToken,
}

impl TestChain {
    pub async fn create(dir: &Path) -> TestChain {
        let token = CancellationToken::new();
        let manager = LogManager::open(None, LogManagerMode::InProc)
            .await
            .expect("manager open should not fail");
        let manager_handle = manager
            .get_handle(TEST_PARTITION_ID, TEST_REPLICA_ID, dir, &token)
            .await
            .expect("manager handle should not fail");
        let physical_handle = manager_handle
            .create_and_open_physical_log(
                &dir.join("container"),
                TEST_CONTAINER_ID,
                TEST_CONTAINER_SIZE,
                TEST_MAX_STREAMS,
                TEST_MAX_BLOCK_SIZE,
                LogCreationFlags::UseNonSparseFile,
                &token,
            )
            .await
            .expect("physical log create should not fail");

        TestChain {
            manager,
            manager_handle,
            physical_handle,
            token,
        }
    }

    /// Reopens the physical log of an already existing container.
    pub async fn open(dir: &Path) -> TestChain {
        let token = CancellationToken::new();
        let manager = LogManager::open(None, LogManagerMode::InProc)
            .await
            .expect("manager open should not fail");
        let manager_handle = manager
            .get_handle(TEST_PARTITION_ID, TEST_REPLICA_ID, dir, &token)
            .await
            .expect("manager handle should not fail");
        let physical_handle = manager_handle
            .open_physical_log(&dir.join("container"), TEST_CONTAINER_ID, &token)
            .await
            .expect("physical log open should not fail");

        TestChain {
            manager,
            manager_handle,
            physical_handle,
            token,
        }
    }

    pub async fn create_log(&self, id: Uuid) -> Arc<LogicalLog> {
        self.physical_handle
            .create_and_open_logical_log(
                id,
                None,
                None,
                0,
                TEST_MAX_BLOCK_SIZE,
                LogCreationFlags::UseNonSparseFile,
                &self.token,
            )
            .await
            .expect("logical log create should not fail")
    }

    pub async fn open_log(&self, id: Uuid) -> Arc<LogicalLog> {
        self.physical_handle
            .open_logical_log(id, &self.token)
            .await
            .expect("logical log open should not fail")
    }

    /// Closes the handles in consumer order; the manager itself stays open.
    pub async fn close(self) {
        self.physical_handle
            .close(&self.token)
            .await
            .expect("physical handle close should not fail");
        self.manager_handle
            .close(&self.token)
            .await
            .expect("manager handle close should not fail");
    }
}

/// The byte pattern the end-to-end scenarios write: `b[i] = (i*i + i) % 255`.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len as u64).map(|i| ((i * i + i) % 255) as u8).collect()
}

pub(crate) async fn append_all(log: &LogicalLog, data: &[u8]) {
    let token = CancellationToken::new();
    log.append(data, &token).await.expect("append should not fail");
}

/// Seeks to `from` and reads up to `len` bytes, using multi-record read-ahead.
pub(crate) async fn read_region(log: &LogicalLog, from: i64, len: usize) -> Vec<u8> {
    let token = CancellationToken::new();
    log.seek_for_read(from, SeekOrigin::Begin)
        .await
        .expect("seek should not fail");

    let mut out = vec![0u8; len];
    let mut total = 0;
    while total < len {
        let read = log
            .read(&mut out[total..], 256 * 1024, &token)
            .await
            .expect("read should not fail");
        if read == 0 {
            break;
        }
        total += read;
    }
    out.truncate(total);
    out
}
