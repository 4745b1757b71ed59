use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{append_all, pattern, with_temp_dir, TestChain, TEST_PARTITION_ID, TEST_REPLICA_ID};
use crate::{
    common::{LogManagerMode, SeekOrigin},
    container::ContainerError,
    logical_log::LogicalLogError,
    manager::{LogManager, ManagerError},
    physical_log::PhysicalLogError,
    record::FIXED_METADATA_SIZE,
};

const LOG_ID: Uuid = Uuid::from_u128(0xe770_0001);

#[tokio::test]
async fn creating_a_live_logical_log_twice_collides() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            let result = chain
                .physical_handle
                .create_and_open_logical_log(
                    LOG_ID,
                    None,
                    None,
                    0,
                    super::TEST_MAX_BLOCK_SIZE,
                    crate::common::LogCreationFlags::UseNonSparseFile,
                    &chain.token,
                )
                .await;
            assert!(matches!(result, Err(PhysicalLogError::Collision { .. })));

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn creating_a_physical_log_twice_collides() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;

            let result = chain
                .manager_handle
                .create_and_open_physical_log(
                    &dir.join("container"),
                    super::TEST_CONTAINER_ID,
                    super::TEST_CONTAINER_SIZE,
                    super::TEST_MAX_STREAMS,
                    super::TEST_MAX_BLOCK_SIZE,
                    crate::common::LogCreationFlags::UseNonSparseFile,
                    &chain.token,
                )
                .await;
            assert!(matches!(result, Err(ManagerError::Collision { .. })));

            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn operations_after_close_fail_deterministically() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            append_all(&log, &pattern(100)).await;
            log.flush(&chain.token).await.expect("flush should not fail");
            log.close(&chain.token).await.expect("close should not fail");

            // Writes are never silently dropped after close.
            let result = log.append(&[1, 2, 3], &chain.token).await;
            assert!(matches!(result, Err(LogicalLogError::Closed)));

            let result = log.flush(&chain.token).await;
            assert!(matches!(result, Err(LogicalLogError::Closed)));

            let mut buf = [0u8; 16];
            let result = log.read(&mut buf, 0, &chain.token).await;
            assert!(matches!(result, Err(LogicalLogError::Closed)));

            let result = log.truncate_head(10).await;
            assert!(matches!(result, Err(LogicalLogError::Closed)));

            // A second close is a benign no-op.
            log.close(&chain.token).await.expect("repeated close should not fail");

            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn payload_corruption_surfaces_as_data_integrity() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            append_all(&log, &pattern(10_000)).await;
            log.flush(&chain.token).await.expect("flush should not fail");
            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;

            // Flip one payload bit in the stream file behind the container's back.
            let stream_file = dir
                .join("container")
                .join(format!("stream-{}.log", LOG_ID.as_simple()));
            let mut file = tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&stream_file)
                .await
                .expect("stream file should exist");
            let payload_byte = (FIXED_METADATA_SIZE + 200) as u64;
            file.seek(std::io::SeekFrom::Start(payload_byte))
                .await
                .expect("seek should not fail");
            let mut byte = [0u8; 1];
            file.read_exact(&mut byte).await.expect("read should not fail");
            byte[0] ^= 0x40;
            file.seek(std::io::SeekFrom::Start(payload_byte))
                .await
                .expect("seek should not fail");
            file.write_all(&byte).await.expect("write should not fail");
            file.sync_all().await.expect("sync should not fail");
            drop(file);

            // Recovery itself succeeds (framing is intact); the read trips on the
            // payload checksum and must not advance the cursor.
            let chain = TestChain::open(&dir).await;
            let log = chain.open_log(LOG_ID).await;

            let token = CancellationToken::new();
            log.seek_for_read(0, SeekOrigin::Begin)
                .await
                .expect("seek should not fail");
            let mut buf = vec![0u8; 1_000];
            let result = log.read(&mut buf, 64 * 1024, &token).await;
            assert!(
                matches!(
                    result,
                    Err(LogicalLogError::Container {
                        source: ContainerError::Corrupted { .. }
                    }) | Err(LogicalLogError::Record { .. })
                ),
                "corrupted payload must fail the read, got {:?}",
                result
            );
            assert_eq!(log.read_position().await, 0);

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn capacity_notifications_are_not_implemented() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            let result = log.wait_capacity_notification(50, &chain.token).await;
            assert!(matches!(result, Err(LogicalLogError::NotImplemented)));

            let result = log.wait_buffer_full_notification(&chain.token).await;
            assert!(matches!(result, Err(LogicalLogError::NotImplemented)));

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn opening_a_missing_container_reports_not_found() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let token = CancellationToken::new();
            let manager = LogManager::open(None, LogManagerMode::InProc)
                .await
                .expect("manager open should not fail");
            let handle = manager
                .get_handle(TEST_PARTITION_ID, TEST_REPLICA_ID, &dir, &token)
                .await
                .expect("manager handle should not fail");

            let result = handle
                .open_physical_log(&dir.join("no-such-container"), Uuid::from_u128(7), &token)
                .await;
            assert!(matches!(
                result,
                Err(ManagerError::Container {
                    source: ContainerError::NotFound { .. }
                })
            ));

            handle
                .close(&token)
                .await
                .expect("manager handle close should not fail");
        }
    })
    .await;
}

#[tokio::test]
async fn opening_a_missing_logical_log_reports_not_found() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;

            let result = chain
                .physical_handle
                .open_logical_log(Uuid::from_u128(0xab5e_17), &chain.token)
                .await;
            assert!(matches!(
                result,
                Err(PhysicalLogError::Container {
                    source: ContainerError::NotFound { .. }
                })
            ));

            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn cancelled_token_stops_operations() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            let cancelled = CancellationToken::new();
            cancelled.cancel();

            let result = log.append(&pattern(100), &cancelled).await;
            assert!(matches!(result, Err(LogicalLogError::Cancelled)));

            let mut buf = [0u8; 16];
            let result = log.read(&mut buf, 0, &cancelled).await;
            assert!(matches!(result, Err(LogicalLogError::Cancelled)));

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}
