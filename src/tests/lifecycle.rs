use std::sync::Arc;

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_test::{assert_pending, task::spawn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{append_all, pattern, with_temp_dir, TestChain, TEST_PARTITION_ID, TEST_REPLICA_ID};
use crate::common::{LogCreationFlags, LogManagerMode, DEFAULT_APPLICATION_SHARED_LOG_ID};
use crate::manager::LogManager;

#[tokio::test]
async fn manager_unloads_when_the_last_consumer_closes() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            assert!(chain.manager.binding_loaded().await);
            assert_eq!(chain.manager.handle_count().await, 1);
            assert_eq!(chain.manager.physical_log_count().await, 1);

            // A second handle onto the same physical log.
            let second = chain
                .manager_handle
                .open_physical_log(
                    &dir.join("container"),
                    super::TEST_CONTAINER_ID,
                    &chain.token,
                )
                .await
                .expect("aliasing open should not fail");
            assert!(second.is_functional());

            let manager = Arc::clone(&chain.manager);
            let token = chain.token.clone();

            // Close in an order that exercises deferral: manager handle first, then
            // the two physical log handles.
            chain
                .manager_handle
                .close(&chain.token)
                .await
                .expect("manager handle close should not fail");
            chain
                .physical_handle
                .close(&chain.token)
                .await
                .expect("first physical handle close should not fail");

            // The physical log still has a live handle, so the container binding and
            // the registry entry must survive.
            assert_eq!(manager.physical_log_count().await, 1);
            assert!(manager.binding_loaded().await);

            second
                .close(&token)
                .await
                .expect("second physical handle close should not fail");

            assert_eq!(manager.handle_count().await, 0);
            assert_eq!(manager.physical_log_count().await, 0);
            assert!(!manager.binding_loaded().await);
            assert!(!second.is_functional());
        }
    })
    .await;
}

#[tokio::test]
async fn manager_close_defers_until_handles_release() {
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

            // Closing the manager must not complete while the handle is alive.
            let mut close = spawn(manager.close(&token));
            assert_pending!(close.poll());

            handle
                .close(&token)
                .await
                .expect("manager handle close should not fail");

            close.await.expect("manager close should not fail");
            assert!(!manager.is_open());
        }
    })
    .await;
}

#[tokio::test]
async fn closing_the_last_logical_log_closes_the_physical_log() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(Uuid::from_u128(0xdead_0001)).await;

            let physical = Arc::clone(chain.physical_handle.owner());
            assert_eq!(physical.logical_log_count().await, 1);
            assert_eq!(physical.handle_count().await, 1);

            // Handle goes first; the logical log keeps the wrapper alive.
            chain
                .physical_handle
                .close(&chain.token)
                .await
                .expect("physical handle close should not fail");
            assert_eq!(physical.handle_count().await, 0);
            assert_eq!(chain.manager.physical_log_count().await, 1);

            log.close(&chain.token).await.expect("log close should not fail");
            assert_eq!(physical.logical_log_count().await, 0);
            assert_eq!(chain.manager.physical_log_count().await, 0);

            chain
                .manager_handle
                .close(&chain.token)
                .await
                .expect("manager handle close should not fail");
        }
    })
    .await;
}

#[tokio::test]
async fn concurrent_appenders_with_mixed_closes() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;

            let mut logs = Vec::new();
            for index in 0..4u128 {
                logs.push(chain.create_log(Uuid::from_u128(0xbeef_0000 + index)).await);
            }

            // Random-size appends with periodic head truncations, all concurrently.
            let appenders = logs.iter().map(|log| {
                let log = Arc::clone(log);
                let token = chain.token.clone();
                tokio::spawn(async move {
                    let mut rng = StdRng::from_entropy();
                    for iteration in 0..40 {
                        let size = rng.gen_range(1..=8 * 1024);
                        log.append(&pattern(size), &token)
                            .await
                            .expect("append should not fail");

                        if iteration % 10 == 9 {
                            log.flush(&token).await.expect("flush should not fail");
                            let head = log.write_position() / 2;
                            if head > log.head_truncation_position() {
                                log.truncate_head(head)
                                    .await
                                    .expect("truncate head should not fail");
                            }
                        }
                    }
                    log.flush(&token).await.expect("flush should not fail");
                })
            });
            join_all(appenders).await.into_iter().for_each(|result| {
                result.expect("appender task should not panic");
            });

            // Close half synchronously and half through detached tasks; every close
            // must complete without hanging.
            let (sync_half, async_half) = logs.split_at(2);
            let async_closes = async_half
                .iter()
                .map(|log| {
                    let log = Arc::clone(log);
                    let token = chain.token.clone();
                    tokio::spawn(async move { log.close(&token).await })
                })
                .collect::<Vec<_>>();

            for log in sync_half {
                log.close(&chain.token).await.expect("close should not fail");
            }
            for close in async_closes {
                close
                    .await
                    .expect("close task should not panic")
                    .expect("close should not fail");
            }

            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn staging_log_redirection_in_proc() {
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

            // The well-known shared-log id routes to the per-replica staging log.
            let physical = handle
                .create_and_open_physical_log(
                    &dir.join("ignored"),
                    DEFAULT_APPLICATION_SHARED_LOG_ID,
                    1024 * 1024,
                    8,
                    64 * 1024,
                    LogCreationFlags::UseNonSparseFile,
                    &token,
                )
                .await
                .expect("staging log create should not fail");

            let staging_path = dir.join(format!(
                "{}_{}.stlog",
                TEST_PARTITION_ID.as_hyphenated(),
                TEST_REPLICA_ID
            ));
            assert!(
                tokio::fs::try_exists(&staging_path)
                    .await
                    .expect("staging path probe should not fail"),
                "staging log directory should exist at the derived path"
            );

            // The staging log is a fully functional physical log.
            let log = physical
                .create_and_open_logical_log(
                    Uuid::from_u128(0x57a9_0001),
                    None,
                    None,
                    0,
                    64 * 1024,
                    LogCreationFlags::UseNonSparseFile,
                    &token,
                )
                .await
                .expect("logical log create in staging log should not fail");
            append_all(&log, b"staged bytes").await;
            log.flush(&token).await.expect("flush should not fail");

            log.close(&token).await.expect("log close should not fail");
            physical
                .close(&token)
                .await
                .expect("physical handle close should not fail");
            handle
                .close(&token)
                .await
                .expect("manager handle close should not fail");
        }
    })
    .await;
}

#[tokio::test]
async fn alias_rotation_and_recovery() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;

            let current_id = Uuid::from_u128(0xa11a_0001);
            let next_id = Uuid::from_u128(0xa11a_0002);

            let current = chain.create_log(current_id).await;
            chain
                .physical_handle
                .assign_alias(current_id, "copy", &chain.token)
                .await
                .expect("alias assignment should not fail");

            let next = chain
                .physical_handle
                .create_and_open_logical_log(
                    next_id,
                    Some("copy.tmp"),
                    None,
                    0,
                    super::TEST_MAX_BLOCK_SIZE,
                    LogCreationFlags::UseNonSparseFile,
                    &chain.token,
                )
                .await
                .expect("logical log create should not fail");

            // Rotate: the new stream takes the primary alias, the previous primary is
            // preserved under the backup alias.
            chain
                .physical_handle
                .replace_alias_logs("copy.tmp", "copy", "copy.bak", &chain.token)
                .await
                .expect("alias rotation should not fail");

            let resolved = chain
                .physical_handle
                .resolve_alias("copy", &chain.token)
                .await
                .expect("alias resolve should not fail");
            assert_eq!(resolved, next_id);

            let backup = chain
                .physical_handle
                .resolve_alias("copy.bak", &chain.token)
                .await
                .expect("backup alias resolve should not fail");
            assert_eq!(backup, current_id);

            // Crash recovery with the primary alias intact resolves to the primary.
            let recovered = chain
                .physical_handle
                .recover_alias_logs("copy.tmp", "copy", "copy.bak", &chain.token)
                .await
                .expect("alias recovery should not fail");
            assert_eq!(recovered, next_id);

            // With the primary alias lost mid-rotation, the backup is promoted.
            chain
                .physical_handle
                .remove_alias("copy", &chain.token)
                .await
                .expect("alias removal should not fail");
            let recovered = chain
                .physical_handle
                .recover_alias_logs("copy.tmp", "copy", "copy.bak", &chain.token)
                .await
                .expect("alias recovery should not fail");
            assert_eq!(recovered, current_id);

            current.close(&chain.token).await.expect("close should not fail");
            next.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}
