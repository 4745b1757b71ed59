use uuid::Uuid;

use super::{append_all, pattern, read_region, with_temp_dir, TestChain};
use crate::{common::SeekOrigin, logical_log::LogicalLogError};

const LOG_ID: Uuid = Uuid::from_u128(0x7204_ca7e);

#[tokio::test]
async fn tail_truncation_discards_the_suffix() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            append_all(&log, &[1u8; 1_000]).await;
            log.flush(&chain.token).await.expect("flush should not fail");

            log.truncate_tail(500, &chain.token)
                .await
                .expect("truncate tail should not fail");
            assert_eq!(log.write_position(), 500);

            append_all(&log, &[2u8; 100]).await;
            log.flush(&chain.token).await.expect("flush should not fail");
            assert_eq!(log.write_position(), 600);

            let ones = read_region(&log, 0, 500).await;
            assert_eq!(ones, vec![1u8; 500]);

            let twos = read_region(&log, 500, 100).await;
            assert_eq!(twos, vec![2u8; 100]);

            let beyond = read_region(&log, 600, 64).await;
            assert_eq!(beyond.len(), 0);

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn tail_truncation_survives_reopen() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            append_all(&log, &[1u8; 1_000]).await;
            log.flush(&chain.token).await.expect("flush should not fail");
            log.truncate_tail(500, &chain.token)
                .await
                .expect("truncate tail should not fail");

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;

            let chain = TestChain::open(&dir).await;
            let log = chain.open_log(LOG_ID).await;

            assert_eq!(log.write_position(), 500);
            let ones = read_region(&log, 0, 1_000).await;
            assert_eq!(ones, vec![1u8; 500]);

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn head_truncation_survives_reopen() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            append_all(&log, &pattern(2 * 1024 * 1024)).await;
            log.flush(&chain.token).await.expect("flush should not fail");

            log.truncate_head(128 * 1024)
                .await
                .expect("truncate head should not fail");

            // The watermark only becomes durable inside the next sealed record.
            append_all(&log, b"marker").await;
            log.flush(&chain.token).await.expect("flush should not fail");

            let write_position = log.write_position();

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;

            let chain = TestChain::open(&dir).await;
            let log = chain.open_log(LOG_ID).await;

            assert_eq!(log.head_truncation_position(), 128 * 1024);
            assert_eq!(log.write_position(), write_position);

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn reads_below_the_head_return_zero_bytes() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            append_all(&log, &pattern(64 * 1024)).await;
            log.flush(&chain.token).await.expect("flush should not fail");
            log.truncate_head(32 * 1024)
                .await
                .expect("truncate head should not fail");

            // Not an error: a read in the truncated prefix is a legal zero-byte read.
            let truncated = read_region(&log, 16 * 1024, 128).await;
            assert_eq!(truncated.len(), 0);

            let live = read_region(&log, 32 * 1024 + 1, 128).await;
            assert_eq!(live.len(), 128);

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn head_truncation_is_idempotent() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            append_all(&log, &pattern(10_000)).await;
            log.flush(&chain.token).await.expect("flush should not fail");

            log.truncate_head(5_000)
                .await
                .expect("truncate head should not fail");
            assert_eq!(log.head_truncation_position(), 5_000);

            // A second call at or below the watermark is a no-op.
            log.truncate_head(2_000)
                .await
                .expect("truncate head below watermark should not fail");
            assert_eq!(log.head_truncation_position(), 5_000);

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn tail_truncation_to_just_after_the_head_empties_the_log() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            append_all(&log, &pattern(10_000)).await;
            log.flush(&chain.token).await.expect("flush should not fail");
            log.truncate_head(4_000)
                .await
                .expect("truncate head should not fail");

            log.truncate_tail(4_001, &chain.token)
                .await
                .expect("truncate tail should not fail");

            assert_eq!(log.length(), 0);

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn tail_truncation_rejects_out_of_range_offsets() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            append_all(&log, &pattern(1_000)).await;
            log.flush(&chain.token).await.expect("flush should not fail");
            log.truncate_head(100)
                .await
                .expect("truncate head should not fail");

            // At or above the write position.
            let result = log.truncate_tail(1_000, &chain.token).await;
            assert!(matches!(
                result,
                Err(LogicalLogError::InvalidParameter { .. })
            ));

            // At or below the head truncation point.
            let result = log.truncate_tail(100, &chain.token).await;
            assert!(matches!(
                result,
                Err(LogicalLogError::InvalidParameter { .. })
            ));

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}

#[tokio::test]
async fn read_ahead_is_invalidated_by_tail_truncation() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            let data_size: i64 = 256 * 1024;
            let expected = pattern(data_size as usize);
            append_all(&log, &expected).await;
            log.flush(&chain.token).await.expect("flush should not fail");

            let stream = log
                .create_read_stream(32 * 1024)
                .await
                .expect("read stream create should not fail");
            stream
                .seek(data_size - 16 * 1024, SeekOrigin::Begin)
                .await
                .expect("seek should not fail");

            let mut first = vec![0u8; 2 * 1024];
            let read = stream
                .read(&mut first, &chain.token)
                .await
                .expect("stream read should not fail");
            assert_eq!(read, first.len());
            let read_position = stream.position().await;

            log.truncate_tail(read_position + 2 * 1024, &chain.token)
                .await
                .expect("truncate tail should not fail");

            // Exactly the surviving 2KiB come back, with the pre-truncation pattern,
            // then the stream reports end of data.
            let mut second = vec![0u8; 4 * 1024];
            let read = stream
                .read(&mut second, &chain.token)
                .await
                .expect("stream read should not fail");
            assert_eq!(read, 2 * 1024);
            let start = read_position as usize;
            assert_eq!(&second[..read], &expected[start..start + read]);

            let trailing = stream
                .read(&mut second, &chain.token)
                .await
                .expect("stream read should not fail");
            assert_eq!(trailing, 0);

            stream.close().await.expect("stream close should not fail");
            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}
