use rand::{rngs::StdRng, Rng, SeedableRng};
use uuid::Uuid;

use super::{read_region, with_temp_dir, TestChain};

const LOG_ID: Uuid = Uuid::from_u128(0x1b5a_0001);

/// In-memory mirror of the byte stream the logical log should contain.
struct StreamModel {
    bytes: Vec<u8>,
    head: i64,
}

impl StreamModel {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            head: -1,
        }
    }

    fn write_position(&self) -> i64 {
        self.bytes.len() as i64
    }

    fn length(&self) -> i64 {
        self.write_position() - self.head - 1
    }

    fn readable_range(&self) -> std::ops::Range<i64> {
        (self.head + 1)..self.write_position()
    }
}

/// Drives a random append/flush/truncate/read schedule against both the real log and
/// an in-memory model, checking the length and position invariants after every step.
/// The seed is fixed so failures replay.
#[tokio::test]
async fn random_schedule_matches_model() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let mut rng = StdRng::seed_from_u64(0x10c0_caf3);
            let mut model = StreamModel::new();

            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            for step in 0..60 {
                match rng.gen_range(0..10) {
                    // Append a random chunk and flush so it becomes readable.
                    0..=4 => {
                        let size = rng.gen_range(1..=24 * 1024);
                        let chunk: Vec<u8> =
                            (0..size).map(|_| rng.gen()).collect();
                        log.append(&chunk, &chain.token)
                            .await
                            .expect("append should not fail");
                        log.flush(&chain.token).await.expect("flush should not fail");
                        model.bytes.extend_from_slice(&chunk);
                    }
                    // Truncate the head somewhere inside the readable range.
                    5..=6 => {
                        if model.length() > 1 {
                            let range = model.readable_range();
                            let point = rng.gen_range(range.start..range.end);
                            log.truncate_head(point)
                                .await
                                .expect("truncate head should not fail");
                            model.head = model.head.max(point);
                        }
                    }
                    // Truncate the tail somewhere inside the readable range.
                    7 => {
                        if model.length() > 1 {
                            let range = model.readable_range();
                            let point = rng.gen_range(range.start + 1..range.end);
                            log.truncate_tail(point, &chain.token)
                                .await
                                .expect("truncate tail should not fail");
                            model.bytes.truncate(point as usize);
                        }
                    }
                    // Read a random readable region and compare with the model.
                    _ => {
                        if model.length() > 0 {
                            let range = model.readable_range();
                            let from = rng.gen_range(range.start..range.end);
                            let len = rng
                                .gen_range(1..=4 * 1024)
                                .min((range.end - from) as usize);
                            let actual = read_region(&log, from, len).await;
                            let expected =
                                &model.bytes[from as usize..from as usize + len];
                            assert!(
                                actual == expected,
                                "step {}: bytes at [{}, {}) diverge from the model",
                                step,
                                from,
                                from + len as i64
                            );
                        }
                    }
                }

                assert_eq!(
                    log.write_position(),
                    model.write_position(),
                    "step {}: write position diverged",
                    step
                );
                assert_eq!(
                    log.head_truncation_position(),
                    model.head,
                    "step {}: head truncation point diverged",
                    step
                );
                assert_eq!(log.length(), model.length(), "step {}: length diverged", step);
                assert!(
                    log.head_truncation_position() < log.write_position(),
                    "step {}: head must stay below the write position",
                    step
                );
            }

            // The head watermark only becomes durable inside the next sealed record;
            // land one marker record before closing, the way consumers do.
            log.append(b"!", &chain.token).await.expect("append should not fail");
            log.flush(&chain.token).await.expect("flush should not fail");
            model.bytes.push(b'!');

            // Recovery must preserve the entire surviving state.
            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;

            let chain = TestChain::open(&dir).await;
            let log = chain.open_log(LOG_ID).await;

            assert_eq!(log.write_position(), model.write_position());
            assert_eq!(log.head_truncation_position(), model.head);
            assert_eq!(log.length(), model.length());

            if model.length() > 0 {
                let range = model.readable_range();
                let actual =
                    read_region(&log, range.start, model.length() as usize).await;
                assert!(
                    actual == model.bytes[range.start as usize..],
                    "recovered bytes diverge from the model"
                );
            }

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}

/// A barrier flush and a plain flush carry the same bytes; the marker only changes the
/// record's flag, never the stream contents.
#[tokio::test]
async fn barrier_flushes_do_not_change_stream_contents() {
    with_temp_dir(|dir| {
        let dir = dir.to_path_buf();

        async move {
            let chain = TestChain::create(&dir).await;
            let log = chain.create_log(LOG_ID).await;

            log.append(b"plain", &chain.token).await.expect("append");
            log.flush(&chain.token).await.expect("flush");
            log.append(b"barrier", &chain.token).await.expect("append");
            log.flush_with_marker(&chain.token).await.expect("flush with marker");

            let actual = read_region(&log, 0, 12).await;
            assert_eq!(actual, b"plainbarrier");

            log.close(&chain.token).await.expect("close should not fail");
            chain.close().await;
        }
    })
    .await;
}
