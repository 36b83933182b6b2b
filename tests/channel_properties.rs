//! Property: whatever bytes are fed into a `FileBufferedChannel` come back
//! out in the same order and undamaged, regardless of how they're chunked or
//! whether they happen to cross the disk-spill threshold along the way.

use apppool::{FileBufferedChannel, SinkResult};
use proptest::prelude::*;

async fn round_trip(chunks: Vec<Vec<u8>>) -> (Vec<u8>, Vec<u8>) {
    let mut channel = FileBufferedChannel::new();
    let mut expected = Vec::new();
    for chunk in &chunks {
        expected.extend_from_slice(chunk);
        channel.feed(chunk.clone()).expect("within the hard cap");
    }
    channel.feed(Vec::new()).expect("eof marker");

    let mut received = Vec::new();
    loop {
        channel.pump_writer().await.expect("spill write succeeds");
        let eof = channel
            .pump_reader(|buf| {
                received.extend_from_slice(buf);
                SinkResult::Accepted
            })
            .await
            .expect("no sink backpressure in this test");
        if eof {
            break;
        }
    }
    (expected, received)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Chunk sizes and counts are picked so the total can land comfortably
    /// below or well past `SPILL_THRESHOLD` (128 KiB), exercising both the
    /// in-memory-only path and the disk-spill path within one property.
    #[test]
    fn bytes_survive_the_round_trip(
        chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..20_000), 0..30)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (expected, received) = rt.block_on(round_trip(chunks));
        prop_assert_eq!(received, expected);
    }
}
