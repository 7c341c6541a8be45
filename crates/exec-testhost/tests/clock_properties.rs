//! 虚拟时钟与内存事件日志的性质测试。

use std::sync::Arc;
use std::time::Duration;

use exec_testhost::{Clock, EventLog, FakeClock, InMemoryEventLog};
use futures::FutureExt;
use proptest::prelude::*;

proptest! {
    /// 任意推进序列下，`elapsed` 等于各步之和，`now` 单调不减。
    #[test]
    fn elapsed_is_sum_of_advances(steps in prop::collection::vec(0u64..10_000, 0..32)) {
        let clock = FakeClock::new();
        let mut previous = clock.now();
        for step in &steps {
            clock.advance(Duration::from_millis(*step));
            let now = clock.now();
            prop_assert!(now >= previous);
            previous = now;
        }
        let total: u64 = steps.iter().sum();
        prop_assert_eq!(clock.elapsed(), Duration::from_millis(total));
    }

    /// 睡眠恰好在累计推进量达到其时长时完成，不早也不晚。
    #[test]
    fn sleep_completes_exactly_at_deadline(
        duration_ms in 1u64..5_000,
        steps in prop::collection::vec(1u64..500, 1..64),
    ) {
        let clock = FakeClock::new();
        let mut sleep = clock.sleep(Duration::from_millis(duration_ms));
        let mut advanced = 0u64;
        for step in steps {
            clock.advance(Duration::from_millis(step));
            advanced += step;
            let ready = sleep.as_mut().now_or_never().is_some();
            prop_assert_eq!(ready, advanced >= duration_ms);
            if ready {
                break;
            }
        }
    }

    /// 事件序号在交错写入多个流时保持全局连续。
    #[test]
    fn sequences_stay_contiguous_across_streams(
        streams in prop::collection::vec(0usize..4, 1..50),
    ) {
        let log = InMemoryEventLog::new(Arc::new(FakeClock::new()));
        for stream in &streams {
            log.append(&format!("stream-{stream}"), "tick", serde_json::Value::Null).unwrap();
        }
        let sequences: Vec<u64> = log.read_all().iter().map(|record| record.sequence).collect();
        let expected: Vec<u64> = (0..streams.len() as u64).collect();
        prop_assert_eq!(sequences, expected);
        let per_stream: usize = (0..4)
            .map(|stream| log.read_stream(&format!("stream-{stream}"), 0).len())
            .sum();
        prop_assert_eq!(per_stream, streams.len());
    }
}
