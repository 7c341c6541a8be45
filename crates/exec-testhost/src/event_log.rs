use std::{fmt, sync::Arc, time::Instant};

use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{clock::Clock, error::EventLogError};

/// 一条已追加的事件记录。
///
/// - `sequence`：全局序号，从 0 开始严格递增；
/// - `stream`：事件所属的流（通常是聚合或执行单元标识）；
/// - `recorded_at`：由宿主注入的 [`Clock`] 给出的时间点，配合 `FakeClock` 可精确断言。
#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    pub sequence: u64,
    pub stream: String,
    pub kind: String,
    pub payload: Value,
    pub recorded_at: Instant,
}

impl EventRecord {
    /// 将负载反序列化为具体类型。
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EventLogError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// 事件日志抽象，执行服务的持久化事件日志在测试中以 [`InMemoryEventLog`] 替身出现。
///
/// # 契约说明（What）
/// - `append` 原子地分配序号并写入，返回写入后的完整记录；
/// - `read_stream` 按追加顺序返回某个流中 `sequence >= from_sequence` 的记录；
/// - 实现需满足 `Send + Sync`，以 `dyn EventLog` 为键登记到宿主。
pub trait EventLog: Send + Sync + 'static {
    fn append(&self, stream: &str, kind: &str, payload: Value)
    -> Result<EventRecord, EventLogError>;

    fn read_stream(&self, stream: &str, from_sequence: u64) -> Vec<EventRecord>;

    fn read_all(&self) -> Vec<EventRecord>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl dyn EventLog {
    /// 序列化任意负载后追加。
    pub fn append_json<T: Serialize + ?Sized>(
        &self,
        stream: &str,
        kind: &str,
        payload: &T,
    ) -> Result<EventRecord, EventLogError> {
        let value = serde_json::to_value(payload)?;
        self.append(stream, kind, value)
    }
}

/// `InMemoryEventLog` 以内存向量替代真实的持久化事件日志。
///
/// # 教案级注释
/// - **意图 (Why)**：让被测组件照常“写日志”，测试再回读断言，无需外部存储；
/// - **实现策略 (How)**：
///   - `RwLock<Vec<EventRecord>>` 保存全部记录，写入时在同一把锁内分配序号，保证序号与存储顺序一致；
///   - 时间戳取自构造时注入的时钟，默认与宿主共享同一个 `FakeClock`；
/// - **契约 (What)**：设置容量后，写满即返回 [`EventLogError::CapacityExceeded`]，已有记录不受影响；
/// - **风险提示 (Trade-offs)**：读取接口返回克隆副本，适合测试规模的数据量，不适合压测场景。
pub struct InMemoryEventLog {
    clock: Arc<dyn Clock>,
    capacity: Option<usize>,
    records: RwLock<Vec<EventRecord>>,
}

impl InMemoryEventLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            capacity: None,
            records: RwLock::new(Vec::new()),
        }
    }

    /// 限定最多保存 `capacity` 条记录。
    pub fn with_capacity_limit(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new(clock)
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl fmt::Debug for InMemoryEventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventLog")
            .field("capacity", &self.capacity)
            .field("len", &self.records.read().len())
            .finish()
    }
}

impl EventLog for InMemoryEventLog {
    fn append(
        &self,
        stream: &str,
        kind: &str,
        payload: Value,
    ) -> Result<EventRecord, EventLogError> {
        let mut records = self.records.write();
        if let Some(capacity) = self.capacity
            && records.len() >= capacity
        {
            return Err(EventLogError::CapacityExceeded { capacity });
        }

        let record = EventRecord {
            sequence: records.len() as u64,
            stream: stream.to_owned(),
            kind: kind.to_owned(),
            payload,
            recorded_at: self.clock.now(),
        };
        records.push(record.clone());
        tracing::debug!(sequence = record.sequence, stream, kind, "event appended");
        Ok(record)
    }

    fn read_stream(&self, stream: &str, from_sequence: u64) -> Vec<EventRecord> {
        self.records
            .read()
            .iter()
            .filter(|record| record.stream == stream && record.sequence >= from_sequence)
            .cloned()
            .collect()
    }

    fn read_all(&self) -> Vec<EventRecord> {
        self.records.read().clone()
    }

    fn len(&self) -> usize {
        self.records.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct JobStarted {
        job: String,
        attempt: u32,
    }

    #[test]
    fn sequences_are_global_and_streams_keep_order() {
        let log = InMemoryEventLog::new(Arc::new(FakeClock::new()));
        log.append("job-a", "started", Value::Null).unwrap();
        log.append("job-b", "started", Value::Null).unwrap();
        log.append("job-a", "finished", Value::Null).unwrap();

        let job_a: Vec<(u64, String)> = log
            .read_stream("job-a", 0)
            .into_iter()
            .map(|record| (record.sequence, record.kind))
            .collect();
        assert_eq!(job_a, vec![(0, "started".into()), (2, "finished".into())]);
        assert_eq!(log.read_stream("job-a", 1).len(), 1);
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn append_survives_a_saturated_clock() {
        let clock = FakeClock::new();
        let log = InMemoryEventLog::new(Arc::new(clock.clone()));
        clock.advance(Duration::MAX);

        let record = log.append("s", "late", Value::Null).unwrap();
        assert_eq!(record.recorded_at, clock.now());
    }

    #[test]
    fn timestamps_follow_the_injected_clock() {
        let clock = FakeClock::new();
        let log = InMemoryEventLog::new(Arc::new(clock.clone()));
        let first = log.append("s", "a", Value::Null).unwrap();
        clock.advance(Duration::from_secs(30));
        let second = log.append("s", "b", Value::Null).unwrap();
        assert_eq!(
            second.recorded_at - first.recorded_at,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn capacity_limit_rejects_further_appends() {
        let log = InMemoryEventLog::with_capacity_limit(Arc::new(FakeClock::new()), 1);
        log.append("s", "a", Value::Null).unwrap();
        let error = log.append("s", "b", Value::Null).unwrap_err();
        assert!(matches!(error, EventLogError::CapacityExceeded { capacity: 1 }));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn json_payload_roundtrips_through_dyn_log() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new(Arc::new(FakeClock::new())));
        let event = JobStarted {
            job: "reindex".into(),
            attempt: 2,
        };
        let record = log.append_json("jobs", "job_started", &event).unwrap();
        assert_eq!(record.decode::<JobStarted>().unwrap(), event);
    }
}
