//! Time-windowed traffic statistics: records are grouped into fixed
//! interval buckets at `hit` time, buckets are emitted once they have been
//! quiet past a grace delay, and the metric lines go to carbon.

pub mod carbon;
pub mod metrics;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::parser::Document;
pub use carbon::{CarbonError, CarbonSink};
pub use metrics::{MetricValue, StatRow};

/// How many emitted bucket keys are remembered to detect late records.
const ALREADY_SENT_CAPACITY: usize = 100;

pub fn uuid_regex() -> Regex {
    Regex::new(
        "^[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}$",
    )
    .expect("uuid pattern is valid")
}

#[derive(Default)]
struct StatState {
    buffers: HashMap<i64, Vec<StatRow>>,
    /// Wall-clock second at which each bucket last received a record.
    last_seen: HashMap<i64, i64>,
    /// Bounded FIFO of emitted bucket keys, with a set for lookup.
    already_sent: VecDeque<i64>,
    sent_lookup: HashSet<i64>,
}

/// The aggregator shared between the filler (`hit`) and the emitter task.
/// One mutex guards all window state; both sides take it briefly.
pub struct Stat {
    prefix: String,
    interval: i64,
    delay: i64,
    uuid: Regex,
    state: Mutex<StatState>,
}

impl Stat {
    pub fn new(prefix: impl Into<String>, interval_secs: u64, delay_secs: u64) -> Self {
        Self {
            prefix: prefix.into(),
            interval: interval_secs.max(1) as i64,
            delay: delay_secs as i64,
            uuid: uuid_regex(),
            state: Mutex::new(StatState::default()),
        }
    }

    pub fn interval_secs(&self) -> u64 {
        self.interval as u64
    }

    /// The bucket key for an epoch timestamp.
    pub fn bucket(&self, ts: i64) -> i64 {
        ts.div_euclid(self.interval) * self.interval
    }

    /// Record one document. Non-blocking; called on the filler task for
    /// every parsed document.
    pub fn hit(&self, doc: &Document) {
        self.hit_at(doc, Utc::now().timestamp());
    }

    /// `hit` with an explicit wall-clock second, the testable form.
    pub fn hit_at(&self, doc: &Document, now: i64) {
        let Some(row) = metrics::project(doc) else {
            return;
        };
        if row.status == 0 {
            // non-HTTP connection
            return;
        }
        let bucket = self.bucket(doc.timestamp.timestamp());

        let mut state = self.state.lock().unwrap();
        if state.sent_lookup.contains(&bucket) {
            error!(
                bucket,
                "record arrived after its bucket was emitted, statistics are partial; \
                 consider increasing the carbon delay"
            );
            return;
        }
        state.last_seen.insert(bucket, now);
        state.buffers.entry(bucket).or_default().push(row);
    }

    /// Pop every bucket that is ready at wall-clock `now`: its window has
    /// fully passed plus the grace delay, and no record has landed in it
    /// for at least the delay.
    pub fn take_ready(&self, now: i64) -> Vec<(i64, Vec<StatRow>)> {
        let mut state = self.state.lock().unwrap();
        let ready_keys: Vec<i64> = state
            .buffers
            .keys()
            .copied()
            .filter(|bucket| {
                let quiet_since = state.last_seen.get(bucket).copied().unwrap_or(i64::MIN);
                now >= bucket + self.interval + self.delay && now >= quiet_since + self.delay
            })
            .collect();
        Self::pop_buckets(&mut state, ready_keys)
    }

    /// Pop everything regardless of readiness; the shutdown path.
    pub fn take_all(&self) -> Vec<(i64, Vec<StatRow>)> {
        let mut state = self.state.lock().unwrap();
        let keys: Vec<i64> = state.buffers.keys().copied().collect();
        Self::pop_buckets(&mut state, keys)
    }

    fn pop_buckets(state: &mut StatState, mut keys: Vec<i64>) -> Vec<(i64, Vec<StatRow>)> {
        keys.sort_unstable();
        keys.into_iter()
            .filter_map(|bucket| {
                let rows = state.buffers.remove(&bucket)?;
                state.last_seen.remove(&bucket);
                if state.already_sent.len() >= ALREADY_SENT_CAPACITY {
                    if let Some(evicted) = state.already_sent.pop_front() {
                        state.sent_lookup.remove(&evicted);
                    }
                }
                state.already_sent.push_back(bucket);
                state.sent_lookup.insert(bucket);
                Some((bucket, rows))
            })
            .collect()
    }

    /// Render one bucket's metric lines in carbon's plaintext protocol.
    pub fn render(&self, bucket: i64, rows: &[StatRow]) -> String {
        let mut out = String::new();
        for (name, value) in metrics::compute(&self.prefix, rows, &self.uuid) {
            out.push_str(&format!("{} {} {}\n", name, value, bucket));
        }
        out
    }
}

/// Handle to the emitter task; dropping it does not stop the task, call
/// [`StatHandle::shutdown`] to flush remaining buckets and join.
pub struct StatHandle {
    eof: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StatHandle {
    pub async fn shutdown(self) {
        let _ = self.eof.send(true);
        let _ = self.task.await;
    }
}

/// Start the emitter: scans aligned to interval boundaries, ships ready
/// buckets, and flushes everything left when `shutdown` is called.
pub fn spawn(stat: std::sync::Arc<Stat>, mut sink: CarbonSink) -> StatHandle {
    let (eof_tx, mut eof_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        loop {
            let pause = pause_until_boundary(stat.interval_secs());
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = eof_rx.changed() => break,
            }
            let ready = stat.take_ready(Utc::now().timestamp());
            emit(&stat, ready, &mut sink).await;
        }
        let rest = stat.take_all();
        emit(&stat, rest, &mut sink).await;
        info!("statistics emitter stopped");
    });
    StatHandle { eof: eof_tx, task }
}

/// Sleep the remainder of the current interval so scans land on bucket
/// boundaries.
fn pause_until_boundary(interval_secs: u64) -> Duration {
    let interval = interval_secs as f64;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    Duration::from_secs_f64(interval - now % interval)
}

async fn emit(stat: &Stat, buckets: Vec<(i64, Vec<StatRow>)>, sink: &mut CarbonSink) {
    for (bucket, rows) in buckets {
        if rows.is_empty() {
            continue;
        }
        let payload = stat.render(bucket, &rows);
        if payload.is_empty() {
            continue;
        }
        debug!(bucket, lines = payload.lines().count(), "sending metrics");
        if let Err(error) = sink.send(&payload).await {
            error!(%error, bucket, "can't send metrics");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn doc_at(epoch: i64, status: i64) -> Document {
        let ts = FixedOffset::east_opt(0)
            .unwrap()
            .timestamp_opt(epoch, 0)
            .unwrap();
        let mut doc = Document::new(ts);
        doc.insert("status", status);
        doc.insert("host", "web1");
        doc.insert("request_time", 0.01);
        doc.insert("bytes_sent", 10);
        doc
    }

    #[test]
    fn test_bucket_is_idempotent() {
        let stat = Stat::new("nginx", 10, 5);
        for ts in [0, 4, 9, 10, 15, 123456789] {
            assert_eq!(stat.bucket(stat.bucket(ts)), stat.bucket(ts));
        }
        assert_eq!(stat.bucket(0), 0);
        assert_eq!(stat.bucket(4), 0);
        assert_eq!(stat.bucket(9), 0);
        assert_eq!(stat.bucket(10), 10);
    }

    #[test]
    fn test_readiness_requires_window_and_quiet() {
        let stat = Stat::new("nginx", 10, 5);
        // records at 0, 4 and 9 land in bucket 0; 9 lands in bucket 0 too
        stat.hit_at(&doc_at(0, 200), 0);
        stat.hit_at(&doc_at(4, 200), 4);
        stat.hit_at(&doc_at(9, 200), 9);

        // window (0..10) plus delay 5 has not passed
        assert!(stat.take_ready(14).is_empty());
        // now = 15 satisfies both: 15 >= 0+10+5 and 15 >= 9+5
        let ready = stat.take_ready(15);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, 0);
        assert_eq!(ready[0].1.len(), 3);
    }

    #[test]
    fn test_late_hit_defers_emission() {
        let stat = Stat::new("nginx", 10, 5);
        stat.hit_at(&doc_at(0, 200), 0);
        // a straggler for bucket 0 lands at wall-clock 13
        stat.hit_at(&doc_at(5, 200), 13);

        // window condition holds at 15 but the bucket was not quiet long
        assert!(stat.take_ready(15).is_empty());
        let ready = stat.take_ready(18);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].1.len(), 2);
    }

    #[test]
    fn test_record_for_emitted_bucket_discarded() {
        let stat = Stat::new("nginx", 10, 5);
        stat.hit_at(&doc_at(0, 200), 0);
        assert_eq!(stat.take_ready(100).len(), 1);

        // the bucket is burned now; a late record must not recreate it
        stat.hit_at(&doc_at(3, 200), 101);
        assert!(stat.take_ready(200).is_empty());
        assert!(stat.take_all().is_empty());
    }

    #[test]
    fn test_already_sent_window_is_bounded() {
        let stat = Stat::new("nginx", 10, 0);
        for i in 0..(ALREADY_SENT_CAPACITY as i64 + 10) {
            stat.hit_at(&doc_at(i * 10, 200), i * 10);
        }
        let emitted = stat.take_ready(i64::MAX - 1000);
        assert_eq!(emitted.len(), ALREADY_SENT_CAPACITY + 10);

        let state = stat.state.lock().unwrap();
        assert_eq!(state.already_sent.len(), ALREADY_SENT_CAPACITY);
        assert_eq!(state.sent_lookup.len(), ALREADY_SENT_CAPACITY);
        // the oldest keys were evicted from the memory window
        assert!(!state.sent_lookup.contains(&0));
    }

    #[test]
    fn test_status_zero_dropped() {
        let stat = Stat::new("nginx", 10, 0);
        stat.hit_at(&doc_at(0, 0), 0);
        assert!(stat.take_ready(i64::MAX - 1000).is_empty());
    }

    #[test]
    fn test_separate_buckets() {
        let stat = Stat::new("nginx", 10, 5);
        stat.hit_at(&doc_at(0, 200), 0);
        stat.hit_at(&doc_at(4, 200), 4);
        stat.hit_at(&doc_at(9, 200), 9);
        stat.hit_at(&doc_at(10, 200), 10);

        let ready = stat.take_ready(30);
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].0, 0);
        assert_eq!(ready[0].1.len(), 3);
        assert_eq!(ready[1].0, 10);
        assert_eq!(ready[1].1.len(), 1);
    }

    #[test]
    fn test_render_line_protocol() {
        let stat = Stat::new("nginx", 10, 5);
        let rows = [StatRow {
            status: 200,
            host: Some("web1".to_string()),
            bytes_sent: Some(5),
            ..Default::default()
        }];
        let payload = stat.render(1672628640, &rows);
        assert!(payload.contains("nginx.bytes_sent.web1.#.#.200 5 1672628640\n"));
        for line in payload.lines() {
            let fields: Vec<&str> = line.split(' ').collect();
            assert_eq!(fields.len(), 3, "malformed line {:?}", line);
        }
    }
}
