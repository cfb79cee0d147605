// Request log - per-family JSONL store with a bounded in-memory tail
//
// One record per client request is appended to ~/.clp/data/<family>.jsonl
// by a single writer task fed through a bounded queue. If the queue fills
// up, the oldest unflushed record is dropped and the next record that does
// reach the file carries `overflow: true`.
//
// The most recent records (logLimit from system settings, default 50) stay
// in an in-memory ring for list/get and for the snapshot replay sent to
// new realtime subscribers. Usage metrics from records that fall out of
// the ring are folded into data/history_usage.json so per-channel totals
// survive eviction.

use crate::config::ConfigStore;
use crate::events::{RealtimeEvent, RealtimeHub};
use crate::family::Family;
use crate::parser::{UsageMetrics, UsageRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Writer queue depth; overflow drops the oldest unflushed record.
const WRITER_QUEUE: usize = 256;

/// Cap on the response bytes persisted per record.
pub const MAX_CAPTURED_RESPONSE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl RequestStatus {
    /// Status only ever advances PENDING -> STREAMING -> {COMPLETED, FAILED}.
    pub fn can_advance_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Streaming)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Streaming, Completed)
                | (Streaming, Failed)
        )
    }
}

/// One persisted request record (one JSONL line).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub timestamp_start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_end: Option<DateTime<Utc>>,
    pub service: String,
    pub channel: String,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_original: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_final: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    pub status: RequestStatus,
    /// Base64 of the body as the client sent it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_body: Option<String>,
    /// Base64 of the body after transformation and filtering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filtered_body: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_headers: BTreeMap<String, String>,
    /// Base64 of the captured response, truncated to MAX_CAPTURED_RESPONSE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_content: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    /// Set when earlier records were lost to writer-queue overflow.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub overflow: bool,
    #[serde(default)]
    pub usage: UsageRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RequestRecord {
    pub fn new(request_id: String, family: Family, method: String, path: String) -> Self {
        Self {
            request_id,
            timestamp_start: Utc::now(),
            timestamp_end: None,
            service: family.service_name().to_string(),
            channel: String::new(),
            method,
            path,
            model_original: None,
            model_final: None,
            status_code: None,
            duration_ms: 0,
            status: RequestStatus::Pending,
            original_body: None,
            filtered_body: None,
            response_headers: BTreeMap::new(),
            response_content: None,
            truncated: false,
            overflow: false,
            usage: UsageRecord::default(),
            error_message: None,
        }
    }

    /// Advance the lifecycle, refusing regressions.
    pub fn advance(&mut self, next: RequestStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

enum WriterMsg {
    Append(Box<RequestRecord>),
    Clear,
}

#[derive(Default)]
struct WriteQueueInner {
    queue: VecDeque<WriterMsg>,
    overflowed: bool,
}

struct WriteQueue {
    inner: Mutex<WriteQueueInner>,
    notify: Notify,
}

impl WriteQueue {
    fn push(&self, msg: WriterMsg) {
        {
            let mut inner = self.inner.lock().unwrap();
            if matches!(msg, WriterMsg::Append(_)) {
                let appends = inner
                    .queue
                    .iter()
                    .filter(|m| matches!(m, WriterMsg::Append(_)))
                    .count();
                if appends >= WRITER_QUEUE {
                    if let Some(pos) = inner
                        .queue
                        .iter()
                        .position(|m| matches!(m, WriterMsg::Append(_)))
                    {
                        inner.queue.remove(pos);
                        inner.overflowed = true;
                        tracing::warn!("Request log writer queue full, dropped oldest record");
                    }
                }
            }
            inner.queue.push_back(msg);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<(WriterMsg, bool)> {
        let mut inner = self.inner.lock().unwrap();
        let msg = inner.queue.pop_front()?;
        let overflowed = std::mem::take(&mut inner.overflowed);
        Some((msg, overflowed))
    }
}

pub struct RequestLog {
    family: Family,
    store: Arc<ConfigStore>,
    hub: Arc<RealtimeHub>,
    log_path: PathBuf,
    history_path: PathBuf,
    ring: Mutex<VecDeque<RequestRecord>>,
    aggregates: Mutex<BTreeMap<String, UsageMetrics>>,
    queue: Arc<WriteQueue>,
}

impl RequestLog {
    /// Create the log and spawn its writer task.
    pub fn new(family: Family, store: Arc<ConfigStore>, hub: Arc<RealtimeHub>) -> Result<Arc<Self>> {
        let data_dir = store.data_dir();
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let log = Arc::new(Self {
            family,
            store,
            hub,
            log_path: data_dir.join(format!("{}.jsonl", family.service_name())),
            history_path: data_dir.join("history_usage.json"),
            ring: Mutex::new(VecDeque::new()),
            aggregates: Mutex::new(BTreeMap::new()),
            queue: Arc::new(WriteQueue {
                inner: Mutex::new(WriteQueueInner::default()),
                notify: Notify::new(),
            }),
        });

        let writer = log.clone();
        tokio::spawn(async move {
            writer.run_writer().await;
        });

        Ok(log)
    }

    pub fn hub(&self) -> &Arc<RealtimeHub> {
        &self.hub
    }

    /// Record a finalized request: update the ring and aggregates, then
    /// hand the record to the writer task.
    pub fn append(&self, record: RequestRecord) {
        let limit = self.store.system().log_limit.max(1);

        let evicted: Vec<RequestRecord> = {
            let mut ring = self.ring.lock().unwrap();
            ring.push_back(record.clone());
            let mut evicted = Vec::new();
            while ring.len() > limit {
                if let Some(old) = ring.pop_front() {
                    evicted.push(old);
                }
            }
            evicted
        };

        if !evicted.is_empty() {
            self.fold_into_history(&evicted);
        }

        if !record.usage.metrics.is_zero() && !record.channel.is_empty() {
            let mut aggregates = self.aggregates.lock().unwrap();
            aggregates
                .entry(record.channel.clone())
                .or_default()
                .merge(&record.usage.metrics);
        }

        self.queue.push(WriterMsg::Append(Box::new(record)));
    }

    /// The most recent records, newest last.
    pub fn list(&self, limit: usize) -> Vec<RequestRecord> {
        let ring = self.ring.lock().unwrap();
        ring.iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }

    pub fn get(&self, request_id: &str) -> Option<RequestRecord> {
        let ring = self.ring.lock().unwrap();
        ring.iter().find(|r| r.request_id == request_id).cloned()
    }

    /// Wipe the file, the ring, and the usage aggregates.
    pub fn clear(&self) {
        self.ring.lock().unwrap().clear();
        self.aggregates.lock().unwrap().clear();
        self.queue.push(WriterMsg::Clear);
    }

    /// Per-channel usage totals accumulated since start (or last clear).
    pub fn usage_aggregates(&self) -> BTreeMap<String, UsageMetrics> {
        self.aggregates.lock().unwrap().clone()
    }

    /// Register a realtime subscriber, replaying the current ring as
    /// snapshot events.
    pub fn subscribe(&self) -> tokio::sync::mpsc::Receiver<RealtimeEvent> {
        let snapshot: Vec<RealtimeEvent> = {
            let ring = self.ring.lock().unwrap();
            ring.iter()
                .filter_map(|record| serde_json::to_value(record).ok())
                .map(|record| RealtimeEvent::Snapshot { record })
                .collect()
        };
        self.hub.subscribe_with(snapshot)
    }

    async fn run_writer(&self) {
        tracing::debug!("Request log writer started: {:?}", self.log_path);
        loop {
            let Some((msg, overflowed)) = self.queue.pop() else {
                self.queue.notify.notified().await;
                continue;
            };
            match msg {
                WriterMsg::Append(mut record) => {
                    if overflowed {
                        record.overflow = true;
                    }
                    if let Err(err) = self.write_line(&record) {
                        tracing::error!("Failed to write request record: {:?}", err);
                    }
                }
                WriterMsg::Clear => {
                    if let Err(err) = fs::write(&self.log_path, b"") {
                        tracing::error!("Failed to clear request log: {}", err);
                    }
                }
            }
        }
    }

    fn write_line(&self, record: &RequestRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .context("Failed to open request log")?;
        let line = serde_json::to_string(record).context("Failed to serialize record")?;
        writeln!(file, "{}", line).context("Failed to append record")?;
        // Persistence is best-effort; a failed fsync is not a write failure
        let _ = file.sync_data();
        Ok(())
    }

    /// Fold usage from evicted records into the historical per-channel
    /// totals so they are not lost with the ring.
    fn fold_into_history(&self, evicted: &[RequestRecord]) {
        let mut history: BTreeMap<String, BTreeMap<String, UsageMetrics>> = fs::read_to_string(
            &self.history_path,
        )
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default();

        let mut changed = false;
        for record in evicted {
            if record.usage.metrics.is_zero() || record.channel.is_empty() {
                continue;
            }
            history
                .entry(record.service.clone())
                .or_default()
                .entry(record.channel.clone())
                .or_default()
                .merge(&record.usage.metrics);
            changed = true;
        }
        if !changed {
            return;
        }

        match serde_json::to_string_pretty(&history) {
            Ok(text) => {
                if let Err(err) = fs::write(&self.history_path, text) {
                    tracing::warn!("Failed to persist usage history: {}", err);
                }
            }
            Err(err) => tracing::warn!("Failed to serialize usage history: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDoc;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn log_with_limit(limit: usize) -> (TempDir, Arc<RequestLog>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConfigStore::new(dir.path()).unwrap());
        store
            .put_value(ConfigDoc::System, &json!({"logLimit": limit}))
            .unwrap();
        let hub = Arc::new(RealtimeHub::new("claude"));
        let log = RequestLog::new(Family::Claude, store, hub).unwrap();
        (dir, log)
    }

    fn record(id: &str, channel: &str, input: u64) -> RequestRecord {
        let mut record = RequestRecord::new(
            id.to_string(),
            Family::Claude,
            "POST".to_string(),
            "/v1/messages".to_string(),
        );
        record.channel = channel.to_string();
        record.usage.metrics.input = input;
        record.usage.metrics.total = input;
        record.advance(RequestStatus::Streaming);
        record.advance(RequestStatus::Completed);
        record
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn status_never_regresses() {
        let mut record = record("r", "main", 0);
        assert_eq!(record.status, RequestStatus::Completed);
        assert!(!record.advance(RequestStatus::Pending));
        assert!(!record.advance(RequestStatus::Streaming));
        assert!(!record.advance(RequestStatus::Failed));
        assert_eq!(record.status, RequestStatus::Completed);
    }

    #[test]
    fn status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&RequestStatus::Pending).unwrap(),
            "\"PENDING\""
        );
    }

    #[tokio::test]
    async fn append_then_list_and_get() {
        let (_dir, log) = log_with_limit(10);
        log.append(record("r1", "main", 5));
        log.append(record("r2", "main", 7));

        let listed = log.list(10);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].request_id, "r2");
        assert_eq!(log.get("r1").unwrap().usage.metrics.input, 5);
        assert!(log.get("missing").is_none());

        let aggregates = log.usage_aggregates();
        assert_eq!(aggregates["main"].input, 12);
    }

    #[tokio::test]
    async fn records_reach_the_jsonl_file() {
        let (dir, log) = log_with_limit(10);
        log.append(record("r1", "main", 1));

        let path = dir.path().join("data/claude.jsonl");
        wait_for(|| {
            fs::read_to_string(&path)
                .map(|text| text.lines().count() == 1)
                .unwrap_or(false)
        })
        .await;

        let line = fs::read_to_string(&path).unwrap();
        let parsed: RequestRecord = serde_json::from_str(line.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.request_id, "r1");
        assert_eq!(parsed.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn ring_eviction_folds_usage_into_history() {
        let (dir, log) = log_with_limit(1);
        log.append(record("r1", "main", 10));
        log.append(record("r2", "main", 3));

        assert_eq!(log.list(10).len(), 1);
        let history: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("data/history_usage.json")).unwrap())
                .unwrap();
        assert_eq!(history["claude"]["main"]["input"], 10);
    }

    #[tokio::test]
    async fn clear_wipes_ring_aggregates_and_file() {
        let (dir, log) = log_with_limit(10);
        log.append(record("r1", "main", 10));
        let path = dir.path().join("data/claude.jsonl");
        wait_for(|| path.exists()).await;

        log.clear();
        wait_for(|| {
            fs::read_to_string(&path)
                .map(|text| text.is_empty())
                .unwrap_or(false)
        })
        .await;
        assert!(log.list(10).is_empty());
        assert!(log.usage_aggregates().is_empty());
    }

    #[tokio::test]
    async fn subscribers_get_ring_snapshot() {
        let (_dir, log) = log_with_limit(10);
        log.append(record("r1", "main", 1));

        let mut rx = log.subscribe();
        let event = rx.try_recv().unwrap();
        match event {
            RealtimeEvent::Snapshot { record } => {
                assert_eq!(record["request_id"], "r1");
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }
}
