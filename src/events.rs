// Realtime events that flow from the proxy pipeline to websocket observers
//
// Each family service owns one hub. Subscribers are independent consumers
// with bounded queues; a slow subscriber is dropped rather than allowed to
// stall the pipeline. Progress deltas are coalesced so no request emits
// more than ~10 progress events per second.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Queue depth per subscriber; overflow drops the subscriber.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// Minimum spacing between progress events for one request (<= 10 Hz).
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Events delivered to `/ws/realtime` subscribers as JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    /// Ring replay sent to a new subscriber.
    Snapshot { record: Value },

    Started {
        request_id: String,
        service: String,
        channel: String,
        method: String,
        path: String,
        target_url: String,
        timestamp: DateTime<Utc>,
    },

    Progress {
        request_id: String,
        service: String,
        status: String,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_delta: Option<String>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        truncated: bool,
    },

    Completed {
        request_id: String,
        service: String,
        status_code: u16,
        duration_ms: u64,
    },

    Failed {
        request_id: String,
        service: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        duration_ms: u64,
        error: String,
    },

    /// An upstream config crossed its failure threshold and was evicted.
    ConfigExcluded {
        service: String,
        config: String,
        failures: u32,
    },
}

struct ProgressState {
    pending_delta: String,
    truncated: bool,
    last_emit: Option<Instant>,
}

struct HubInner {
    subscribers: Vec<mpsc::Sender<RealtimeEvent>>,
    progress: HashMap<String, ProgressState>,
}

pub struct RealtimeHub {
    service: &'static str,
    inner: Mutex<HubInner>,
}

impl RealtimeHub {
    pub fn new(service: &'static str) -> Self {
        Self {
            service,
            inner: Mutex::new(HubInner {
                subscribers: Vec::new(),
                progress: HashMap::new(),
            }),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }

    /// Register a subscriber, first replaying `snapshot` into its queue.
    pub fn subscribe_with(&self, snapshot: Vec<RealtimeEvent>) -> mpsc::Receiver<RealtimeEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE.max(snapshot.len() + 1));
        for event in snapshot {
            let _ = tx.try_send(event);
        }
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }

    /// Fan an event out to every subscriber. Full or closed queues drop the
    /// subscriber on the spot.
    pub fn broadcast(&self, event: RealtimeEvent) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .subscribers
            .retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Dropping slow realtime subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
    }

    pub fn request_started(
        &self,
        request_id: &str,
        channel: &str,
        method: &str,
        path: &str,
        target_url: &str,
    ) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.progress.insert(
                request_id.to_string(),
                ProgressState {
                    pending_delta: String::new(),
                    truncated: false,
                    last_emit: None,
                },
            );
        }
        self.broadcast(RealtimeEvent::Started {
            request_id: request_id.to_string(),
            service: self.service.to_string(),
            channel: channel.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            target_url: target_url.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// First upstream byte arrived: announce the STREAMING transition.
    pub fn request_streaming(&self, request_id: &str, duration_ms: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(state) = inner.progress.get_mut(request_id) {
                state.last_emit = Some(Instant::now());
            }
        }
        self.broadcast(RealtimeEvent::Progress {
            request_id: request_id.to_string(),
            service: self.service.to_string(),
            status: "STREAMING".to_string(),
            duration_ms,
            response_delta: None,
            truncated: false,
        });
    }

    /// Buffer a response delta, emitting a coalesced progress event when
    /// the rate limit allows.
    pub fn response_chunk(&self, request_id: &str, delta: &str, duration_ms: u64) {
        if delta.trim().is_empty() {
            return;
        }
        let flushed = {
            let mut inner = self.inner.lock().unwrap();
            let Some(state) = inner.progress.get_mut(request_id) else {
                return;
            };
            state.pending_delta.push_str(delta);
            let due = state
                .last_emit
                .map_or(true, |t| t.elapsed() >= PROGRESS_INTERVAL);
            if !due {
                None
            } else {
                state.last_emit = Some(Instant::now());
                Some((std::mem::take(&mut state.pending_delta), state.truncated))
            }
        };
        if let Some((delta, truncated)) = flushed {
            self.broadcast(RealtimeEvent::Progress {
                request_id: request_id.to_string(),
                service: self.service.to_string(),
                status: "STREAMING".to_string(),
                duration_ms,
                response_delta: Some(delta),
                truncated,
            });
        }
    }

    pub fn mark_truncated(&self, request_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.progress.get_mut(request_id) {
            state.truncated = true;
        }
    }

    /// Final event for a request. Any pending delta is flushed first so
    /// subscribers never lose the tail of a response.
    pub fn request_finished(
        &self,
        request_id: &str,
        status_code: Option<u16>,
        duration_ms: u64,
        error: Option<&str>,
    ) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .progress
                .remove(request_id)
                .filter(|state| !state.pending_delta.is_empty())
                .map(|state| (state.pending_delta, state.truncated))
        };
        if let Some((delta, truncated)) = pending {
            self.broadcast(RealtimeEvent::Progress {
                request_id: request_id.to_string(),
                service: self.service.to_string(),
                status: "STREAMING".to_string(),
                duration_ms,
                response_delta: Some(delta),
                truncated,
            });
        }

        match error {
            None => self.broadcast(RealtimeEvent::Completed {
                request_id: request_id.to_string(),
                service: self.service.to_string(),
                status_code: status_code.unwrap_or(0),
                duration_ms,
            }),
            Some(message) => self.broadcast(RealtimeEvent::Failed {
                request_id: request_id.to_string(),
                service: self.service.to_string(),
                status_code,
                duration_ms,
                error: message.to_string(),
            }),
        }
    }

    pub fn config_excluded(&self, config: &str, failures: u32) {
        self.broadcast(RealtimeEvent::ConfigExcluded {
            service: self.service.to_string(),
            config: config.to_string(),
            failures,
        });
    }
}

/// Generate a sortable request id: millisecond timestamp plus a process
/// counter, so concurrent requests never collide.
pub fn generate_request_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{:04}", Utc::now().timestamp_millis(), count % 10_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::Receiver<RealtimeEvent>) -> Vec<RealtimeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn lifecycle_events_are_ordered_per_request() {
        let hub = RealtimeHub::new("claude");
        let mut rx = hub.subscribe_with(Vec::new());

        hub.request_started("r1", "main", "POST", "/v1/messages", "https://up/v1/messages");
        hub.request_streaming("r1", 12);
        hub.request_finished("r1", Some(200), 80, None);

        let events = drain(&mut rx);
        assert!(matches!(events[0], RealtimeEvent::Started { .. }));
        assert!(matches!(events[1], RealtimeEvent::Progress { .. }));
        assert!(matches!(events[2], RealtimeEvent::Completed { .. }));
    }

    #[tokio::test]
    async fn rapid_chunks_coalesce_until_finish() {
        let hub = RealtimeHub::new("legacy");
        let mut rx = hub.subscribe_with(Vec::new());

        hub.request_started("r1", "main", "POST", "/v1/chat/completions", "https://up");
        drain(&mut rx);

        // First chunk emits immediately; the second lands inside the
        // coalescing window and is held back until completion.
        hub.response_chunk("r1", "hello ", 5);
        hub.response_chunk("r1", "world", 6);
        let mid = drain(&mut rx);
        assert_eq!(mid.len(), 1);

        hub.request_finished("r1", Some(200), 10, None);
        let tail = drain(&mut rx);
        assert!(matches!(
            &tail[0],
            RealtimeEvent::Progress { response_delta: Some(d), .. } if d == "world"
        ));
        assert!(matches!(tail[1], RealtimeEvent::Completed { .. }));
    }

    #[tokio::test]
    async fn failure_flushes_as_failed_event() {
        let hub = RealtimeHub::new("codex");
        let mut rx = hub.subscribe_with(Vec::new());
        hub.request_started("r1", "main", "POST", "/v1/responses", "https://up");
        hub.request_finished("r1", None, 30, Some("connect timeout"));

        let events = drain(&mut rx);
        assert!(matches!(
            events.last(),
            Some(RealtimeEvent::Failed { error, .. }) if error == "connect timeout"
        ));
    }

    #[tokio::test]
    async fn closed_subscribers_are_dropped() {
        let hub = RealtimeHub::new("claude");
        let rx = hub.subscribe_with(Vec::new());
        drop(rx);
        hub.config_excluded("main", 3);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn request_ids_are_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
    }
}
