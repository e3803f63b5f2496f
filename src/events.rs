//! Per-job lifecycle event stream.
//!
//! The orchestrator is the only producer. Every event is appended to the
//! job's history and broadcast to live subscribers; a subscriber first
//! replays the history, then follows live events until the terminal one.
//! A subscriber that falls behind the live buffer catches up from the
//! history, so no event is ever skipped.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;

use crate::error::ErrorCode;
use crate::scheduler::job::{JobFailure, JobResult};

const LIVE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Queued,
    Routing,
    Progress,
    Completed,
    Failed,
    Cancelled,
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::Completed | EventKind::Failed | EventKind::Cancelled
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Queued => write!(f, "queued"),
            EventKind::Routing => write!(f, "routing"),
            EventKind::Progress => write!(f, "progress"),
            EventKind::Completed => write!(f, "completed"),
            EventKind::Failed => write!(f, "failed"),
            EventKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_sub_commands: Option<Vec<String>>,
}

impl JobEvent {
    fn bare(kind: EventKind, job_id: &str) -> Self {
        Self {
            kind,
            job_id: job_id.to_string(),
            progress: None,
            message: None,
            result: None,
            error: None,
            code: None,
            completed_sub_commands: None,
        }
    }

    pub fn queued(job_id: &str) -> Self {
        Self {
            progress: Some(0),
            ..Self::bare(EventKind::Queued, job_id)
        }
    }

    pub fn routing(job_id: &str, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare(EventKind::Routing, job_id)
        }
    }

    pub fn progress(job_id: &str, progress: u8, message: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            message: Some(message.into()),
            ..Self::bare(EventKind::Progress, job_id)
        }
    }

    pub fn completed(job_id: &str, result: JobResult) -> Self {
        Self {
            progress: Some(100),
            result: Some(result),
            ..Self::bare(EventKind::Completed, job_id)
        }
    }

    pub fn failed(job_id: &str, progress: u8, failure: &JobFailure) -> Self {
        Self {
            progress: Some(progress),
            message: Some(failure.message.clone()),
            error: Some(failure.message.clone()),
            code: Some(failure.code),
            completed_sub_commands: Some(failure.completed_sub_commands.clone()),
            ..Self::bare(EventKind::Failed, job_id)
        }
    }

    pub fn cancelled(job_id: &str) -> Self {
        Self {
            message: Some("cancelled before execution".to_string()),
            code: Some(ErrorCode::Cancelled),
            ..Self::bare(EventKind::Cancelled, job_id)
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

struct LogInner {
    history: Vec<JobEvent>,
    /// Dropped after the terminal event so live streams end. Each live
    /// event carries its index in `history`.
    live: Option<broadcast::Sender<(usize, JobEvent)>>,
}

/// History plus live fan-out for one job.
pub struct JobEventLog {
    inner: Mutex<LogInner>,
}

impl JobEventLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            inner: Mutex::new(LogInner {
                history: Vec::new(),
                live: Some(tx),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event. Events after the terminal one are ignored.
    pub fn publish(&self, event: JobEvent) -> bool {
        let mut inner = self.lock();
        let Some(live) = inner.live.as_ref() else {
            return false;
        };
        let index = inner.history.len();
        // No subscribers is fine; history still records the event.
        let _ = live.send((index, event.clone()));
        let terminal = event.kind.is_terminal();
        inner.history.push(event);
        if terminal {
            inner.live = None;
        }
        true
    }

    pub fn history(&self) -> Vec<JobEvent> {
        self.lock().history.clone()
    }

    /// Events from index `from` on.
    fn history_from(&self, from: usize) -> Vec<JobEvent> {
        self.lock().history.get(from..).map(<[JobEvent]>::to_vec).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().live.is_none()
    }

    /// Replay everything published so far, then follow live events.
    pub fn subscribe(self: &Arc<Self>) -> EventStream {
        let inner = self.lock();
        let pending: VecDeque<JobEvent> = inner.history.iter().cloned().collect();
        let next = inner.history.len();
        let live = inner
            .live
            .as_ref()
            .map(|tx| BroadcastStream::new(tx.subscribe()));
        drop(inner);
        Box::pin(Subscription {
            log: self.clone(),
            pending,
            next,
            live,
        })
    }
}

/// One subscriber's position in a job's events.
struct Subscription {
    log: Arc<JobEventLog>,
    /// Events ready to hand out, in order.
    pending: VecDeque<JobEvent>,
    /// History index of the next event not yet queued in `pending`.
    next: usize,
    live: Option<BroadcastStream<(usize, JobEvent)>>,
}

impl Subscription {
    fn catch_up(&mut self) {
        let missed = self.log.history_from(self.next);
        self.next += missed.len();
        self.pending.extend(missed);
    }
}

impl Stream for Subscription {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<JobEvent>> {
        let this = &mut *self;
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            let Some(live) = this.live.as_mut() else {
                return Poll::Ready(None);
            };
            match Pin::new(live).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok((index, event)))) => {
                    if index == this.next {
                        this.next += 1;
                        return Poll::Ready(Some(event));
                    }
                    if index > this.next {
                        this.catch_up();
                    }
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                    tracing::debug!(missed, "Event subscriber lagged, replaying from history");
                    this.catch_up();
                }
                Poll::Ready(None) => {
                    // Publisher closed; the history now holds everything.
                    this.live = None;
                    this.catch_up();
                }
            }
        }
    }
}

impl Default for JobEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEventLog")
            .field("events", &self.history().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::PayloadRef;
    use tokio_stream::StreamExt;
    use crate::scheduler::job::ExecutionMode;

    fn result() -> JobResult {
        JobResult {
            payload_ref: PayloadRef::new("out"),
            cached: false,
            mode: ExecutionMode::Local,
            model_used: "m".into(),
        }
    }

    #[tokio::test]
    async fn late_subscriber_replays_history() {
        let log = Arc::new(JobEventLog::new());
        log.publish(JobEvent::queued("j"));
        log.publish(JobEvent::completed("j", result()));

        let events: Vec<JobEvent> = log.subscribe().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, EventKind::Completed);
    }

    #[tokio::test]
    async fn live_subscriber_sees_events_until_terminal() {
        let log = Arc::new(JobEventLog::new());
        log.publish(JobEvent::queued("j"));
        let stream = log.subscribe();

        log.publish(JobEvent::routing("j", "local"));
        log.publish(JobEvent::completed("j", result()));

        let kinds: Vec<EventKind> = stream.map(|e| e.kind).collect().await;
        assert_eq!(
            kinds,
            vec![EventKind::Queued, EventKind::Routing, EventKind::Completed]
        );
    }

    #[tokio::test]
    async fn lagging_subscriber_misses_nothing() {
        let log = Arc::new(JobEventLog::new());
        log.publish(JobEvent::queued("j"));
        let stream = log.subscribe();

        let steps = LIVE_CAPACITY * 3;
        for step in 0..steps {
            log.publish(JobEvent::progress("j", (step % 100) as u8, format!("step {}", step)));
        }
        log.publish(JobEvent::completed("j", result()));

        let events: Vec<JobEvent> = stream.collect().await;
        assert_eq!(events.len(), steps + 2);
        assert_eq!(events, log.history());
    }

    #[tokio::test]
    async fn subscriber_polled_midway_keeps_order() {
        let log = Arc::new(JobEventLog::new());
        let mut stream = log.subscribe();

        log.publish(JobEvent::queued("j"));
        assert_eq!(stream.next().await.map(|e| e.kind), Some(EventKind::Queued));
        for step in 0..LIVE_CAPACITY + 10 {
            log.publish(JobEvent::progress("j", 1, format!("step {}", step)));
        }
        log.publish(JobEvent::cancelled("j"));

        let rest: Vec<JobEvent> = stream.collect().await;
        assert_eq!(rest.len(), LIVE_CAPACITY + 11);
        assert_eq!(rest[0].message.as_deref(), Some("step 0"));
        assert_eq!(rest.last().map(|e| e.kind), Some(EventKind::Cancelled));
    }

    #[test]
    fn nothing_after_terminal() {
        let log = JobEventLog::new();
        assert!(log.publish(JobEvent::cancelled("j")));
        assert!(!log.publish(JobEvent::progress("j", 50, "late")));
        assert!(log.is_closed());
        assert_eq!(log.history().len(), 1);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let json = serde_json::to_value(JobEvent::queued("j1")).unwrap();
        assert_eq!(json["type"], "queued");
        assert_eq!(json["jobId"], "j1");
        assert!(json.get("error").is_none());
    }
}
