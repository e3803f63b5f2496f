use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use tokio_util::sync::CancellationToken;

use crate::events::{EventStream, JobEvent, JobEventLog};
use crate::request::PayloadRef;
use crate::scheduler::job::{Job, JobFailure, JobResult, JobState};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// A job plus its event log and cancellation signal.
#[derive(Debug)]
pub struct JobEntry {
    pub job: Job,
    pub events: Arc<JobEventLog>,
    pub cancel: CancellationToken,
}

/// Registry of jobs known to the orchestrator.
///
/// Every state change goes through [`JobTable::transition`], which publishes
/// the matching event under the same lock so the event order always matches
/// the state order.
#[derive(Debug)]
pub struct JobTable {
    jobs: HashMap<String, JobEntry>,
    max_jobs: usize,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            max_jobs,
        }
    }

    /// Add a queued job.
    ///
    /// A full table makes room by evicting the oldest finished job. Returns
    /// None if the id is taken or every slot holds an active job.
    pub fn insert(&mut self, job: Job) -> Option<(Arc<JobEventLog>, CancellationToken)> {
        if self.jobs.contains_key(&job.id) {
            return None;
        }
        if self.jobs.len() >= self.max_jobs && !self.evict_oldest_finished() {
            return None;
        }
        let events = Arc::new(JobEventLog::new());
        let cancel = CancellationToken::new();
        events.publish(JobEvent::queued(&job.id));
        self.jobs.insert(
            job.id.clone(),
            JobEntry {
                job,
                events: events.clone(),
                cancel: cancel.clone(),
            },
        );
        Some((events, cancel))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id).map(|e| &e.job)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(id).map(|e| &mut e.job)
    }

    pub fn entry(&self, id: &str) -> Option<&JobEntry> {
        self.jobs.get(id)
    }

    pub fn subscribe(&self, id: &str) -> Option<EventStream> {
        self.jobs.get(id).map(|e| e.events.subscribe())
    }

    /// Move job `id` to `next` and publish `event`. False if the job is gone
    /// or the transition is not allowed (e.g. it was cancelled meanwhile).
    pub fn transition(&mut self, id: &str, next: JobState, event: JobEvent) -> bool {
        let Some(entry) = self.jobs.get_mut(id) else {
            return false;
        };
        if !entry.job.transition(next) {
            return false;
        }
        if let Some(progress) = event.progress {
            entry.job.advance_progress(progress);
        }
        if let Some(message) = event.message.as_ref() {
            entry.job.message = message.clone();
        } else {
            entry.job.message = next.to_string();
        }
        entry.events.publish(event);
        true
    }

    /// Publish a progress event without changing state.
    pub fn progress(&mut self, id: &str, progress: u8, message: &str) -> bool {
        let Some(entry) = self.jobs.get_mut(id) else {
            return false;
        };
        if entry.job.state.is_terminal() {
            return false;
        }
        let progress = entry.job.advance_progress(progress);
        entry.job.message = message.to_string();
        entry
            .events
            .publish(JobEvent::progress(id, progress, message));
        true
    }

    /// Record a finished step: its output becomes the intermediate payload.
    pub fn record_step(
        &mut self,
        id: &str,
        sub_command: Option<&str>,
        output: &PayloadRef,
        progress: u8,
        message: &str,
    ) -> bool {
        let Some(job) = self.get_mut(id) else {
            return false;
        };
        if job.state.is_terminal() {
            return false;
        }
        if let Some(sub) = sub_command {
            job.completed_sub_commands.push(sub.to_string());
        }
        job.intermediate_payload = Some(output.clone());
        self.progress(id, progress, message)
    }

    pub fn complete(&mut self, id: &str, result: JobResult) -> bool {
        let Some(job) = self.get_mut(id) else {
            return false;
        };
        if !job.state.can_transition_to(JobState::Completed) {
            return false;
        }
        job.result = Some(result.clone());
        self.transition(id, JobState::Completed, JobEvent::completed(id, result))
    }

    /// Fail job `id`, attaching the sequence progress reached so far.
    pub fn fail(&mut self, id: &str, failure: JobFailure) -> Option<JobFailure> {
        let job = self.get_mut(id)?;
        if !job.state.can_transition_to(JobState::Failed) {
            return None;
        }
        let failure = failure.with_progress(
            job.completed_sub_commands.clone(),
            job.intermediate_payload.clone(),
        );
        let event = JobEvent::failed(id, job.progress, &failure);
        job.failure = Some(failure.clone());
        self.transition(id, JobState::Failed, event)
            .then_some(failure)
    }

    /// Get all jobs sorted chronologically by creation time
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().map(|e| &e.job).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn jobs_in_state(&self, state: JobState) -> Vec<&Job> {
        self.jobs
            .values()
            .map(|e| &e.job)
            .filter(|j| j.state == state)
            .collect()
    }

    /// Remove jobs that finished at least `older_than` ago. Returns the number removed.
    pub fn cleanup_finished_jobs(&mut self, older_than: Duration) -> usize {
        let now = Utc::now();
        let before = self.jobs.len();
        self.jobs.retain(|_, e| {
            if !e.job.state.is_terminal() {
                return true;
            }
            let age = e.job.completed_at.and_then(|at| (now - at).to_std().ok());
            age.is_some_and(|age| age < older_than)
        });
        before - self.jobs.len()
    }

    /// Drop the finished job that finished first. False if none is finished.
    fn evict_oldest_finished(&mut self) -> bool {
        let oldest = self
            .jobs
            .values()
            .filter(|e| e.job.state.is_terminal())
            .min_by_key(|e| (e.job.completed_at, e.job.created_at))
            .map(|e| e.job.id.clone());
        match oldest {
            Some(id) => {
                tracing::debug!(job_id = %id, "Evicting finished job");
                self.jobs.remove(&id);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str) -> Job {
        Job::new(id.to_string(), "enhance".to_string(), 1)
    }

    #[test]
    fn insert_rejects_duplicates_and_overflow() {
        let mut table = JobTable::with_capacity(2);
        assert!(table.insert(job("a")).is_some());
        assert!(table.insert(job("a")).is_none());
        assert!(table.insert(job("b")).is_some());
        assert!(table.is_full());
        assert!(table.insert(job("c")).is_none());
    }

    #[test]
    fn full_table_evicts_oldest_finished() {
        let mut table = JobTable::with_capacity(2);
        table.insert(job("a"));
        table.insert(job("b"));
        table.transition("a", JobState::Cancelled, JobEvent::cancelled("a"));
        std::thread::sleep(std::time::Duration::from_millis(2));
        table.transition("b", JobState::Cancelled, JobEvent::cancelled("b"));

        assert!(table.insert(job("c")).is_some());
        assert!(!table.contains("a"));
        assert!(table.contains("b"));
        assert_eq!(table.len(), 2);

        assert!(table.insert(job("d")).is_some());
        assert!(!table.contains("b"));
        // Only active jobs remain, so there is nothing left to evict.
        assert!(table.insert(job("e")).is_none());
    }

    #[test]
    fn many_finished_jobs_cycle_through_small_table() {
        let mut table = JobTable::with_capacity(3);
        for i in 0..50 {
            let id = format!("j{}", i);
            assert!(table.insert(job(&id)).is_some(), "insert {} failed", id);
            assert!(table.transition(&id, JobState::Cancelled, JobEvent::cancelled(&id)));
        }
        assert_eq!(table.len(), 3);
        assert!(table.contains("j49"));
    }

    #[test]
    fn transition_publishes_event() {
        let mut table = JobTable::new();
        let (events, _) = table.insert(job("a")).unwrap();
        assert!(table.transition("a", JobState::Routing, JobEvent::routing("a", "local")));
        assert_eq!(table.get("a").unwrap().state, JobState::Routing);
        assert_eq!(events.history().len(), 2);
    }

    #[test]
    fn cancelled_job_rejects_further_transitions() {
        let mut table = JobTable::new();
        let (events, _) = table.insert(job("a")).unwrap();
        assert!(table.transition("a", JobState::Cancelled, JobEvent::cancelled("a")));
        assert!(!table.transition("a", JobState::Routing, JobEvent::routing("a", "x")));
        assert!(!table.progress("a", 50, "late"));
        assert_eq!(events.history().len(), 2);
    }

    #[test]
    fn failure_carries_completed_steps() {
        use crate::error::ErrorCode;

        let mut table = JobTable::new();
        let mut seq = job("a");
        seq.total_steps = 3;
        table.insert(seq);
        table.transition("a", JobState::Routing, JobEvent::routing("a", "local"));
        table.transition("a", JobState::Executing, JobEvent::progress("a", 0, "running"));
        table.record_step("a", Some("s1"), &PayloadRef::new("out1"), 33, "s1 done");

        let failure = table
            .fail(
                "a",
                JobFailure {
                    code: ErrorCode::UpstreamFailure,
                    message: "boom".into(),
                    transient: false,
                    completed_sub_commands: Vec::new(),
                    last_payload: None,
                },
            )
            .unwrap();
        assert_eq!(failure.completed_sub_commands, vec!["s1".to_string()]);
        assert_eq!(failure.last_payload, Some(PayloadRef::new("out1")));
        assert_eq!(table.get("a").unwrap().progress, 33);
        assert!(table.fail("a", failure).is_none());
    }

    #[test]
    fn cleanup_removes_only_finished() {
        let mut table = JobTable::new();
        table.insert(job("a"));
        table.insert(job("b"));
        table.transition("a", JobState::Cancelled, JobEvent::cancelled("a"));
        assert_eq!(table.cleanup_finished_jobs(Duration::from_secs(3600)), 0);
        assert_eq!(table.cleanup_finished_jobs(Duration::ZERO), 1);
        assert!(table.contains("b"));
        assert_eq!(table.jobs_in_state(JobState::Queued).len(), 1);
    }
}
