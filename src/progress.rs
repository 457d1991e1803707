// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Identifies one sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Category of a progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Info,
    Downloaded,
    Deleted,
    Error,
    Complete,
    Cancelled,
}

/// One line of a job's progress log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub kind: Option<EventKind>,
}

impl ProgressEvent {
    pub fn new(job_id: JobId, kind: EventKind, text: impl Into<String>) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            text: text.into(),
            kind: Some(kind),
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Per-job event log fanned out to any number of subscribers.
///
/// Every event is kept until the job's log is closed, so a subscriber that
/// joins late still sees the whole job from the first event. A log ends with
/// the event passed to [`ProgressBroadcaster::finish`].
#[derive(Debug, Clone, Default)]
pub struct ProgressBroadcaster {
    logs: Arc<Mutex<HashMap<JobId, JobLog>>>,
}

#[derive(Debug, Default)]
struct JobLog {
    history: Vec<ProgressEvent>,
    listeners: Vec<mpsc::UnboundedSender<ProgressEvent>>,
    live_subscriptions: usize,
    finished: bool,
    close_requested: bool,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobLog>> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start an empty log for a job
    pub fn open(&self, job_id: JobId) {
        self.lock().entry(job_id).or_default();
    }

    /// Append an event and forward it to current subscribers.
    ///
    /// Events for jobs that were never opened, or whose log finished or was
    /// released, are dropped.
    pub fn publish(&self, job_id: JobId, kind: EventKind, text: impl Into<String>) {
        let event = ProgressEvent::new(job_id, kind, text);
        let mut logs = self.lock();
        let Some(log) = logs.get_mut(&job_id) else {
            debug!(%job_id, "Dropping event for unknown job");
            return;
        };
        if log.finished {
            debug!(%job_id, "Dropping event for finished job");
            return;
        }
        log.push(event);
    }

    /// Publish the terminal event and end every subscriber's stream
    pub fn finish(&self, job_id: JobId, kind: EventKind, text: impl Into<String>) {
        let event = ProgressEvent::new(job_id, kind, text);
        let mut logs = self.lock();
        let Some(log) = logs.get_mut(&job_id) else {
            debug!(%job_id, "Dropping terminal event for unknown job");
            return;
        };
        if log.finished {
            return;
        }
        log.push(event);
        log.finished = true;
        log.listeners.clear();
    }

    /// Whether the job's log has ended
    pub fn is_finished(&self, job_id: JobId) -> bool {
        self.lock().get(&job_id).is_some_and(|log| log.finished)
    }

    /// Events published so far
    pub fn history(&self, job_id: JobId) -> Vec<ProgressEvent> {
        self.lock()
            .get(&job_id)
            .map(|log| log.history.clone())
            .unwrap_or_default()
    }

    /// Follow a job's log from its first event. Returns `None` for unknown jobs.
    pub fn subscribe(&self, job_id: JobId) -> Option<ProgressSubscription> {
        let mut logs = self.lock();
        let log = logs.get_mut(&job_id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        for event in &log.history {
            let _ = tx.send(event.clone());
        }
        if !log.finished {
            log.listeners.push(tx);
        }
        log.live_subscriptions += 1;

        Some(ProgressSubscription {
            job_id,
            rx,
            logs: Arc::downgrade(&self.logs),
        })
    }

    /// Release a job's log once it has finished and nobody is reading it.
    ///
    /// If subscriptions are still alive the log is released when the last one
    /// is dropped. Returns whether the log was released immediately.
    pub fn close(&self, job_id: JobId) -> bool {
        let mut logs = self.lock();
        let Some(log) = logs.get_mut(&job_id) else {
            return false;
        };

        if log.finished && log.live_subscriptions == 0 {
            logs.remove(&job_id);
            debug!(%job_id, "Released progress log");
            true
        } else {
            log.close_requested = true;
            false
        }
    }

    /// Number of jobs with a retained log
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobLog {
    fn push(&mut self, event: ProgressEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
        self.history.push(event);
    }
}

/// A live view of one job's progress log.
///
/// Yields every event since the job started and ends after the terminal event.
#[derive(Debug)]
pub struct ProgressSubscription {
    job_id: JobId,
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    logs: std::sync::Weak<Mutex<HashMap<JobId, JobLog>>>,
}

impl ProgressSubscription {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the next event; `None` once the log has ended
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Newline-terminated human readable lines, one per event
    pub fn into_lines(self) -> impl Stream<Item = String> + Send {
        self.map(|event| format!("{}\n", event.text))
    }
}

impl Stream for ProgressSubscription {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        let Some(logs) = self.logs.upgrade() else {
            return;
        };
        let mut logs = logs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(log) = logs.get_mut(&self.job_id) else {
            return;
        };

        log.live_subscriptions = log.live_subscriptions.saturating_sub(1);
        if log.close_requested && log.finished && log.live_subscriptions == 0 {
            logs.remove(&self.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(events: &[ProgressEvent]) -> Vec<&str> {
        events.iter().map(|e| e.text.as_str()).collect()
    }

    #[tokio::test]
    async fn late_subscriber_replays_history() {
        let broadcaster = ProgressBroadcaster::new();
        let job = JobId::new();
        broadcaster.open(job);

        broadcaster.publish(job, EventKind::Info, "one");
        broadcaster.publish(job, EventKind::Downloaded, "two");
        let mut sub = broadcaster.subscribe(job).unwrap();
        broadcaster.publish(job, EventKind::Deleted, "three");
        broadcaster.finish(job, EventKind::Complete, "done");

        let events: Vec<_> = (&mut sub).collect().await;
        assert_eq!(texts(&events), vec!["one", "two", "three", "done"]);
        assert_eq!(events.last().unwrap().kind, Some(EventKind::Complete));
    }

    #[tokio::test]
    async fn concurrent_subscribers_are_independent() {
        let broadcaster = ProgressBroadcaster::new();
        let job = JobId::new();
        broadcaster.open(job);

        let mut first = broadcaster.subscribe(job).unwrap();
        broadcaster.publish(job, EventKind::Info, "a");
        let mut second = broadcaster.subscribe(job).unwrap();

        assert_eq!(first.next_event().await.unwrap().text, "a");
        drop(first);

        broadcaster.publish(job, EventKind::Info, "b");
        broadcaster.finish(job, EventKind::Complete, "done");

        let events: Vec<_> = (&mut second).collect().await;
        assert_eq!(texts(&events), vec!["a", "b", "done"]);
    }

    #[tokio::test]
    async fn subscriber_after_finish_gets_full_log_and_ends() {
        let broadcaster = ProgressBroadcaster::new();
        let job = JobId::new();
        broadcaster.open(job);
        broadcaster.publish(job, EventKind::Info, "started");
        broadcaster.finish(job, EventKind::Cancelled, "cancelled");
        broadcaster.publish(job, EventKind::Info, "late");

        let lines: Vec<String> = broadcaster.subscribe(job).unwrap().into_lines().collect().await;

        assert_eq!(lines, vec!["started\n", "cancelled\n"]);
    }

    #[test]
    fn unknown_job_has_no_subscription() {
        let broadcaster = ProgressBroadcaster::new();
        assert!(broadcaster.subscribe(JobId::new()).is_none());
    }

    #[test]
    fn close_waits_for_last_subscriber() {
        let broadcaster = ProgressBroadcaster::new();
        let job = JobId::new();
        broadcaster.open(job);

        assert!(!broadcaster.close(job), "unfinished log must be kept");

        let sub = broadcaster.subscribe(job).unwrap();
        broadcaster.finish(job, EventKind::Complete, "done");
        assert!(!broadcaster.close(job));
        assert_eq!(broadcaster.len(), 1);

        drop(sub);
        assert!(broadcaster.is_empty());
    }

    #[test]
    fn events_after_release_do_not_recreate_the_log() {
        let broadcaster = ProgressBroadcaster::new();
        let job = JobId::new();
        broadcaster.open(job);
        broadcaster.finish(job, EventKind::Complete, "done");
        assert!(broadcaster.close(job));

        broadcaster.publish(job, EventKind::Info, "late");
        broadcaster.finish(job, EventKind::Error, "late failure");

        assert!(broadcaster.is_empty());
        assert!(broadcaster.subscribe(job).is_none());
        assert!(broadcaster.history(job).is_empty());
    }

    #[test]
    fn events_for_unopened_jobs_are_dropped() {
        let broadcaster = ProgressBroadcaster::new();
        let job = JobId::new();

        broadcaster.publish(job, EventKind::Info, "stray");
        broadcaster.finish(job, EventKind::Complete, "stray");

        assert_eq!(broadcaster.len(), 0);
        assert!(!broadcaster.is_finished(job));
    }

    #[test]
    fn close_releases_idle_finished_log() {
        let broadcaster = ProgressBroadcaster::new();
        let job = JobId::new();
        broadcaster.open(job);
        broadcaster.finish(job, EventKind::Error, "failed");

        assert!(broadcaster.close(job));
        assert!(broadcaster.subscribe(job).is_none());
    }
}
