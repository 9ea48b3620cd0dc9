//! Job progress push channel
//!
//! One broadcast topic per job id. Workers publish, the channel fans out to
//! any number of subscribers, and execution never waits on a listener.
//!
//! ```text
//! worker ──publish(status)──► ProgressChannel
//!                               │ topic[job_id] (broadcast)
//!                      ┌────────┼────────┐
//!                      ▼        ▼        ▼
//!                    sub 1    sub 2    sub N
//! ```
//!
//! Closing a topic drops its sender; subscribers drain what is buffered and
//! then see the stream end.

use crate::tasks::job::{JobId, JobStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Message pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum JobEvent {
    /// A state transition of the job
    JobUpdate {
        /// Per-topic sequence number
        sequence: u64,
        /// Status after the transition
        status: JobStatus,
    },
    /// First message of a subscription, with the current status
    SubscribeAck {
        /// Current status
        status: JobStatus,
    },
    /// The subscription could not be served
    Error {
        /// Job the error refers to
        #[serde(rename = "jobId", skip_serializing_if = "Option::is_none", default)]
        job_id: Option<String>,
        /// Machine-readable code
        code: String,
        /// Human readable message
        message: String,
    },
}

impl JobEvent {
    /// Status carried by the event, if any
    pub fn status(&self) -> Option<&JobStatus> {
        match self {
            JobEvent::JobUpdate { status, .. } | JobEvent::SubscribeAck { status } => Some(status),
            JobEvent::Error { .. } => None,
        }
    }

    /// Whether no event can follow this one
    pub fn is_final(&self) -> bool {
        match self {
            JobEvent::Error { .. } => true,
            _ => self.status().is_some_and(|s| s.state.is_terminal()),
        }
    }
}

struct JobTopic {
    sender: broadcast::Sender<JobEvent>,
    sequence: AtomicU64,
    created_at: Instant,
}

impl JobTopic {
    fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }
}

/// Counters of the channel
#[derive(Debug, Default)]
pub struct ProgressStats {
    /// Subscriptions created
    pub subscriptions_created: AtomicU64,
    /// Events delivered to at least one receiver, counted per receiver
    pub events_sent: AtomicU64,
    /// Events published while nobody listened
    pub events_dropped: AtomicU64,
}

/// Per-job broadcast topics
pub struct ProgressChannel {
    buffer: usize,
    topics: RwLock<HashMap<JobId, JobTopic>>,
    stats: ProgressStats,
}

impl std::fmt::Debug for ProgressChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressChannel")
            .field("buffer", &self.buffer)
            .field("topics", &self.active_topics())
            .finish()
    }
}

impl ProgressChannel {
    /// Channel whose topics buffer `buffer` events per subscriber
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer,
            topics: RwLock::new(HashMap::new()),
            stats: ProgressStats::default(),
        }
    }

    /// Receive every event published for `job` from now on
    pub fn subscribe(&self, job: JobId) -> broadcast::Receiver<JobEvent> {
        let mut topics = self.topics.write();
        let topic = topics.entry(job).or_insert_with(|| JobTopic::new(self.buffer));
        self.stats.subscriptions_created.fetch_add(1, Ordering::Relaxed);
        topic.sender.subscribe()
    }

    /// Publish a status; returns the number of receivers reached
    pub fn publish(&self, status: &JobStatus) -> usize {
        let topics = self.topics.read();
        let Some(topic) = topics.get(&status.job_id) else {
            self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            return 0;
        };
        let event = JobEvent::JobUpdate {
            sequence: topic.sequence.fetch_add(1, Ordering::Relaxed),
            status: status.clone(),
        };
        match topic.sender.send(event) {
            Ok(n) => {
                self.stats.events_sent.fetch_add(n as u64, Ordering::Relaxed);
                n
            },
            Err(_) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                0
            },
        }
    }

    /// Drop the topic of a finished job
    pub fn close(&self, job: JobId) {
        self.topics.write().remove(&job);
    }

    /// Receivers currently attached to a job
    pub fn subscriber_count(&self, job: JobId) -> usize {
        self.topics
            .read()
            .get(&job)
            .map_or(0, |t| t.sender.receiver_count())
    }

    /// Jobs with an open topic
    pub fn active_topics(&self) -> usize {
        self.topics.read().len()
    }

    /// Drop topics without receivers older than `max_age`
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let mut topics = self.topics.write();
        let before = topics.len();
        topics.retain(|_, t| t.sender.receiver_count() > 0 || t.created_at.elapsed() < max_age);
        before - topics.len()
    }

    /// Channel counters
    pub fn stats(&self) -> &ProgressStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FilterSpec;
    use crate::tasks::job::{ExportJob, JobKind, JobSpec, JobState};

    fn job() -> ExportJob {
        ExportJob::new(JobSpec {
            kind: JobKind::RowLevelExport,
            filter: FilterSpec::default(),
        })
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let channel = ProgressChannel::new(8);
        let mut j = job();
        let mut a = channel.subscribe(j.id);
        let mut b = channel.subscribe(j.id);
        assert_eq!(channel.subscriber_count(j.id), 2);

        j.apply(JobState::Started { retries: 0 }).unwrap();
        assert_eq!(channel.publish(&j.status()), 2);
        j.apply(JobState::Progress { percent: 50 }).unwrap();
        channel.publish(&j.status());

        for rx in [&mut a, &mut b] {
            let first = rx.recv().await.unwrap();
            assert!(matches!(first, JobEvent::JobUpdate { sequence: 0, .. }));
            let second = rx.recv().await.unwrap();
            assert_eq!(second.status().unwrap().progress, 50);
        }
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let channel = ProgressChannel::new(8);
        let mut j = job();
        let mut rx = channel.subscribe(j.id);
        j.apply(JobState::Cancelled).unwrap();
        channel.publish(&j.status());
        channel.close(j.id);

        let last = rx.recv().await.unwrap();
        assert!(last.is_final());
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
        assert_eq!(channel.active_topics(), 0);
    }

    #[test]
    fn test_publish_without_topic_is_dropped() {
        let channel = ProgressChannel::new(8);
        assert_eq!(channel.publish(&job().status()), 0);
        assert_eq!(channel.stats().events_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = JobEvent::SubscribeAck { status: job().status() };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "subscribe_ack");
        assert_eq!(value["status"]["state"]["phase"], "pending");
        let err = JobEvent::Error {
            job_id: None,
            code: "job_not_found".into(),
            message: "gone".into(),
        };
        assert_eq!(serde_json::to_value(&err).unwrap()["type"], "error");
    }

    #[test]
    fn test_cleanup_stale_keeps_subscribed_topics() {
        let channel = ProgressChannel::new(4);
        let j = job();
        let _rx = channel.subscribe(j.id);
        let orphan = job();
        drop(channel.subscribe(orphan.id));
        assert_eq!(channel.cleanup_stale(Duration::ZERO), 1);
        assert_eq!(channel.active_topics(), 1);
    }
}
