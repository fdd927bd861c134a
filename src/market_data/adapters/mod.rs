// Boundary with the external connection layer: sources push raw bytes, the
// pipeline never performs network I/O itself.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::queue::{BoundedQueue, PushOutcome};
use crate::engine::types::{now_ms, RawMessage};

pub mod fix;
pub mod json_path;

/// Producer side of a connection node's inbox. Cheap to clone and safe to use
/// from any thread or task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    source_id: Arc<str>,
    inbox: Arc<BoundedQueue<RawMessage>>,
}

impl ConnectionHandle {
    pub fn new(source_id: &str, inbox: Arc<BoundedQueue<RawMessage>>) -> Self {
        Self { source_id: Arc::from(source_id), inbox }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn push(&self, payload: impl Into<Vec<u8>>, arrival_ms: u64) -> PushOutcome {
        let outcome = self.inbox.push(RawMessage::new(self.source_id.as_ref(), payload, arrival_ms));
        match outcome {
            PushOutcome::Evicted => {
                metrics::counter!("mdpipe_inbox_overflow_total", "source" => self.source_id.to_string()).increment(1);
                debug!(source = %self.source_id, "Inbox full, dropped oldest raw message");
            }
            PushOutcome::Closed => warn!(source = %self.source_id, "Push to closed connection"),
            PushOutcome::Accepted => {}
        }
        outcome
    }

    pub fn push_now(&self, payload: impl Into<Vec<u8>>) -> PushOutcome {
        self.push(payload, now_ms())
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

#[async_trait::async_trait]
pub trait ConnectionSource: Send + Sync {
    fn source_id(&self) -> &str;

    // Deliver messages into the handle until the source is exhausted or the handle closes.
    async fn spawn(&self, handle: ConnectionHandle);
}

/// Replays a fixed list of payloads, optionally paced. Used for recorded
/// sessions and tests.
pub struct ReplaySource {
    pub source_id: String,
    pub payloads: Vec<String>,
    pub pace: Option<Duration>,
}

impl ReplaySource {
    pub fn new(source_id: &str, payloads: Vec<String>) -> Self {
        Self { source_id: source_id.to_string(), payloads, pace: None }
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }
}

#[async_trait::async_trait]
impl ConnectionSource for ReplaySource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn spawn(&self, handle: ConnectionHandle) {
        for payload in &self.payloads {
            if handle.push_now(payload.as_bytes()) == PushOutcome::Closed {
                break;
            }
            match self.pace {
                Some(pace) => tokio::time::sleep(pace).await,
                None => tokio::task::yield_now().await,
            }
        }
        debug!(source = %self.source_id, count = self.payloads.len(), "Replay finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replay_source_fills_inbox() {
        let inbox = Arc::new(BoundedQueue::new(16));
        let handle = ConnectionHandle::new("venue-a", Arc::clone(&inbox));
        let source = ReplaySource::new("venue-a", vec!["one".into(), "two".into()]);
        source.spawn(handle).await;

        let drained = inbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].source_id, "venue-a");
        assert_eq!(drained[1].payload, b"two".to_vec());
    }

    #[tokio::test]
    async fn test_replay_stops_on_closed_inbox() {
        let inbox = Arc::new(BoundedQueue::new(16));
        inbox.close();
        let handle = ConnectionHandle::new("venue-a", Arc::clone(&inbox));
        ReplaySource::new("venue-a", vec!["one".into()]).spawn(handle).await;
        assert!(inbox.is_empty());
    }
}
