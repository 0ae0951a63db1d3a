//! Outbound batching: drain up to 2,000 rendered points or 6 seconds,
//! whichever comes first, then hand the batch to the caller for a single
//! JSON-array publish.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::render::RenderedMessage;

pub const MAX_BATCH_SIZE: usize = 2_000;
pub const MAX_BATCH_INTERVAL: Duration = Duration::from_secs(6);

#[derive(Default)]
pub struct BatchBuffer {
    pending: Mutex<VecDeque<RenderedMessage>>,
    ready: Notify,
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: RenderedMessage) {
        let mut guard = self.pending.lock().expect("batch buffer lock poisoned");
        guard.push_back(message);
        if guard.len() >= MAX_BATCH_SIZE {
            self.ready.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("batch buffer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until either [`MAX_BATCH_SIZE`] messages have accumulated or
    /// [`MAX_BATCH_INTERVAL`] has elapsed, then drain and return up to
    /// `MAX_BATCH_SIZE` messages (oldest first). Returns an empty vector
    /// if nothing had accumulated by the deadline.
    pub async fn next_batch(&self) -> Vec<RenderedMessage> {
        if self.len() < MAX_BATCH_SIZE {
            let _ = tokio::time::timeout(MAX_BATCH_INTERVAL, self.ready.notified()).await;
        }
        let mut guard = self.pending.lock().expect("batch buffer lock poisoned");
        let drain_count = guard.len().min(MAX_BATCH_SIZE);
        guard.drain(..drain_count).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(uuid: &str) -> RenderedMessage {
        RenderedMessage {
            uuid: uuid.to_string(),
            measurement: "cpu_used".to_string(),
            time: 0.0,
            value: 1.0,
            item: None,
            status: None,
            check_output: None,
            event_grace_period: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_flushes_on_timeout_with_partial_contents() {
        let buffer = BatchBuffer::new();
        buffer.push(message("m1"));

        let batch = tokio::time::timeout(Duration::from_secs(7), buffer.next_batch()).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn batch_flushes_immediately_once_full() {
        let buffer = BatchBuffer::new();
        for i in 0..MAX_BATCH_SIZE {
            buffer.push(message(&i.to_string()));
        }
        let batch = tokio::time::timeout(Duration::from_millis(100), buffer.next_batch()).await.unwrap();
        assert_eq!(batch.len(), MAX_BATCH_SIZE);
    }
}
