//! In-memory job queue for tests and local development.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{CorrelationId, JobMessage, JobQueue, QueueError};

/// Records every accepted message. Can be switched offline or made slow to
/// exercise degraded dispatch.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    messages: Mutex<Vec<(CorrelationId, JobMessage)>>,
    next_id: AtomicU64,
    offline: AtomicBool,
    delay_ms: AtomicU64,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every enqueue by `delay` (zero disables).
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Snapshot of accepted messages, oldest first.
    pub fn messages(&self) -> Vec<JobMessage> {
        self.messages
            .lock()
            .map(|m| m.iter().map(|(_, msg)| msg.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, message: &JobMessage) -> Result<CorrelationId, QueueError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("in-memory queue offline".to_string()));
        }

        let seq = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = CorrelationId(format!("mem-{seq}"));
        self.messages
            .lock()
            .map_err(|_| QueueError::Unavailable("in-memory queue lock poisoned".to_string()))?
            .push((id.clone(), message.clone()));
        Ok(id)
    }
}
