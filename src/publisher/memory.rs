//! Recording publisher with failure injection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Message, Publisher};
use crate::error::PublishError;
use crate::models::EventId;

/// Owned copy of a message accepted by [`MemoryPublisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub event_id: EventId,
    pub entity_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub idempotency_key: String,
    pub attributes: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct State {
    published: Vec<PublishedMessage>,
    /// Remaining forced failures per idempotency key.
    failures: HashMap<String, usize>,
    unavailable: bool,
    attempts: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPublisher {
    state: Arc<Mutex<State>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rejects the next `times` publishes of the event with this idempotency key.
    pub fn fail_next(&self, idempotency_key: impl Into<String>, times: usize) {
        self.lock().failures.insert(idempotency_key.into(), times);
    }

    /// Fails every publish with a transport error while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Publish calls received, successful or not.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, message: &Message<'_>) -> Result<(), PublishError> {
        let mut state = self.lock();
        state.attempts += 1;

        if state.unavailable {
            return Err(PublishError::Transport("broker unavailable".to_string()));
        }
        if let Some(remaining) = state.failures.get_mut(message.idempotency_key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PublishError::Rejected {
                    code: "InjectedFailure".to_string(),
                    message: format!("forced failure for {}", message.idempotency_key),
                });
            }
        }

        state.published.push(PublishedMessage {
            event_id: message.event_id,
            entity_id: message.entity_id.to_string(),
            topic: message.topic.to_string(),
            payload: message.payload.to_vec(),
            idempotency_key: message.idempotency_key.to_string(),
            attributes: message.attributes(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str) -> Message<'_> {
        Message {
            event_id: EventId(1),
            entity_id: "entity",
            topic: "t",
            payload: b"{}",
            idempotency_key: key,
            trace: None,
        }
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let publisher = MemoryPublisher::new();
        publisher.fail_next("a", 1);

        assert!(publisher.publish(&message("a")).await.is_err());
        assert!(publisher.publish(&message("a")).await.is_ok());
        assert_eq!(publisher.attempts(), 2);
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn batch_reports_each_message() {
        let publisher = MemoryPublisher::new();
        publisher.fail_next("b", 1);

        let results = publisher
            .publish_batch(&[message("a"), message("b"), message("c")])
            .await;
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(PublishError::Rejected { .. })));
        assert!(results[2].is_ok());
    }
}
