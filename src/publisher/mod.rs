//! Broker side of the outbox.

pub mod aws;
pub mod memory;

use async_trait::async_trait;

use crate::error::PublishError;
use crate::models::{Event, EventId, TraceContext};

pub use aws::AwsPublisher;
pub use memory::MemoryPublisher;

/// Message attribute carrying the event's idempotency key.
pub const IDEMPOTENCY_KEY_ATTRIBUTE: &str = "idempotency-key";
pub const EVENT_ID_ATTRIBUTE: &str = "event-id";
pub const TRACE_ID_ATTRIBUTE: &str = "trace-id";

/// What the relay hands to the broker for one event.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    pub event_id: EventId,
    /// Orders messages of the same entity on FIFO channels.
    pub entity_id: &'a str,
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub idempotency_key: &'a str,
    pub trace: Option<&'a TraceContext>,
}

impl<'a> From<&'a Event> for Message<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            event_id: event.id,
            entity_id: &event.entity_id,
            topic: &event.topic,
            payload: &event.payload,
            idempotency_key: &event.idempotency_key,
            trace: event.trace.as_ref(),
        }
    }
}

impl Message<'_> {
    /// Attributes sent alongside the payload so consumers can dedup and correlate.
    pub fn attributes(&self) -> Vec<(String, String)> {
        let mut attributes = vec![
            (IDEMPOTENCY_KEY_ATTRIBUTE.to_string(), self.idempotency_key.to_string()),
            (EVENT_ID_ATTRIBUTE.to_string(), self.event_id.to_string()),
        ];
        if let Some(trace) = self.trace {
            if let Some(trace_id) = &trace.trace_id {
                attributes.push((TRACE_ID_ATTRIBUTE.to_string(), trace_id.clone()));
            }
            attributes.extend(trace.carrier.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        attributes
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &Message<'_>) -> Result<(), PublishError>;

    /// Publishes every message and reports one result per message, in order.
    async fn publish_batch(&self, messages: &[Message<'_>]) -> Vec<Result<(), PublishError>> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            results.push(self.publish(message).await);
        }
        results
    }
}
