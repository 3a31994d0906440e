use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{StoreError, ValidationError};

/// Store-assigned identifier of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Tracing context captured when the event was created, forwarded with the message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: Option<String>,
    /// Propagation headers such as `traceparent`.
    #[serde(default)]
    pub carrier: BTreeMap<String, String>,
}

impl TraceContext {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            carrier: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.carrier.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.trace_id.is_none() && self.carrier.is_empty()
    }

    /// Serialized form of the carrier as stored in the `trace_carrier` column.
    pub(crate) fn carrier_json(&self) -> Option<String> {
        if self.carrier.is_empty() {
            return None;
        }
        serde_json::to_string(&self.carrier).ok()
    }

    pub(crate) fn from_columns(
        trace_id: Option<String>,
        carrier: Option<&str>,
    ) -> Result<Option<Self>, serde_json::Error> {
        let carrier = match carrier {
            Some(raw) => serde_json::from_str(raw)?,
            None => BTreeMap::new(),
        };
        let context = Self { trace_id, carrier };
        Ok((!context.is_empty()).then_some(context))
    }
}

/// An event persisted in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    pub entity_id: String,
    pub idempotency_key: String,
    pub payload: Vec<u8>,
    pub topic: String,
    pub trace: Option<TraceContext>,
    /// `true` exactly when `sent_at` is set.
    pub processed: bool,
    pub sent_at: Option<DateTime<Utc>>,
    /// Retention after delivery. `None` defers to the collector's retention.
    pub ttl: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Whether the garbage collector may delete this event at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        if !self.processed {
            return false;
        }
        let Some(sent_at) = self.sent_at else {
            return false;
        };
        let window = self.ttl.map_or(retention, |ttl| ttl.min(retention));
        match (now - sent_at).to_std() {
            Ok(elapsed) => elapsed >= window,
            // sent_at lies in the future
            Err(_) => window.is_zero(),
        }
    }
}

/// An event ready to be inserted, built from a validated command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub entity_id: String,
    pub idempotency_key: String,
    pub payload: Vec<u8>,
    pub topic: String,
    pub trace: Option<TraceContext>,
    pub ttl: Option<Duration>,
}

/// Request to record one event alongside a business write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateEventCommand {
    pub entity_id: String,
    pub idempotency_key: String,
    pub payload: Vec<u8>,
    pub topic: String,
    /// Zero means "use the collector retention".
    pub ttl: Duration,
    pub trace: Option<TraceContext>,
}

/// Ordered commands inserted with a single statement.
pub type BatchCreateEventCommand = Vec<CreateEventCommand>;

impl CreateEventCommand {
    pub fn new(
        entity_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        topic: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            idempotency_key: idempotency_key.into(),
            payload: payload.into(),
            topic: topic.into(),
            ttl,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = (!trace.is_empty()).then_some(trace);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.topic.trim().is_empty() {
            return Err(ValidationError::EmptyTopic);
        }
        if self.idempotency_key.trim().is_empty() {
            return Err(ValidationError::EmptyIdempotencyKey);
        }
        if self.payload.is_empty() {
            return Err(ValidationError::EmptyPayload);
        }
        Ok(())
    }

    pub fn into_new_event(self) -> Result<NewEvent, ValidationError> {
        self.validate()?;
        Ok(NewEvent {
            entity_id: self.entity_id,
            idempotency_key: self.idempotency_key,
            payload: self.payload,
            topic: self.topic,
            trace: self.trace,
            ttl: stored_ttl(self.ttl),
        })
    }
}

/// Row shape of `outbox.events`.
#[derive(Debug, FromRow)]
pub(crate) struct EventRow {
    pub id: i64,
    pub entity_id: String,
    pub idempotency_key: String,
    pub payload: Vec<u8>,
    pub topic: String,
    pub trace_id: Option<String>,
    pub trace_carrier: Option<String>,
    pub processed: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub ttl_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let trace = TraceContext::from_columns(row.trace_id, row.trace_carrier.as_deref())
            .map_err(StoreError::query)?;
        Ok(Self {
            id: EventId(row.id),
            entity_id: row.entity_id,
            idempotency_key: row.idempotency_key,
            payload: row.payload,
            topic: row.topic,
            trace,
            processed: row.processed,
            sent_at: row.sent_at,
            ttl: row
                .ttl_ms
                .and_then(|ms| u64::try_from(ms).ok())
                .map(Duration::from_millis),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// TTL as it is persisted: zero means none, anything else is whole
/// milliseconds with sub-millisecond values rounded up to one.
fn stored_ttl(ttl: Duration) -> Option<Duration> {
    if ttl.is_zero() {
        return None;
    }
    let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
    Some(Duration::from_millis(millis))
}

/// Duration in whole milliseconds, saturating at `i64::MAX`.
pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
