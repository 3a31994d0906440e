//! Transactional outbox.
//!
//! Events are written in the same database transaction as the business
//! change that produced them, then relayed to the broker by a background
//! loop with at-least-once delivery. A second loop deletes delivered events
//! once their retention has passed.
//!
//! - [`Outbox`]: event creation and the two background loops
//! - [`store::EventStore`]: persistence, with [`store::PgEventStore`] for Postgres
//! - [`publisher::Publisher`]: broker delivery, with [`publisher::AwsPublisher`] for SQS/SNS

pub mod clients;
pub mod collector;
pub mod config;
pub mod error;
pub mod models;
pub mod outbox;
pub mod publisher;
pub mod relay;
pub mod store;

pub use collector::GarbageCollector;
pub use config::{CollectorConfig, Config, OutboxConfig, RelayConfig};
pub use error::{
    ConfigError, OutboxError, OutboxResult, PublishError, StoreError, StoreResult,
    ValidationError,
};
pub use models::{BatchCreateEventCommand, CreateEventCommand, Event, EventId, TraceContext};
pub use outbox::{Outbox, OutboxHandle};
pub use relay::{CycleReport, MessageRelay, RelayState};
