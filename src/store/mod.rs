//! Event persistence.
//!
//! Every row operation takes an optional unit of work. `None` runs the
//! statement standalone; `Some(tx)` joins the caller's transaction so the
//! event commits (or rolls back) together with the caller's own writes.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::models::{Event, EventId, NewEvent};

pub use memory::{MemoryEventStore, MemoryTransaction};
pub use postgres::PgEventStore;

/// An open transaction that can be finished explicitly.
///
/// Dropping an unfinished unit of work rolls it back.
#[async_trait]
pub trait UnitOfWork: Send + Sized {
    async fn commit(self) -> StoreResult<()>;

    async fn rollback(self) -> StoreResult<()>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    type Tx: UnitOfWork;

    /// Opens a unit of work the caller can share with its business writes.
    async fn begin(&self) -> StoreResult<Self::Tx>;

    /// Inserts one event. Duplicate idempotency keys fail with
    /// [`StoreError::ConstraintViolation`](crate::error::StoreError::ConstraintViolation).
    async fn create(&self, tx: Option<&mut Self::Tx>, event: &NewEvent) -> StoreResult<EventId>;

    /// Inserts all events with one statement and returns their ids in input order.
    async fn batch_create(
        &self,
        tx: Option<&mut Self::Tx>,
        events: &[NewEvent],
    ) -> StoreResult<Vec<EventId>>;

    /// Returns up to `limit` unprocessed events, oldest first.
    ///
    /// Inside a unit of work the returned rows stay claimed until it ends,
    /// and rows claimed by other open units of work are skipped.
    async fn fetch_unprocessed(
        &self,
        tx: Option<&mut Self::Tx>,
        limit: u32,
    ) -> StoreResult<Vec<Event>>;

    /// Sets `processed` and `sent_at` on the given events. Already processed
    /// ids are left untouched. Returns the number of rows transitioned.
    async fn mark_processed(
        &self,
        tx: Option<&mut Self::Tx>,
        ids: &[EventId],
    ) -> StoreResult<u64>;

    /// Deletes processed events whose retention has elapsed.
    ///
    /// An event expires once `now - sent_at` reaches the shorter of its own
    /// TTL and `retention`. Unprocessed events are never deleted.
    async fn delete_expired(&self, retention: Duration) -> StoreResult<u64>;
}
