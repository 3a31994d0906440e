use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPool};
use sqlx::query::{QueryAs, QueryScalar};
use sqlx::{Postgres, Transaction};

use super::{EventStore, UnitOfWork};
use crate::error::{StoreError, StoreResult};
use crate::models::{duration_millis, Event, EventId, EventRow, NewEvent};

const INSERT_EVENT: &str = r#"
    INSERT INTO outbox.events
        (entity_id, idempotency_key, payload, topic, trace_id, trace_carrier, ttl_ms)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
    RETURNING id
"#;

const INSERT_EVENTS: &str = r#"
    INSERT INTO outbox.events
        (entity_id, idempotency_key, payload, topic, trace_id, trace_carrier, ttl_ms)
    SELECT * FROM UNNEST(
        $1::text[], $2::text[], $3::bytea[], $4::text[], $5::text[], $6::text[], $7::bigint[]
    )
    RETURNING id, idempotency_key
"#;

/// Oldest first. `SKIP LOCKED` keeps rows claimed by another open
/// transaction out of this batch.
const FETCH_UNPROCESSED: &str = r#"
    SELECT id, entity_id, idempotency_key, payload, topic, trace_id, trace_carrier,
           processed, sent_at, ttl_ms, created_at, updated_at
    FROM outbox.events
    WHERE NOT processed
    ORDER BY created_at, id
    LIMIT $1
    FOR UPDATE SKIP LOCKED
"#;

const MARK_PROCESSED: &str = r#"
    UPDATE outbox.events
    SET processed = TRUE, sent_at = NOW(), updated_at = NOW()
    WHERE id = ANY($1)
        AND NOT processed
"#;

/// `LEAST` ignores a NULL `ttl_ms`, leaving the collector retention.
const DELETE_EXPIRED: &str = r#"
    DELETE FROM outbox.events
    WHERE processed
        AND sent_at <= NOW() - LEAST(ttl_ms, $1) * INTERVAL '1 millisecond'
"#;

/// Event store backed by the `outbox.events` table.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl UnitOfWork for Transaction<'static, Postgres> {
    async fn commit(self) -> StoreResult<()> {
        Transaction::commit(self).await.map_err(StoreError::from)
    }

    async fn rollback(self) -> StoreResult<()> {
        Transaction::rollback(self).await.map_err(StoreError::from)
    }
}

fn insert_query(event: &NewEvent) -> QueryScalar<'_, Postgres, i64, PgArguments> {
    let trace = event.trace.as_ref();
    sqlx::query_scalar(INSERT_EVENT)
        .bind(&event.entity_id)
        .bind(&event.idempotency_key)
        .bind(&event.payload)
        .bind(&event.topic)
        .bind(trace.and_then(|t| t.trace_id.clone()))
        .bind(trace.and_then(|t| t.carrier_json()))
        .bind(event.ttl.map(duration_millis))
}

/// Column-wise arrays for the `UNNEST` insert.
#[derive(Default)]
struct EventColumns {
    entity_ids: Vec<String>,
    idempotency_keys: Vec<String>,
    payloads: Vec<Vec<u8>>,
    topics: Vec<String>,
    trace_ids: Vec<Option<String>>,
    trace_carriers: Vec<Option<String>>,
    ttls: Vec<Option<i64>>,
}

impl EventColumns {
    fn from_events(events: &[NewEvent]) -> Self {
        let mut columns = Self::default();
        for event in events {
            let trace = event.trace.as_ref();
            columns.entity_ids.push(event.entity_id.clone());
            columns.idempotency_keys.push(event.idempotency_key.clone());
            columns.payloads.push(event.payload.clone());
            columns.topics.push(event.topic.clone());
            columns.trace_ids.push(trace.and_then(|t| t.trace_id.clone()));
            columns.trace_carriers.push(trace.and_then(|t| t.carrier_json()));
            columns.ttls.push(event.ttl.map(duration_millis));
        }
        columns
    }

    fn into_query(self) -> QueryAs<'static, Postgres, (i64, String), PgArguments> {
        sqlx::query_as(INSERT_EVENTS)
            .bind(self.entity_ids)
            .bind(self.idempotency_keys)
            .bind(self.payloads)
            .bind(self.topics)
            .bind(self.trace_ids)
            .bind(self.trace_carriers)
            .bind(self.ttls)
    }
}

fn fetch_query(limit: u32) -> QueryAs<'static, Postgres, EventRow, PgArguments> {
    sqlx::query_as(FETCH_UNPROCESSED).bind(i64::from(limit))
}

#[async_trait]
impl EventStore for PgEventStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        Ok(self.pool.begin().await?)
    }

    async fn create(&self, tx: Option<&mut Self::Tx>, event: &NewEvent) -> StoreResult<EventId> {
        let id = match tx {
            Some(tx) => insert_query(event).fetch_one(&mut **tx).await?,
            None => insert_query(event).fetch_one(&self.pool).await?,
        };
        Ok(EventId(id))
    }

    async fn batch_create(
        &self,
        tx: Option<&mut Self::Tx>,
        events: &[NewEvent],
    ) -> StoreResult<Vec<EventId>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let query = EventColumns::from_events(events).into_query();
        let rows = match tx {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };

        // RETURNING order is not guaranteed, so match rows back by key.
        let ids_by_key: HashMap<String, i64> =
            rows.into_iter().map(|(id, key)| (key, id)).collect();
        events
            .iter()
            .map(|event| {
                ids_by_key
                    .get(&event.idempotency_key)
                    .map(|id| EventId(*id))
                    .ok_or_else(|| {
                        StoreError::query(format!(
                            "batch insert returned no row for idempotency key {}",
                            event.idempotency_key
                        ))
                    })
            })
            .collect()
    }

    async fn fetch_unprocessed(
        &self,
        tx: Option<&mut Self::Tx>,
        limit: u32,
    ) -> StoreResult<Vec<Event>> {
        let rows = match tx {
            Some(tx) => fetch_query(limit).fetch_all(&mut **tx).await?,
            None => fetch_query(limit).fetch_all(&self.pool).await?,
        };
        rows.into_iter().map(Event::try_from).collect()
    }

    async fn mark_processed(
        &self,
        tx: Option<&mut Self::Tx>,
        ids: &[EventId],
    ) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let query = sqlx::query::<Postgres>(MARK_PROCESSED).bind(ids);
        let result = match tx {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, retention: Duration) -> StoreResult<u64> {
        let result = sqlx::query(DELETE_EXPIRED)
            .bind(duration_millis(retention))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
