//! In-process event store.
//!
//! Mirrors the Postgres semantics closely enough to exercise the relay,
//! collector and facade without a database: unique idempotency keys,
//! oldest-first fetch, claims held by open transactions, and staged writes
//! that only become visible on commit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{EventStore, UnitOfWork};
use crate::error::{StoreError, StoreResult};
use crate::models::{Event, EventId, NewEvent};

const IDEMPOTENCY_KEY_CONSTRAINT: &str = "events_idempotency_key_key";

#[derive(Debug, Default)]
struct State {
    last_id: i64,
    rows: BTreeMap<i64, Event>,
    keys: HashMap<String, i64>,
    claimed: HashSet<i64>,
    unavailable: bool,
}

impl State {
    fn ensure_available(&self) -> StoreResult<()> {
        if self.unavailable {
            return Err(StoreError::unavailable("memory store is marked unavailable"));
        }
        Ok(())
    }

    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn insert(&mut self, event: Event) {
        self.keys.insert(event.idempotency_key.clone(), event.id.0);
        self.rows.insert(event.id.0, event);
    }

    fn mark(&mut self, id: i64, at: DateTime<Utc>) -> bool {
        match self.rows.get_mut(&id) {
            Some(event) if !event.processed => {
                event.processed = true;
                event.sent_at = Some(at);
                event.updated_at = at;
                true
            }
            _ => false,
        }
    }

    fn release(&mut self, claims: &[i64]) {
        for id in claims {
            self.claimed.remove(id);
        }
    }
}

fn violation() -> StoreError {
    StoreError::ConstraintViolation {
        constraint: Some(IDEMPOTENCY_KEY_CONSTRAINT.to_string()),
    }
}

fn materialize(id: i64, event: &NewEvent, now: DateTime<Utc>) -> Event {
    Event {
        id: EventId(id),
        entity_id: event.entity_id.clone(),
        idempotency_key: event.idempotency_key.clone(),
        payload: event.payload.clone(),
        topic: event.topic.clone(),
        trace: event.trace.clone(),
        processed: false,
        sent_at: None,
        ttl: event.ttl,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    state: Arc<Mutex<State>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_owner(&self, tx: &MemoryTransaction) -> StoreResult<()> {
        if !Arc::ptr_eq(&self.state, &tx.state) {
            return Err(StoreError::query("transaction belongs to another store"));
        }
        Ok(())
    }

    /// Makes every operation fail as if the backend were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Committed events ordered by id.
    pub fn events(&self) -> Vec<Event> {
        self.lock().rows.values().cloned().collect()
    }

    pub fn get(&self, id: EventId) -> Option<Event> {
        self.lock().rows.get(&id.0).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overrides `sent_at` of a processed event, for exercising retention.
    pub fn set_sent_at(&self, id: EventId, sent_at: DateTime<Utc>) -> bool {
        match self.lock().rows.get_mut(&id.0) {
            Some(event) if event.processed => {
                event.sent_at = Some(sent_at);
                true
            }
            _ => false,
        }
    }
}

/// Staged writes and claims of an open memory transaction.
#[derive(Debug)]
pub struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    inserts: Vec<Event>,
    marks: Vec<(i64, DateTime<Utc>)>,
    claims: Vec<i64>,
    finished: bool,
}

impl MemoryTransaction {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn staged_key(&self, key: &str) -> bool {
        self.inserts.iter().any(|e| e.idempotency_key == key)
    }

    fn is_marked(&self, id: i64) -> bool {
        self.marks.iter().any(|(marked, _)| *marked == id)
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let claims = std::mem::take(&mut self.claims);
        self.lock().release(&claims);
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.finish();
    }
}

#[async_trait]
impl UnitOfWork for MemoryTransaction {
    async fn commit(mut self) -> StoreResult<()> {
        let inserts = std::mem::take(&mut self.inserts);
        let marks = std::mem::take(&mut self.marks);
        let result = {
            let mut state = self.lock();
            if let Err(err) = state.ensure_available() {
                Err(err)
            } else if inserts.iter().any(|e| state.keys.contains_key(&e.idempotency_key)) {
                // another transaction committed the same key first
                Err(violation())
            } else {
                for event in inserts {
                    state.insert(event);
                }
                for (id, at) in marks {
                    state.mark(id, at);
                }
                Ok(())
            }
        };
        self.finish();
        result
    }

    async fn rollback(mut self) -> StoreResult<()> {
        self.inserts.clear();
        self.marks.clear();
        self.finish();
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> StoreResult<Self::Tx> {
        self.lock().ensure_available()?;
        Ok(MemoryTransaction {
            state: Arc::clone(&self.state),
            inserts: Vec::new(),
            marks: Vec::new(),
            claims: Vec::new(),
            finished: false,
        })
    }

    async fn create(&self, tx: Option<&mut Self::Tx>, event: &NewEvent) -> StoreResult<EventId> {
        let ids = self.batch_create(tx, std::slice::from_ref(event)).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| StoreError::query("insert produced no id"))
    }

    async fn batch_create(
        &self,
        tx: Option<&mut Self::Tx>,
        events: &[NewEvent],
    ) -> StoreResult<Vec<EventId>> {
        if let Some(tx) = tx.as_deref() {
            self.check_owner(tx)?;
        }
        let mut state = self.lock();
        state.ensure_available()?;

        let mut seen = HashSet::new();
        for event in events {
            let key = event.idempotency_key.as_str();
            let staged = tx.as_deref().is_some_and(|tx| tx.staged_key(key));
            if !seen.insert(key) || staged || state.keys.contains_key(key) {
                return Err(violation());
            }
        }

        let now = Utc::now();
        let rows: Vec<Event> = events
            .iter()
            .map(|event| {
                let id = state.next_id();
                materialize(id, event, now)
            })
            .collect();
        let ids = rows.iter().map(|e| e.id).collect();

        match tx {
            Some(tx) => tx.inserts.extend(rows),
            None => rows.into_iter().for_each(|row| state.insert(row)),
        }
        Ok(ids)
    }

    async fn fetch_unprocessed(
        &self,
        tx: Option<&mut Self::Tx>,
        limit: u32,
    ) -> StoreResult<Vec<Event>> {
        if let Some(tx) = tx.as_deref() {
            self.check_owner(tx)?;
        }
        let mut state = self.lock();
        state.ensure_available()?;

        let own_claims: &[i64] = tx
            .as_deref()
            .map(|tx| tx.claims.as_slice())
            .unwrap_or_default();
        let mut candidates: Vec<&Event> = state
            .rows
            .values()
            .filter(|e| !e.processed)
            .filter(|e| !state.claimed.contains(&e.id.0) || own_claims.contains(&e.id.0))
            .chain(tx.as_deref().into_iter().flat_map(|tx| tx.inserts.iter()))
            .filter(|e| !tx.as_deref().is_some_and(|tx| tx.is_marked(e.id.0)))
            .collect();
        candidates.sort_by_key(|e| (e.created_at, e.id));
        let batch: Vec<Event> = candidates
            .into_iter()
            .take(limit as usize)
            .cloned()
            .collect();

        if let Some(tx) = tx {
            for event in &batch {
                if state.rows.contains_key(&event.id.0) && state.claimed.insert(event.id.0) {
                    tx.claims.push(event.id.0);
                }
            }
        }
        Ok(batch)
    }

    async fn mark_processed(
        &self,
        tx: Option<&mut Self::Tx>,
        ids: &[EventId],
    ) -> StoreResult<u64> {
        if let Some(tx) = tx.as_deref() {
            self.check_owner(tx)?;
        }
        let mut state = self.lock();
        state.ensure_available()?;
        let now = Utc::now();

        let Some(tx) = tx else {
            let marked = ids.iter().filter(|id| state.mark(id.0, now)).count();
            return Ok(marked as u64);
        };

        let mut marked = 0;
        for id in ids {
            if tx.is_marked(id.0) {
                continue;
            }
            if let Some(staged) = tx.inserts.iter_mut().find(|e| e.id == *id) {
                staged.processed = true;
                staged.sent_at = Some(now);
                staged.updated_at = now;
                tx.marks.push((id.0, now));
                marked += 1;
            } else if state.rows.get(&id.0).is_some_and(|e| !e.processed) {
                tx.marks.push((id.0, now));
                marked += 1;
            }
        }
        Ok(marked)
    }

    async fn delete_expired(&self, retention: Duration) -> StoreResult<u64> {
        let mut state = self.lock();
        state.ensure_available()?;
        let now = Utc::now();

        let expired: Vec<i64> = state
            .rows
            .values()
            .filter(|e| e.is_expired(now, retention))
            .map(|e| e.id.0)
            .collect();
        for id in &expired {
            if let Some(event) = state.rows.remove(id) {
                state.keys.remove(&event.idempotency_key);
            }
        }
        Ok(expired.len() as u64)
    }
}
