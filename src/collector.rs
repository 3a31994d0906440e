use std::sync::Arc;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, Span};

use crate::config::CollectorConfig;
use crate::error::StoreResult;
use crate::store::EventStore;

/// Deletes processed events once their retention has elapsed.
pub struct GarbageCollector<S> {
    store: Arc<S>,
    config: CollectorConfig,
}

impl<S: EventStore> GarbageCollector<S> {
    pub fn new(store: Arc<S>, config: CollectorConfig) -> Self {
        Self { store, config }
    }

    /// Runs one collection and returns the number of deleted events.
    #[instrument(skip_all, fields(deleted = 0))]
    pub async fn run_cycle(&self) -> StoreResult<u64> {
        let deleted = self.store.delete_expired(self.config.retention).await?;
        Span::current().record("deleted", deleted);
        if deleted > 0 {
            info!(deleted, "Deleted expired outbox events.");
        } else {
            debug!("No expired outbox events found.");
        }
        Ok(deleted)
    }

    /// Runs collections on the configured interval until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            retention_ms = self.config.retention.as_millis() as u64,
            "Starting garbage collector..."
        );
        let mut interval = time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        result = self.run_cycle() => {
                            if let Err(e) = result {
                                error!("Error during garbage collection: {}. Retrying next tick.", e);
                            }
                        }
                    }
                }
            }
        }
        info!("Garbage collector stopped.");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::error::StoreError;
    use crate::models::{Event, EventId, NewEvent};
    use crate::store::{MemoryEventStore, MemoryTransaction};

    /// Memory store whose deletes never complete.
    struct StalledStore(MemoryEventStore);

    #[async_trait]
    impl EventStore for StalledStore {
        type Tx = MemoryTransaction;

        async fn begin(&self) -> StoreResult<Self::Tx> {
            self.0.begin().await
        }

        async fn create(&self, tx: Option<&mut Self::Tx>, event: &NewEvent) -> StoreResult<EventId> {
            self.0.create(tx, event).await
        }

        async fn batch_create(
            &self,
            tx: Option<&mut Self::Tx>,
            events: &[NewEvent],
        ) -> StoreResult<Vec<EventId>> {
            self.0.batch_create(tx, events).await
        }

        async fn fetch_unprocessed(
            &self,
            tx: Option<&mut Self::Tx>,
            limit: u32,
        ) -> StoreResult<Vec<Event>> {
            self.0.fetch_unprocessed(tx, limit).await
        }

        async fn mark_processed(
            &self,
            tx: Option<&mut Self::Tx>,
            ids: &[EventId],
        ) -> StoreResult<u64> {
            self.0.mark_processed(tx, ids).await
        }

        async fn delete_expired(&self, _retention: Duration) -> StoreResult<u64> {
            std::future::pending().await
        }
    }

    const TTL: Duration = Duration::from_secs(60);

    fn collector() -> (Arc<MemoryEventStore>, GarbageCollector<MemoryEventStore>) {
        let store = Arc::new(MemoryEventStore::new());
        let collector = GarbageCollector::new(
            store.clone(),
            CollectorConfig {
                interval: Duration::from_millis(10),
                retention: TTL,
            },
        );
        (store, collector)
    }

    async fn seed(store: &MemoryEventStore, keys: &[&str]) -> Vec<EventId> {
        let events: Vec<NewEvent> = keys
            .iter()
            .map(|key| NewEvent {
                entity_id: "entity".to_string(),
                idempotency_key: key.to_string(),
                payload: b"{}".to_vec(),
                topic: "t".to_string(),
                trace: None,
                ttl: None,
            })
            .collect();
        store.batch_create(None, &events).await.unwrap()
    }

    #[tokio::test]
    async fn deletes_only_expired_processed_events() {
        let (store, collector) = collector();
        let ids = seed(&store, &["stale", "fresh", "pending"]).await;
        store.mark_processed(None, &ids[..2]).await.unwrap();
        store.set_sent_at(ids[0], Utc::now() - chrono::Duration::seconds(120));

        assert_eq!(collector.run_cycle().await.unwrap(), 1);
        assert!(store.get(ids[0]).is_none());
        assert!(store.get(ids[1]).is_some());
        assert!(store.get(ids[2]).is_some());
    }

    #[tokio::test]
    async fn unprocessed_events_survive_any_age() {
        let (store, collector) = collector();
        seed(&store, &["a", "b"]).await;

        assert_eq!(collector.run_cycle().await.unwrap(), 0);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn store_outage_is_reported() {
        let (store, collector) = collector();
        store.set_unavailable(true);
        assert!(matches!(
            collector.run_cycle().await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn loop_collects_until_cancelled() {
        let (store, collector) = collector();
        let ids = seed(&store, &["stale"]).await;
        store.mark_processed(None, &ids).await.unwrap();
        store.set_sent_at(ids[0], Utc::now() - chrono::Duration::seconds(120));

        let token = CancellationToken::new();
        let stopper = token.clone();
        let run = collector.run(token);
        let check = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(store.is_empty());
            stopper.cancel();
        };

        tokio::time::timeout(Duration::from_secs(1), async { tokio::join!(run, check) })
            .await
            .expect("collector did not stop after cancellation");
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_interval_wait() {
        let collector = GarbageCollector::new(
            Arc::new(MemoryEventStore::new()),
            CollectorConfig {
                interval: Duration::from_secs(3600),
                retention: TTL,
            },
        );
        let token = CancellationToken::new();
        let stopper = token.clone();

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        };
        tokio::time::timeout(Duration::from_millis(150), async {
            tokio::join!(collector.run(token), cancel)
        })
        .await
        .expect("collector kept sleeping after cancellation");
    }

    #[tokio::test]
    async fn cancellation_abandons_a_stalled_delete() {
        let store = Arc::new(StalledStore(MemoryEventStore::new()));
        let ids = seed(&store.0, &["stale"]).await;
        store.mark_processed(None, &ids).await.unwrap();
        store.0.set_sent_at(ids[0], Utc::now() - chrono::Duration::seconds(120));
        let collector = GarbageCollector::new(
            store.clone(),
            CollectorConfig {
                interval: Duration::from_millis(10),
                retention: TTL,
            },
        );
        let token = CancellationToken::new();
        let stopper = token.clone();

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        };
        tokio::time::timeout(Duration::from_millis(150), async {
            tokio::join!(collector.run(token), cancel)
        })
        .await
        .expect("collector stayed blocked on the store after cancellation");
        assert!(store.0.get(ids[0]).is_some());
    }
}
