use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Span};

use crate::config::RelayConfig;
use crate::error::StoreResult;
use crate::models::EventId;
use crate::publisher::{Message, Publisher};
use crate::store::{EventStore, UnitOfWork};

/// Phase of the relay within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayState {
    Idle = 0,
    Polling = 1,
    Publishing = 2,
    Marking = 3,
}

impl RelayState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Polling,
            2 => Self::Publishing,
            3 => Self::Marking,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Publishing => "publishing",
            Self::Marking => "marking",
        };
        f.write_str(name)
    }
}

/// Counts of one relay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
}

/// Publishes unprocessed events and marks the ones the broker accepted.
pub struct MessageRelay<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    config: RelayConfig,
    state: AtomicU8,
}

impl<S, P> MessageRelay<S, P>
where
    S: EventStore,
    P: Publisher,
{
    pub fn new(store: Arc<S>, publisher: Arc<P>, config: RelayConfig) -> Self {
        Self {
            store,
            publisher,
            config,
            state: AtomicU8::new(RelayState::Idle as u8),
        }
    }

    pub fn state(&self) -> RelayState {
        RelayState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn enter(&self, state: RelayState) {
        self.state.store(state as u8, Ordering::Release);
        debug!(%state, "Relay state changed.");
    }

    /// Runs one fetch → publish → mark cycle inside a single unit of work.
    ///
    /// The fetched rows stay claimed until the unit of work commits, so an
    /// abandoned cycle leaves them unprocessed for the next one.
    #[instrument(skip_all, fields(fetched = 0, published = 0, failed = 0))]
    pub async fn run_cycle(&self) -> StoreResult<CycleReport> {
        let result = self.cycle().await;
        self.enter(RelayState::Idle);
        result
    }

    async fn cycle(&self) -> StoreResult<CycleReport> {
        self.enter(RelayState::Polling);
        let mut tx = self.store.begin().await?;
        let events = self
            .store
            .fetch_unprocessed(Some(&mut tx), self.config.batch_size)
            .await?;

        let mut report = CycleReport {
            fetched: events.len(),
            ..CycleReport::default()
        };
        if events.is_empty() {
            tx.rollback().await?;
            debug!("No unprocessed events found.");
            return Ok(report);
        }
        Span::current().record("fetched", report.fetched);

        self.enter(RelayState::Publishing);
        let messages: Vec<Message<'_>> = events.iter().map(Message::from).collect();
        let results = self.publisher.publish_batch(&messages).await;

        let mut delivered: Vec<EventId> = Vec::with_capacity(events.len());
        for (message, result) in messages.iter().zip(results) {
            match result {
                Ok(()) => delivered.push(message.event_id),
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        event_id = %message.event_id,
                        topic = message.topic,
                        error = %e,
                        "Failed to publish event. It will be retried next cycle."
                    );
                }
            }
        }
        // a publisher that reports fewer results than messages
        report.failed += messages.len().saturating_sub(delivered.len() + report.failed);
        report.published = delivered.len();
        Span::current().record("published", report.published);
        Span::current().record("failed", report.failed);

        self.enter(RelayState::Marking);
        self.store.mark_processed(Some(&mut tx), &delivered).await?;
        tx.commit().await?;

        Ok(report)
    }

    /// Runs cycles on the configured interval until `token` is cancelled.
    ///
    /// An in-flight cycle is abandoned on cancellation.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting message relay..."
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
                        result = self.run_cycle() => match result {
                            Ok(report) if report.fetched > 0 => {
                                info!(
                                    published = report.published,
                                    failed = report.failed,
                                    "Relayed outbox events."
                                );
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!("Error during relay cycle: {}. Retrying next tick.", e);
                            }
                        },
                    }
                }
            }
        }
        self.enter(RelayState::Idle);
        info!("Message relay stopped.");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{PublishError, StoreError};
    use crate::models::NewEvent;
    use crate::publisher::MemoryPublisher;
    use crate::store::MemoryEventStore;

    /// Broker call that never completes.
    struct StalledPublisher;

    #[async_trait]
    impl Publisher for StalledPublisher {
        async fn publish(&self, _message: &Message<'_>) -> Result<(), PublishError> {
            std::future::pending().await
        }
    }

    fn relay(
        batch_size: u32,
    ) -> (
        Arc<MemoryEventStore>,
        Arc<MemoryPublisher>,
        MessageRelay<MemoryEventStore, MemoryPublisher>,
    ) {
        let store = Arc::new(MemoryEventStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let relay = MessageRelay::new(
            store.clone(),
            publisher.clone(),
            RelayConfig {
                batch_size,
                interval: Duration::from_millis(10),
            },
        );
        (store, publisher, relay)
    }

    fn new_event(key: &str) -> NewEvent {
        NewEvent {
            entity_id: "entity".to_string(),
            idempotency_key: key.to_string(),
            payload: format!(r#"{{"key": "{key}"}}"#).into_bytes(),
            topic: "t".to_string(),
            trace: None,
            ttl: None,
        }
    }

    async fn seed(store: &MemoryEventStore, count: usize) -> Vec<EventId> {
        let events: Vec<NewEvent> = (0..count).map(|i| new_event(&format!("key-{i}"))).collect();
        store.batch_create(None, &events).await.unwrap()
    }

    #[tokio::test]
    async fn empty_cycle_is_a_no_op() {
        let (_store, publisher, relay) = relay(10);
        let report = relay.run_cycle().await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(publisher.attempts(), 0);
        assert_eq!(relay.state(), RelayState::Idle);
    }

    #[tokio::test]
    async fn cycle_marks_published_events() {
        let (store, publisher, relay) = relay(10);
        let ids = seed(&store, 2).await;

        let report = relay.run_cycle().await.unwrap();
        assert_eq!(
            report,
            CycleReport {
                fetched: 2,
                published: 2,
                failed: 0
            }
        );
        for id in ids {
            let event = store.get(id).unwrap();
            assert!(event.processed);
            assert!(event.sent_at.is_some());
        }
        let published: Vec<String> = publisher
            .published()
            .into_iter()
            .map(|m| m.idempotency_key)
            .collect();
        assert_eq!(published, vec!["key-0", "key-1"]);
    }

    #[tokio::test]
    async fn drains_backlog_in_ceil_n_over_batch_cycles() {
        let (store, _publisher, relay) = relay(3);
        seed(&store, 7).await;

        for _ in 0..3 {
            relay.run_cycle().await.unwrap();
        }
        assert!(store.events().iter().all(|e| e.processed));
        assert_eq!(relay.run_cycle().await.unwrap().fetched, 0);
    }

    #[tokio::test]
    async fn failed_event_is_retried_next_cycle() {
        let (store, publisher, relay) = relay(10);
        let ids = seed(&store, 3).await;
        publisher.fail_next("key-1", 1);

        let first = relay.run_cycle().await.unwrap();
        assert_eq!(first.published, 2);
        assert_eq!(first.failed, 1);
        assert!(store.get(ids[0]).unwrap().processed);
        assert!(!store.get(ids[1]).unwrap().processed);
        assert!(store.get(ids[1]).unwrap().sent_at.is_none());
        assert!(store.get(ids[2]).unwrap().processed);

        let second = relay.run_cycle().await.unwrap();
        assert_eq!(second.fetched, 1);
        assert_eq!(second.published, 1);
        assert!(store.get(ids[1]).unwrap().processed);
    }

    #[tokio::test]
    async fn broker_outage_leaves_everything_unprocessed() {
        let (store, publisher, relay) = relay(10);
        seed(&store, 2).await;
        publisher.set_unavailable(true);

        let report = relay.run_cycle().await.unwrap();
        assert_eq!(report.failed, 2);
        assert!(store.events().iter().all(|e| !e.processed));

        publisher.set_unavailable(false);
        assert_eq!(relay.run_cycle().await.unwrap().published, 2);
    }

    #[tokio::test]
    async fn store_outage_is_reported() {
        let (store, _publisher, relay) = relay(10);
        store.set_unavailable(true);

        let err = relay.run_cycle().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(relay.state(), RelayState::Idle);
    }

    #[tokio::test]
    async fn loop_survives_store_outage() {
        let (store, _publisher, relay) = relay(10);
        let relay = Arc::new(relay);
        seed(&store, 1).await;
        store.set_unavailable(true);

        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let relay = relay.clone();
            let token = token.clone();
            async move { relay.run(token).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.set_unavailable(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.events().iter().all(|e| e.processed));

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let (store, publisher, relay) = relay(10);
        let token = CancellationToken::new();
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), relay.run(token))
            .await
            .expect("relay did not stop after cancellation");

        seed(&store, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(publisher.attempts(), 0);
        assert_eq!(relay.state(), RelayState::Idle);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_interval_wait() {
        let store = Arc::new(MemoryEventStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let relay = MessageRelay::new(
            store.clone(),
            publisher.clone(),
            RelayConfig {
                batch_size: 10,
                interval: Duration::from_secs(3600),
            },
        );
        let token = CancellationToken::new();
        let stopper = token.clone();

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        };
        tokio::time::timeout(Duration::from_millis(150), async {
            tokio::join!(relay.run(token), cancel)
        })
        .await
        .expect("relay kept sleeping after cancellation");
        assert_eq!(relay.state(), RelayState::Idle);
    }

    #[tokio::test]
    async fn cancellation_abandons_a_stalled_publish() {
        let store = Arc::new(MemoryEventStore::new());
        let relay = MessageRelay::new(
            store.clone(),
            Arc::new(StalledPublisher),
            RelayConfig {
                batch_size: 10,
                interval: Duration::from_millis(10),
            },
        );
        let ids = seed(&store, 1).await;
        let token = CancellationToken::new();
        let stopper = token.clone();

        let cancel = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(relay.state(), RelayState::Publishing);
            stopper.cancel();
        };
        tokio::time::timeout(Duration::from_millis(150), async {
            tokio::join!(relay.run(token), cancel)
        })
        .await
        .expect("relay stayed blocked on the broker after cancellation");

        assert_eq!(relay.state(), RelayState::Idle);
        let event = store.get(ids[0]).unwrap();
        assert!(!event.processed);
        assert!(event.sent_at.is_none());
        let pending = store.fetch_unprocessed(None, 10).await.unwrap();
        assert_eq!(pending.iter().map(|e| e.id).collect::<Vec<_>>(), ids);
    }
}
