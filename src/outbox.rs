//! Public entry point of the engine.
//!
//! ```ignore
//! let mut tx = store.begin().await?;
//! // business write on the same transaction
//! sqlx::query("UPDATE orders SET status = 'paid' WHERE id = $1")
//!     .bind(order_id)
//!     .execute(&mut *tx)
//!     .await?;
//! outbox
//!     .create_event(Some(&mut tx), CreateEventCommand::new(order_id, key, payload, topic, ttl))
//!     .await?;
//! tx.commit().await?;
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::collector::GarbageCollector;
use crate::config::OutboxConfig;
use crate::error::{OutboxError, OutboxResult};
use crate::models::{BatchCreateEventCommand, CreateEventCommand, EventId, NewEvent};
use crate::publisher::Publisher;
use crate::relay::MessageRelay;
use crate::store::EventStore;

pub struct Outbox<S, P> {
    store: Arc<S>,
    relay: MessageRelay<S, P>,
    collector: GarbageCollector<S>,
}

impl<S, P> Outbox<S, P>
where
    S: EventStore,
    P: Publisher,
{
    /// Builds the engine. Fails if any setting is zero.
    pub fn new(config: OutboxConfig, store: Arc<S>, publisher: Arc<P>) -> OutboxResult<Self> {
        config.validate()?;
        Ok(Self {
            relay: MessageRelay::new(store.clone(), publisher, config.relay),
            collector: GarbageCollector::new(store.clone(), config.collector),
            store,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn message_relay(&self) -> &MessageRelay<S, P> {
        &self.relay
    }

    pub fn garbage_collector(&self) -> &GarbageCollector<S> {
        &self.collector
    }

    /// Records one event. Pass the caller's unit of work to commit the
    /// event atomically with the caller's own writes.
    ///
    /// The trace context is not captured from the current span. Attach it to
    /// the command with [`CreateEventCommand::with_trace`] so it travels with
    /// the event to the broker.
    #[instrument(skip_all, fields(topic = %command.topic, entity_id = %command.entity_id))]
    pub async fn create_event(
        &self,
        tx: Option<&mut S::Tx>,
        command: CreateEventCommand,
    ) -> OutboxResult<EventId> {
        let event = command.into_new_event()?;
        let id = self.store.create(tx, &event).await?;
        info!(event_id = %id, "Created outbox event.");
        Ok(id)
    }

    /// Records all events with one statement. Ids come back in command order.
    ///
    /// Every command is validated before anything is written.
    #[instrument(skip_all, fields(events = commands.len()))]
    pub async fn batch_create_events(
        &self,
        tx: Option<&mut S::Tx>,
        commands: BatchCreateEventCommand,
    ) -> OutboxResult<Vec<EventId>> {
        let events = commands
            .into_iter()
            .enumerate()
            .map(|(index, command)| {
                command
                    .into_new_event()
                    .map_err(|source| OutboxError::InvalidBatchCommand { index, source })
            })
            .collect::<OutboxResult<Vec<NewEvent>>>()?;
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let ids = self.store.batch_create(tx, &events).await?;
        info!(created = ids.len(), "Created outbox events.");
        Ok(ids)
    }

    /// Blocks running the message relay until `token` is cancelled.
    pub async fn run_message_relay(&self, token: CancellationToken) {
        self.relay.run(token).await;
    }

    /// Blocks running the garbage collector until `token` is cancelled.
    pub async fn run_garbage_collector(&self, token: CancellationToken) {
        self.collector.run(token).await;
    }
}

impl<S, P> Outbox<S, P>
where
    S: EventStore + 'static,
    P: Publisher + 'static,
{
    /// Spawns both background loops on the current runtime.
    pub fn start(self: Arc<Self>) -> OutboxHandle {
        let token = CancellationToken::new();

        let relay = {
            let outbox = self.clone();
            let token = token.clone();
            tokio::spawn(async move { outbox.run_message_relay(token).await })
        };
        let collector = {
            let outbox = self;
            let token = token.clone();
            tokio::spawn(async move { outbox.run_garbage_collector(token).await })
        };

        OutboxHandle {
            token,
            tasks: vec![relay, collector],
        }
    }
}

/// Stops the loops spawned by [`Outbox::start`].
pub struct OutboxHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl OutboxHandle {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels both loops and waits for them to return.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Outbox task ended abnormally: {}", e);
            }
        }
        info!("Outbox stopped.");
    }
}
