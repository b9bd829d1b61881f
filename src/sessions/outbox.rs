/*!
 * Outbox Dispatcher
 *
 * Domain events are written into the `outbox_events` table inside the same
 * transaction as the aggregate mutation. This dispatcher drains the table in
 * the background and delivers each event to every registered subscriber
 * at-least-once: a row is only marked dispatched when all subscribers
 * accepted it, so subscribers must tolerate redelivery. Delivery is FIFO per
 * aggregate; when a row fails, later rows of the same aggregate are held
 * back until the next pass.
 */

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::sessions::contracts::EventSubscriber;
use crate::sessions::database::SessionDatabase;
use crate::sessions::error::SessionResult;

pub struct OutboxDispatcher {
    database: Arc<SessionDatabase>,
    subscribers: Arc<RwLock<Vec<Arc<dyn EventSubscriber>>>>,
    running: Arc<RwLock<bool>>,
    poll_interval: Duration,
    batch_size: u32,
}

impl OutboxDispatcher {
    pub fn new(database: Arc<SessionDatabase>, poll_interval: Duration, batch_size: u32) -> Self {
        Self {
            database,
            subscribers: Arc::new(RwLock::new(Vec::new())),
            running: Arc::new(RwLock::new(false)),
            poll_interval,
            batch_size,
        }
    }

    pub async fn register_subscriber(&self, subscriber: Arc<dyn EventSubscriber>) {
        info!("Registering outbox subscriber: {}", subscriber.name());
        self.subscribers.write().await.push(subscriber);
    }

    /// Start the dispatch loop
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let database = Arc::clone(&self.database);
        let subscribers = Arc::clone(&self.subscribers);
        let running = Arc::clone(&self.running);
        let poll_interval = self.poll_interval;
        let batch_size = self.batch_size;

        tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            info!("Outbox dispatcher started");

            while *running.read().await {
                let drained =
                    match Self::drain_batch(&database, &subscribers, batch_size).await {
                        Ok(count) => count,
                        Err(error) => {
                            warn!("Outbox drain failed: {}", error);
                            0
                        }
                    };

                // A full batch means there is likely more waiting; skip the
                // sleep and keep draining.
                if (drained as u32) < batch_size {
                    ticker.tick().await;
                }
            }
            info!("Outbox dispatcher stopped");
        });
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    /// Drain one batch; exposed for deterministic tests
    pub async fn drain_once(&self) -> SessionResult<usize> {
        Self::drain_batch(&self.database, &self.subscribers, self.batch_size).await
    }

    async fn drain_batch(
        database: &SessionDatabase,
        subscribers: &RwLock<Vec<Arc<dyn EventSubscriber>>>,
        batch_size: u32,
    ) -> SessionResult<usize> {
        let rows = database.fetch_undispatched_events(batch_size).await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let subscribers = subscribers.read().await.clone();
        let mut dispatched = 0usize;
        let mut held_aggregates: HashSet<String> = HashSet::new();

        for row in rows {
            if held_aggregates.contains(&row.aggregate_id) {
                continue;
            }

            let mut delivery_error = None;
            for subscriber in &subscribers {
                if let Err(error) = subscriber.handle(&row.event).await {
                    warn!(
                        "Subscriber {} rejected event {} ({}): {}",
                        subscriber.name(),
                        row.id,
                        row.event_name,
                        error
                    );
                    delivery_error = Some(error);
                    break;
                }
            }

            match delivery_error {
                None => {
                    database.mark_event_dispatched(row.id).await?;
                    debug!("Dispatched event {} ({})", row.id, row.event_name);
                    dispatched += 1;
                }
                Some(error) => {
                    database.record_event_failure(row.id, &error.to_string()).await?;
                    held_aggregates.insert(row.aggregate_id);
                }
            }
        }

        Ok(dispatched)
    }
}
