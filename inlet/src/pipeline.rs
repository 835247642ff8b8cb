// Copyright 2025 The Inlet Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The ingestion pipeline: connection manager, dispatcher, delivery
//! queue and worker pool wired together in one composition root.
//!
//! # Example
//!
//! ```ignore
//! let config = PipelineConfig::builder("broker.example.com").build();
//! let pipeline = Pipeline::new(config)?;
//!
//! pipeline
//!     .subscribe("sensors/#", QoS::AtLeastOnce, Arc::new(LogSink::default()))
//!     .await?;
//! pipeline.start().await?;
//!
//! tokio::signal::ctrl_c().await?;
//! pipeline.stop().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use rumqttc::QoS;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::config::PipelineConfig;
use crate::connection::{Connection, ConnectionState};
use crate::dispatch::{Delivery, Dispatcher, SubscriptionId};
use crate::error::SinkError;
use crate::message::InboundMessage;
use crate::observe::{DropObserver, DropReason, LogDropObserver};
use crate::queue::DeliveryQueue;
use crate::sink::Sink;
use crate::topic::TopicFilter;

/// Upper bound on the delay between sink retries.
const SINK_RETRY_CAP: Duration = Duration::from_secs(10);

/// Owns every moving part of the ingestion pipeline.
///
/// Construction validates the configuration; [`Pipeline::start`] brings
/// the broker session and the workers up, [`Pipeline::stop`] tears them
/// down with a clean disconnect and a bounded drain.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    dispatcher: Arc<Dispatcher>,
    queue: Arc<DeliveryQueue<Delivery>>,
    observer: Arc<dyn DropObserver>,
    connection: Connection,
    workers: Mutex<Vec<WorkerHandle>>,
}

/// A worker task plus the entry it currently holds. The slot lets
/// shutdown account for a delivery that an abort would otherwise lose.
struct WorkerHandle {
    task: JoinHandle<()>,
    in_flight: Arc<Mutex<Option<InboundMessage>>>,
}

impl Pipeline {
    /// Builds a pipeline that reports drops through the default logging
    /// observer.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_observer(config, Arc::new(LogDropObserver))
    }

    /// Builds a pipeline with a custom drop observer.
    pub fn with_observer(config: PipelineConfig, observer: Arc<dyn DropObserver>) -> Result<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let queue = Arc::new(DeliveryQueue::new(config.queue_capacity));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&queue), Arc::clone(&observer)));
        let connection = Connection::new(Arc::clone(&config), Arc::clone(&dispatcher));

        Ok(Self {
            config,
            dispatcher,
            queue,
            observer,
            connection,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Current connection state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Receiver that observes every connection state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    /// Registers `sink` for every message matching `filter`.
    ///
    /// Valid before or after [`Pipeline::start`]; subscriptions made
    /// while disconnected are established as soon as a session is up.
    /// When the broker-level subscribe fails, nothing stays registered.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        sink: Arc<dyn Sink>,
    ) -> Result<SubscriptionId> {
        let filter = TopicFilter::parse(filter)?;
        let path = filter.as_str().to_string();

        let id = self.dispatcher.subscribe(filter, qos, sink);
        // An identical-filter SUBSCRIBE replaces the broker-side
        // subscription, so the wire carries the highest QoS registered
        // for the path rather than this subscription's own.
        let wire_qos = self.dispatcher.path_qos(&path).unwrap_or(qos);
        if let Err(e) = self.connection.subscribe_path(&path, wire_qos).await {
            self.dispatcher.unsubscribe(id);
            return Err(e);
        }

        info!(
            "[{}] Subscribed {id} to '{path}' ({qos:?})",
            self.config.client_id
        );
        Ok(id)
    }

    /// Subscribes `sink` to every filter listed in the configuration.
    pub async fn subscribe_configured(&self, sink: Arc<dyn Sink>) -> Result<Vec<SubscriptionId>> {
        let mut ids = Vec::with_capacity(self.config.topic_filters.len());
        for filter in &self.config.topic_filters {
            ids.push(
                self.subscribe(filter, QoS::AtLeastOnce, Arc::clone(&sink))
                    .await?,
            );
        }
        Ok(ids)
    }

    /// Removes a subscription. The broker-level unsubscribe is only sent
    /// once no other subscription uses the same filter path.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let Some(subscription) = self.dispatcher.unsubscribe(id) else {
            anyhow::bail!("unknown subscription {id}");
        };

        let path = subscription.filter.as_str();
        if !self.dispatcher.is_path_in_use(path) {
            self.connection.unsubscribe_path(path).await?;
        }

        info!("[{}] Unsubscribed {id} from '{path}'", self.config.client_id);
        Ok(())
    }

    /// Spawns the worker pool and the broker session.
    ///
    /// A stopped pipeline cannot be started again; build a new instance
    /// to restart after [`Pipeline::stop`] or a `Failed` connection.
    pub async fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            anyhow::bail!("pipeline already started");
        }
        if self.queue.is_closed() {
            anyhow::bail!("pipeline already stopped");
        }

        info!(
            "[{}] Starting pipeline ({} workers, queue capacity {})",
            self.config.client_id, self.config.workers, self.config.queue_capacity
        );

        for worker in 0..self.config.workers {
            let in_flight = Arc::new(Mutex::new(None));
            workers.push(WorkerHandle {
                task: tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&self.dispatcher),
                    Arc::clone(&self.queue),
                    Arc::clone(&self.observer),
                    Arc::clone(&in_flight),
                    self.config.sink_retries,
                    self.config.sink_retry_base,
                )),
                in_flight,
            });
        }
        drop(workers);

        self.connection.start().await
    }

    /// Stops the pipeline: clean disconnect, bounded queue drain, worker
    /// shutdown. Messages still queued, or in a worker's hands, once the
    /// grace period expires are reported to the drop observer.
    pub async fn stop(&self) -> Result<()> {
        info!("[{}] Stopping pipeline", self.config.client_id);

        // Disconnect first so nothing new is fed into the queue.
        self.connection.stop().await;
        self.queue.close();

        let mut undelivered = 0usize;

        // Give the workers a bounded window to drain what is queued.
        let deadline = tokio::time::Instant::now() + self.config.drain_grace;
        let mut workers = self.workers.lock().await;
        let mut expired = false;
        while let Some(mut worker) = workers.pop() {
            let joined = match tokio::time::timeout_at(deadline, &mut worker.task).await {
                Ok(joined) => joined,
                Err(_) => {
                    if !expired {
                        expired = true;
                        warn!(
                            "[{}] Drain grace of {:?} expired; aborting {} workers",
                            self.config.client_id,
                            self.config.drain_grace,
                            1 + workers.len()
                        );
                        for waiting in workers.iter() {
                            waiting.task.abort();
                        }
                    }
                    worker.task.abort();
                    worker.task.await
                }
            };
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    error!("[{}] Worker panicked: {e}", self.config.client_id);
                }
            }
            // A worker cut down mid-delivery still holds its entry.
            if let Some(message) = worker.in_flight.lock().await.take() {
                self.observer.on_drop(&message, DropReason::Shutdown);
                undelivered += 1;
            }
        }
        drop(workers);

        // Whatever is left in the queue will never be delivered.
        while let Some(delivery) = self.queue.pop().await {
            self.observer
                .on_drop(&delivery.message, DropReason::Shutdown);
            undelivered += 1;
        }
        if undelivered > 0 {
            warn!(
                "[{}] Dropped {undelivered} undelivered messages at shutdown",
                self.config.client_id
            );
        }

        info!("[{}] Pipeline stopped", self.config.client_id);
        Ok(())
    }
}

/// Drains the delivery queue until it is closed and empty. The popped
/// entry is parked in `in_flight` for the duration of its delivery so
/// shutdown can see what an aborted worker was holding.
async fn run_worker(
    worker: usize,
    dispatcher: Arc<Dispatcher>,
    queue: Arc<DeliveryQueue<Delivery>>,
    observer: Arc<dyn DropObserver>,
    in_flight: Arc<Mutex<Option<InboundMessage>>>,
    retries: u32,
    retry_base: Duration,
) {
    debug!("[worker-{worker}] Started");
    while let Some(delivery) = queue.pop().await {
        *in_flight.lock().await = Some(delivery.message.clone());
        deliver(&dispatcher, &*observer, delivery, retries, retry_base).await;
        *in_flight.lock().await = None;
    }
    debug!("[worker-{worker}] Stopped");
}

/// Delivers one queue entry to every target sink. Transient sink
/// failures are retried with a doubling delay up to `retries` times;
/// permanent failures and exhausted budgets drop the message and notify
/// the observer.
async fn deliver(
    dispatcher: &Dispatcher,
    observer: &dyn DropObserver,
    delivery: Delivery,
    retries: u32,
    retry_base: Duration,
) {
    let Delivery { message, targets } = delivery;
    for target in targets {
        // The subscription may have been removed while the entry was queued.
        let Some(sink) = dispatcher.sink(target) else {
            continue;
        };

        let mut backoff = Backoff::new(retry_base, SINK_RETRY_CAP, false);
        let mut attempt: u32 = 0;
        loop {
            match sink.deliver(&message).await {
                Ok(()) => break,
                Err(SinkError::Permanent(reason)) => {
                    error!(
                        "[{target}] Permanent sink failure on '{}': {reason}",
                        message.topic
                    );
                    observer.on_drop(&message, DropReason::PermanentFailure);
                    break;
                }
                Err(SinkError::Transient(reason)) => {
                    attempt += 1;
                    if attempt > retries {
                        error!(
                            "[{target}] Giving up on '{}' after {attempt} attempts: {reason}",
                            message.topic
                        );
                        observer.on_drop(&message, DropReason::RetriesExhausted);
                        break;
                    }
                    warn!(
                        "[{target}] Transient sink failure on '{}' (attempt {attempt}/{retries}): {reason}",
                        message.topic
                    );
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }
}
