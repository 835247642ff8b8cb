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

//! Routing from incoming publishes to registered sinks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use rumqttc::{QoS, SubscribeFilter};

use crate::message::InboundMessage;
use crate::observe::{DropObserver, DropReason};
use crate::queue::DeliveryQueue;
use crate::sink::Sink;
use crate::topic::TopicFilter;

/// Handle returned by `subscribe`, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One registered subscription: the filter, the QoS requested from the
/// broker and the sink fed by it.
pub(crate) struct Subscription {
    pub filter: TopicFilter,
    pub qos: QoS,
    pub sink: Arc<dyn Sink>,
}

/// One delivery queue entry: the message plus every subscription it
/// matched at dispatch time.
pub(crate) struct Delivery {
    pub message: InboundMessage,
    pub targets: Vec<SubscriptionId>,
}

/// Concurrent subscription table plus the routing step that feeds the
/// delivery queue. The network task reads the table on every publish and
/// the workers read it per delivery, so it lives in a [`DashMap`] rather
/// than behind a lock.
pub(crate) struct Dispatcher {
    subscriptions: DashMap<SubscriptionId, Subscription>,
    next_id: AtomicU64,
    queue: Arc<DeliveryQueue<Delivery>>,
    observer: Arc<dyn DropObserver>,
}

impl Dispatcher {
    pub fn new(queue: Arc<DeliveryQueue<Delivery>>, observer: Arc<dyn DropObserver>) -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(0),
            queue,
            observer,
        }
    }

    pub fn subscribe(&self, filter: TopicFilter, qos: QoS, sink: Arc<dyn Sink>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.insert(id, Subscription { filter, qos, sink });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Option<Subscription> {
        self.subscriptions.remove(&id).map(|(_, subscription)| subscription)
    }

    /// All subscriptions whose filter matches `topic`, in subscription
    /// order. Each matching subscription receives the message exactly
    /// once, even when several of its filters overlap.
    pub fn matches(&self, topic: &str) -> Vec<SubscriptionId> {
        let mut targets: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().filter.matches(topic))
            .map(|entry| *entry.key())
            .collect();
        targets.sort_unstable();
        targets
    }

    /// Sink for `id`, or `None` when the subscription was removed while
    /// the delivery sat in the queue.
    pub fn sink(&self, id: SubscriptionId) -> Option<Arc<dyn Sink>> {
        self.subscriptions
            .get(&id)
            .map(|entry| Arc::clone(&entry.value().sink))
    }

    /// Whether any remaining subscription still uses `path` on the wire.
    /// Governs when an unsubscribe is forwarded to the broker.
    pub fn is_path_in_use(&self, path: &str) -> bool {
        self.subscriptions
            .iter()
            .any(|entry| entry.value().filter.as_str() == path)
    }

    /// Highest QoS any subscription currently requests for `path`.
    ///
    /// An identical-filter SUBSCRIBE replaces the broker-side
    /// subscription, so the wire must always carry this merged value.
    pub fn path_qos(&self, path: &str) -> Option<QoS> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.value().filter.as_str() == path)
            .map(|entry| entry.value().qos)
            .max_by_key(|qos| qos_rank(*qos))
    }

    /// Wire-level filters for (re)subscribing, deduplicated by path with
    /// the highest QoS requested for that path.
    pub fn subscribe_filters(&self) -> Vec<SubscribeFilter> {
        let mut by_path: HashMap<String, QoS> = HashMap::new();
        for entry in self.subscriptions.iter() {
            let subscription = entry.value();
            by_path
                .entry(subscription.filter.as_str().to_string())
                .and_modify(|qos| {
                    if qos_rank(subscription.qos) > qos_rank(*qos) {
                        *qos = subscription.qos;
                    }
                })
                .or_insert(subscription.qos);
        }

        let mut filters: Vec<SubscribeFilter> = by_path
            .into_iter()
            .map(|(path, qos)| SubscribeFilter::new(path, qos))
            .collect();
        filters.sort_unstable_by(|a, b| a.path.cmp(&b.path));
        filters
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Routes an inbound message onto the delivery queue.
    ///
    /// The message is matched once, here, and the queue entry carries the
    /// matched subscription ids. An AtMostOnce message is admitted by
    /// evicting the oldest entry when the queue is full; anything with a
    /// stronger guarantee waits for room instead, which suspends the
    /// network task and lets TCP flow control push back on the broker.
    pub async fn dispatch(&self, message: InboundMessage) {
        let targets = self.matches(&message.topic);
        if targets.is_empty() {
            debug!("[dispatch] no subscription matches '{}'", message.topic);
            return;
        }

        let qos = message.qos;
        let delivery = Delivery { message, targets };

        if qos == QoS::AtMostOnce {
            match self.queue.push_evict(delivery).await {
                Ok(evicted) => {
                    for stale in evicted {
                        self.observer
                            .on_drop(&stale.message, DropReason::EvictedOldest);
                    }
                }
                Err(rejected) => {
                    self.observer
                        .on_drop(&rejected.into_inner().message, DropReason::Shutdown);
                }
            }
        } else if let Err(rejected) = self.queue.push(delivery).await {
            // push only fails once the queue is closed for shutdown
            self.observer
                .on_drop(&rejected.into_inner().message, DropReason::Shutdown);
        }
    }
}

fn qos_rank(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}
