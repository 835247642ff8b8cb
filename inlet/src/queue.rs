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

//! Bounded FIFO queue between the network task and the delivery workers.
//!
//! Capacity is tracked with a pair of semaphores: `slots` counts free
//! capacity, `items` counts queued entries. A push moves one permit from
//! `slots` to `items`, a pop moves it back, so producers can either fail
//! fast ([`DeliveryQueue::try_push`]), wait for room
//! ([`DeliveryQueue::push`]) or evict the oldest entry
//! ([`DeliveryQueue::push_evict`]) without ever holding the deque lock
//! across an await point.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Semaphore, TryAcquireError};

use crate::error::PushError;

pub struct DeliveryQueue<T> {
    deque: Mutex<VecDeque<T>>,
    slots: Semaphore,
    items: Semaphore,
    capacity: usize,
}

impl<T> DeliveryQueue<T> {
    /// Creates a queue holding at most `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            deque: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            items: Semaphore::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.deque.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.deque.lock().await.is_empty()
    }

    /// Enqueues without waiting. Fails with [`PushError::Full`] when the
    /// queue is at capacity.
    pub async fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.deque.lock().await.push_back(item);
                self.items.add_permits(1);
                Ok(())
            }
            Err(TryAcquireError::NoPermits) => Err(PushError::Full(item)),
            Err(TryAcquireError::Closed) => Err(PushError::Closed(item)),
        }
    }

    /// Enqueues, waiting until a slot frees up. This is the backpressure
    /// path: while the queue is full the caller stays suspended, which for
    /// the network task means the broker connection stops being polled.
    pub async fn push(&self, item: T) -> Result<(), PushError<T>> {
        match self.slots.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.deque.lock().await.push_back(item);
                self.items.add_permits(1);
                Ok(())
            }
            Err(_) => Err(PushError::Closed(item)),
        }
    }

    /// Enqueues, evicting the oldest entries when the queue is full.
    /// Returns whatever was evicted so the caller can log the drops.
    pub async fn push_evict(&self, item: T) -> Result<Vec<T>, PushError<T>> {
        let mut evicted = Vec::new();
        loop {
            match self.slots.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    self.deque.lock().await.push_back(item);
                    self.items.add_permits(1);
                    return Ok(evicted);
                }
                Err(TryAcquireError::Closed) => {
                    // Closed mid-eviction: put survivors back so the
                    // shutdown drain still sees them.
                    if !evicted.is_empty() {
                        let mut deque = self.deque.lock().await;
                        for entry in evicted.into_iter().rev() {
                            deque.push_front(entry);
                        }
                    }
                    return Err(PushError::Closed(item));
                }
                Err(TryAcquireError::NoPermits) => match self.items.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        let oldest = self.deque.lock().await.pop_front();
                        self.slots.add_permits(1);
                        if let Some(oldest) = oldest {
                            evicted.push(oldest);
                        }
                    }
                    // A consumer freed a slot in the meantime; retry the push.
                    Err(_) => continue,
                },
            }
        }
    }

    /// Dequeues the next entry, waiting while the queue is empty.
    ///
    /// After [`DeliveryQueue::close`] the remaining entries drain out in
    /// order and then `None` is returned.
    pub async fn pop(&self) -> Option<T> {
        match self.items.acquire().await {
            Ok(permit) => {
                permit.forget();
                let item = self.deque.lock().await.pop_front();
                self.slots.add_permits(1);
                item
            }
            Err(_) => self.deque.lock().await.pop_front(),
        }
    }

    /// Rejects further pushes and wakes blocked producers and consumers.
    /// Entries already queued stay poppable.
    pub fn close(&self) {
        self.slots.close();
        self.items.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }
}
