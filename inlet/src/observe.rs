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

//! Hook for messages the pipeline gives up on.

use std::fmt;

use crate::message::InboundMessage;

/// Why a message was dropped instead of delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The message was evicted from a full queue to admit a newer one.
    EvictedOldest,
    /// The sink kept failing transiently until the retry budget was spent.
    RetriesExhausted,
    /// The sink rejected the message permanently; retrying would not help.
    PermanentFailure,
    /// The message was still queued when shutdown drained the pipeline.
    Shutdown,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::EvictedOldest => write!(f, "evicted for newer message"),
            DropReason::RetriesExhausted => write!(f, "sink retries exhausted"),
            DropReason::PermanentFailure => write!(f, "permanent sink failure"),
            DropReason::Shutdown => write!(f, "shutdown drain"),
        }
    }
}

/// Observes every message the pipeline drops. Implementations should be
/// cheap: the hook runs inline on the network task and the workers.
pub trait DropObserver: Send + Sync {
    fn on_drop(&self, message: &InboundMessage, reason: DropReason);
}

/// Default observer: logs each drop at warn level.
pub struct LogDropObserver;

impl DropObserver for LogDropObserver {
    fn on_drop(&self, message: &InboundMessage, reason: DropReason) {
        log::warn!(
            "[pipeline] dropping message on '{}' ({} bytes): {}",
            message.topic,
            message.payload.len(),
            reason
        );
    }
}
