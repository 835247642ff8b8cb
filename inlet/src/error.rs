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

//! Error taxonomy of the ingestion pipeline.

use thiserror::Error;

/// Classification of broker connection failures.
///
/// Every variant is retried by the connection manager; the classification
/// drives logging and lets operators tell a flaky network apart from bad
/// credentials.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// Transport-level failure (DNS, TCP, TLS, timeouts, broker I/O).
    #[error("network error: {0}")]
    Network(String),
    /// The broker refused the credentials supplied in the configuration.
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// The broker does not speak the protocol revision we offered.
    #[error("protocol version rejected by broker")]
    ProtocolVersion,
}

/// Failure to enqueue onto the delivery queue. Carries the rejected
/// entry back so the caller can evict, wait or report the drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError<T> {
    /// The queue is at capacity; the caller decides between waiting
    /// (backpressure) and evicting, based on message QoS.
    #[error("delivery queue is full")]
    Full(T),
    /// The queue was closed for shutdown; no further pushes are accepted.
    #[error("delivery queue is closed")]
    Closed(T),
}

impl<T> PushError<T> {
    /// Recovers the entry that could not be enqueued.
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }
}

/// Failure reported by a [`Sink`](crate::sink::Sink).
///
/// `Transient` failures are retried with backoff up to the configured
/// budget; `Permanent` failures drop the message immediately. Both end up
/// at the drop observer once the message is abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("transient sink failure: {0}")]
    Transient(String),
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

impl SinkError {
    /// Build a transient (retryable) sink failure.
    pub fn transient(reason: impl Into<String>) -> Self {
        SinkError::Transient(reason.into())
    }

    /// Build a permanent (non-retryable) sink failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        SinkError::Permanent(reason.into())
    }

    /// Whether the failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}
