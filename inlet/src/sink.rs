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

//! Sink trait implemented by message consumers.

use async_trait::async_trait;

use crate::error::SinkError;
use crate::message::InboundMessage;

/// Receives messages matched by a subscription.
///
/// Implementations decide what a delivery means: writing to a database,
/// forwarding over HTTP, updating in-memory state. A failed delivery is
/// reported through [`SinkError`]: transient errors are retried with
/// backoff, permanent ones drop the message immediately.
///
/// # Example
///
/// ```ignore
/// struct Printer;
///
/// #[async_trait]
/// impl Sink for Printer {
///     async fn deliver(&self, message: &InboundMessage) -> Result<(), SinkError> {
///         println!("{}: {:?}", message.topic, message.payload);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, message: &InboundMessage) -> Result<(), SinkError>;
}

/// Sink that logs every message it receives. Handy as a first consumer
/// when wiring up a new pipeline.
pub struct LogSink {
    label: String,
}

impl LogSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new("sink")
    }
}

#[async_trait]
impl Sink for LogSink {
    async fn deliver(&self, message: &InboundMessage) -> Result<(), SinkError> {
        log::info!(
            "[{}] {} ({} bytes): {}",
            self.label,
            message.topic,
            message.payload.len(),
            String::from_utf8_lossy(&message.payload)
        );
        Ok(())
    }
}
