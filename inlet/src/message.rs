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

//! Inbound message representation.

use std::time::SystemTime;

use bytes::Bytes;
use rumqttc::{Publish, QoS};

/// A message received from the broker.
///
/// Created on network receipt and immutable from then on. The payload is a
/// cheaply clonable [`Bytes`] handle, so fan-out to multiple sinks never
/// copies the body.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Topic the message was published on (no wildcards).
    pub topic: String,
    /// Raw payload bytes; interpretation is left to the sink.
    pub payload: Bytes,
    /// Wall-clock time at network receipt.
    pub received_at: SystemTime,
    /// QoS the message arrived with.
    pub qos: QoS,
    /// Broker retain flag.
    pub retain: bool,
}

impl InboundMessage {
    /// Create a message as if it had just arrived on `topic`.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: SystemTime::now(),
            qos,
            retain: false,
        }
    }
}

impl From<Publish> for InboundMessage {
    fn from(publish: Publish) -> Self {
        Self {
            topic: publish.topic,
            payload: publish.payload,
            received_at: SystemTime::now(),
            qos: publish.qos,
            retain: publish.retain,
        }
    }
}
