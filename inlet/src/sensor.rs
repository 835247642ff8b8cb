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

//! Decoding for the moisture sensor fleet.
//!
//! Battery-powered nodes publish a state reading to
//! `devices/<type>/<node>/state` and a Home Assistant discovery
//! announcement to `devices/<type>/<node>/config`. This module turns
//! those raw payloads into typed values and provides a ready-made
//! [`Sink`] that forwards decoded readings over a channel.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::SinkError;
use crate::message::InboundMessage;
use crate::sink::Sink;

/// Filter matching every node's state channel.
pub const STATE_FILTER: &str = "devices/+/+/state";
/// Filter matching every node's discovery channel.
pub const CONFIG_FILTER: &str = "devices/+/+/config";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("not a device topic: {0}")]
    Topic(String),

    #[error("expected the {expected} channel, topic was '{topic}'")]
    WrongChannel { expected: &'static str, topic: String },

    #[error("invalid payload")]
    Payload(#[from] serde_json::Error),
}

/// Which per-node channel a topic addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChannel {
    State,
    Config,
}

/// Parsed `devices/<type>/<node>/<channel>` topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopic {
    pub device_type: String,
    pub node_id: String,
    pub channel: DeviceChannel,
}

impl DeviceTopic {
    /// Parses a topic of the form `devices/<type>/<node>/state` or
    /// `devices/<type>/<node>/config`. Returns `None` for anything else.
    pub fn parse(topic: &str) -> Option<Self> {
        let mut levels = topic.split('/');
        if levels.next() != Some("devices") {
            return None;
        }
        let device_type = levels.next()?;
        let node_id = levels.next()?;
        let channel = match levels.next()? {
            "state" => DeviceChannel::State,
            "config" => DeviceChannel::Config,
            _ => return None,
        };
        if levels.next().is_some() || device_type.is_empty() || node_id.is_empty() {
            return None;
        }
        Some(Self {
            device_type: device_type.to_string(),
            node_id: node_id.to_string(),
            channel,
        })
    }
}

/// One moisture measurement, as serialized by the sensor firmware.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct MoistureReading {
    /// Normalized moisture in percent. The firmware maps raw readings
    /// onto 0..=100 but an out-of-calibration sensor can exceed the range.
    pub moisture: f64,
}

/// Home Assistant discovery announcement published on the config channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Announcement {
    pub name: String,
    pub unique_id: String,
    #[serde(default)]
    pub device_class: Option<String>,
    #[serde(rename = "stat_t")]
    pub state_topic: String,
    #[serde(rename = "unit_of_measurement", default)]
    pub unit: Option<String>,
    #[serde(rename = "value_template", default)]
    pub value_template: Option<String>,
}

/// Decodes a state message into its source topic and reading.
pub fn decode_state(message: &InboundMessage) -> Result<(DeviceTopic, MoistureReading), DecodeError> {
    let topic = DeviceTopic::parse(&message.topic)
        .ok_or_else(|| DecodeError::Topic(message.topic.clone()))?;
    if topic.channel != DeviceChannel::State {
        return Err(DecodeError::WrongChannel {
            expected: "state",
            topic: message.topic.clone(),
        });
    }
    let reading: MoistureReading = serde_json::from_slice(&message.payload)?;
    Ok((topic, reading))
}

/// Decodes a discovery message into its source topic and announcement.
pub fn decode_announcement(
    message: &InboundMessage,
) -> Result<(DeviceTopic, Announcement), DecodeError> {
    let topic = DeviceTopic::parse(&message.topic)
        .ok_or_else(|| DecodeError::Topic(message.topic.clone()))?;
    if topic.channel != DeviceChannel::Config {
        return Err(DecodeError::WrongChannel {
            expected: "config",
            topic: message.topic.clone(),
        });
    }
    let announcement: Announcement = serde_json::from_slice(&message.payload)?;
    Ok((topic, announcement))
}

/// A decoded state message ready for a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorUpdate {
    pub source: DeviceTopic,
    pub reading: MoistureReading,
}

/// Sink that decodes state payloads and forwards them over a channel.
///
/// Subscribe it with [`STATE_FILTER`]. Messages that fail to decode are
/// rejected permanently: a malformed payload will not improve on retry.
pub struct ReadingSink {
    tx: mpsc::Sender<SensorUpdate>,
}

impl ReadingSink {
    pub fn new(tx: mpsc::Sender<SensorUpdate>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Sink for ReadingSink {
    async fn deliver(&self, message: &InboundMessage) -> Result<(), SinkError> {
        let (source, reading) =
            decode_state(message).map_err(|e| SinkError::permanent(e.to_string()))?;
        self.tx
            .send(SensorUpdate { source, reading })
            .await
            .map_err(|_| SinkError::permanent("reading channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rumqttc::QoS;

    use crate::topic::TopicFilter;

    use super::*;

    fn message(topic: &str, payload: &str) -> InboundMessage {
        InboundMessage::new(topic, Bytes::copy_from_slice(payload.as_bytes()), QoS::AtMostOnce)
    }

    #[test]
    fn test_parse_device_topics() {
        let state = DeviceTopic::parse("devices/sensor/3735928559/state").unwrap();
        assert_eq!(state.device_type, "sensor");
        assert_eq!(state.node_id, "3735928559");
        assert_eq!(state.channel, DeviceChannel::State);

        let config = DeviceTopic::parse("devices/sensor/7/config").unwrap();
        assert_eq!(config.channel, DeviceChannel::Config);

        assert!(DeviceTopic::parse("devices/sensor/7/battery").is_none());
        assert!(DeviceTopic::parse("devices/sensor/state").is_none());
        assert!(DeviceTopic::parse("devices/sensor/7/state/extra").is_none());
        assert!(DeviceTopic::parse("homes/sensor/7/state").is_none());
    }

    #[test]
    fn test_state_filter_matches_state_topics() {
        let filter = TopicFilter::parse(STATE_FILTER).unwrap();
        assert!(filter.matches("devices/sensor/3735928559/state"));
        assert!(!filter.matches("devices/sensor/3735928559/config"));
    }

    #[test]
    fn test_decode_state_reading() {
        let (topic, reading) = decode_state(&message(
            "devices/sensor/42/state",
            r#"{"moisture": 41}"#,
        ))
        .unwrap();
        assert_eq!(topic.node_id, "42");
        assert_eq!(reading.moisture, 41.0);

        assert!(matches!(
            decode_state(&message("devices/sensor/42/state", "not json")),
            Err(DecodeError::Payload(_))
        ));
        assert!(matches!(
            decode_state(&message("devices/sensor/42/config", r#"{"moisture": 41}"#)),
            Err(DecodeError::WrongChannel { .. })
        ));
        assert!(matches!(
            decode_state(&message("kitchen/lights", r#"{"moisture": 41}"#)),
            Err(DecodeError::Topic(_))
        ));
    }

    #[test]
    fn test_decode_announcement() {
        let payload = r#"{
            "name": "Plant Sensor",
            "unique_id": "3735928559",
            "device_class": "humidity",
            "stat_t": "devices/sensor/3735928559/state",
            "unit_of_measurement": "%",
            "frc_upd": true,
            "value_template": "{{ value_json.moisture}}"
        }"#;

        let (topic, announcement) =
            decode_announcement(&message("devices/sensor/3735928559/config", payload)).unwrap();
        assert_eq!(topic.channel, DeviceChannel::Config);
        assert_eq!(announcement.name, "Plant Sensor");
        assert_eq!(announcement.state_topic, "devices/sensor/3735928559/state");
        assert_eq!(announcement.unit.as_deref(), Some("%"));
    }

    #[tokio::test]
    async fn test_reading_sink_forwards_decoded_updates() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ReadingSink::new(tx);

        sink.deliver(&message("devices/sensor/42/state", r#"{"moisture": 58.5}"#))
            .await
            .unwrap();

        let update = rx.recv().await.unwrap();
        assert_eq!(update.source.node_id, "42");
        assert_eq!(update.reading.moisture, 58.5);
    }

    #[tokio::test]
    async fn test_reading_sink_rejects_undecodable_payloads() {
        let (tx, _rx) = mpsc::channel(4);
        let sink = ReadingSink::new(tx);

        let err = sink
            .deliver(&message("devices/sensor/42/state", "garbage"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
