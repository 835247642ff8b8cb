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

//! Bounded MQTT ingestion pipeline.
//!
//! Connects to a broker, matches incoming publishes against wildcard
//! subscriptions, and fans them out to [`Sink`] implementations through a
//! bounded delivery queue. The connection reconnects forever with jittered
//! exponential backoff, and every dropped message is reported through a
//! [`DropObserver`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use inlet::{LogSink, Pipeline, PipelineConfig, QoS};
//!
//! let config = PipelineConfig::builder("broker.local")
//!     .client_id("field-gateway")
//!     .topic_filter("devices/+/+/state")
//!     .build();
//!
//! let pipeline = Pipeline::new(config)?;
//! pipeline
//!     .subscribe("devices/+/+/state", QoS::AtLeastOnce, Arc::new(LogSink::default()))
//!     .await?;
//! pipeline.start().await?;
//! // ... run until shutdown is requested ...
//! pipeline.stop().await?;
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod observe;
pub mod queue;
pub mod sensor;
pub mod sink;
pub mod topic;

mod backoff;
mod connection;
mod dispatch;
mod pipeline;

pub use config::{ConfigError, PipelineConfig, PipelineConfigBuilder, ReconnectConfig};
pub use connection::ConnectionState;
pub use dispatch::SubscriptionId;
pub use error::{ConnectError, PushError, SinkError};
pub use message::InboundMessage;
pub use observe::{DropObserver, DropReason, LogDropObserver};
pub use pipeline::Pipeline;
pub use queue::DeliveryQueue;
pub use sink::{LogSink, Sink};
pub use topic::{FilterError, TopicFilter};

// Re-exported so callers can name QoS levels without depending on rumqttc.
pub use rumqttc::QoS;
