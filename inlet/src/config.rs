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

//! Pipeline configuration.
//!
//! # Example
//!
//! ```ignore
//! let config = PipelineConfig::builder("broker.example.com")
//!     .port(8883)
//!     .use_tls(true)
//!     .username("gateway")
//!     .password("secret")
//!     .workers(4)
//!     .build();
//! ```

use std::env;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::topic::{FilterError, TopicFilter};

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Startup subscription when no filters are configured.
pub const DEFAULT_TOPIC_FILTER: &str = "#";
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_SINK_RETRIES: u32 = 3;
pub const DEFAULT_SINK_RETRY_BASE: Duration = Duration::from_millis(100);
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

fn default_topic_filters() -> Vec<String> {
    vec![DEFAULT_TOPIC_FILTER.to_string()]
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("broker host must not be empty")]
    EmptyHost,

    #[error("queue capacity must be at least 1")]
    ZeroCapacity,

    #[error("worker count must be at least 1")]
    ZeroWorkers,

    #[error("reconnect initial delay must not exceed the max delay")]
    BackoffRange,

    #[error("keep-alive must be at least 5 seconds")]
    KeepAliveTooShort,

    #[error("invalid topic filter '{filter}'")]
    InvalidFilter {
        filter: String,
        #[source]
        source: FilterError,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Reconnect behavior after the broker connection is lost.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First retry delay; the envelope doubles from here.
    pub initial_delay: Duration,
    /// Upper bound on the retry delay.
    pub max_delay: Duration,
    /// Draw each delay uniformly from `0..=envelope` instead of using the
    /// envelope itself.
    pub jitter: bool,
    /// Give up and enter the `Failed` state after this many consecutive
    /// failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
            max_attempts: None,
        }
    }
}

/// Everything the pipeline needs to run: broker endpoint, session
/// settings and delivery tuning. Built with [`PipelineConfig::builder`],
/// read from the environment with [`PipelineConfig::from_env`], or
/// deserialized from a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub use_tls: bool,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Filters subscribed at startup. Defaults to the catch-all `#` when
    /// none are given; dynamic subscriptions can be added on top at
    /// runtime.
    #[serde(default = "default_topic_filters")]
    pub topic_filters: Vec<String>,
    pub queue_capacity: usize,
    pub workers: usize,
    pub reconnect: ReconnectConfig,
    /// Redeliveries attempted after a transient sink failure before the
    /// message is dropped.
    pub sink_retries: u32,
    /// First delay between sink retries; doubles per attempt.
    pub sink_retry_base: Duration,
    /// How long shutdown waits for queued messages to drain.
    pub drain_grace: Duration,
}

impl PipelineConfig {
    pub fn builder(broker_host: impl Into<String>) -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            broker_host: broker_host.into(),
            broker_port: DEFAULT_PORT,
            use_tls: false,
            client_id: None,
            username: None,
            password: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            topic_filters: Vec::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: 1,
            reconnect: ReconnectConfig::default(),
            sink_retries: DEFAULT_SINK_RETRIES,
            sink_retry_base: DEFAULT_SINK_RETRY_BASE,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    /// Reads the broker settings from `MQTT_HOST` (bare hostname, no
    /// scheme), `MQTT_PORT`, `MQTT_CLIENT_ID`, `MQTT_USERNAME`,
    /// `MQTT_PASSWORD`, `MQTT_USE_TLS` and `MQTT_TOPIC` (comma-separated
    /// filters). Unset variables fall back to defaults (`localhost:1883`,
    /// generated client id, no credentials, the catch-all `#` filter).
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string());

        let mut builder = Self::builder(host);

        if let Ok(port) = env::var("MQTT_PORT") {
            let port: u16 = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "MQTT_PORT".to_string(),
                value: port.clone(),
            })?;
            builder = builder.port(port);
        }
        if let Ok(client_id) = env::var("MQTT_CLIENT_ID") {
            builder = builder.client_id(client_id);
        }
        if let Ok(username) = env::var("MQTT_USERNAME") {
            builder = builder.username(username);
        }
        if let Ok(password) = env::var("MQTT_PASSWORD") {
            builder = builder.password(password);
        }
        if let Ok(use_tls) = env::var("MQTT_USE_TLS") {
            let use_tls: bool = use_tls.parse().map_err(|_| ConfigError::InvalidValue {
                key: "MQTT_USE_TLS".to_string(),
                value: use_tls.clone(),
            })?;
            builder = builder.use_tls(use_tls);
        }
        if let Ok(topics) = env::var("MQTT_TOPIC") {
            builder = builder.topic_filters(
                topics
                    .split(',')
                    .map(str::trim)
                    .filter(|topic| !topic.is_empty())
                    .map(String::from),
            );
        }

        Ok(builder.build())
    }

    /// Checks the invariants the pipeline relies on. Called once at
    /// startup; a failure here means the pipeline never starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        // The host goes straight into the MQTT client; schemes belong in
        // `use_tls` and `broker_port`.
        if self.broker_host.contains("://") {
            return Err(ConfigError::InvalidValue {
                key: "broker host".to_string(),
                value: self.broker_host.clone(),
            });
        }
        if self.keep_alive < Duration::from_secs(5) {
            return Err(ConfigError::KeepAliveTooShort);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.reconnect.initial_delay > self.reconnect.max_delay {
            return Err(ConfigError::BackoffRange);
        }
        for filter in &self.topic_filters {
            TopicFilter::parse(filter).map_err(|source| ConfigError::InvalidFilter {
                filter: filter.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

pub struct PipelineConfigBuilder {
    broker_host: String,
    broker_port: u16,
    use_tls: bool,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    keep_alive: Duration,
    clean_session: bool,
    topic_filters: Vec<String>,
    queue_capacity: usize,
    workers: usize,
    reconnect: ReconnectConfig,
    sink_retries: u32,
    sink_retry_base: Duration,
    drain_grace: Duration,
}

impl PipelineConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.broker_port = port;
        self
    }

    /// Connect over TLS using the platform trust store.
    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Ask the broker to start a fresh session instead of resuming one.
    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    /// Adds one filter to subscribe at startup.
    pub fn topic_filter(mut self, filter: impl Into<String>) -> Self {
        self.topic_filters.push(filter.into());
        self
    }

    /// Replaces the startup filter list.
    pub fn topic_filters(mut self, filters: impl IntoIterator<Item = String>) -> Self {
        self.topic_filters = filters.into_iter().collect();
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Number of delivery workers. One worker (the default) preserves
    /// arrival order across all topics; more workers trade that for
    /// throughput.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn sink_retries(mut self, retries: u32) -> Self {
        self.sink_retries = retries;
        self
    }

    pub fn sink_retry_base(mut self, base: Duration) -> Self {
        self.sink_retry_base = base;
        self
    }

    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn build(self) -> PipelineConfig {
        let topic_filters = if self.topic_filters.is_empty() {
            default_topic_filters()
        } else {
            self.topic_filters
        };
        PipelineConfig {
            broker_host: self.broker_host,
            broker_port: self.broker_port,
            use_tls: self.use_tls,
            client_id: self
                .client_id
                .unwrap_or_else(|| format!("inlet-{}", uuid::Uuid::new_v4())),
            username: self.username,
            password: self.password,
            keep_alive: self.keep_alive,
            clean_session: self.clean_session,
            topic_filters,
            queue_capacity: self.queue_capacity,
            workers: self.workers,
            reconnect: self.reconnect,
            sink_retries: self.sink_retries,
            sink_retry_base: self.sink_retry_base,
            drain_grace: self.drain_grace,
        }
    }
}
