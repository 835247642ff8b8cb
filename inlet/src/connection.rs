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

//! Broker session ownership: connect, reconnect with backoff, dispatch.
//!
//! One spawned task owns the MQTT event loop. Connection state is
//! published through a [`watch`] channel so any number of observers can
//! follow transitions without touching the session itself.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use log::{error, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, Incoming, MqttOptions, QoS,
    SubscribeFilter, Transport,
};
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::config::PipelineConfig;
use crate::dispatch::Dispatcher;
use crate::error::ConnectError;
use crate::message::InboundMessage;

/// Lifecycle of the broker session.
///
/// `Failed` is terminal and only reachable when a retry cap is
/// configured; the default configuration retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Owns the broker session and the one task allowed to poll it.
pub(crate) struct Connection {
    config: Arc<PipelineConfig>,
    dispatcher: Arc<Dispatcher>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    /// Client handle for subscribe calls; set on start, cleared on stop.
    client: RwLock<Option<AsyncClient>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(config: Arc<PipelineConfig>, dispatcher: Arc<Dispatcher>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            dispatcher,
            state_tx: Arc::new(state_tx),
            client: RwLock::new(None),
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Forwards a subscribe to the broker when a session is up. While
    /// disconnected this is a no-op: the filter is wired on the next
    /// ConnAck along with everything else in the dispatcher.
    pub async fn subscribe_path(&self, path: &str, qos: QoS) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Ok(());
        }
        if let Some(client) = self.client.read().await.as_ref() {
            client
                .subscribe(path, qos)
                .await
                .map_err(|e| anyhow::anyhow!("MQTT subscribe failed: {e}"))?;
        }
        Ok(())
    }

    /// Forwards an unsubscribe to the broker when a session is up.
    pub async fn unsubscribe_path(&self, path: &str) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Ok(());
        }
        if let Some(client) = self.client.read().await.as_ref() {
            client
                .unsubscribe(path)
                .await
                .map_err(|e| anyhow::anyhow!("MQTT unsubscribe failed: {e}"))?;
        }
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        let config = Arc::clone(&self.config);
        info!(
            "[{}] Starting connection manager (broker={}:{}, tls={})",
            config.client_id, config.broker_host, config.broker_port, config.use_tls
        );

        // Build MQTT options.
        let mut mqtt_opts = MqttOptions::new(
            &config.client_id,
            &config.broker_host,
            config.broker_port,
        );
        mqtt_opts.set_keep_alive(config.keep_alive);
        mqtt_opts.set_clean_session(config.clean_session);
        if config.use_tls {
            mqtt_opts.set_transport(Transport::tls_with_default_config());
        }
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqtt_opts.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 100);

        // Store the client for subscribe calls and the clean disconnect on stop.
        *self.client.write().await = Some(client.clone());

        // Create shutdown channel.
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        transition(&self.state_tx, ConnectionState::Connecting, &config.client_id);

        // Clone what we need for the spawned task.
        let dispatcher = Arc::clone(&self.dispatcher);
        let state_tx = Arc::clone(&self.state_tx);
        let reconnect = config.reconnect.clone();
        let id = config.client_id.clone();

        // Spawn the MQTT event loop task.
        let handle = tokio::spawn(async move {
            info!("[{id}] MQTT event loop started");
            let mut backoff = Backoff::new(
                reconnect.initial_delay,
                reconnect.max_delay,
                reconnect.jitter,
            );
            let mut failures: u32 = 0;
            let mut was_connected = false;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("[{id}] Shutdown signal received");
                        break;
                    }
                    event = eventloop.poll() => {
                        match event {
                            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                                if ack.code != ConnectReturnCode::Success {
                                    // The event loop surfaces this as an error on the next poll.
                                    warn!("[{id}] Broker refused session: {:?}", ack.code);
                                    continue;
                                }
                                // Re-issue every subscription before reporting Connected;
                                // broker sessions are not assumed persistent.
                                let filters = dispatcher.subscribe_filters();
                                if !filters.is_empty() {
                                    if let Err(e) = client.subscribe_many(filters.clone()).await {
                                        error!("[{id}] Resubscribe failed: {e}");
                                    }
                                }
                                backoff.reset();
                                failures = 0;
                                was_connected = true;
                                transition(&state_tx, ConnectionState::Connected, &id);
                                info!(
                                    "[{id}] Connected (session_present={})",
                                    ack.session_present
                                );
                                // A subscribe landing between the snapshot above and
                                // the Connected transition was still gated off the
                                // wire; pick up whatever the snapshot missed.
                                let late = missing_filters(&filters, dispatcher.subscribe_filters());
                                if !late.is_empty() {
                                    if let Err(e) = client.subscribe_many(late).await {
                                        error!("[{id}] Late subscribe failed: {e}");
                                    }
                                }
                            }
                            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                                // May suspend on a full queue; while suspended the
                                // event loop is not polled, which exerts backpressure
                                // on the broker through TCP flow control.
                                dispatcher.dispatch(InboundMessage::from(publish)).await;
                            }
                            Ok(_) => {} // Ignore other events (SubAck, PingResp, etc.)
                            Err(e) => {
                                match shutdown_rx.try_recv() {
                                    Ok(()) => {
                                        info!("[{id}] Shutdown signal received");
                                        break;
                                    }
                                    Err(oneshot::error::TryRecvError::Closed) => {
                                        warn!("[{id}] Shutdown channel closed; stopping");
                                        break;
                                    }
                                    Err(oneshot::error::TryRecvError::Empty) => {}
                                }

                                failures += 1;
                                let err = classify_connection_error(&e);
                                error!("[{id}] Connection error (attempt {failures}): {err}");

                                if let Some(max) = reconnect.max_attempts {
                                    if failures >= max {
                                        transition(&state_tx, ConnectionState::Failed, &id);
                                        error!("[{id}] Retry cap of {max} reached; giving up");
                                        break;
                                    }
                                }

                                let next = if was_connected {
                                    ConnectionState::Reconnecting
                                } else {
                                    ConnectionState::Connecting
                                };
                                transition(&state_tx, next, &id);

                                let delay = backoff.next_delay();
                                info!("[{id}] Retrying in {delay:?}");
                                tokio::select! {
                                    _ = &mut shutdown_rx => {
                                        info!("[{id}] Shutdown signal received");
                                        break;
                                    }
                                    _ = tokio::time::sleep(delay) => {}
                                }
                            }
                        }
                    }
                }
            }

            if *state_tx.borrow() != ConnectionState::Failed {
                transition(&state_tx, ConnectionState::Disconnected, &id);
            }
            info!("[{id}] MQTT event loop stopped");
        });

        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Disconnects cleanly and stops the event loop task. Waits up to the
    /// drain grace period for the task to finish before aborting it.
    pub async fn stop(&self) {
        // Ask for a clean MQTT disconnect while the event loop still runs.
        if let Some(client) = self.client.write().await.take() {
            let _ = client.disconnect().await;
        }
        if let Some(shutdown_tx) = self.shutdown_tx.lock().await.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(mut task) = self.task.lock().await.take() {
            match tokio::time::timeout(self.config.drain_grace, &mut task).await {
                Ok(Err(e)) if !e.is_cancelled() => {
                    error!("[{}] Network task panicked: {e}", self.config.client_id);
                }
                Ok(_) => {}
                Err(_) => {
                    warn!(
                        "[{}] Network task did not stop within {:?}; aborting",
                        self.config.client_id, self.config.drain_grace
                    );
                    task.abort();
                }
            }
        }
    }
}

#[cfg(test)]
impl Connection {
    /// Installs a live client and reports `Connected` without running a
    /// session task, so tests can drive the wire paths directly.
    pub(crate) async fn adopt_session(&self, client: AsyncClient) {
        *self.client.write().await = Some(client);
        transition(&self.state_tx, ConnectionState::Connected, "test");
    }
}

/// Publishes a state change, skipping no-op transitions.
fn transition(state_tx: &watch::Sender<ConnectionState>, next: ConnectionState, id: &str) {
    let prev = *state_tx.borrow();
    if prev != next {
        state_tx.send_replace(next);
        info!("[{id}] Connection state {prev} -> {next}");
    }
}

/// Maps an event loop failure onto the connect error taxonomy.
pub(crate) fn classify_connection_error(err: &ConnectionError) -> ConnectError {
    match err {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                ConnectError::Auth(format!("{code:?}"))
            }
            ConnectReturnCode::RefusedProtocolVersion => ConnectError::ProtocolVersion,
            other => ConnectError::Network(format!("connection refused: {other:?}")),
        },
        other => ConnectError::Network(other.to_string()),
    }
}

/// Filters present in `current` but absent from `sent`: new paths, or
/// paths whose merged QoS rose since the snapshot was taken.
fn missing_filters(
    sent: &[SubscribeFilter],
    current: Vec<SubscribeFilter>,
) -> Vec<SubscribeFilter> {
    current
        .into_iter()
        .filter(|filter| {
            !sent
                .iter()
                .any(|s| s.path == filter.path && s.qos == filter.qos)
        })
        .collect()
}
