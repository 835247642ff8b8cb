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

use std::sync::Arc;

use anyhow::Result;
use inlet::sensor::{ReadingSink, STATE_FILTER};
use inlet::{LogSink, Pipeline, PipelineConfig, QoS};
use log::info;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    info!("Starting moisture sensor gateway...");

    // 1. Configure the pipeline
    // Broker endpoint and extra filters come from MQTT_* environment variables.
    let config = PipelineConfig::from_env()?;
    let pipeline = Pipeline::new(config)?;

    // 2. Wire moisture readings into a channel
    // Every devices/+/+/state payload is decoded off the network path.
    let (tx, mut readings) = mpsc::channel(64);
    pipeline
        .subscribe(STATE_FILTER, QoS::AtLeastOnce, Arc::new(ReadingSink::new(tx)))
        .await?;

    // 3. Log whatever else the deployment asked for
    // MQTT_TOPIC holds a comma-separated filter list; unset, it falls
    // back to the catch-all `#` so every payload shows up in the log.
    let configured = pipeline
        .subscribe_configured(Arc::new(LogSink::default()))
        .await?;
    info!("Logging traffic on {} configured filter(s)", configured.len());

    // 4. Start the pipeline and consume readings until shutdown
    pipeline.start().await?;

    let consumer = tokio::spawn(async move {
        while let Some(update) = readings.recv().await {
            info!(
                "node {} ({}) moisture {:.0}%",
                update.source.node_id, update.source.device_type, update.reading.moisture
            );
        }
    });

    // Keep running until signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    pipeline.stop().await?;
    consumer.abort();

    Ok(())
}
