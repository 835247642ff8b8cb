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

//! Integration tests against a scripted in-process broker.
//!
//! Each test binds a local TCP listener and speaks just enough MQTT 3.1.1
//! to drive the pipeline: it acknowledges CONNECT, watches for SUBSCRIBE,
//! and writes raw PUBLISH frames. No external broker is required.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use inlet::sensor::{ReadingSink, STATE_FILTER};
use inlet::{
    ConnectionState, DropObserver, DropReason, InboundMessage, Pipeline, PipelineConfig, QoS,
    ReconnectConfig, Sink, SinkError,
};

const WAIT: Duration = Duration::from_secs(5);

const CONNECT: u8 = 1;
const SUBSCRIBE: u8 = 8;

/// Reads one MQTT frame and returns its packet type and variable body.
async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let first = stream.read_u8().await?;
    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        remaining |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body).await?;
    Ok((first >> 4, body))
}

/// Accepts one client and completes the session handshake.
async fn accept_and_connack(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.expect("accept");
    let (packet_type, _) = read_packet(&mut stream).await.expect("read connect");
    assert_eq!(packet_type, CONNECT, "first packet should be CONNECT");
    stream
        .write_all(&[0x20, 0x02, 0x00, 0x00])
        .await
        .expect("write connack");
    stream
}

/// Skips frames until a SUBSCRIBE arrives and returns its body.
async fn read_until_subscribe(stream: &mut TcpStream) -> Vec<u8> {
    loop {
        let (packet_type, body) = read_packet(stream).await.expect("read packet");
        if packet_type == SUBSCRIBE {
            return body;
        }
    }
}

/// Encodes a QoS 1 PUBLISH frame.
fn publish_packet(topic: &str, payload: &[u8], pkid: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(&pkid.to_be_bytes());
    body.extend_from_slice(payload);

    let mut packet = vec![0x32];
    let mut remaining = body.len();
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if remaining == 0 {
            break;
        }
    }
    packet.extend_from_slice(&body);
    packet
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Requested QoS byte that follows `path` inside a SUBSCRIBE body.
fn subscribe_qos(body: &[u8], path: &str) -> Option<u8> {
    let needle = path.as_bytes();
    body.windows(needle.len())
        .position(|window| window == needle)
        .and_then(|pos| body.get(pos + needle.len()).copied())
}

fn test_config(port: u16, client_id: &str) -> PipelineConfig {
    PipelineConfig::builder("127.0.0.1")
        .port(port)
        .client_id(client_id)
        .queue_capacity(16)
        .reconnect(fast_reconnect(None))
        .drain_grace(Duration::from_secs(1))
        .build()
}

fn fast_reconnect(max_attempts: Option<u32>) -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        jitter: false,
        max_attempts,
    }
}

/// Forwards each payload as text over a channel, optionally after a delay.
struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
    delay: Duration,
}

impl ChannelSink {
    fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            tx,
            delay: Duration::ZERO,
        }
    }

    fn slow(tx: mpsc::UnboundedSender<String>, delay: Duration) -> Self {
        Self { tx, delay }
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn deliver(&self, message: &InboundMessage) -> Result<(), SinkError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.tx
            .send(String::from_utf8_lossy(&message.payload).into_owned())
            .map_err(|_| SinkError::permanent("test channel closed"))
    }
}

#[derive(Default)]
struct CountingObserver {
    drops: AtomicUsize,
}

impl DropObserver for CountingObserver {
    fn on_drop(&self, _message: &InboundMessage, _reason: DropReason) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

async fn wait_for_state(pipeline: &Pipeline, wanted: ConnectionState) {
    let mut rx = pipeline.watch_state();
    timeout(WAIT, rx.wait_for(|state| *state == wanted))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"))
        .expect("state channel closed");
}

#[tokio::test]
async fn test_delivers_decoded_readings_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let pipeline = Pipeline::new(test_config(port, "it-deliver")).unwrap();
    let (tx, mut rx) = mpsc::channel(8);
    pipeline
        .subscribe(STATE_FILTER, QoS::AtLeastOnce, Arc::new(ReadingSink::new(tx)))
        .await
        .unwrap();
    pipeline.start().await.unwrap();

    let mut stream = accept_and_connack(&listener).await;
    read_until_subscribe(&mut stream).await;
    wait_for_state(&pipeline, ConnectionState::Connected).await;

    stream
        .write_all(&publish_packet(
            "devices/sensor/7/state",
            br#"{"moisture": 41}"#,
            1,
        ))
        .await
        .unwrap();

    let update = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(update.source.node_id, "7");
    assert_eq!(update.reading.moisture, 41.0);

    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reconnect_restores_every_subscription() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let pipeline = Pipeline::new(test_config(port, "it-resub")).unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    pipeline
        .subscribe(
            "devices/+/+/state",
            QoS::AtLeastOnce,
            Arc::new(ChannelSink::new(tx.clone())),
        )
        .await
        .unwrap();
    pipeline
        .subscribe("alerts/#", QoS::AtMostOnce, Arc::new(ChannelSink::new(tx)))
        .await
        .unwrap();
    pipeline.start().await.unwrap();

    // First session: acknowledge, observe the subscription, then cut the link.
    let mut first = accept_and_connack(&listener).await;
    let body = read_until_subscribe(&mut first).await;
    assert!(contains(&body, b"devices/+/+/state"));
    assert!(contains(&body, b"alerts/#"));
    wait_for_state(&pipeline, ConnectionState::Connected).await;
    drop(first);

    wait_for_state(&pipeline, ConnectionState::Reconnecting).await;

    // Second session: every filter is re-issued before Connected is reported.
    let mut second = accept_and_connack(&listener).await;
    let body = read_until_subscribe(&mut second).await;
    assert!(contains(&body, b"devices/+/+/state"));
    assert!(contains(&body, b"alerts/#"));
    wait_for_state(&pipeline, ConnectionState::Connected).await;

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_live_subscribe_keeps_shared_path_qos() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let pipeline = Pipeline::new(test_config(port, "it-qos")).unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    pipeline
        .subscribe(
            "farm/plot/9",
            QoS::AtLeastOnce,
            Arc::new(ChannelSink::new(tx.clone())),
        )
        .await
        .unwrap();
    pipeline.start().await.unwrap();

    let mut stream = accept_and_connack(&listener).await;
    let body = read_until_subscribe(&mut stream).await;
    assert_eq!(subscribe_qos(&body, "farm/plot/9"), Some(1));
    wait_for_state(&pipeline, ConnectionState::Connected).await;

    // A second, lower-QoS subscriber on the same path re-issues the
    // filter; the broker replaces subscriptions wholesale, so the wire
    // must still carry the higher QoS.
    pipeline
        .subscribe("farm/plot/9", QoS::AtMostOnce, Arc::new(ChannelSink::new(tx)))
        .await
        .unwrap();
    let body = read_until_subscribe(&mut stream).await;
    assert_eq!(subscribe_qos(&body, "farm/plot/9"), Some(1));

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_slow_sink_backpressure_drops_nothing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let observer = Arc::new(CountingObserver::default());
    let config = PipelineConfig::builder("127.0.0.1")
        .port(port)
        .client_id("it-backpressure")
        .queue_capacity(2)
        .reconnect(fast_reconnect(None))
        .drain_grace(Duration::from_secs(1))
        .build();
    let pipeline = Pipeline::with_observer(config, observer.clone()).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    pipeline
        .subscribe(
            "farm/plot/9",
            QoS::AtLeastOnce,
            Arc::new(ChannelSink::slow(tx, Duration::from_millis(50))),
        )
        .await
        .unwrap();
    pipeline.start().await.unwrap();

    let mut stream = accept_and_connack(&listener).await;
    read_until_subscribe(&mut stream).await;

    // More publishes than the queue holds; the network path must absorb
    // them through backpressure rather than dropping.
    let payloads: [&[u8]; 5] = [b"r1", b"r2", b"r3", b"r4", b"r5"];
    for (i, payload) in payloads.iter().enumerate() {
        stream
            .write_all(&publish_packet("farm/plot/9", payload, i as u16 + 1))
            .await
            .unwrap();
    }

    for expected in ["r1", "r2", "r3", "r4", "r5"] {
        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, expected);
    }
    assert_eq!(observer.drops.load(Ordering::SeqCst), 0);

    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_interrupts_reconnect_backoff() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener); // nothing is listening; every attempt is refused

    let pipeline = Pipeline::new(test_config(port, "it-stop")).unwrap();
    pipeline.start().await.unwrap();

    // Let a few attempts fail; the connection task sits in its backoff sleep.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pipeline.state(), ConnectionState::Connecting);

    timeout(Duration::from_secs(2), pipeline.stop())
        .await
        .expect("stop should not wait out the backoff")
        .unwrap();
    assert_eq!(pipeline.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_retry_cap_reaches_failed_state() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = PipelineConfig::builder("127.0.0.1")
        .port(port)
        .client_id("it-cap")
        .reconnect(ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(50),
            jitter: false,
            max_attempts: Some(3),
        })
        .drain_grace(Duration::from_secs(1))
        .build();
    let pipeline = Pipeline::new(config).unwrap();
    pipeline.start().await.unwrap();

    wait_for_state(&pipeline, ConnectionState::Failed).await;

    // Stop still cleans up workers; the state stays Failed until a restart.
    pipeline.stop().await.unwrap();
    assert_eq!(pipeline.state(), ConnectionState::Failed);
}
