//! Shared test helpers for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use ridelink_core::config::ChannelConfig;
use ridelink_core::error::{AppError, ErrorKind};
use ridelink_core::result::AppResult;
use ridelink_realtime::storage::MemoryStore;
use ridelink_realtime::{
    ChannelEvent, CloseReason, ConnectionState, EventKind, RealtimeClient, Transport,
    TransportConnection, TransportEvent, TransportSink,
};

/// Outbound half of a scripted connection.
#[derive(Debug)]
pub struct MockSink {
    sent: Mutex<Vec<(String, Value)>>,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    events: mpsc::Sender<TransportEvent>,
    script: Arc<Script>,
}

impl MockSink {
    /// Everything sent on this connection, in order.
    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }

    /// Names of sent events, excluding heartbeat pings.
    pub fn sent_names(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|(event, _)| event)
            .filter(|event| event != "ping")
            .collect()
    }

    /// Whether the client closed this connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make every subsequent send fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportSink for MockSink {
    async fn send(&self, event: &str, payload: Value) -> AppResult<()> {
        let delay = *self.script.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            if !matches!(event, "protocol_version_request" | "ping") {
                tokio::time::sleep(delay).await;
            }
        }
        if self.is_closed() || self.fail_sends.load(Ordering::SeqCst) {
            return Err(AppError::transport("mock socket unavailable"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((event.to_string(), payload.clone()));

        match event {
            "protocol_version_request" => {
                let version = self.script.server_version.lock().unwrap().clone();
                if let Some(version) = version {
                    let _ = self.events.try_send(TransportEvent::Message {
                        event: "protocol_version".to_string(),
                        payload: json!({ "version": version }),
                    });
                }
            }
            "ping" if self.script.answer_pings.load(Ordering::SeqCst) => {
                let _ = self.events.try_send(TransportEvent::Message {
                    event: "pong".to_string(),
                    payload: json!({ "timestamp": payload["timestamp"] }),
                });
            }
            _ => {}
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Server behavior shared by every connection of a [`MockTransport`].
#[derive(Debug)]
struct Script {
    server_version: Mutex<Option<String>>,
    answer_pings: AtomicBool,
    open_failures: Mutex<VecDeque<ErrorKind>>,
    open_delay: Mutex<Option<Duration>>,
    send_delay: Mutex<Option<Duration>>,
    opens: AtomicUsize,
    connections: Mutex<Vec<(Arc<MockSink>, mpsc::Sender<TransportEvent>)>>,
}

/// In-memory transport driven by the test.
#[derive(Debug, Clone)]
pub struct MockTransport {
    script: Arc<Script>,
}

impl MockTransport {
    /// A server that speaks protocol 2.0.0 and answers pings.
    pub fn new() -> Self {
        Self {
            script: Arc::new(Script {
                server_version: Mutex::new(Some("2.0.0".to_string())),
                answer_pings: AtomicBool::new(true),
                open_failures: Mutex::new(VecDeque::new()),
                open_delay: Mutex::new(None),
                send_delay: Mutex::new(None),
                opens: AtomicUsize::new(0),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Version announced in reply to `protocol_version_request`; `None`
    /// never replies.
    pub fn set_server_version(&self, version: Option<&str>) {
        *self.script.server_version.lock().unwrap() = version.map(str::to_string);
    }

    /// Whether pings get a pong.
    pub fn set_answer_pings(&self, answer: bool) {
        self.script.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// Fail the next `count` opens with `kind`.
    pub fn fail_next_opens(&self, count: usize, kind: ErrorKind) {
        let mut failures = self.script.open_failures.lock().unwrap();
        for _ in 0..count {
            failures.push_back(kind);
        }
    }

    /// Delay every open by `delay`.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        *self.script.open_delay.lock().unwrap() = delay;
    }

    /// Delay every application send by `delay`. Handshake frames and pings
    /// are not delayed.
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *self.script.send_delay.lock().unwrap() = delay;
    }

    /// Number of `open` calls so far.
    pub fn open_count(&self) -> usize {
        self.script.opens.load(Ordering::SeqCst)
    }

    /// Number of opens that produced a connection.
    pub fn connection_count(&self) -> usize {
        self.script.connections.lock().unwrap().len()
    }

    /// Sink of the most recent connection.
    pub fn latest_sink(&self) -> Arc<MockSink> {
        let connections = self.script.connections.lock().unwrap();
        Arc::clone(&connections.last().expect("no connection opened").0)
    }

    /// Push a server event on the most recent connection.
    pub async fn push(&self, event: &str, payload: Value) {
        self.latest_events()
            .send(TransportEvent::Message {
                event: event.to_string(),
                payload,
            })
            .await
            .expect("connection reader gone");
    }

    /// Report a close on the most recent connection.
    pub async fn drop_connection(&self, reason: CloseReason) {
        let _ = self.latest_events().send(TransportEvent::Closed(reason)).await;
    }

    fn latest_events(&self) -> mpsc::Sender<TransportEvent> {
        let connections = self.script.connections.lock().unwrap();
        connections.last().expect("no connection opened").1.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, _url: &str, _auth_token: &str) -> AppResult<TransportConnection> {
        self.script.opens.fetch_add(1, Ordering::SeqCst);

        let delay = *self.script.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.script.open_failures.lock().unwrap().pop_front();
        if let Some(kind) = failure {
            return Err(AppError::new(kind, "mock open refused"));
        }

        let (tx, rx) = mpsc::channel(64);
        let sink = Arc::new(MockSink {
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            events: tx.clone(),
            script: Arc::clone(&self.script),
        });
        self.script
            .connections
            .lock()
            .unwrap()
            .push((Arc::clone(&sink), tx));

        Ok(TransportConnection { sink, events: rx })
    }
}

/// Channel config tuned for tests: deterministic backoff, short timers.
pub fn test_config() -> ChannelConfig {
    let mut config = ChannelConfig::default();
    config.url = "ws://mock/realtime".to_string();
    config.reconnect.jitter = 0.0;
    config.reconnect.seed = Some(7);
    config.reconnect.max_attempts = 3;
    config.protocol.negotiation_timeout_ms = 500;
    config
}

/// Client wired to a fresh mock transport and in-memory store.
pub async fn client_with(
    config: ChannelConfig,
) -> (RealtimeClient, MockTransport, Arc<MemoryStore>) {
    let transport = MockTransport::new();
    let store = Arc::new(MemoryStore::new());
    let client = RealtimeClient::new(config, Arc::new(transport.clone()), store.clone())
        .await
        .expect("Failed to create client");
    (client, transport, store)
}

/// Records every event delivered to the client's subscribers.
pub fn record_all(client: &RealtimeClient) -> Arc<Mutex<Vec<ChannelEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for kind in EventKind::ALL {
        let log = Arc::clone(&log);
        client.on(kind, move |event| log.lock().unwrap().push(event.clone()));
    }
    log
}

/// Events of one kind from a recorded log.
pub fn of_kind(log: &Arc<Mutex<Vec<ChannelEvent>>>, kind: EventKind) -> Vec<ChannelEvent> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|event| event.kind() == Some(kind))
        .cloned()
        .collect()
}

/// Wait (in virtual time) until the client reaches `target`.
pub async fn wait_for_state(client: &RealtimeClient, target: ConnectionState) {
    let mut watch = client.state_watch();
    tokio::time::timeout(Duration::from_secs(600), watch.wait_for(|state| *state == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target}"))
        .expect("state channel closed");
}

/// Poll `condition` until it holds, yielding to the runtime in between.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..6_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition never became true");
}
