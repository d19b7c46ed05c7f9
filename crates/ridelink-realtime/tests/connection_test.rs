//! Integration tests for the connection lifecycle: negotiation,
//! reconnection, heartbeats and cancellation.

mod helpers;

use std::time::Duration;

use serde_json::json;

use ridelink_core::error::ErrorKind;
use ridelink_realtime::message::ProtocolVersion;
use ridelink_realtime::{
    ChannelEvent, CloseReason, ConnectionState, EventKind, InboundEvent, OutboundEvent, SendOutcome,
    Signal,
};

use helpers::{client_with, eventually, of_kind, record_all, test_config, wait_for_state};

fn signals(events: Vec<ChannelEvent>) -> Vec<Signal> {
    events
        .into_iter()
        .filter_map(|event| match event {
            ChannelEvent::Signal(signal) => Some(signal),
            ChannelEvent::Inbound(_) => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_connect_negotiates_protocol() {
    let (client, transport, _) = client_with(test_config()).await;
    let log = record_all(&client);

    client.connect("token").await.expect("connect");

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(
        transport.latest_sink().sent_names(),
        vec!["protocol_version_request"]
    );
    let protocol = client.protocol().expect("negotiated");
    assert_eq!(protocol.server, Some(ProtocolVersion::new(2, 0, 0)));
    assert_eq!(of_kind(&log, EventKind::Connected).len(), 1);
    assert!(of_kind(&log, EventKind::ProtocolMismatch).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_older_server_is_a_mismatch_but_connects() {
    let (client, transport, _) = client_with(test_config()).await;
    transport.set_server_version(Some("1.4.2"));
    let log = record_all(&client);

    client.connect("token").await.expect("connect");

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(
        signals(of_kind(&log, EventKind::ProtocolMismatch)),
        vec![Signal::ProtocolMismatch {
            client_version: "2.0.0".to_string(),
            server_version: "1.4.2".to_string(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_silent_server_still_connects() {
    let (client, transport, _) = client_with(test_config()).await;
    transport.set_server_version(None);
    let log = record_all(&client);

    client.connect("token").await.expect("connect");

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.protocol().and_then(|p| p.server), None);
    assert!(of_kind(&log, EventKind::ProtocolMismatch).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_open_once() {
    let (client, transport, _) = client_with(test_config()).await;
    transport.set_open_delay(Some(Duration::from_secs(1)));

    let (a, b) = tokio::join!(client.connect("token"), client.connect("token"));
    a.expect("first connect");
    b.expect("second connect");

    assert_eq!(transport.open_count(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_does_not_auto_reconnect() {
    let (client, transport, _) = client_with(test_config()).await;
    transport.fail_next_opens(1, ErrorKind::Transport);
    let log = record_all(&client);

    let err = client.connect("token").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Transport);
    assert_eq!(client.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.open_count(), 1);
    assert!(of_kind(&log, EventKind::ReconnectScheduled).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_auth_rejection_is_surfaced() {
    let (client, transport, _) = client_with(test_config()).await;
    transport.fail_next_opens(1, ErrorKind::Authentication);

    let err = client.connect("expired").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authentication);
    assert!(!err.is_transient());
}

#[tokio::test(start_paused = true)]
async fn test_server_close_reconnects() {
    let (client, transport, _) = client_with(test_config()).await;
    let log = record_all(&client);
    client.connect("token").await.expect("connect");

    transport.drop_connection(CloseReason::ServerInitiated).await;
    eventually(|| transport.connection_count() == 2).await;
    wait_for_state(&client, ConnectionState::Connected).await;

    let signals = signals(log.lock().unwrap().clone());
    assert!(signals.contains(&Signal::Disconnected {
        reason: CloseReason::ServerInitiated
    }));
    assert!(signals.contains(&Signal::ReconnectScheduled {
        attempt: 1,
        delay: Duration::from_millis(1000),
    }));
    assert!(signals.contains(&Signal::Reconnected { attempt: 1 }));
    assert_eq!(client.attempts(), 0);
    assert!(transport.latest_sink().sent_names().contains(&"protocol_version_request".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_grows_between_failed_attempts() {
    let (client, transport, _) = client_with(test_config()).await;
    let log = record_all(&client);
    client.connect("token").await.expect("connect");

    transport.fail_next_opens(2, ErrorKind::Transport);
    transport.drop_connection(CloseReason::NetworkError).await;
    eventually(|| !of_kind(&log, EventKind::Reconnected).is_empty()).await;

    let delays: Vec<(u32, Duration)> = signals(of_kind(&log, EventKind::ReconnectScheduled))
        .into_iter()
        .filter_map(|signal| match signal {
            Signal::ReconnectScheduled { attempt, delay } => Some((attempt, delay)),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            (1, Duration::from_millis(1000)),
            (2, Duration::from_millis(2000)),
            (3, Duration::from_millis(4000)),
        ]
    );
    assert_eq!(
        signals(of_kind(&log, EventKind::Reconnected)),
        vec![Signal::Reconnected { attempt: 3 }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_attempt_counter_resets_after_reconnect() {
    let (client, transport, _) = client_with(test_config()).await;
    let log = record_all(&client);
    client.connect("token").await.expect("connect");

    transport.fail_next_opens(1, ErrorKind::Transport);
    transport.drop_connection(CloseReason::NetworkError).await;
    eventually(|| transport.connection_count() == 2).await;
    wait_for_state(&client, ConnectionState::Connected).await;

    log.lock().unwrap().clear();
    transport.drop_connection(CloseReason::ServerInitiated).await;
    eventually(|| !of_kind(&log, EventKind::ReconnectScheduled).is_empty()).await;

    assert_eq!(
        signals(of_kind(&log, EventKind::ReconnectScheduled))[0],
        Signal::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_millis(1000),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let (client, transport, _) = client_with(test_config()).await;
    let log = record_all(&client);
    client.connect("token").await.expect("connect");

    transport.fail_next_opens(10, ErrorKind::Transport);
    transport.drop_connection(CloseReason::NetworkError).await;
    eventually(|| !of_kind(&log, EventKind::ReconnectFailed).is_empty()).await;

    assert_eq!(
        signals(of_kind(&log, EventKind::ReconnectFailed)),
        vec![Signal::ReconnectFailed { attempts: 3 }]
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(transport.open_count(), 4);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(transport.open_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_reports_latency() {
    let (client, _transport, _) = client_with(test_config()).await;
    let log = record_all(&client);
    client.connect("token").await.expect("connect");

    eventually(|| !of_kind(&log, EventKind::Heartbeat).is_empty()).await;
    assert!(of_kind(&log, EventKind::HeartbeatMissed).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dead_heartbeat_triggers_reconnect() {
    let (client, transport, _) = client_with(test_config()).await;
    let log = record_all(&client);
    client.connect("token").await.expect("connect");
    transport.set_answer_pings(false);

    eventually(|| transport.connection_count() == 2).await;

    let missed: Vec<Signal> = signals(of_kind(&log, EventKind::HeartbeatMissed));
    assert_eq!(
        missed,
        vec![
            Signal::HeartbeatMissed { count: 1 },
            Signal::HeartbeatMissed { count: 2 },
            Signal::HeartbeatMissed { count: 3 },
        ]
    );
    assert!(signals(of_kind(&log, EventKind::Disconnected)).contains(&Signal::Disconnected {
        reason: CloseReason::HeartbeatTimeout
    }));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_connect_is_ignored() {
    let (client, transport, _) = client_with(test_config()).await;
    transport.set_open_delay(Some(Duration::from_secs(5)));
    let log = record_all(&client);

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect("token").await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.state(), ConnectionState::Connecting);
    client.disconnect().await;

    let result = connecting.await.expect("connect task");
    assert_eq!(result.unwrap_err().kind, ErrorKind::Cancelled);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(of_kind(&log, EventKind::Connected).is_empty());
    assert!(transport.latest_sink().is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let (client, transport, _) = client_with(test_config()).await;
    client.connect("token").await.expect("connect");

    transport.drop_connection(CloseReason::ServerInitiated).await;
    wait_for_state(&client, ConnectionState::Reconnecting).await;
    client.disconnect().await;

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.connection_count(), 1);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_client_close_is_not_reconnected() {
    let (client, transport, _) = client_with(test_config()).await;
    let log = record_all(&client);
    client.connect("token").await.expect("connect");

    client.disconnect().await;
    assert!(transport.latest_sink().is_closed());
    assert_eq!(
        signals(of_kind(&log, EventKind::Disconnected)),
        vec![Signal::Disconnected {
            reason: CloseReason::ClientInitiated
        }]
    );

    client.connect("token").await.expect("reconnect after disconnect");
    assert_eq!(transport.connection_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_events_dispatch_once() {
    let (client, transport, _) = client_with(test_config()).await;
    let log = record_all(&client);
    client.connect("token").await.expect("connect");

    let update = json!({"eventId": "e-1", "rideId": "r-1", "status": "arrived"});
    transport.push("ride_status_update", update.clone()).await;
    transport.push("ride_status_update", update).await;
    transport
        .push(
            "ride_status_update",
            json!({"eventId": "e-2", "rideId": "r-1", "status": "started"}),
        )
        .await;

    eventually(|| of_kind(&log, EventKind::RideStatusUpdate).len() >= 2).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let statuses: Vec<String> = of_kind(&log, EventKind::RideStatusUpdate)
        .into_iter()
        .filter_map(|event| match event {
            ChannelEvent::Inbound(InboundEvent::RideStatusUpdate(update)) => Some(update.status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec!["arrived", "started"]);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_is_dropped() {
    let (client, transport, _) = client_with(test_config()).await;
    let log = record_all(&client);
    client.connect("token").await.expect("connect");

    transport.push("ride_status_update", json!({"status": 5})).await;
    transport.push("surge_pricing", json!({"multiplier": 1.5})).await;
    transport
        .push("chat_message", json!({"rideId": "r-1", "senderId": "d-1", "text": "outside"}))
        .await;

    eventually(|| !of_kind(&log, EventKind::ChatMessage).is_empty()).await;
    assert!(of_kind(&log, EventKind::RideStatusUpdate).is_empty());
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_off_removes_handler() {
    let (client, transport, _) = client_with(test_config()).await;
    client.connect("token").await.expect("connect");

    let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let id = {
        let seen = seen.clone();
        client.on(EventKind::ChatMessage, move |_| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        })
    };
    let chat = |text: &str| json!({"rideId": "r-1", "senderId": "d-1", "text": text});

    transport.push("chat_message", chat("one")).await;
    eventually(|| seen.load(std::sync::atomic::Ordering::SeqCst) == 1).await;

    assert_eq!(client.off(EventKind::ChatMessage, Some(id)), 1);
    transport.push("chat_message", chat("two")).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_while_connected_goes_straight_out() {
    let (client, transport, _) = client_with(test_config()).await;
    client.connect("token").await.expect("connect");

    let outcome = client.join_ride("r-9").await.expect("send");
    assert_eq!(outcome, SendOutcome::Sent);
    assert_eq!(client.queue_len(), 0);

    let sent = transport.latest_sink().sent();
    let (event, payload) = sent.last().expect("a frame");
    assert_eq!(event, "join_ride");
    assert_eq!(payload, &json!({"rideId": "r-9"}));
}

#[tokio::test(start_paused = true)]
async fn test_control_frames_are_not_queued() {
    let (client, _transport, _) = client_with(test_config()).await;

    let err = client.send(OutboundEvent::ping()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Transport);
    assert_eq!(client.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_closed_client_refuses_connect() {
    let (client, _transport, _) = client_with(test_config()).await;
    client.connect("token").await.expect("connect");

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    let err = client.connect("token").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
}
