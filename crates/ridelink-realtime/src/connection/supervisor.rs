//! Connection supervisor.
//!
//! Owns the transport handle, the heartbeat monitor, the reconnect timer and
//! the attempt counter. Every state transition goes through here.
//!
//! Each `disconnect()` bumps an epoch. Work started under an older epoch
//! (an in-flight connect, a pending reconnect) notices the change and drops
//! its result instead of reporting it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use ridelink_core::config::{ChannelConfig, ProtocolConfig};
use ridelink_core::error::{AppError, ErrorKind};
use ridelink_core::result::AppResult;
use ridelink_core::traits::KeyValueStore;

use super::backoff::Backoff;
use super::heartbeat::{HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
use super::state::{ConnectMode, ConnectionState};
use super::timer::{ScheduledTask, TimerSlot};
use crate::events::{
    ChannelEvent, EventKind, HandlerRegistry, IdempotencyFilter, Signal, SubscriptionId,
};
use crate::message::validator::validate_frame;
use crate::message::{
    event_id, InboundEvent, LocationPing, NegotiatedProtocol, OutboundEvent, ProtocolVersion,
};
use crate::outbox::OfflineQueue;
use crate::presence::status::{PresenceRecord, PresenceStatus};
use crate::presence::tracker::PresenceTracker;
use crate::transport::{CloseReason, Transport, TransportConnection, TransportEvent, TransportSink};

/// What happened to an outbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the open transport.
    Sent,
    /// Stored in the offline queue.
    Queued {
        /// Queue length after the append.
        queue_size: usize,
    },
}

/// The live connection.
#[derive(Debug)]
struct ActiveSession {
    id: u64,
    sink: Arc<dyn TransportSink>,
    heartbeat: HeartbeatMonitor,
    reader: Option<ScheduledTask>,
}

impl ActiveSession {
    /// Stop the heartbeat and reader, then close the socket.
    async fn shut_down(mut self, cancel_reader: bool) {
        self.heartbeat.stop();
        if let Some(reader) = self.reader.take() {
            if cancel_reader {
                reader.cancel();
            } else {
                reader.detach();
            }
        }
        self.sink.close().await;
    }
}

#[derive(Debug)]
struct ClientInner {
    config: ChannelConfig,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    handlers: HandlerRegistry,
    dedup: IdempotencyFilter,
    presence: PresenceTracker,
    queue: OfflineQueue,
    session: Mutex<Option<ActiveSession>>,
    reconnect_timer: TimerSlot,
    /// Serializes connects so only one transport opens at a time.
    connect_lock: tokio::sync::Mutex<()>,
    attempts: AtomicU32,
    epoch: AtomicU64,
    session_seq: AtomicU64,
    auth_token: RwLock<Option<String>>,
    backoff: Mutex<Backoff>,
    protocol: RwLock<Option<NegotiatedProtocol>>,
    closed: AtomicBool,
}

/// Real-time channel client.
///
/// Cheap to clone; clones share one connection.
#[derive(Debug, Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl RealtimeClient {
    /// Create a client and restore the persisted offline queue.
    pub async fn new(
        config: ChannelConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
    ) -> AppResult<Self> {
        config.validate()?;

        let queue = OfflineQueue::new(config.queue.clone(), store);
        queue.load().await?;

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = ClientInner {
            transport,
            state,
            handlers: HandlerRegistry::new(),
            dedup: IdempotencyFilter::new(config.idempotency.max_entries),
            presence: PresenceTracker::new(),
            queue,
            session: Mutex::new(None),
            reconnect_timer: TimerSlot::new(),
            connect_lock: tokio::sync::Mutex::new(()),
            attempts: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            session_seq: AtomicU64::new(0),
            auth_token: RwLock::new(None),
            backoff: Mutex::new(Backoff::from_config(&config.reconnect)),
            protocol: RwLock::new(None),
            closed: AtomicBool::new(false),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Open the channel.
    ///
    /// Resolves once the transport is open and negotiated. A failure here is
    /// returned to the caller and does not start automatic reconnection.
    /// Concurrent calls share one attempt; calling while connected is a no-op.
    pub async fn connect(&self, auth_token: impl Into<String>) -> AppResult<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(AppError::validation("Client has been closed"));
        }
        *inner.auth_token.write().unwrap_or_else(|e| e.into_inner()) = Some(auth_token.into());

        let _guard = inner.connect_lock.lock().await;
        if inner.is_connected() {
            debug!("Connect requested while already connected");
            return Ok(());
        }

        inner.reconnect_timer.cancel();
        inner.attempts.store(0, Ordering::SeqCst);
        let epoch = inner.epoch.load(Ordering::SeqCst);

        match ClientInner::establish(inner, epoch, ConnectMode::Explicit).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Connect failed");
                inner.transition(epoch, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Close the channel on purpose.
    ///
    /// Stops the heartbeat, cancels any pending reconnect, abandons an
    /// in-flight connect and writes the offline queue to storage. Safe to
    /// call in any state; the client may `connect` again afterwards.
    pub async fn disconnect(&self) {
        let inner = &self.inner;

        let mut previous = ConnectionState::Disconnected;
        inner.state.send_modify(|state| {
            inner.epoch.fetch_add(1, Ordering::SeqCst);
            previous = *state;
            *state = ConnectionState::Disconnected;
        });
        inner.reconnect_timer.cancel();
        inner.attempts.store(0, Ordering::SeqCst);

        let session = inner.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(session) = session {
            info!(session_id = session.id, "Closing connection");
            session.shut_down(true).await;
        }

        *inner.protocol.write().unwrap_or_else(|e| e.into_inner()) = None;
        inner.dedup.clear();

        if let Err(e) = inner.queue.persist_now().await {
            error!(error = %e, "Failed to persist offline queue on disconnect");
        }

        if previous != ConnectionState::Disconnected {
            info!(from = %previous, "Disconnected by client");
            inner.emit(Signal::Disconnected {
                reason: CloseReason::ClientInitiated,
            });
        }
    }

    /// Disconnect, drop every handler and presence subscription, and refuse
    /// further connects.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.disconnect().await;
        self.inner.handlers.clear();
        self.inner.presence.clear();
        info!("Realtime client closed");
    }

    // ── Subscriptions ─────────────────────────────────────────────

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.inner.handlers.on(kind, handler)
    }

    /// Remove one handler, or all handlers of `kind` when `id` is `None`.
    pub fn off(&self, kind: EventKind, id: Option<SubscriptionId>) -> usize {
        self.inner.handlers.off(kind, id)
    }

    // ── Sending ───────────────────────────────────────────────────

    /// Send an event, queueing it when the channel is down.
    ///
    /// Control frames are never queued; sending one while disconnected is a
    /// [`ErrorKind::Transport`] error.
    pub async fn send(&self, event: OutboundEvent) -> AppResult<SendOutcome> {
        let (name, payload) = event.to_frame()?;
        validate_frame(&name, &payload)?;

        match self.inner.current_sink() {
            Some(sink) => match sink.send(&name, payload.clone()).await {
                Ok(()) => {
                    debug!(event = %name, "Sent");
                    return Ok(SendOutcome::Sent);
                }
                Err(e) if event.is_queueable() => {
                    warn!(event = %name, error = %e, "Send failed, queueing for retry");
                }
                Err(e) => return Err(e),
            },
            None if !event.is_queueable() => {
                return Err(AppError::transport(format!(
                    "Cannot send {name} while {}",
                    self.state()
                )));
            }
            None => {}
        }

        let outcome = self.inner.queue.enqueue(name.clone(), payload);
        self.inner.emit(Signal::MessageQueued {
            event: name,
            queue_size: outcome.queue_size,
        });
        Ok(SendOutcome::Queued {
            queue_size: outcome.queue_size,
        })
    }

    /// Start receiving a ride's events.
    pub async fn join_ride(&self, ride_id: impl Into<String>) -> AppResult<SendOutcome> {
        self.send(OutboundEvent::JoinRide {
            ride_id: ride_id.into(),
        })
        .await
    }

    /// Stop receiving a ride's events.
    pub async fn leave_ride(&self, ride_id: impl Into<String>) -> AppResult<SendOutcome> {
        self.send(OutboundEvent::LeaveRide {
            ride_id: ride_id.into(),
        })
        .await
    }

    /// Report the rider's position.
    pub async fn send_location(&self, ping: LocationPing) -> AppResult<SendOutcome> {
        self.send(OutboundEvent::LocationUpdate(ping)).await
    }

    /// Report the driver's position.
    pub async fn send_driver_location(&self, ping: LocationPing) -> AppResult<SendOutcome> {
        self.send(OutboundEvent::DriverLocationUpdate(ping)).await
    }

    /// Post a chat line to a ride.
    pub async fn send_chat_message(
        &self,
        ride_id: impl Into<String>,
        text: impl Into<String>,
    ) -> AppResult<SendOutcome> {
        self.send(OutboundEvent::chat(ride_id, text)).await
    }

    /// Change the driver's availability.
    pub async fn update_driver_status(&self, status: impl Into<String>) -> AppResult<SendOutcome> {
        self.send(OutboundEvent::DriverStatusUpdate {
            status: status.into(),
        })
        .await
    }

    /// Accept an offered ride.
    pub async fn accept_ride(&self, ride_id: impl Into<String>) -> AppResult<SendOutcome> {
        self.send(OutboundEvent::AcceptRide {
            ride_id: ride_id.into(),
        })
        .await
    }

    /// Decline an offered ride.
    pub async fn reject_ride(
        &self,
        ride_id: impl Into<String>,
        reason: Option<String>,
    ) -> AppResult<SendOutcome> {
        self.send(OutboundEvent::RejectRide {
            ride_id: ride_id.into(),
            reason,
        })
        .await
    }

    /// Mark a ride as started.
    pub async fn start_ride(&self, ride_id: impl Into<String>) -> AppResult<SendOutcome> {
        self.send(OutboundEvent::StartRide {
            ride_id: ride_id.into(),
        })
        .await
    }

    /// Mark a ride as completed.
    pub async fn complete_ride(
        &self,
        ride_id: impl Into<String>,
        fare: Option<f64>,
    ) -> AppResult<SendOutcome> {
        self.send(OutboundEvent::CompleteRide {
            ride_id: ride_id.into(),
            fare,
        })
        .await
    }

    /// Publish this user's own presence.
    pub async fn update_presence(
        &self,
        status: PresenceStatus,
        ride_id: Option<String>,
    ) -> AppResult<SendOutcome> {
        self.send(OutboundEvent::PresenceUpdate { status, ride_id })
            .await
    }

    /// Send a free-form application message.
    pub async fn send_message(&self, payload: serde_json::Value) -> AppResult<SendOutcome> {
        self.send(OutboundEvent::Message(payload)).await
    }

    // ── Presence ──────────────────────────────────────────────────

    /// Follow peers' presence.
    ///
    /// Ids are remembered locally and announced to the server now if
    /// connected, and again after every connect.
    pub async fn subscribe_presence<I, S>(&self, user_ids: I) -> AppResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let added = self.inner.presence.subscribe(user_ids);
        if added.is_empty() || !self.inner.is_connected() {
            return Ok(());
        }
        self.send(OutboundEvent::PresenceSubscribe { user_ids: added })
            .await
            .map(|_| ())
    }

    /// Stop following peers' presence and forget their records.
    pub async fn unsubscribe_presence<I, S>(&self, user_ids: I) -> AppResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let removed = self.inner.presence.unsubscribe(user_ids);
        if removed.is_empty() || !self.inner.is_connected() {
            return Ok(());
        }
        self.send(OutboundEvent::PresenceUnsubscribe { user_ids: removed })
            .await
            .map(|_| ())
    }

    /// Last known presence of a user.
    pub fn get_presence(&self, user_id: &str) -> Option<PresenceRecord> {
        self.inner.presence.get_presence(user_id)
    }

    /// Whether a user was last seen online or busy.
    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.presence.is_online(user_id)
    }

    /// Ids currently followed.
    pub fn presence_subscriptions(&self) -> Vec<String> {
        self.inner.presence.subscribed_ids()
    }

    // ── Diagnostics ───────────────────────────────────────────────

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Entries waiting in the offline queue.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Reconnect attempts made since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Result of the current connection's version exchange.
    pub fn protocol(&self) -> Option<NegotiatedProtocol> {
        self.inner
            .protocol
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ClientInner {
    fn emit(&self, signal: Signal) {
        self.handlers.dispatch(&ChannelEvent::Signal(signal));
    }

    fn is_connected(&self) -> bool {
        let connected = *self.state.borrow() == ConnectionState::Connected;
        connected
            && self
                .session
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some()
    }

    fn current_sink(&self) -> Option<Arc<dyn TransportSink>> {
        if *self.state.borrow() != ConnectionState::Connected {
            return None;
        }
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|session| Arc::clone(&session.sink))
    }

    /// Move to `to` unless a disconnect happened since `epoch` was read.
    /// Returns whether the epoch was still current.
    fn transition(&self, epoch: u64, to: ConnectionState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|state| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            from = Some(*state);
            if *state == to {
                return false;
            }
            *state = to;
            true
        });
        if changed {
            if let Some(from) = from {
                info!(from = %from, to = %to, "Connection state changed");
            }
        }
        from.is_some()
    }

    fn epoch_is(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Open, negotiate and install a session, then announce it.
    async fn establish(inner: &Arc<Self>, epoch: u64, mode: ConnectMode) -> AppResult<()> {
        let pending = match mode {
            ConnectMode::Explicit => ConnectionState::Connecting,
            ConnectMode::Reconnect => ConnectionState::Reconnecting,
        };
        if !inner.transition(epoch, pending) {
            return Err(abandoned());
        }

        let token = inner
            .auth_token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default();

        info!(url = %inner.config.url, mode = ?mode, "Opening transport");
        let opened = tokio::time::timeout(
            inner.config.connect_timeout(),
            inner.transport.open(&inner.config.url, &token),
        )
        .await;
        let TransportConnection { sink, mut events } = match opened {
            Ok(result) => result?,
            Err(_) => {
                return Err(AppError::timeout(format!(
                    "Transport did not open within {}ms",
                    inner.config.connect_timeout_ms
                )));
            }
        };

        if !inner.epoch_is(epoch) {
            sink.close().await;
            return Err(abandoned());
        }

        let (protocol, backlog) =
            match negotiate(&inner.config.protocol, sink.as_ref(), &mut events).await {
                Ok(negotiated) => negotiated,
                Err(e) => {
                    sink.close().await;
                    return Err(e);
                }
            };

        let session_id = inner.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let heartbeat = HeartbeatMonitor::new(inner.config.heartbeat.clone());
        let (beat_tx, beat_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let stale = {
            let mut slot = inner.session.lock().unwrap_or_else(|e| e.into_inner());
            if !inner.epoch_is(epoch) {
                None
            } else {
                heartbeat.start(Arc::clone(&sink), beat_tx);
                let reader = ScheduledTask::spawn(
                    "session-reader",
                    run_session(
                        Arc::downgrade(inner),
                        session_id,
                        events,
                        beat_rx,
                        heartbeat.state(),
                        backlog,
                        ready_rx,
                    ),
                );
                let previous = slot.replace(ActiveSession {
                    id: session_id,
                    sink: Arc::clone(&sink),
                    heartbeat,
                    reader: Some(reader),
                });
                inner.transition(epoch, ConnectionState::Connected);
                Some(previous)
            }
        };
        let Some(stale) = stale else {
            sink.close().await;
            return Err(abandoned());
        };
        if let Some(stale) = stale {
            warn!(session_id = stale.id, "Replacing stale session");
            stale.shut_down(true).await;
        }

        *inner.protocol.write().unwrap_or_else(|e| e.into_inner()) = Some(protocol.clone());
        let attempt = inner.attempts.swap(0, Ordering::SeqCst);
        info!(
            session_id,
            attempt,
            server_version = ?protocol.server.map(|v| v.to_string()),
            "Connected"
        );

        if protocol.is_mismatch() {
            let server_version = protocol
                .server
                .map(|v| v.to_string())
                .unwrap_or_default();
            warn!(
                client_version = %protocol.client,
                server_version = %server_version,
                "Server protocol version is older than supported"
            );
            inner.emit(Signal::ProtocolMismatch {
                client_version: protocol.client.to_string(),
                server_version,
            });
        }

        if !inner.epoch_is(epoch) {
            return Err(abandoned());
        }
        inner.emit(Signal::Connected);
        if mode == ConnectMode::Reconnect {
            inner.emit(Signal::Reconnected { attempt });
        }

        let followed = inner.presence.subscribed_ids();
        if !followed.is_empty() {
            let count = followed.len();
            match (OutboundEvent::PresenceSubscribe { user_ids: followed }).to_frame() {
                Ok((event, payload)) => {
                    if let Err(e) = sink.send(&event, payload).await {
                        warn!(error = %e, "Failed to re-announce presence subscriptions");
                    } else {
                        debug!(count, "Presence subscriptions re-announced");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to build presence subscription"),
            }
        }

        if !inner.queue.is_empty() {
            let report = inner.queue.flush(sink.as_ref()).await;
            if !inner.epoch_is(epoch) {
                return Err(abandoned());
            }
            inner.emit(Signal::QueueFlushed {
                success_count: report.success_count,
                failed_count: report.failed_count,
            });
        }

        let _ = ready_tx.send(());
        Ok(())
    }

    /// Tear down a session that ended on its own and decide what follows.
    async fn on_session_ended(inner: &Arc<Self>, session_id: u64, reason: CloseReason) {
        let session = {
            let mut slot = inner.session.lock().unwrap_or_else(|e| e.into_inner());
            if slot.as_ref().is_some_and(|s| s.id == session_id) {
                slot.take()
            } else {
                None
            }
        };
        // Already torn down by disconnect() or replaced.
        let Some(session) = session else {
            return;
        };
        session.shut_down(false).await;
        *inner.protocol.write().unwrap_or_else(|e| e.into_inner()) = None;

        let epoch = inner.epoch.load(Ordering::SeqCst);
        let reconnect = reason.is_unexpected() && !inner.closed.load(Ordering::SeqCst);
        warn!(session_id, reason = %reason, reconnect, "Connection lost");

        if reconnect {
            inner.transition(epoch, ConnectionState::Reconnecting);
            inner.emit(Signal::Disconnected { reason });
            Self::schedule_reconnect(inner, epoch);
        } else {
            inner.transition(epoch, ConnectionState::Disconnected);
            inner.emit(Signal::Disconnected { reason });
        }
    }

    /// Arm the reconnect timer for the next attempt, or give up.
    fn schedule_reconnect(inner: &Arc<Self>, epoch: u64) {
        if !inner.epoch_is(epoch) {
            return;
        }

        let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let max_attempts = inner.config.reconnect.max_attempts;
        if attempt > max_attempts {
            inner.attempts.store(0, Ordering::SeqCst);
            inner.transition(epoch, ConnectionState::Disconnected);
            error!(attempts = max_attempts, "Reconnection gave up");
            inner.emit(Signal::ReconnectFailed {
                attempts: max_attempts,
            });
            return;
        }

        let delay = inner
            .backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .delay_for(attempt);
        if !inner.transition(epoch, ConnectionState::Reconnecting) {
            return;
        }

        let client = Arc::downgrade(inner);
        inner.reconnect_timer.replace(ScheduledTask::after(
            "reconnect",
            delay,
            async move {
                if let Some(inner) = client.upgrade() {
                    Self::reconnect_attempt(inner, epoch).await;
                }
            },
        ));

        info!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        inner.emit(Signal::ReconnectScheduled { attempt, delay });
    }

    fn reconnect_attempt(inner: Arc<Self>, epoch: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            inner.reconnect_timer.clear();
            let guard = inner.connect_lock.lock().await;
            if !inner.epoch_is(epoch) || inner.closed.load(Ordering::SeqCst) {
                debug!("Reconnect abandoned");
                return;
            }
            if inner.is_connected() {
                debug!("Reconnect skipped, already connected");
                return;
            }

            let attempt = inner.attempts.load(Ordering::SeqCst);
            info!(attempt, "Reconnecting");
            match Self::establish(&inner, epoch, ConnectMode::Reconnect).await {
                Ok(()) => {}
                Err(e) if e.kind == ErrorKind::Cancelled => {
                    debug!("Reconnect cancelled by disconnect");
                }
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "Reconnect attempt failed");
                    drop(guard);
                    Self::schedule_reconnect(&inner, epoch);
                }
                Err(e) => {
                    error!(attempt, error = %e, "Reconnect failed permanently");
                    inner.attempts.store(0, Ordering::SeqCst);
                    inner.transition(epoch, ConnectionState::Disconnected);
                    inner.emit(Signal::ReconnectFailed { attempts: attempt });
                }
            }
        })
    }

    /// Returns the close reason when the event ends the session.
    fn handle_transport_event(
        &self,
        event: TransportEvent,
        pongs: &HeartbeatState,
    ) -> Option<CloseReason> {
        match event {
            TransportEvent::Message { event, payload } => {
                self.handle_inbound(&event, payload, pongs);
                None
            }
            TransportEvent::Error(message) => {
                warn!(error = %message, "Transport error");
                None
            }
            TransportEvent::Closed(reason) => Some(reason),
        }
    }

    fn handle_inbound(&self, event: &str, payload: serde_json::Value, pongs: &HeartbeatState) {
        if let Err(e) = validate_frame(event, &payload) {
            warn!(event, error = %e, "Dropping invalid inbound frame");
            return;
        }

        let id = event_id(&payload);
        let decoded = match InboundEvent::decode(event, payload) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                debug!(event, "Ignoring unknown inbound event");
                return;
            }
            Err(e) => {
                warn!(event, error = %e, "Dropping malformed inbound payload");
                return;
            }
        };

        match &decoded {
            InboundEvent::Pong(_) => {
                pongs.record_pong();
                return;
            }
            InboundEvent::ProtocolVersion(version) => {
                debug!(version = %version.version, "Ignoring late protocol_version");
                return;
            }
            _ => {}
        }

        if !self.dedup.check_and_mark(id.as_deref()) {
            debug!(event, event_id = ?id, "Duplicate inbound event dropped");
            return;
        }

        match &decoded {
            InboundEvent::PresenceUpdate(record) => self.presence.apply_update(record.clone()),
            InboundEvent::PresenceBatch(batch) => {
                self.presence.apply_batch(batch.users.iter().cloned())
            }
            _ => {}
        }

        self.handlers.dispatch(&ChannelEvent::Inbound(decoded));
    }
}

fn abandoned() -> AppError {
    AppError::cancelled("Connect abandoned by disconnect")
}

/// Announce the client version and wait for the server's.
///
/// Events arriving first are kept in order for the session reader. A server
/// that never answers is tolerated; the version is then unknown.
async fn negotiate(
    config: &ProtocolConfig,
    sink: &dyn TransportSink,
    events: &mut mpsc::Receiver<TransportEvent>,
) -> AppResult<(NegotiatedProtocol, Vec<TransportEvent>)> {
    let client = ProtocolVersion::client();
    let (event, payload) = OutboundEvent::ProtocolVersionRequest {
        version: client.to_string(),
    }
    .to_frame()?;
    sink.send(&event, payload).await?;

    let deadline = Instant::now() + config.negotiation_timeout();
    let mut backlog = Vec::new();

    let server = loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => {
                warn!(
                    timeout_ms = config.negotiation_timeout_ms,
                    "Server did not announce a protocol version"
                );
                break None;
            }
            Ok(None) => {
                return Err(AppError::transport(
                    "Connection ended during protocol negotiation",
                ));
            }
            Ok(Some(TransportEvent::Closed(reason))) => {
                return Err(AppError::transport(format!(
                    "Connection closed during protocol negotiation: {reason}"
                )));
            }
            Ok(Some(TransportEvent::Message { event, payload }))
                if event == "protocol_version" =>
            {
                match InboundEvent::decode(&event, payload) {
                    Ok(Some(InboundEvent::ProtocolVersion(announced))) => {
                        match announced.version.parse::<ProtocolVersion>() {
                            Ok(version) => break Some(version),
                            Err(e) => {
                                warn!(
                                    version = %announced.version,
                                    error = %e,
                                    "Unparseable server protocol version"
                                );
                                break None;
                            }
                        }
                    }
                    Ok(_) => break None,
                    Err(e) => {
                        warn!(error = %e, "Malformed protocol_version payload");
                        break None;
                    }
                }
            }
            Ok(Some(other)) => backlog.push(other),
        }
    };

    Ok((
        NegotiatedProtocol::new(client, server, config.min_server_major),
        backlog,
    ))
}

/// Heartbeat or transport input for the session reader.
enum SessionInput {
    Transport(Option<TransportEvent>),
    Heartbeat(HeartbeatEvent),
}

/// Per-session reader: feeds inbound events through the filter and into
/// the registry, and relays heartbeat verdicts.
async fn run_session(
    client: Weak<ClientInner>,
    session_id: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    mut heartbeats: mpsc::UnboundedReceiver<HeartbeatEvent>,
    pongs: Arc<HeartbeatState>,
    backlog: Vec<TransportEvent>,
    ready: oneshot::Receiver<()>,
) {
    if ready.await.is_err() {
        return;
    }

    let reason = 'session: {
        for event in backlog {
            let Some(inner) = client.upgrade() else {
                return;
            };
            if let Some(reason) = inner.handle_transport_event(event, &pongs) {
                break 'session reason;
            }
        }

        loop {
            let input = tokio::select! {
                event = events.recv() => SessionInput::Transport(event),
                Some(beat) = heartbeats.recv() => SessionInput::Heartbeat(beat),
            };
            let Some(inner) = client.upgrade() else {
                return;
            };

            match input {
                SessionInput::Transport(Some(event)) => {
                    if let Some(reason) = inner.handle_transport_event(event, &pongs) {
                        break 'session reason;
                    }
                }
                SessionInput::Transport(None) => break 'session CloseReason::NetworkError,
                SessionInput::Heartbeat(HeartbeatEvent::Pong { latency }) => {
                    inner.emit(Signal::Heartbeat { latency });
                }
                SessionInput::Heartbeat(HeartbeatEvent::Missed { count }) => {
                    inner.emit(Signal::HeartbeatMissed { count });
                }
                SessionInput::Heartbeat(HeartbeatEvent::Dead { .. }) => {
                    break 'session CloseReason::HeartbeatTimeout;
                }
            }
        }
    };

    if let Some(inner) = client.upgrade() {
        ClientInner::on_session_ended(&inner, session_id, reason).await;
    }
}
