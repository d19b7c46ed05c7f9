//! Ping/pong liveness monitor.
//!
//! One monitor runs per connected session. Every interval it sends a `ping`
//! and waits up to the timeout for the supervisor to report a `pong`. Each
//! unanswered ping counts as a miss; reaching the configured maximum declares
//! the connection dead. Any pong resets the miss counter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use ridelink_core::config::HeartbeatConfig;

use super::timer::{ScheduledTask, TimerSlot};
use crate::message::OutboundEvent;
use crate::transport::TransportSink;

/// What the monitor reports back to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// A pong answered the outstanding ping.
    Pong {
        /// Time from ping to pong.
        latency: Duration,
    },
    /// A ping went unanswered.
    Missed {
        /// Consecutive misses, including this one.
        count: u32,
    },
    /// Too many consecutive misses; the monitor has stopped.
    Dead {
        /// Consecutive misses that triggered the verdict.
        missed: u32,
    },
}

/// Shared between the monitor task and the inbound reader.
#[derive(Debug)]
pub struct HeartbeatState {
    missed: AtomicU32,
    pongs: watch::Sender<u64>,
}

impl HeartbeatState {
    fn new() -> Self {
        let (pongs, _) = watch::channel(0);
        Self {
            missed: AtomicU32::new(0),
            pongs,
        }
    }

    /// Report that a pong arrived.
    pub fn record_pong(&self) {
        self.pongs.send_modify(|seq| *seq = seq.wrapping_add(1));
    }

    /// Consecutive unanswered pings.
    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::SeqCst)
    }
}

/// Runs the ping loop for one connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    task: TimerSlot,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor.
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            state: Arc::new(HeartbeatState::new()),
            task: TimerSlot::new(),
        }
    }

    /// Handle for reporting pongs.
    pub fn state(&self) -> Arc<HeartbeatState> {
        Arc::clone(&self.state)
    }

    /// Start pinging over `sink`. Restarting replaces the running loop.
    pub fn start(
        &self,
        sink: Arc<dyn TransportSink>,
        events: mpsc::UnboundedSender<HeartbeatEvent>,
    ) {
        self.state.missed.store(0, Ordering::SeqCst);
        let task = ScheduledTask::spawn(
            "heartbeat",
            run(self.config.clone(), Arc::clone(&self.state), sink, events),
        );
        self.task.replace(task);
    }

    /// Stop pinging.
    pub fn stop(&self) {
        if self.task.cancel() {
            debug!("Heartbeat stopped");
        }
    }

    /// Whether the ping loop is active.
    pub fn is_running(&self) -> bool {
        self.task.is_pending()
    }

    /// Consecutive unanswered pings.
    pub fn missed_count(&self) -> u32 {
        self.state.missed()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.cancel();
    }
}

async fn run(
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    sink: Arc<dyn TransportSink>,
    events: mpsc::UnboundedSender<HeartbeatEvent>,
) {
    let interval = config.interval();
    let timeout = config.timeout();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pongs = state.pongs.subscribe();

    loop {
        ticker.tick().await;

        // Pongs that arrived between cycles do not answer the next ping.
        pongs.borrow_and_update();

        let sent_at = Instant::now();
        match OutboundEvent::ping().to_frame() {
            Ok((event, payload)) => {
                if let Err(e) = sink.send(&event, payload).await {
                    warn!(error = %e, "Failed to send heartbeat ping");
                }
            }
            Err(e) => warn!(error = %e, "Failed to build heartbeat ping"),
        }

        tokio::select! {
            changed = pongs.changed() => {
                if changed.is_err() {
                    break;
                }
                state.missed.store(0, Ordering::SeqCst);
                let latency = sent_at.elapsed();
                debug!(latency_ms = latency.as_millis() as u64, "Heartbeat pong");
                if events.send(HeartbeatEvent::Pong { latency }).is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(timeout) => {
                let count = state.missed.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(missed = count, max = config.max_missed, "Heartbeat missed");
                if events.send(HeartbeatEvent::Missed { count }).is_err() {
                    break;
                }
                if count >= config.max_missed {
                    warn!(missed = count, "Heartbeat exhausted, connection considered dead");
                    let _ = events.send(HeartbeatEvent::Dead { missed: count });
                    break;
                }
            }
        }
    }
}
