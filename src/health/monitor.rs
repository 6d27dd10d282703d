//! Background task that probes one session and drives its recovery.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HealthStatus, ProbeOutcome, ProbeSample, classify};
use crate::config::{HealthConfig, RecoveryPolicy};
use crate::events::ClientEvent;
use crate::protocol::methods;
use crate::session::{ChannelEvent, Session, SessionState};

/// Periodic prober for a single server.
pub(crate) struct HealthMonitor {
    session: Arc<Session>,
    config: HealthConfig,
    policy: RecoveryPolicy,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        session: Arc<Session>,
        config: HealthConfig,
        policy: RecoveryPolicy,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            session,
            config,
            policy,
            events,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let period = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(server = %self.session.id(), interval_ms = period.as_millis() as u64, "Health monitor started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(event) = self.events.recv() => self.on_channel_event(event).await,
                _ = ticker.tick() => self.on_tick().await,
            }

            if self.session.state().is_closed() {
                break;
            }
        }

        debug!(server = %self.session.id(), "Health monitor stopped");
    }

    async fn on_tick(&mut self) {
        let outcome = match self.session.state() {
            SessionState::Ready | SessionState::Degraded => tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                outcome = self.session.probe() => outcome,
            },
            SessionState::Reconnecting => ProbeOutcome::NoChannel,
            _ => return,
        };

        let status = classify(&outcome, &self.config);
        if let ProbeOutcome::Failed(reason) = &outcome {
            debug!(server = %self.session.id(), reason = %reason, "Probe failed");
        }
        self.apply(status, &outcome).await;
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Failed { generation, error } => {
                if self.session.handle_channel_failure(generation, &error).await {
                    self.apply(HealthStatus::Unhealthy, &ProbeOutcome::Failed(error.to_string()))
                        .await;
                }
            }
            ChannelEvent::Notification {
                generation,
                notification,
            } => {
                if generation != self.session.generation() {
                    return;
                }
                if notification.method == methods::TOOLS_LIST_CHANGED {
                    if let Err(e) = self.session.rediscover().await {
                        warn!(server = %self.session.id(), error = %e, "Tool rediscovery failed");
                    }
                } else {
                    debug!(server = %self.session.id(), method = %notification.method, "Ignoring notification");
                }
            }
        }
    }

    async fn apply(&mut self, status: HealthStatus, outcome: &ProbeOutcome) {
        let failures = self
            .session
            .record_probe(ProbeSample::new(status, outcome.latency()));

        match status {
            HealthStatus::Healthy => {
                if self
                    .session
                    .transition_from(|s| s == SessionState::Degraded, SessionState::Ready)
                {
                    info!(server = %self.session.id(), "Server recovered");
                    self.session.emit(ClientEvent::ServerRecovered {
                        server_id: self.session.id().to_string(),
                    });
                }
            }
            HealthStatus::Degraded => {
                if self
                    .session
                    .transition_from(|s| s == SessionState::Ready, SessionState::Degraded)
                {
                    warn!(server = %self.session.id(), "Server degraded");
                    self.session.emit(ClientEvent::ServerDegraded {
                        server_id: self.session.id().to_string(),
                    });
                }
            }
            HealthStatus::Unhealthy => self.recover(failures).await,
        }
    }

    /// Schedules the restart for the `failures`-th consecutive unhealthy
    /// probe, or gives the server up.
    async fn recover(&mut self, failures: u32) {
        let Some(delay) = self.policy.delay_for(failures) else {
            self.session
                .fail(format!("{failures} consecutive failed health checks"))
                .await;
            return;
        };

        self.session.begin_reconnect().await;
        info!(
            server = %self.session.id(),
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "Scheduling restart"
        );

        if !delay.is_zero() {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.session.restart().await.is_ok() {
            // The next probe fills in the health status.
            self.session.reset_failures();
            self.session.emit(ClientEvent::ServerRecovered {
                server_id: self.session.id().to_string(),
            });
        }
    }
}
