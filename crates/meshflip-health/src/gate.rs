//! Health gate: polls readiness probes until every stage converges.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use meshflip_core::{HealthSettings, SpecResult};

use crate::backoff::PollBackoff;
use crate::error::{GateError, GateResult};
use crate::probe::ReadinessProbe;

/// Which half of a stage the gate is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    /// Waiting for new units to show up as not ready.
    AwaitTransition,
    /// Waiting for every unit to become ready.
    AwaitReady,
}

impl GatePhase {
    fn satisfied(self, unready: usize) -> bool {
        match self {
            GatePhase::AwaitTransition => unready > 0,
            GatePhase::AwaitReady => unready == 0,
        }
    }
}

impl fmt::Display for GatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatePhase::AwaitTransition => f.write_str("awaiting transition"),
            GatePhase::AwaitReady => f.write_str("awaiting ready"),
        }
    }
}

/// Poll counts for one converged stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    /// Polls spent in the transition phase; zero when it is disabled.
    pub transition_polls: u32,
    pub ready_polls: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct GateReport {
    pub stages: Vec<StageReport>,
}

/// Blocks until readiness probes converge, or a limit is hit.
#[derive(Debug, Clone)]
pub struct HealthGate {
    interval: Duration,
    max_interval: Duration,
    deadline: Option<Duration>,
    max_polls: Option<u32>,
    await_transition: bool,
    cancel: Option<watch::Receiver<bool>>,
}

impl HealthGate {
    /// Build a gate from the `[health]` config section.
    pub fn new(settings: &HealthSettings) -> SpecResult<Self> {
        Ok(Self {
            interval: settings.interval()?,
            max_interval: settings.max_interval()?,
            deadline: settings.deadline()?,
            max_polls: settings.max_polls,
            await_transition: settings.await_transition,
            cancel: None,
        })
    }

    /// Abort the wait once `true` is sent on the channel.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run every probe's stage to convergence, in order. The deadline
    /// covers the whole call; one too far out to represent is no deadline.
    pub async fn wait(&self, probes: &[&dyn ReadinessProbe]) -> GateResult<GateReport> {
        let deadline_at = self.deadline.and_then(|d| Instant::now().checked_add(d));
        let mut report = GateReport::default();

        for probe in probes {
            let transition_polls = if self.await_transition {
                self.wait_phase(*probe, GatePhase::AwaitTransition, deadline_at)
                    .await?
            } else {
                0
            };
            let ready_polls = self
                .wait_phase(*probe, GatePhase::AwaitReady, deadline_at)
                .await?;

            info!(
                stage = probe.stage(),
                transition_polls, ready_polls, "stage converged"
            );
            report.stages.push(StageReport {
                stage: probe.stage(),
                transition_polls,
                ready_polls,
            });
        }

        Ok(report)
    }

    async fn wait_phase(
        &self,
        probe: &dyn ReadinessProbe,
        phase: GatePhase,
        deadline_at: Option<Instant>,
    ) -> GateResult<u32> {
        let stage = probe.stage();
        let mut backoff = PollBackoff::new(self.interval, self.max_interval);
        let mut cancel = self.cancel.clone();
        let mut polls = 0u32;

        loop {
            let unready = self.poll(probe).await?;
            polls += 1;

            if phase.satisfied(unready) {
                debug!(stage, %phase, unready, polls, "phase satisfied");
                return Ok(polls);
            }

            if self.max_polls.is_some_and(|max| polls >= max) {
                warn!(stage, %phase, polls, "poll limit reached");
                return Err(GateError::Timeout { stage, phase, polls });
            }

            let mut delay = backoff.next_delay(unready);
            if let Some(deadline_at) = deadline_at {
                let remaining = deadline_at.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!(stage, %phase, polls, "health deadline passed");
                    return Err(GateError::Timeout { stage, phase, polls });
                }
                delay = delay.min(remaining);
            }

            info!(stage, %phase, unready, polls, delay_ms = delay.as_millis() as u64, "waiting");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled(cancel.as_mut()) => {
                    info!(stage, %phase, "health wait cancelled");
                    return Err(GateError::Cancelled { stage });
                }
            }
        }
    }

    async fn poll(&self, probe: &dyn ReadinessProbe) -> GateResult<usize> {
        match probe.count_unready().await {
            Ok(count) => Ok(count),
            Err(e) if probe.tolerates_errors() => {
                warn!(stage = probe.stage(), error = %e, "probe failed, counting zero unready");
                Ok(0)
            }
            Err(source) => Err(GateError::Probe {
                stage: probe.stage(),
                source,
            }),
        }
    }
}

/// Resolves once `true` has been sent. Never resolves without a channel
/// or after the sender is dropped.
async fn cancelled(cancel: Option<&mut watch::Receiver<bool>>) {
    let Some(rx) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
