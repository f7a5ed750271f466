//! Poll loop
//!
//! Drives the run end to end: on each tick, execute the status query over
//! the remote channel, parse the payload, evaluate the rule, and log the
//! summary. The first available tick fires the alert sink once and stops
//! the loop.
//!
//! - Fixed cadence: the full `step` wait happens after every tick, whether
//!   it succeeded, failed transiently, or found nothing (no backoff, no
//!   drift correction)
//! - Tick-local failures (exec error, timeout, malformed payload) are
//!   logged and tolerated; fatal channel failures stop the run
//! - The shutdown future cancels promptly, aborting an in-flight tick or
//!   an inter-tick sleep

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::alert::{alert_message, alert_title, AlertSink};
use crate::channel::{ChannelError, RemoteChannel};
use crate::config::MonitorOptions;
use crate::policy::{evaluate, AvailabilityRule, Decision};
use crate::status::{PayloadError, StatusQuery};

/// Why the loop stopped. Fatal channel failures are the error path instead.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The policy fired and the alert was issued; no further queries follow.
    Alerted { ticks: u64 },
    /// The operator asked to stop. Not an error.
    Cancelled,
    /// The finite horizon ran out without availability.
    Exhausted { ticks: u64 },
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("remote channel failure: {0}")]
    Channel(#[from] ChannelError),
}

/// A single tick's failure, contained within that tick unless fatal.
#[derive(Debug, Error)]
enum TickError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

pub struct PollLoop<C, A> {
    channel: C,
    alert: A,
    addr: String,
    rule: AvailabilityRule,
    query: StatusQuery,
    step: Duration,
    exec_timeout: Duration,
    alert_sound: Option<PathBuf>,
    max_ticks: Option<u64>,
}

impl<C: RemoteChannel, A: AlertSink> PollLoop<C, A> {
    pub fn new(
        channel: C,
        alert: A,
        addr: String,
        rule: AvailabilityRule,
        options: &MonitorOptions,
    ) -> Self {
        Self {
            channel,
            alert,
            addr,
            rule,
            query: options.query(),
            step: Duration::from_secs(options.step_secs),
            exec_timeout: Duration::from_secs(options.exec_timeout_secs),
            alert_sound: options.alert_sound.clone(),
            max_ticks: options.max_ticks,
        }
    }

    /// Run until the alert fires, the horizon runs out, the shutdown future
    /// resolves, or the channel fails fatally. Dropping the loop afterwards
    /// releases the channel.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<Outcome, MonitorError> {
        tokio::pin!(shutdown);
        let mut ticks: u64 = 0;

        loop {
            ticks += 1;

            let result = tokio::select! {
                result = self.tick() => result,
                _ = &mut shutdown => {
                    info!("monitor cancelled");
                    return Ok(Outcome::Cancelled);
                }
            };

            match result {
                Ok(decision) => {
                    info!("{}", decision.summary);
                    if decision.available {
                        info!("GPUs available now!");
                        self.fire_alert().await;
                        return Ok(Outcome::Alerted { ticks });
                    }
                }
                Err(TickError::Channel(e)) if e.is_fatal() => {
                    error!(error = %e, "remote channel failed, stopping monitor");
                    return Err(MonitorError::Channel(e));
                }
                Err(e) => {
                    warn!(error = %e, "status check failed, retrying next tick");
                }
            }

            if let Some(max) = self.max_ticks {
                if ticks >= max {
                    info!(ticks, "polling horizon reached without availability");
                    return Ok(Outcome::Exhausted { ticks });
                }
            }

            tokio::select! {
                _ = sleep(self.step) => {}
                _ = &mut shutdown => {
                    info!("monitor cancelled");
                    return Ok(Outcome::Cancelled);
                }
            }
        }
    }

    /// One status check: query, parse, evaluate.
    async fn tick(&self) -> Result<Decision, TickError> {
        let raw = match timeout(self.exec_timeout, self.channel.execute(&self.query.command))
            .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ChannelError::Timeout(self.exec_timeout).into()),
        };

        let snapshot = self.query.parse(&raw)?;
        Ok(evaluate(&snapshot, &self.rule))
    }

    /// Issue the single alert. Sink failures are logged; the decision stands.
    async fn fire_alert(&self) {
        let title = alert_title(&self.addr);
        let message = alert_message(&self.rule);

        if let Err(e) = self.alert.notify(&title, &message).await {
            warn!(error = %e, "failed to show notification");
        }
        if let Some(sound) = &self.alert_sound {
            if let Err(e) = self.alert.play(sound).await {
                warn!(error = %e, "failed to play alert sound");
            }
        }
    }
}
