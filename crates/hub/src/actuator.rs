//! Confirmed open/close commands.
//!
//! Each attempt makes sure the link is up, publishes the action, lets the
//! servo settle and then waits for the status topic to echo the action.
//! Attempts are bounded, and commands for the rack are serialized.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ValidationError;
use crate::link::ControlLink;

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    #[serde(rename = "buka")]
    Open,
    #[serde(rename = "tutup")]
    Close,
}

impl Action {
    /// Wire form published on the control topic.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "buka",
            Self::Close => "tutup",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ValidationError;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buka" => Ok(Self::Open),
            "tutup" => Ok(Self::Close),
            _ => Err(ValidationError::InvalidAction(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Attempts and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorConfig {
    pub max_attempts: u32,
    pub confirm_window: Duration,
    pub settle_delay: Duration,
    /// How long one attempt waits for the link to come up.
    pub connect_timeout: Duration,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            confirm_window: Duration::from_secs(5),
            settle_delay: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Pending,
    Confirmed,
    Unconfirmed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandAttempt {
    pub action: Action,
    /// 1-based.
    pub attempt: u32,
    /// End of the confirmation window, set once the command is published.
    pub deadline: Option<Instant>,
    pub outcome: AttemptOutcome,
}

impl CommandAttempt {
    pub fn new(action: Action, attempt: u32) -> Self {
        Self {
            action,
            attempt,
            deadline: None,
            outcome: AttemptOutcome::Pending,
        }
    }
}

/// Final result of [`Actuator::send`]. Exhausting all attempts is a normal
/// outcome, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlOutcome {
    pub success: bool,
    pub action: Action,
    /// Attempts actually made.
    pub attempts: u32,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

pub struct Actuator<L> {
    link: Arc<L>,
    config: ActuatorConfig,
    in_flight: Mutex<()>,
    cancel: CancellationToken,
}

impl<L: ControlLink> Actuator<L> {
    pub fn new(link: Arc<L>, config: ActuatorConfig, cancel: CancellationToken) -> Self {
        Self {
            link,
            config,
            in_flight: Mutex::new(()),
            cancel,
        }
    }

    /// Run the confirmation protocol. Total time is bounded by
    /// `max_attempts × (connect_timeout + settle_delay + confirm_window)`.
    pub async fn send(&self, action: Action) -> ControlOutcome {
        let _guard = self.in_flight.lock().await;
        let mut status = self.link.status_updates();
        let max = self.config.max_attempts;

        for n in 1..=max {
            let mut attempt = CommandAttempt::new(action, n);
            info!(%action, attempt = n, max, "sending control command");

            let run = self.attempt(&mut attempt, &mut status);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!(%action, attempt = n, "control command cancelled");
                    return ControlOutcome {
                        success: false,
                        action,
                        attempts: n,
                        message: format!("Command {action} cancelled after {n} attempts"),
                    };
                }
                _ = run => {}
            }

            if attempt.outcome == AttemptOutcome::Confirmed {
                info!(%action, attempt = n, "command confirmed");
                return ControlOutcome {
                    success: true,
                    action,
                    attempts: n,
                    message: format!("Servo successfully {action}"),
                };
            }
        }

        warn!(%action, attempts = max, "command not confirmed");
        ControlOutcome {
            success: false,
            action,
            attempts: max,
            message: format!("Failed to send command {action} after {max} attempts"),
        }
    }

    async fn attempt(&self, attempt: &mut CommandAttempt, status: &mut watch::Receiver<Option<String>>) {
        let action = attempt.action;
        attempt.outcome = AttemptOutcome::Unconfirmed;

        if let Err(e) = self.link.ensure_connected(self.config.connect_timeout).await {
            warn!(%action, attempt = attempt.attempt, error = %e, "link unavailable");
            return;
        }
        if let Err(e) = self.link.publish_control(action.as_str()).await {
            warn!(%action, attempt = attempt.attempt, error = %e, "publish failed");
            return;
        }
        let deadline = Instant::now() + self.config.settle_delay + self.config.confirm_window;
        attempt.deadline = Some(deadline);

        sleep(self.config.settle_delay).await;

        // Matches the current value too, even if it predates this publish.
        let wanted = action.as_str();
        let echoed = status.wait_for(|s| s.as_deref() == Some(wanted));
        match timeout(self.config.confirm_window, echoed).await {
            Ok(Ok(_)) => attempt.outcome = AttemptOutcome::Confirmed,
            Ok(Err(_)) => {
                warn!(%action, attempt = attempt.attempt, "status channel closed");
            }
            Err(_) => {
                warn!(
                    %action,
                    attempt = attempt.attempt,
                    overshoot_ms = Instant::now().saturating_duration_since(deadline).as_millis() as u64,
                    "no confirmation within window"
                );
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
