//! The hub core as seen by the web layer: read telemetry, evaluate, command
//! the rack, observe the link.

use std::sync::Arc;

use tracing::error;

use crate::actuator::{Action, Actuator, ControlOutcome};
use crate::decision::{DecisionEngine, Recommendation};
use crate::error::{EvaluationError, ValidationError};
use crate::link::{ConnectionState, ControlLink};
use crate::state::{SharedState, TelemetryRecord};

pub struct RackCore<L> {
    pub state: SharedState,
    engine: Arc<DecisionEngine>,
    actuator: Arc<Actuator<L>>,
    link: Arc<L>,
}

impl<L: ControlLink> RackCore<L> {
    pub fn new(
        state: SharedState,
        engine: Arc<DecisionEngine>,
        actuator: Arc<Actuator<L>>,
        link: Arc<L>,
    ) -> Self {
        Self {
            state,
            engine,
            actuator,
            link,
        }
    }

    pub fn get_latest_telemetry(&self) -> Option<Arc<TelemetryRecord>> {
        self.state.latest_telemetry()
    }

    pub fn evaluate(&self, record: &TelemetryRecord) -> Result<Recommendation, EvaluationError> {
        let result = self.engine.evaluate_record(record);
        if let Err(EvaluationError::Internal(msg)) = &result {
            error!("evaluation failed: {msg}");
            self.state.record_error(format!("evaluation failed: {msg}"));
        }
        result
    }

    /// Run the confirmation protocol on its own task so callers never hold
    /// up telemetry readers.
    pub async fn send_control(&self, raw: &str) -> Result<ControlOutcome, ValidationError> {
        let action: Action = raw.parse()?;
        let actuator = Arc::clone(&self.actuator);
        let outcome = match tokio::spawn(async move { actuator.send(action).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%action, "control task failed: {e}");
                ControlOutcome {
                    success: false,
                    action,
                    attempts: 0,
                    message: format!("Command {action} aborted: {e}"),
                }
            }
        };
        self.state.record_control(format!(
            "{action}: {} ({} attempt{})",
            outcome.message,
            outcome.attempts,
            if outcome.attempts == 1 { "" } else { "s" }
        ));
        Ok(outcome)
    }

    pub fn connection_status(&self) -> ConnectionState {
        self.link.connection_state()
    }

    /// Last status string echoed by the rack.
    pub fn last_status(&self) -> Option<String> {
        self.link.status_updates().borrow().clone()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
