// src/settings_guard.rs
// Gate between operator setpoint requests and the control loop

use crate::config::SettingsConfig;
use crate::error::{RejectReason, Result};
use crate::measurement::Setpoints;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[cfg(feature = "metrics")]
use metrics::counter;

/// One physical operator input (a press, a touch). Distinct inputs carry
/// distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperatorAction {
    pub id: u64,
    pub at: DateTime<Utc>,
}

impl OperatorAction {
    pub fn new(id: u64) -> Self {
        Self { id, at: Utc::now() }
    }
}

/// Requested change; `None` keeps the current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SetpointRequest {
    pub pip: Option<f64>,
    pub peep: Option<f64>,
    pub breaths_per_minute: Option<f64>,
}

impl SetpointRequest {
    pub fn pip(pip: f64) -> Self {
        Self { pip: Some(pip), ..Self::default() }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingChange {
    candidate: Setpoints,
    first_action: u64,
    requested_at: DateTime<Utc>,
}

pub struct SettingsGuard {
    config: SettingsConfig,
    current: Setpoints,
    startup_confirmed: bool,
    pending: Option<PendingChange>,
}

impl SettingsGuard {
    pub fn new(config: &SettingsConfig) -> Self {
        Self {
            current: config.initial,
            config: config.clone(),
            startup_confirmed: false,
            pending: None,
        }
    }

    pub fn current(&self) -> Setpoints {
        self.current
    }

    pub fn is_startup_confirmed(&self) -> bool {
        self.startup_confirmed
    }

    /// Candidate waiting for its second confirmation
    pub fn pending(&self) -> Option<Setpoints> {
        self.pending.map(|p| p.candidate)
    }

    /// Operator explicitly accepts the loaded settings before therapy starts
    pub fn confirm_startup(&mut self, action: OperatorAction) -> Setpoints {
        if !self.startup_confirmed {
            info!(
                "Startup settings confirmed by action {}: PIP {} PEEP {} at {} bpm",
                action.id, self.current.pip, self.current.peep, self.current.breaths_per_minute
            );
        }
        self.startup_confirmed = true;
        self.current
    }

    /// Validate and, when allowed, apply a setpoint change.
    ///
    /// A PIP above the confirmation limit needs the same change requested
    /// twice, by two distinct actions, within the confirmation window.
    pub fn request(&mut self, request: SetpointRequest, action: OperatorAction) -> Result<Setpoints> {
        let outcome = self.evaluate(request, action);
        if let Err(reason) = &outcome {
            warn!("Setpoint request by action {} rejected: {}", action.id, reason);
            #[cfg(feature = "metrics")]
            counter!("ventguard_rejected_commands_total").increment(1);
        }
        outcome.map_err(Into::into)
    }

    /// The safety path lowered PIP; never raises it
    pub fn note_pip_override(&mut self, pip: f64) {
        if pip < self.current.pip {
            info!("PIP overridden from {} to {} by safety response", self.current.pip, pip);
            self.current.pip = pip;
            self.pending = None;
        }
    }

    fn evaluate(&mut self, request: SetpointRequest, action: OperatorAction) -> std::result::Result<Setpoints, RejectReason> {
        if !self.startup_confirmed {
            return Err(RejectReason::StartupUnconfirmed);
        }
        let candidate = Setpoints {
            pip: request.pip.unwrap_or(self.current.pip),
            peep: request.peep.unwrap_or(self.current.peep),
            breaths_per_minute: request.breaths_per_minute.unwrap_or(self.current.breaths_per_minute),
        };
        self.check_limits(&candidate)?;

        let limit = self.config.confirmation_pip;
        if candidate.pip <= limit || candidate.pip == self.current.pip {
            return Ok(self.apply(candidate, action));
        }

        let window_ms = self.config.confirmation_window_ms;
        match self.pending {
            Some(p) if p.candidate == candidate => {
                if p.first_action == action.id {
                    return Err(RejectReason::RepeatedAction(action.id));
                }
                let elapsed = action.at.signed_duration_since(p.requested_at).num_milliseconds();
                if elapsed < 0 || elapsed as u64 > window_ms {
                    self.pend(candidate, action);
                    return Err(RejectReason::ConfirmationExpired { window_ms });
                }
                Ok(self.apply(candidate, action))
            }
            _ => {
                self.pend(candidate, action);
                Err(RejectReason::ConfirmationRequired { requested: candidate.pip, limit })
            }
        }
    }

    fn check_limits(&self, s: &Setpoints) -> std::result::Result<(), RejectReason> {
        if !(s.pip.is_finite() && s.peep.is_finite() && s.breaths_per_minute.is_finite()) {
            return Err(RejectReason::OutOfRange("non-finite setpoint".into()));
        }
        if s.pip <= 0.0 || s.breaths_per_minute <= 0.0 {
            return Err(RejectReason::WouldDisableVentilation(format!(
                "PIP {} / rate {} bpm stops ventilation",
                s.pip, s.breaths_per_minute
            )));
        }
        if s.pip <= s.peep {
            return Err(RejectReason::WouldDisableVentilation(format!(
                "PIP {} not above PEEP {}",
                s.pip, s.peep
            )));
        }
        if s.pip > self.config.absolute_max_pip {
            return Err(RejectReason::OutOfRange(format!(
                "PIP {} above absolute limit {}",
                s.pip, self.config.absolute_max_pip
            )));
        }
        if s.peep < 0.0 || s.peep > self.config.max_peep {
            return Err(RejectReason::OutOfRange(format!("PEEP {} outside [0, {}]", s.peep, self.config.max_peep)));
        }
        if s.breaths_per_minute > self.config.max_breaths_per_minute {
            return Err(RejectReason::OutOfRange(format!(
                "rate {} above {} bpm",
                s.breaths_per_minute, self.config.max_breaths_per_minute
            )));
        }
        Ok(())
    }

    fn pend(&mut self, candidate: Setpoints, action: OperatorAction) {
        info!("PIP {} awaiting second confirmation (first action {})", candidate.pip, action.id);
        self.pending = Some(PendingChange {
            candidate,
            first_action: action.id,
            requested_at: action.at,
        });
    }

    fn apply(&mut self, candidate: Setpoints, action: OperatorAction) -> Setpoints {
        info!(
            "Setpoints changed by action {}: PIP {} PEEP {} at {} bpm",
            action.id, candidate.pip, candidate.peep, candidate.breaths_per_minute
        );
        self.pending = None;
        self.current = candidate;
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VentError;
    use chrono::Duration;

    fn guard() -> SettingsGuard {
        let mut g = SettingsGuard::new(&SettingsConfig::default());
        g.confirm_startup(OperatorAction::new(0));
        g
    }

    fn at(id: u64, base: DateTime<Utc>, ms: i64) -> OperatorAction {
        OperatorAction { id, at: base + Duration::milliseconds(ms) }
    }

    fn reason(r: Result<Setpoints>) -> RejectReason {
        match r {
            Err(VentError::OperatorRejected(reason)) => reason,
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_requires_startup_confirmation() {
        let mut g = SettingsGuard::new(&SettingsConfig::default());
        assert_eq!(
            reason(g.request(SetpointRequest::pip(25.0), OperatorAction::new(1))),
            RejectReason::StartupUnconfirmed
        );
    }

    #[test]
    fn test_ordinary_change_applies_immediately() {
        let mut g = guard();
        let s = g.request(SetpointRequest::pip(25.0), OperatorAction::new(1)).unwrap();
        assert_eq!(s.pip, 25.0);
        assert_eq!(g.current().pip, 25.0);
    }

    #[test]
    fn test_high_pip_needs_two_distinct_actions() {
        let mut g = guard();
        let t0 = Utc::now();
        assert!(matches!(
            reason(g.request(SetpointRequest::pip(65.0), at(1, t0, 0))),
            RejectReason::ConfirmationRequired { .. }
        ));
        assert_eq!(g.current().pip, 20.0);
        assert_eq!(
            reason(g.request(SetpointRequest::pip(65.0), at(1, t0, 500))),
            RejectReason::RepeatedAction(1)
        );
        let s = g.request(SetpointRequest::pip(65.0), at(2, t0, 1_000)).unwrap();
        assert_eq!(s.pip, 65.0);
        assert!(g.pending().is_none());
    }

    #[test]
    fn test_confirmation_window_expires() {
        let mut g = guard();
        let t0 = Utc::now();
        let _ = g.request(SetpointRequest::pip(65.0), at(1, t0, 0));
        assert_eq!(
            reason(g.request(SetpointRequest::pip(65.0), at(2, t0, 10_001))),
            RejectReason::ConfirmationExpired { window_ms: 10_000 }
        );
        // the late action became the new first confirmation
        assert!(g.request(SetpointRequest::pip(65.0), at(3, t0, 12_000)).is_ok());
    }

    #[test]
    fn test_refuses_to_disable_ventilation() {
        let mut g = guard();
        for req in [
            SetpointRequest::pip(0.0),
            SetpointRequest { breaths_per_minute: Some(0.0), ..SetpointRequest::default() },
            SetpointRequest { peep: Some(20.0), ..SetpointRequest::default() },
        ] {
            assert!(matches!(
                reason(g.request(req, OperatorAction::new(9))),
                RejectReason::WouldDisableVentilation(_)
            ));
        }
        assert!(matches!(
            reason(g.request(SetpointRequest::pip(95.0), OperatorAction::new(9))),
            RejectReason::OutOfRange(_)
        ));
    }

    #[test]
    fn test_pip_override_only_lowers() {
        let mut g = guard();
        g.note_pip_override(30.0);
        assert_eq!(g.current().pip, 20.0);
        g.note_pip_override(15.0);
        assert_eq!(g.current().pip, 15.0);
    }
}
