// src/safety.rs
// Automatic remedial actuator sequences with cycle-bounded deadlines

use crate::alarms::{AlarmKind, AlarmState, AlarmTransition};
use crate::error::{Result, VentError};
use crate::measurement::Setpoints;
use crate::window::WindowReading;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use metrics::counter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyActionKind {
    /// Open the expiratory valve to relieve airway pressure
    OpenExpiratoryValve,
    /// Reduce input flow until airway pressure reaches PEEP, never to zero
    CutInputFlow,
    /// Open to atmosphere or PEEP and drop the PIP target to the fallback
    RevertToAtmosphericOrPeep,
}

impl SafetyActionKind {
    /// Higher is stricter
    pub fn strictness(self) -> u8 {
        match self {
            SafetyActionKind::OpenExpiratoryValve => 1,
            SafetyActionKind::CutInputFlow => 2,
            SafetyActionKind::RevertToAtmosphericOrPeep => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyAction {
    pub kind: SafetyActionKind,
    /// Alarm whose activation caused the action
    pub alarm: AlarmKind,
    pub issued_cycle: u64,
    pub deadline_cycle: u64,
    /// Airway pressure the actuator should settle at, cm H2O
    pub target_pressure: Option<f64>,
    /// Reduced PIP the control loop must adopt
    pub pip_override: Option<f64>,
}

/// Command handed to the actuator collaborator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SafetyCommand {
    Issue(SafetyAction),
    Clear { kind: SafetyActionKind, cycle: u64 },
}

/// Non-blocking path to the valve/actuator drivers
pub trait ActuatorSink: Send {
    fn dispatch(&mut self, command: &SafetyCommand) -> Result<()>;
}

impl ActuatorSink for mpsc::Sender<SafetyCommand> {
    fn dispatch(&mut self, command: &SafetyCommand) -> Result<()> {
        self.try_send(*command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => VentError::ActuatorUnavailable("actuator queue full".into()),
            mpsc::error::TrySendError::Closed(_) => VentError::ActuatorUnavailable("actuator channel closed".into()),
        })
    }
}

/// In-memory sink that keeps every command; clones share the same log
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    commands: Arc<Mutex<Vec<SafetyCommand>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<SafetyCommand> {
        self.commands.lock().clone()
    }

    pub fn issued(&self) -> Vec<SafetyAction> {
        self.commands
            .lock()
            .iter()
            .filter_map(|c| match c {
                SafetyCommand::Issue(a) => Some(*a),
                SafetyCommand::Clear { .. } => None,
            })
            .collect()
    }
}

impl ActuatorSink for RecordingSink {
    fn dispatch(&mut self, command: &SafetyCommand) -> Result<()> {
        self.commands.lock().push(*command);
        Ok(())
    }
}

/// What the coordinator needs to know about the cycle just evaluated
#[derive(Debug, Clone, Copy)]
pub struct SafetyInput<'a> {
    pub cycle: u64,
    pub setpoints: Setpoints,
    pub transitions: &'a [AlarmTransition],
    pub end_expiratory_pressure: WindowReading,
    pub obstruction_raised: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SafetyOutcome {
    pub issued: Vec<SafetyAction>,
    pub cleared: Vec<SafetyActionKind>,
    /// Reduced PIP to apply to the setpoints immediately
    pub pip_override: Option<f64>,
}

pub struct SafetyResponseCoordinator {
    sink: Box<dyn ActuatorSink>,
    fallback_pip: f64,
    active: Vec<SafetyAction>,
    flow_check_due: Option<u64>,
}

impl SafetyResponseCoordinator {
    pub fn new(sink: Box<dyn ActuatorSink>, fallback_pip: f64) -> Self {
        Self {
            sink,
            fallback_pip,
            active: Vec::with_capacity(3),
            flow_check_due: None,
        }
    }

    pub fn active(&self) -> &[SafetyAction] {
        &self.active
    }

    pub fn is_active(&self, kind: SafetyActionKind) -> bool {
        self.active.iter().any(|a| a.kind == kind)
    }

    /// Active actions outranked by a stricter active action
    pub fn superseded(&self) -> Vec<SafetyActionKind> {
        let strictest = self.active.iter().map(|a| a.kind.strictness()).max().unwrap_or(0);
        self.active
            .iter()
            .filter(|a| a.kind.strictness() < strictest)
            .map(|a| a.kind)
            .collect()
    }

    /// React to one cycle's alarm transitions.
    ///
    /// Any action that cannot be dispatched by its deadline cycle yields
    /// `VentError::DeadlineMiss`, which callers must treat as fatal.
    pub fn respond(&mut self, input: &SafetyInput<'_>) -> Result<SafetyOutcome> {
        let mut outcome = SafetyOutcome::default();

        if let Some(due) = self.flow_check_due {
            if input.cycle > due {
                self.flow_check_due = None;
                return Err(self.miss(SafetyActionKind::CutInputFlow, due, input.cycle, "flow check cycle skipped"));
            }
            if input.cycle == due {
                self.flow_check_due = None;
                self.check_flow(input, &mut outcome)?;
            }
        }

        for t in input.transitions {
            match (t.kind, t.to) {
                (AlarmKind::Obstruction, AlarmState::Active) => {
                    let action = SafetyAction {
                        kind: SafetyActionKind::OpenExpiratoryValve,
                        alarm: t.kind,
                        issued_cycle: input.cycle,
                        deadline_cycle: t.cycle,
                        target_pressure: None,
                        pip_override: None,
                    };
                    self.issue(action, input.cycle, &mut outcome)?;
                    self.flow_check_due = Some(t.cycle + 1);
                }
                (AlarmKind::Hapa, AlarmState::Active) => {
                    let pip = self.fallback_pip.min(input.setpoints.pip);
                    let action = SafetyAction {
                        kind: SafetyActionKind::RevertToAtmosphericOrPeep,
                        alarm: t.kind,
                        issued_cycle: input.cycle,
                        deadline_cycle: t.cycle,
                        target_pressure: Some(input.setpoints.peep),
                        pip_override: Some(pip),
                    };
                    self.issue(action, input.cycle, &mut outcome)?;
                    outcome.pip_override = Some(pip);
                }
                (AlarmKind::Obstruction | AlarmKind::Hapa, AlarmState::Inactive) => {
                    if t.kind == AlarmKind::Obstruction {
                        self.flow_check_due = None;
                    }
                    self.clear_for(t.kind, input.cycle, &mut outcome);
                }
                _ => {}
            }
        }

        let superseded = self.superseded();
        if !outcome.issued.is_empty() && !superseded.is_empty() {
            debug!("Superseded safety actions: {:?}", superseded);
        }
        Ok(outcome)
    }

    fn check_flow(&mut self, input: &SafetyInput<'_>, outcome: &mut SafetyOutcome) -> Result<()> {
        if !input.obstruction_raised {
            return Ok(());
        }
        let peep = input.setpoints.peep;
        let relieved = matches!(input.end_expiratory_pressure, WindowReading::Value(p) if p <= peep);
        if relieved {
            info!("Airway pressure back at PEEP by cycle {}, no flow cut needed", input.cycle);
            return Ok(());
        }

        // Flow is only cut while expiration is open, so the patient can still breathe
        if !self.is_active(SafetyActionKind::OpenExpiratoryValve) {
            let valve = SafetyAction {
                kind: SafetyActionKind::OpenExpiratoryValve,
                alarm: AlarmKind::Obstruction,
                issued_cycle: input.cycle,
                deadline_cycle: input.cycle,
                target_pressure: None,
                pip_override: None,
            };
            self.issue(valve, input.cycle, outcome)?;
        }
        let cut = SafetyAction {
            kind: SafetyActionKind::CutInputFlow,
            alarm: AlarmKind::Obstruction,
            issued_cycle: input.cycle,
            deadline_cycle: input.cycle,
            target_pressure: Some(peep),
            pip_override: None,
        };
        self.issue(cut, input.cycle, outcome)
    }

    fn issue(&mut self, action: SafetyAction, cycle: u64, outcome: &mut SafetyOutcome) -> Result<()> {
        if cycle > action.deadline_cycle {
            return Err(self.miss(action.kind, action.deadline_cycle, cycle, "issued after deadline"));
        }
        if let Err(e) = self.sink.dispatch(&SafetyCommand::Issue(action)) {
            return Err(self.miss(action.kind, action.deadline_cycle, cycle, &e.to_string()));
        }
        warn!(
            "Safety action {:?} issued for {} at cycle {} (deadline {})",
            action.kind, action.alarm, cycle, action.deadline_cycle
        );
        #[cfg(feature = "metrics")]
        counter!("ventguard_safety_actions_total").increment(1);

        self.active.retain(|a| a.kind != action.kind);
        self.active.push(action);
        outcome.issued.push(action);
        Ok(())
    }

    fn clear_for(&mut self, alarm: AlarmKind, cycle: u64, outcome: &mut SafetyOutcome) {
        let (done, keep): (Vec<_>, Vec<_>) = self.active.drain(..).partition(|a| a.alarm == alarm);
        self.active = keep;
        for action in done {
            let command = SafetyCommand::Clear { kind: action.kind, cycle };
            match self.sink.dispatch(&command) {
                Ok(()) => {
                    info!("Safety action {:?} cleared at cycle {}", action.kind, cycle);
                    outcome.cleared.push(action.kind);
                }
                Err(e) => {
                    error!("Failed to clear safety action {:?}: {}", action.kind, e);
                    self.active.push(action);
                }
            }
        }
    }

    fn miss(&self, action: SafetyActionKind, deadline_cycle: u64, cycle: u64, reason: &str) -> VentError {
        error!(
            "DEADLINE MISS: {:?} due by cycle {}, now cycle {}: {}",
            action, deadline_cycle, cycle, reason
        );
        VentError::DeadlineMiss {
            action,
            deadline_cycle,
            cycle,
            reason: reason.to_string(),
        }
    }
}
