// File: src/alarms.rs
// Alarm definitions, the fixed per-kind registry, and the per-kind state machine.
//
// Every alarm kind has exactly one definition and exactly one instance for the
// lifetime of the engine. Instances change state only when the alarm manager
// feeds them a rule verdict at a cycle boundary.

use crate::config::{AlarmsConfig, Config};
use crate::error::{RejectReason, Result, VentError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

// ==========================================
// SECTION 1: ALARM KINDS AND PRIORITIES
// ==========================================

/// Clinical and technical alarm kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    /// Low airway pressure at end of expiration
    Lapa,
    /// High airway pressure
    Hapa,
    /// Hypoventilation / low expired tidal volume
    LowVte,
    /// Measured PEEP outside the configured band
    PeepOutOfRange,
    /// Airway pressure above PIP for consecutive cycles
    Obstruction,
    /// Low VTE together with low airway pressure
    Disconnection,
    /// SpO2 outside target band
    Oxygenation,
    /// Implausible, missing, stuck or insufficient sensor data
    SensorFault,
    /// A safety response missed its cycle deadline
    SafetyDeadlineMiss,
}

impl AlarmKind {
    pub const COUNT: usize = 9;

    pub const ALL: [AlarmKind; AlarmKind::COUNT] = [
        AlarmKind::Lapa,
        AlarmKind::Hapa,
        AlarmKind::LowVte,
        AlarmKind::PeepOutOfRange,
        AlarmKind::Obstruction,
        AlarmKind::Disconnection,
        AlarmKind::Oxygenation,
        AlarmKind::SensorFault,
        AlarmKind::SafetyDeadlineMiss,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn description(&self) -> &'static str {
        match self {
            AlarmKind::Lapa => "Low airway pressure",
            AlarmKind::Hapa => "High airway pressure",
            AlarmKind::LowVte => "Low expired tidal volume",
            AlarmKind::PeepOutOfRange => "PEEP out of range",
            AlarmKind::Obstruction => "Airway obstruction",
            AlarmKind::Disconnection => "Circuit disconnection or leak",
            AlarmKind::Oxygenation => "Oxygen saturation out of range",
            AlarmKind::SensorFault => "Sensor fault",
            AlarmKind::SafetyDeadlineMiss => "Safety response deadline missed",
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            AlarmKind::Lapa => "LAPA",
            AlarmKind::Hapa => "HAPA",
            AlarmKind::LowVte => "LOW_VTE",
            AlarmKind::PeepOutOfRange => "PEEP",
            AlarmKind::Obstruction => "OBSTRUCTION",
            AlarmKind::Disconnection => "DISCONNECTION",
            AlarmKind::Oxygenation => "SPO2",
            AlarmKind::SensorFault => "SENSOR_FAULT",
            AlarmKind::SafetyDeadlineMiss => "DEADLINE_MISS",
        };
        f.write_str(code)
    }
}

/// Priority tiers; a numerically higher tier is more urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlarmPriority {
    Low = 1,
    Medium = 2,
    High = 3,
}

// ==========================================
// SECTION 2: DEFINITIONS
// ==========================================

/// When and how far an active alarm escalates
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum EscalationPolicy {
    None,
    /// Escalate once the condition has held for `cycles` cycles past activation
    PersistentCycles { cycles: u32, to: AlarmPriority },
    /// Escalate when the rule itself reports the higher tier
    RuleReported { to: AlarmPriority },
}

impl EscalationPolicy {
    fn target(&self) -> Option<AlarmPriority> {
        match self {
            EscalationPolicy::None => None,
            EscalationPolicy::PersistentCycles { to, .. } | EscalationPolicy::RuleReported { to } => Some(*to),
        }
    }
}

/// Threshold parameters handed to the rule of each kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Thresholds {
    Lapa { limit: f64 },
    Hapa { pip_factor: f64 },
    LowVte { low_limit: f64, hard_min: f64, hard_max: f64, deviation: f64, mean_cycles: usize },
    Peep { min: f64, max: f64 },
    Obstruction { consecutive_cycles: u32 },
    Disconnection { pressure_limit: f64, vte_limit: f64 },
    Oxygenation { target: f64, tolerance: f64 },
    /// `stuck_mask` holds one bit per [`SignalKind::index`] checked for flat output
    SensorFault { stuck_cycles: u32, stuck_mask: u8 },
    DeadlineMiss,
}

/// Static description of one alarm kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AlarmDefinition {
    pub kind: AlarmKind,
    pub priority: AlarmPriority,
    pub suppressible: bool,
    pub technical: bool,
    /// Extra triggered cycles spent in Pending before activation
    pub debounce_cycles: u32,
    pub escalation: EscalationPolicy,
    pub thresholds: Thresholds,
}

impl AlarmDefinition {
    /// Highest tier an instance of this kind may ever reach
    pub fn max_priority(&self) -> AlarmPriority {
        self.escalation.target().map_or(self.priority, |to| to.max(self.priority))
    }
}

/// Fixed registry holding exactly one definition per kind
#[derive(Debug, Clone)]
pub struct AlarmRegistry {
    definitions: Vec<AlarmDefinition>,
}

impl AlarmRegistry {
    pub fn from_config(config: &Config) -> Result<Self> {
        let a: &AlarmsConfig = &config.alarms;
        let def = |kind, priority, suppressible, technical, escalation, thresholds| AlarmDefinition {
            kind,
            priority,
            suppressible,
            technical,
            debounce_cycles: 0,
            escalation,
            thresholds,
        };

        let mut definitions = vec![
            def(
                AlarmKind::Lapa,
                AlarmPriority::Low,
                true,
                false,
                EscalationPolicy::PersistentCycles { cycles: a.lapa.escalation_cycles, to: AlarmPriority::Medium },
                Thresholds::Lapa { limit: a.lapa.limit },
            ),
            def(
                AlarmKind::Hapa,
                AlarmPriority::High,
                false,
                false,
                EscalationPolicy::None,
                Thresholds::Hapa { pip_factor: a.hapa.pip_factor },
            ),
            def(
                AlarmKind::LowVte,
                AlarmPriority::Low,
                true,
                false,
                EscalationPolicy::RuleReported { to: AlarmPriority::Medium },
                Thresholds::LowVte {
                    low_limit: a.low_vte.low_limit_ml,
                    hard_min: a.low_vte.hard_min_ml,
                    hard_max: a.low_vte.hard_max_ml,
                    deviation: a.low_vte.deviation_fraction,
                    mean_cycles: a.low_vte.mean_cycles,
                },
            ),
            def(
                AlarmKind::PeepOutOfRange,
                AlarmPriority::Medium,
                false,
                false,
                EscalationPolicy::None,
                Thresholds::Peep { min: a.peep.min, max: a.peep.max },
            ),
            def(
                AlarmKind::Obstruction,
                AlarmPriority::High,
                false,
                true,
                EscalationPolicy::None,
                Thresholds::Obstruction { consecutive_cycles: a.obstruction.consecutive_cycles },
            ),
            def(
                AlarmKind::Disconnection,
                AlarmPriority::Medium,
                false,
                true,
                EscalationPolicy::None,
                Thresholds::Disconnection { pressure_limit: a.lapa.limit, vte_limit: a.low_vte.low_limit_ml },
            ),
            def(
                AlarmKind::Oxygenation,
                AlarmPriority::Medium,
                false,
                false,
                EscalationPolicy::None,
                Thresholds::Oxygenation { target: a.oxygenation.target, tolerance: a.oxygenation.tolerance },
            ),
            def(
                AlarmKind::SensorFault,
                AlarmPriority::Medium,
                false,
                true,
                EscalationPolicy::None,
                Thresholds::SensorFault {
                    stuck_cycles: config.sensors.stuck_cycles,
                    stuck_mask: config
                        .sensors
                        .stuck_signals
                        .iter()
                        .fold(0u8, |mask, kind| mask | (1 << kind.index())),
                },
            ),
            def(
                AlarmKind::SafetyDeadlineMiss,
                AlarmPriority::High,
                false,
                true,
                EscalationPolicy::None,
                Thresholds::DeadlineMiss,
            ),
        ];

        definitions[AlarmKind::Lapa.index()].debounce_cycles = a.lapa.debounce_cycles;
        definitions[AlarmKind::LowVte.index()].debounce_cycles = a.low_vte.debounce_cycles;

        let registry = Self { definitions };
        registry.validate()?;
        Ok(registry)
    }

    /// Structural invariants of the registry
    pub fn validate(&self) -> Result<()> {
        if self.definitions.len() != AlarmKind::COUNT {
            return Err(VentError::ConfigurationInvalid(format!(
                "expected {} alarm definitions, found {}",
                AlarmKind::COUNT,
                self.definitions.len()
            )));
        }
        for (def, kind) in self.definitions.iter().zip(AlarmKind::ALL) {
            if def.kind != kind {
                return Err(VentError::ConfigurationInvalid(format!(
                    "alarm definition for {} registered in slot of {}",
                    def.kind, kind
                )));
            }
            if def.priority == AlarmPriority::High && def.suppressible {
                return Err(VentError::ConfigurationInvalid(format!(
                    "HIGH alarm {} must not be suppressible",
                    def.kind
                )));
            }
            if def.priority == AlarmPriority::High && def.debounce_cycles > 0 {
                return Err(VentError::ConfigurationInvalid(format!(
                    "HIGH alarm {} must act in the cycle it is detected",
                    def.kind
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, kind: AlarmKind) -> &AlarmDefinition {
        &self.definitions[kind.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlarmDefinition> {
        self.definitions.iter()
    }
}

// ==========================================
// SECTION 3: RUNTIME STATE MACHINE
// ==========================================

/// Lifecycle states of an alarm instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Inactive,
    /// Triggered, waiting out the definition's debounce count
    Pending,
    Active,
    Escalated,
    Suppressed,
    /// Transient: verdict cleared, last-cleared cycle being recorded
    Clearing,
}

impl AlarmState {
    /// Active or Escalated, i.e. eligible for annunciation
    pub fn is_annunciable(self) -> bool {
        matches!(self, AlarmState::Active | AlarmState::Escalated)
    }

    /// Condition currently present, annunciated or not
    pub fn is_raised(self) -> bool {
        matches!(self, AlarmState::Active | AlarmState::Escalated | AlarmState::Suppressed)
    }
}

/// Verdict produced by a rule for one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Clear,
    Trigger(AlarmPriority),
    /// The rule could not decide; held, never read as normal
    Insufficient,
}

/// A single state change of one alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlarmTransition {
    pub kind: AlarmKind,
    pub from: AlarmState,
    pub to: AlarmState,
    pub priority: AlarmPriority,
    pub cycle: u64,
}

/// Runtime instance of one alarm kind
#[derive(Debug, Clone)]
pub struct AlarmInstance {
    definition: AlarmDefinition,
    state: AlarmState,
    priority: AlarmPriority,
    first_triggered: Option<u64>,
    last_cleared: Option<u64>,
    suppressed_until: Option<u64>,
    resume_state: AlarmState,
    acknowledged: bool,
    triggered_cycles: u32,
    activation_count: u64,
}

impl AlarmInstance {
    pub fn new(definition: AlarmDefinition) -> Self {
        Self {
            priority: definition.priority,
            definition,
            state: AlarmState::Inactive,
            first_triggered: None,
            last_cleared: None,
            suppressed_until: None,
            resume_state: AlarmState::Active,
            acknowledged: false,
            triggered_cycles: 0,
            activation_count: 0,
        }
    }

    pub fn kind(&self) -> AlarmKind {
        self.definition.kind
    }

    pub fn definition(&self) -> &AlarmDefinition {
        &self.definition
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    pub fn priority(&self) -> AlarmPriority {
        self.priority
    }

    pub fn first_triggered(&self) -> Option<u64> {
        self.first_triggered
    }

    pub fn last_cleared(&self) -> Option<u64> {
        self.last_cleared
    }

    pub fn suppressed_until(&self) -> Option<u64> {
        self.suppressed_until
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn activation_count(&self) -> u64 {
        self.activation_count
    }

    /// Advance the state machine by one cycle
    pub fn step(&mut self, verdict: Verdict, cycle: u64) -> Vec<AlarmTransition> {
        let mut transitions = Vec::new();
        match verdict {
            Verdict::Insufficient => {}
            Verdict::Clear => self.clear(cycle, &mut transitions),
            Verdict::Trigger(reported) => self.trigger(reported, cycle, &mut transitions),
        }
        transitions
    }

    fn trigger(&mut self, reported: AlarmPriority, cycle: u64, out: &mut Vec<AlarmTransition>) {
        let reported = reported.min(self.definition.max_priority());
        match self.state {
            AlarmState::Inactive | AlarmState::Clearing => {
                self.first_triggered = Some(cycle);
                self.triggered_cycles = 1;
                self.priority = self.definition.priority;
                self.acknowledged = false;
                self.activation_count += 1;
                if self.definition.debounce_cycles == 0 {
                    self.transition(AlarmState::Active, cycle, out);
                    self.escalate(reported, cycle, out);
                } else {
                    self.transition(AlarmState::Pending, cycle, out);
                }
            }
            AlarmState::Pending => {
                self.triggered_cycles += 1;
                if self.triggered_cycles > self.definition.debounce_cycles {
                    self.transition(AlarmState::Active, cycle, out);
                    self.escalate(reported, cycle, out);
                }
            }
            AlarmState::Active | AlarmState::Escalated => {
                self.triggered_cycles += 1;
                self.escalate(reported, cycle, out);
            }
            AlarmState::Suppressed => {
                self.triggered_cycles += 1;
                let before = self.priority;
                let target = self.escalation_target(reported);
                let newly_high = target == AlarmPriority::High && before < AlarmPriority::High;
                let superseded = target > before;
                let expired = self.suppressed_until.map_or(true, |until| cycle >= until);
                if newly_high || superseded || expired {
                    self.priority = before.max(target);
                    self.suppressed_until = None;
                    let resume = if self.priority > self.definition.priority {
                        AlarmState::Escalated
                    } else {
                        self.resume_state
                    };
                    self.transition(resume, cycle, out);
                }
            }
        }
    }

    fn escalation_target(&self, reported: AlarmPriority) -> AlarmPriority {
        let persistent = match self.definition.escalation {
            EscalationPolicy::PersistentCycles { cycles, to } if self.triggered_cycles > cycles => to,
            _ => self.definition.priority,
        };
        let ruled = match self.definition.escalation {
            EscalationPolicy::RuleReported { to } if reported >= to => to,
            _ => self.definition.priority,
        };
        persistent.max(ruled).min(self.definition.max_priority())
    }

    fn escalate(&mut self, reported: AlarmPriority, cycle: u64, out: &mut Vec<AlarmTransition>) {
        let target = self.escalation_target(reported);
        if target > self.priority {
            self.priority = target;
            self.transition(AlarmState::Escalated, cycle, out);
        }
    }

    fn clear(&mut self, cycle: u64, out: &mut Vec<AlarmTransition>) {
        if self.state == AlarmState::Inactive {
            return;
        }
        let from = self.state;
        self.state = AlarmState::Clearing;
        self.last_cleared = Some(cycle);
        self.first_triggered = None;
        self.suppressed_until = None;
        self.resume_state = AlarmState::Active;
        self.acknowledged = false;
        self.triggered_cycles = 0;
        out.push(AlarmTransition {
            kind: self.definition.kind,
            from,
            to: AlarmState::Inactive,
            priority: self.priority,
            cycle,
        });
        self.state = AlarmState::Inactive;
        self.priority = self.definition.priority;
    }

    fn transition(&mut self, to: AlarmState, cycle: u64, out: &mut Vec<AlarmTransition>) {
        if self.state == to {
            return;
        }
        out.push(AlarmTransition {
            kind: self.definition.kind,
            from: self.state,
            to,
            priority: self.priority,
            cycle,
        });
        self.state = to;
    }

    /// Put a raised alarm into Suppressed until `cycle + cycles`
    pub fn suppress(&mut self, cycle: u64, cycles: u32) -> std::result::Result<Option<AlarmTransition>, RejectReason> {
        if !self.definition.suppressible {
            warn!("Refusing to suppress non-suppressible alarm {}", self.kind());
            return Err(RejectReason::NotSuppressible(self.kind()));
        }
        match self.state {
            AlarmState::Active | AlarmState::Escalated => {
                self.resume_state = self.state;
                self.suppressed_until = Some(cycle + u64::from(cycles));
                let mut out = Vec::with_capacity(1);
                self.transition(AlarmState::Suppressed, cycle, &mut out);
                info!("{} suppressed until cycle {}", self.kind(), cycle + u64::from(cycles));
                Ok(out.pop())
            }
            AlarmState::Suppressed => {
                self.suppressed_until = Some(cycle + u64::from(cycles));
                Ok(None)
            }
            _ => Err(RejectReason::NotActive(self.kind())),
        }
    }

    pub fn acknowledge(&mut self) -> std::result::Result<(), RejectReason> {
        if !self.state.is_raised() {
            return Err(RejectReason::NotActive(self.kind()));
        }
        self.acknowledged = true;
        Ok(())
    }
}

// ==========================================
// SECTION 4: TESTS
// ==========================================
