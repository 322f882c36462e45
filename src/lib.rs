//! VENTGUARD - Alarm detection and safety response engine for mechanical ventilators
//!
//! Consumes airway pressure, flow, expired tidal volume and SpO2 measurements
//! once per breath cycle, evaluates a fixed set of clinical and technical
//! alarm rules, arbitrates the single annunciated alarm, and drives automatic
//! remedial actuator commands within cycle-bounded deadlines.
//!
//! # Feature Flags
//!
//! - **metrics**: export tick, transition and deadline counters through the
//!   `metrics` facade
//!
//! # Examples
//!
//! ```rust
//! use ventguard::{Config, Engine, OperatorAction, RecordingSink, SoftwareWatchdog};
//! use ventguard::simulation::CycleBuilder;
//!
//! let mut engine = Engine::new(
//!     Config::default(),
//!     Box::new(RecordingSink::new()),
//!     Box::new(SoftwareWatchdog::new()),
//! )?;
//! engine.confirm_startup(OperatorAction::new(1))?;
//!
//! let breath = CycleBuilder::new(0);
//! for m in breath.build() {
//!     engine.ingest(m);
//! }
//! let tick = engine.tick(breath.context(engine.setpoints()))?;
//! assert!(tick.report.annunciated.is_none());
//! # Ok::<(), ventguard::VentError>(())
//! ```

// ============================================================================
// CORE MODULES
// ============================================================================

/// Error taxonomy shared by every module
pub mod error;

/// YAML configuration with defaults and load-time validation
pub mod config;

/// Unit-tagged measurements, phases and cycle context
pub mod measurement;

/// Latest-value bus read by UI and telemetry
pub mod signal;

/// Fixed-capacity rolling windows per signal
pub mod window;

// ============================================================================
// ALARM PIPELINE
// ============================================================================

/// Alarm kinds, definitions and the per-kind state machine
pub mod alarms;

/// Pure rule evaluators, one per alarm kind
pub mod rules;

/// Per-cycle evaluation, arbitration and snapshot publication
pub mod alarm_manager;

/// Automatic remedial actions with cycle deadlines
pub mod safety;

// ============================================================================
// OPERATOR AND SUPERVISION
// ============================================================================

/// Two-step confirmation and startup gate for setpoint changes
pub mod settings_guard;

/// Fail-safe supervisor for fatal faults
pub mod watchdog;

/// Engine lifecycle and run loop
pub mod engine;

/// Synthetic breath source for the demo binary, benches and tests
pub mod simulation;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use alarm_manager::{AlarmManager, AlarmSnapshot, AnnunciatedAlarm, SnapshotReader, TickReport};
pub use alarms::{AlarmKind, AlarmPriority, AlarmState, AlarmTransition, Verdict};
pub use config::Config;
pub use engine::{Engine, EngineInput, EngineStats, EngineTick, OperatorCommand, OperatorReply};
pub use error::{RejectReason, Result, VentError};
pub use measurement::{CycleContext, Measurement, Phase, Setpoints, SignalKind, Unit};
pub use safety::{ActuatorSink, RecordingSink, SafetyAction, SafetyActionKind, SafetyCommand};
pub use settings_guard::{OperatorAction, SetpointRequest, SettingsGuard};
pub use signal::MeasurementBus;
pub use watchdog::{SoftwareWatchdog, Watchdog};
pub use window::{SignalWindow, WindowReading};

// ============================================================================
// VERSION INFORMATION
// ============================================================================

/// VENTGUARD version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// VENTGUARD authors
pub const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
