use crate::alarms::AlarmKind;
use crate::safety::SafetyActionKind;
use thiserror::Error;

/// Engine level error type used throughout the crate.
#[derive(Error, Debug)]
pub enum VentError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Threshold parameters outside a physically sane range; the engine refuses to arm
    #[error("Configuration invalid: {0}")]
    ConfigurationInvalid(String),

    /// Stale, invalid or out-of-order input
    #[error("Data quality: {0}")]
    DataQuality(String),

    /// Operator command declined without any state change
    #[error("Operator command rejected: {0}")]
    OperatorRejected(#[from] RejectReason),

    /// A safety action could not be issued by its deadline cycle.
    ///
    /// Fatal: the engine halts and trips its watchdog.
    #[error("Safety deadline missed: {action:?} due by cycle {deadline_cycle}, now cycle {cycle}: {reason}")]
    DeadlineMiss {
        action: SafetyActionKind,
        deadline_cycle: u64,
        cycle: u64,
        reason: String,
    },

    /// Therapy has not been confirmed, or the engine halted after a fatal fault
    #[error("Engine not armed: {0}")]
    NotArmed(String),

    /// The actuator collaborator refused or could not queue a command
    #[error("Actuator unavailable: {0}")]
    ActuatorUnavailable(String),
}

/// Reason an operator command was declined.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RejectReason {
    #[error("{0} alarm cannot be suppressed")]
    NotSuppressible(AlarmKind),

    #[error("{0} alarm is not active")]
    NotActive(AlarmKind),

    #[error("PIP {requested} hPa exceeds {limit} hPa and needs a second, distinct confirmation")]
    ConfirmationRequired { requested: f64, limit: f64 },

    #[error("action {0} already requested this change and cannot confirm it")]
    RepeatedAction(u64),

    #[error("confirmation window of {window_ms} ms expired")]
    ConfirmationExpired { window_ms: u64 },

    #[error("command would disable ventilation: {0}")]
    WouldDisableVentilation(String),

    #[error("setpoint out of range: {0}")]
    OutOfRange(String),

    #[error("startup settings have not been confirmed")]
    StartupUnconfirmed,
}

/// Convenient alias over [`Result`] using [`VentError`]
pub type Result<T> = std::result::Result<T, VentError>;

impl VentError {
    /// Fatal errors must reach a supervising fail-safe and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VentError::DeadlineMiss { .. })
    }

    pub fn rejection(&self) -> Option<&RejectReason> {
        match self {
            VentError::OperatorRejected(reason) => Some(reason),
            _ => None,
        }
    }
}
