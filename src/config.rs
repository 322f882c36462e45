// src/config.rs - Engine, window, alarm threshold and settings configuration

use crate::error::{Result, VentError};
use crate::measurement::{Setpoints, SignalKind};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// MAIN CONFIGURATION
// ============================================================================

/// Main VENTGUARD configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine runtime configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Rolling window sizing
    #[serde(default)]
    pub window: WindowConfig,

    /// Alarm thresholds
    #[serde(default)]
    pub alarms: AlarmsConfig,

    /// Sensor plausibility checks
    #[serde(default)]
    pub sensors: SensorConfig,

    /// Operator settings protection
    #[serde(default)]
    pub settings: SettingsConfig,

    /// Automatic safety responses
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject thresholds outside a physically sane range
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.window.validate()?;
        self.alarms.validate()?;
        self.sensors.validate()?;
        self.settings.validate()?;
        self.safety.validate(&self.settings)?;

        // pressure records two phase ends per cycle, VTE only the expiratory one
        let needed = (2 * self.alarms.obstruction.consecutive_cycles as usize)
            .max(self.alarms.low_vte.mean_cycles + 1);
        if self.window.phase_history < needed {
            return Err(invalid(format!(
                "window.phase_history {} must hold at least {} phase ends",
                self.window.phase_history, needed
            )));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> VentError {
    VentError::ConfigurationInvalid(msg.into())
}

fn check_range(name: &str, value: f64, lo: f64, hi: f64) -> Result<()> {
    if !value.is_finite() || value < lo || value > hi {
        return Err(invalid(format!("{} = {} outside [{}, {}]", name, value, lo, hi)));
    }
    Ok(())
}

// ============================================================================
// ENGINE CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Time budget for a single tick in microseconds
    #[serde(default = "default_cycle_budget_us")]
    pub cycle_budget_us: u64,

    /// Measurements buffered between ticks before the oldest is dropped
    #[serde(default = "default_measurement_buffer")]
    pub measurement_buffer: usize,

    /// Capacity of the bounded input queue feeding the run loop
    #[serde(default = "default_input_queue")]
    pub input_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_budget_us: default_cycle_budget_us(),
            measurement_buffer: default_measurement_buffer(),
            input_queue: default_input_queue(),
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<()> {
        if self.cycle_budget_us == 0 {
            return Err(invalid("engine.cycle_budget_us must be positive"));
        }
        if self.measurement_buffer == 0 || self.input_queue == 0 {
            return Err(invalid("engine buffers must hold at least one entry"));
        }
        Ok(())
    }
}

// ============================================================================
// WINDOW CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Samples held per signal
    #[serde(default = "default_window_capacity")]
    pub capacity: usize,

    /// Rolling mean duration recorded at each phase end
    #[serde(default = "default_smoothing_ms")]
    pub smoothing_ms: u64,

    /// Fraction of valid samples below which a window reports insufficient data
    #[serde(default = "default_min_valid_coverage")]
    pub min_valid_coverage: f64,

    /// Phase ends remembered per signal
    #[serde(default = "default_phase_history")]
    pub phase_history: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            capacity: default_window_capacity(),
            smoothing_ms: default_smoothing_ms(),
            min_valid_coverage: default_min_valid_coverage(),
            phase_history: default_phase_history(),
        }
    }
}

impl WindowConfig {
    fn validate(&self) -> Result<()> {
        if self.capacity < 8 {
            return Err(invalid("window.capacity must be at least 8 samples"));
        }
        if self.smoothing_ms == 0 || self.smoothing_ms > 1_000 {
            return Err(invalid("window.smoothing_ms must be within 1..=1000"));
        }
        if !(self.min_valid_coverage > 0.0 && self.min_valid_coverage <= 1.0) {
            return Err(invalid("window.min_valid_coverage must be within (0, 1]"));
        }
        Ok(())
    }
}

// ============================================================================
// ALARM CONFIGURATION
// ============================================================================

/// Debounce bound for the LOW-origin alarms (LAPA, Low VTE)
const MAX_DEBOUNCE_CYCLES: u32 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlarmsConfig {
    #[serde(default)]
    pub lapa: LapaConfig,
    #[serde(default)]
    pub hapa: HapaConfig,
    #[serde(default)]
    pub low_vte: LowVteConfig,
    #[serde(default)]
    pub peep: PeepConfig,
    #[serde(default)]
    pub obstruction: ObstructionConfig,
    #[serde(default)]
    pub oxygenation: OxygenationConfig,
    #[serde(default)]
    pub suppression: SuppressionConfig,
}

impl AlarmsConfig {
    fn validate(&self) -> Result<()> {
        check_range("alarms.lapa.limit", self.lapa.limit, 0.0, 40.0)?;
        if self.lapa.escalation_cycles == 0 {
            return Err(invalid("alarms.lapa.escalation_cycles must be positive"));
        }
        if self.lapa.debounce_cycles > MAX_DEBOUNCE_CYCLES || self.low_vte.debounce_cycles > MAX_DEBOUNCE_CYCLES {
            return Err(invalid(format!("alarms debounce_cycles must not exceed {}", MAX_DEBOUNCE_CYCLES)));
        }
        check_range("alarms.hapa.pip_factor", self.hapa.pip_factor, 1.0, 2.0)?;

        let vte = &self.low_vte;
        check_range("alarms.low_vte.hard_min_ml", vte.hard_min_ml, 0.0, 3000.0)?;
        check_range("alarms.low_vte.hard_max_ml", vte.hard_max_ml, 0.0, 3000.0)?;
        check_range("alarms.low_vte.low_limit_ml", vte.low_limit_ml, vte.hard_min_ml, vte.hard_max_ml)?;
        check_range("alarms.low_vte.deviation_fraction", vte.deviation_fraction, 0.01, 1.0)?;
        if vte.mean_cycles == 0 {
            return Err(invalid("alarms.low_vte.mean_cycles must be positive"));
        }

        check_range("alarms.peep.min", self.peep.min, 0.0, 40.0)?;
        check_range("alarms.peep.max", self.peep.max, self.peep.min, 40.0)?;
        if self.peep.min >= self.peep.max {
            return Err(invalid("alarms.peep band is empty"));
        }

        if self.obstruction.consecutive_cycles < 1 {
            return Err(invalid("alarms.obstruction.consecutive_cycles must be positive"));
        }

        check_range("alarms.oxygenation.target", self.oxygenation.target, 50.0, 100.0)?;
        check_range("alarms.oxygenation.tolerance", self.oxygenation.tolerance, 0.5, 20.0)?;

        let s = &self.suppression;
        if s.default_cycles == 0 || s.default_cycles > s.max_cycles {
            return Err(invalid(format!(
                "alarms.suppression.default_cycles {} must be within 1..={}",
                s.default_cycles, s.max_cycles
            )));
        }
        Ok(())
    }
}

/// Low airway pressure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LapaConfig {
    /// cm H2O, compared against the end-expiratory rolling mean
    #[serde(default = "default_lapa_limit")]
    pub limit: f64,
    /// Cycles the condition must persist past activation before escalating
    #[serde(default = "default_one")]
    pub escalation_cycles: u32,
    /// Triggered cycles held in Pending before the alarm becomes Active
    #[serde(default)]
    pub debounce_cycles: u32,
}

impl Default for LapaConfig {
    fn default() -> Self {
        Self { limit: default_lapa_limit(), escalation_cycles: 1, debounce_cycles: 0 }
    }
}

/// High airway pressure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HapaConfig {
    #[serde(default = "default_pip_factor")]
    pub pip_factor: f64,
}

impl Default for HapaConfig {
    fn default() -> Self {
        Self { pip_factor: default_pip_factor() }
    }
}

/// Hypoventilation / low expired tidal volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LowVteConfig {
    #[serde(default = "default_vte_low")]
    pub low_limit_ml: f64,
    #[serde(default = "default_vte_hard_min")]
    pub hard_min_ml: f64,
    #[serde(default = "default_vte_hard_max")]
    pub hard_max_ml: f64,
    /// Deviation from the rolling mean VTE that escalates to MEDIUM
    #[serde(default = "default_vte_deviation")]
    pub deviation_fraction: f64,
    /// Previous breaths averaged into the rolling mean
    #[serde(default = "default_vte_mean_cycles")]
    pub mean_cycles: usize,
    #[serde(default)]
    pub debounce_cycles: u32,
}

impl Default for LowVteConfig {
    fn default() -> Self {
        Self {
            low_limit_ml: default_vte_low(),
            hard_min_ml: default_vte_hard_min(),
            hard_max_ml: default_vte_hard_max(),
            deviation_fraction: default_vte_deviation(),
            mean_cycles: default_vte_mean_cycles(),
            debounce_cycles: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeepConfig {
    #[serde(default = "default_peep_min")]
    pub min: f64,
    #[serde(default = "default_peep_max")]
    pub max: f64,
}

impl Default for PeepConfig {
    fn default() -> Self {
        Self { min: default_peep_min(), max: default_peep_max() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObstructionConfig {
    #[serde(default = "default_obstruction_cycles")]
    pub consecutive_cycles: u32,
}

impl Default for ObstructionConfig {
    fn default() -> Self {
        Self { consecutive_cycles: default_obstruction_cycles() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OxygenationConfig {
    /// Target SpO2, percent
    #[serde(default = "default_spo2_target")]
    pub target: f64,
    /// Allowed deviation in percentage points
    #[serde(default = "default_spo2_tolerance")]
    pub tolerance: f64,
}

impl Default for OxygenationConfig {
    fn default() -> Self {
        Self { target: default_spo2_target(), tolerance: default_spo2_tolerance() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionConfig {
    #[serde(default = "default_suppression_cycles")]
    pub default_cycles: u32,
    #[serde(default = "default_max_suppression_cycles")]
    pub max_cycles: u32,
}

impl Default for SuppressionConfig {
    fn default() -> Self {
        Self {
            default_cycles: default_suppression_cycles(),
            max_cycles: default_max_suppression_cycles(),
        }
    }
}

// ============================================================================
// SENSOR CONFIGURATION
// ============================================================================

/// Physical plausibility of sensor readings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default = "default_pressure_range")]
    pub pressure_range: [f64; 2],
    #[serde(default = "default_flow_range")]
    pub flow_range: [f64; 2],
    #[serde(default = "default_volume_range")]
    pub volume_range: [f64; 2],
    #[serde(default = "default_spo2_range")]
    pub spo2_range: [f64; 2],
    /// Consecutive perfectly flat cycles reported as a stuck sensor
    #[serde(default = "default_stuck_cycles")]
    pub stuck_cycles: u32,
    /// Signals expected to vary within every breath
    #[serde(default = "default_stuck_signals")]
    pub stuck_signals: Vec<SignalKind>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            pressure_range: default_pressure_range(),
            flow_range: default_flow_range(),
            volume_range: default_volume_range(),
            spo2_range: default_spo2_range(),
            stuck_cycles: default_stuck_cycles(),
            stuck_signals: default_stuck_signals(),
        }
    }
}

impl SensorConfig {
    pub fn plausible_range(&self, kind: SignalKind) -> (f64, f64) {
        let [lo, hi] = match kind {
            SignalKind::AirwayPressure => self.pressure_range,
            SignalKind::Flow => self.flow_range,
            SignalKind::TidalVolumeExpired => self.volume_range,
            SignalKind::SpO2 => self.spo2_range,
        };
        (lo, hi)
    }

    fn validate(&self) -> Result<()> {
        for kind in SignalKind::ALL {
            let (lo, hi) = self.plausible_range(kind);
            if !(lo.is_finite() && hi.is_finite() && lo < hi) {
                return Err(invalid(format!("sensors: empty plausible range for {}", kind)));
            }
        }
        if self.stuck_cycles == 0 {
            return Err(invalid("sensors.stuck_cycles must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// SETTINGS CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Settings loaded at startup, pending operator confirmation
    #[serde(default)]
    pub initial: Setpoints,

    /// PIP above which a change needs two distinct confirmations, hPa
    #[serde(default = "default_confirmation_pip")]
    pub confirmation_pip: f64,

    /// Hard ceiling no confirmation can exceed, hPa
    #[serde(default = "default_absolute_max_pip")]
    pub absolute_max_pip: f64,

    #[serde(default = "default_max_peep")]
    pub max_peep: f64,

    #[serde(default = "default_max_bpm")]
    pub max_breaths_per_minute: f64,

    /// Time allowed between the two confirmatory actions
    #[serde(default = "default_confirmation_window_ms")]
    pub confirmation_window_ms: u64,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            initial: Setpoints::default(),
            confirmation_pip: default_confirmation_pip(),
            absolute_max_pip: default_absolute_max_pip(),
            max_peep: default_max_peep(),
            max_breaths_per_minute: default_max_bpm(),
            confirmation_window_ms: default_confirmation_window_ms(),
        }
    }
}

impl SettingsConfig {
    fn validate(&self) -> Result<()> {
        check_range("settings.confirmation_pip", self.confirmation_pip, 10.0, self.absolute_max_pip)?;
        check_range("settings.absolute_max_pip", self.absolute_max_pip, 10.0, 120.0)?;
        check_range("settings.max_peep", self.max_peep, 0.0, 40.0)?;
        check_range("settings.max_breaths_per_minute", self.max_breaths_per_minute, 1.0, 120.0)?;
        if self.confirmation_window_ms == 0 {
            return Err(invalid("settings.confirmation_window_ms must be positive"));
        }
        let s = &self.initial;
        check_range("settings.initial.pip", s.pip, 1.0, self.absolute_max_pip)?;
        check_range("settings.initial.peep", s.peep, 0.0, self.max_peep)?;
        check_range("settings.initial.breaths_per_minute", s.breaths_per_minute, 1.0, self.max_breaths_per_minute)?;
        if s.pip <= s.peep {
            return Err(invalid("settings.initial.pip must exceed settings.initial.peep"));
        }
        Ok(())
    }
}

// ============================================================================
// SAFETY CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// PIP the control loop is told to fall back to after a high-pressure alarm
    #[serde(default = "default_fallback_pip")]
    pub fallback_pip: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self { fallback_pip: default_fallback_pip() }
    }
}

impl SafetyConfig {
    fn validate(&self, settings: &SettingsConfig) -> Result<()> {
        check_range("safety.fallback_pip", self.fallback_pip, 1.0, settings.confirmation_pip)
    }
}

// ============================================================================
// DEFAULTS
// ============================================================================

fn default_cycle_budget_us() -> u64 { 2_000 }
fn default_measurement_buffer() -> usize { 2_048 }
fn default_input_queue() -> usize { 1_024 }
fn default_window_capacity() -> usize { 512 }
fn default_smoothing_ms() -> u64 { 50 }
fn default_min_valid_coverage() -> f64 { 0.8 }
fn default_phase_history() -> usize { 16 }
fn default_one() -> u32 { 1 }
fn default_lapa_limit() -> f64 { 5.0 }
fn default_pip_factor() -> f64 { 1.15 }
fn default_vte_low() -> f64 { 300.0 }
fn default_vte_hard_min() -> f64 { 100.0 }
fn default_vte_hard_max() -> f64 { 1_500.0 }
fn default_vte_deviation() -> f64 { 0.15 }
fn default_vte_mean_cycles() -> usize { 8 }
fn default_peep_min() -> f64 { 3.0 }
fn default_peep_max() -> f64 { 15.0 }
fn default_obstruction_cycles() -> u32 { 2 }
fn default_spo2_target() -> f64 { 94.0 }
fn default_spo2_tolerance() -> f64 { 5.0 }
fn default_suppression_cycles() -> u32 { 60 }
fn default_max_suppression_cycles() -> u32 { 300 }
fn default_pressure_range() -> [f64; 2] { [-10.0, 120.0] }
fn default_flow_range() -> [f64; 2] { [-250.0, 250.0] }
fn default_volume_range() -> [f64; 2] { [0.0, 3_000.0] }
fn default_spo2_range() -> [f64; 2] { [0.0, 100.0] }
fn default_stuck_cycles() -> u32 { 3 }
fn default_stuck_signals() -> Vec<SignalKind> {
    vec![SignalKind::AirwayPressure, SignalKind::Flow]
}
fn default_confirmation_pip() -> f64 { 60.0 }
fn default_absolute_max_pip() -> f64 { 80.0 }
fn default_max_peep() -> f64 { 30.0 }
fn default_max_bpm() -> f64 { 60.0 }
fn default_confirmation_window_ms() -> u64 { 10_000 }
fn default_fallback_pip() -> f64 { 30.0 }
