// src/measurement.rs - Unit-tagged measurements and breath-cycle context
use crate::error::{Result, VentError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Physiological signals monitored by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    AirwayPressure,
    Flow,
    TidalVolumeExpired,
    #[serde(rename = "spo2")]
    SpO2,
}

impl SignalKind {
    pub const ALL: [SignalKind; 4] = [
        SignalKind::AirwayPressure,
        SignalKind::Flow,
        SignalKind::TidalVolumeExpired,
        SignalKind::SpO2,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether a sample in `unit` can enter the engine for this signal.
    ///
    /// Pressure is accepted in cm H2O or hPa, treated as the same nominal unit.
    pub fn accepts(self, unit: Unit) -> bool {
        matches!(
            (self, unit),
            (SignalKind::AirwayPressure, Unit::CmH2O)
                | (SignalKind::AirwayPressure, Unit::HPa)
                | (SignalKind::Flow, Unit::LitresPerMinute)
                | (SignalKind::TidalVolumeExpired, Unit::Millilitres)
                | (SignalKind::SpO2, Unit::Percent)
        )
    }

    pub fn canonical_unit(self) -> Unit {
        match self {
            SignalKind::AirwayPressure => Unit::CmH2O,
            SignalKind::Flow => Unit::LitresPerMinute,
            SignalKind::TidalVolumeExpired => Unit::Millilitres,
            SignalKind::SpO2 => Unit::Percent,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::AirwayPressure => write!(f, "airway_pressure"),
            SignalKind::Flow => write!(f, "flow"),
            SignalKind::TidalVolumeExpired => write!(f, "vte"),
            SignalKind::SpO2 => write!(f, "spo2"),
        }
    }
}

/// Engineering units reported by the sensor collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    CmH2O,
    HPa,
    KPa,
    Millilitres,
    LitresPerMinute,
    Percent,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Unit::CmH2O => "cmH2O",
            Unit::HPa => "hPa",
            Unit::KPa => "kPa",
            Unit::Millilitres => "mL",
            Unit::LitresPerMinute => "L/min",
            Unit::Percent => "%",
        };
        f.write_str(s)
    }
}

/// Breath-cycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Inspiratory,
    Expiratory,
}

/// A single reading from the sensor collaborator.
///
/// `cycle` and `phase` are stamped by the acquisition front-end from the
/// control loop's most recent phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub kind: SignalKind,
    pub value: f64,
    pub unit: Unit,
    pub valid: bool,
    pub timestamp_ms: u64,
    pub cycle: u64,
    pub phase: Phase,
}

impl Measurement {
    /// Valid reading in the signal's canonical unit
    pub fn new(kind: SignalKind, value: f64, timestamp_ms: u64, cycle: u64, phase: Phase) -> Self {
        Self {
            kind,
            value,
            unit: kind.canonical_unit(),
            valid: true,
            timestamp_ms,
            cycle,
            phase,
        }
    }

    /// Reading the sensor collaborator flagged as invalid
    pub fn invalid(kind: SignalKind, timestamp_ms: u64, cycle: u64, phase: Phase) -> Self {
        Self {
            valid: false,
            ..Self::new(kind, f64::NAN, timestamp_ms, cycle, phase)
        }
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    /// Reject readings the engine cannot interpret. Conversion is the sensor
    /// collaborator's job; nothing is converted here.
    pub fn check(&self) -> Result<()> {
        if !self.kind.accepts(self.unit) {
            return Err(VentError::DataQuality(format!(
                "{} reported in {}, expected {}",
                self.kind,
                self.unit,
                self.kind.canonical_unit()
            )));
        }
        if self.valid && !self.value.is_finite() {
            return Err(VentError::DataQuality(format!(
                "{} reported non-finite value flagged as valid",
                self.kind
            )));
        }
        Ok(())
    }

    /// Usable for aggregation: flagged valid, finite, and in an accepted unit
    pub fn is_usable(&self) -> bool {
        self.valid && self.check().is_ok()
    }
}

/// Setpoints owned by the control loop
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Setpoints {
    /// Peak inspiratory pressure, cm H2O
    pub pip: f64,
    /// Positive end-expiratory pressure, cm H2O
    pub peep: f64,
    #[serde(default = "default_bpm")]
    pub breaths_per_minute: f64,
}

fn default_bpm() -> f64 {
    15.0
}

impl Default for Setpoints {
    fn default() -> Self {
        Self {
            pip: 20.0,
            peep: 5.0,
            breaths_per_minute: default_bpm(),
        }
    }
}

/// Supplied by the control loop at the end of every breath cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleContext {
    /// Monotonic breath number
    pub cycle: u64,
    /// Phase that just ended
    pub phase: Phase,
    pub setpoints: Setpoints,
}

impl CycleContext {
    pub fn new(cycle: u64, setpoints: Setpoints) -> Self {
        Self {
            cycle,
            phase: Phase::Expiratory,
            setpoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_accepts_hpa_and_cmh2o() {
        let m = Measurement::new(SignalKind::AirwayPressure, 12.0, 0, 0, Phase::Inspiratory);
        assert!(m.is_usable());
        assert!(m.with_unit(Unit::HPa).is_usable());
        assert!(matches!(
            m.with_unit(Unit::KPa).check(),
            Err(VentError::DataQuality(_))
        ));
    }

    #[test]
    fn test_invalid_reading_is_not_usable() {
        let m = Measurement::invalid(SignalKind::SpO2, 10, 3, Phase::Expiratory);
        assert!(!m.is_usable());
        assert!(m.check().is_ok());
    }

    #[test]
    fn test_nan_flagged_valid_is_rejected() {
        let m = Measurement::new(SignalKind::Flow, f64::NAN, 0, 0, Phase::Inspiratory);
        assert!(!m.is_usable());
    }
}
