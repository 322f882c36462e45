// src/signal.rs - Latest-value measurement bus
use crate::measurement::{Measurement, SignalKind};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::trace;

/// Thread-safe latest-value store for monitored signals
///
/// Acquisition contexts publish here and UI/telemetry readers query it
/// without touching the engine. Only the most recent sample per signal is
/// kept; readers never wait for a fresh one.
///
/// # Examples
///
/// ```rust
/// use ventguard::{Measurement, MeasurementBus, Phase, SignalKind};
///
/// let bus = MeasurementBus::new();
/// bus.publish(Measurement::new(SignalKind::AirwayPressure, 18.5, 1_000, 3, Phase::Inspiratory));
///
/// assert_eq!(bus.value(SignalKind::AirwayPressure), Some(18.5));
/// assert_eq!(bus.value(SignalKind::SpO2), None);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MeasurementBus {
    latest: Arc<DashMap<SignalKind, Measurement>>,
}

impl MeasurementBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `m` unless a newer sample of the same signal is already held
    pub fn publish(&self, m: Measurement) {
        trace!("bus {} = {} @ {} ms", m.kind, m.value, m.timestamp_ms);
        self.latest
            .entry(m.kind)
            .and_modify(|held| {
                if m.timestamp_ms >= held.timestamp_ms {
                    *held = m;
                }
            })
            .or_insert(m);
    }

    /// Most recent sample of `kind`, valid or not
    pub fn latest(&self, kind: SignalKind) -> Option<Measurement> {
        self.latest.get(&kind).map(|entry| *entry.value())
    }

    /// Most recent usable value of `kind`
    pub fn value(&self, kind: SignalKind) -> Option<f64> {
        self.latest(kind).filter(Measurement::is_usable).map(|m| m.value)
    }

    pub fn snapshot(&self) -> Vec<Measurement> {
        SignalKind::ALL.iter().filter_map(|&kind| self.latest(kind)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Phase;

    #[test]
    fn test_older_sample_does_not_overwrite() {
        let bus = MeasurementBus::new();
        bus.publish(Measurement::new(SignalKind::Flow, 30.0, 200, 0, Phase::Inspiratory));
        bus.publish(Measurement::new(SignalKind::Flow, 10.0, 100, 0, Phase::Inspiratory));
        assert_eq!(bus.value(SignalKind::Flow), Some(30.0));
    }

    #[test]
    fn test_invalid_latest_reads_as_none() {
        let bus = MeasurementBus::new();
        bus.publish(Measurement::invalid(SignalKind::SpO2, 10, 0, Phase::Expiratory));
        assert!(bus.latest(SignalKind::SpO2).is_some());
        assert_eq!(bus.value(SignalKind::SpO2), None);
    }
}
