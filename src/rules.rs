// src/rules.rs - Pure alarm rule evaluators
//
// Each rule maps (window snapshot, cycle context, definition thresholds) to a
// verdict. Rules keep no state; hysteresis and timing belong to the instance
// state machine in alarms.rs.

use crate::alarms::{AlarmDefinition, AlarmPriority, Thresholds, Verdict};
use crate::measurement::{CycleContext, Phase, SignalKind};
use crate::window::{WindowReading, WindowSet};

/// Everything a rule may look at for one cycle
#[derive(Debug, Clone, Copy)]
pub struct RuleInput<'a> {
    pub windows: &'a WindowSet,
    pub ctx: &'a CycleContext,
    /// A clinical rule could not decide this cycle
    pub data_gap: bool,
    /// Latched once a safety deadline has been missed
    pub deadline_missed: bool,
}

pub fn evaluate(def: &AlarmDefinition, input: &RuleInput<'_>) -> Verdict {
    match def.thresholds {
        Thresholds::Lapa { limit } => low_airway_pressure(input, limit),
        Thresholds::Hapa { pip_factor } => high_airway_pressure(input, pip_factor),
        Thresholds::LowVte { low_limit, hard_min, hard_max, deviation, mean_cycles } => {
            low_tidal_volume(input, low_limit, hard_min, hard_max, deviation, mean_cycles)
        }
        Thresholds::Peep { min, max } => peep_out_of_range(input, min, max),
        Thresholds::Obstruction { consecutive_cycles } => obstruction(input, consecutive_cycles),
        Thresholds::Disconnection { pressure_limit, vte_limit } => disconnection(input, pressure_limit, vte_limit),
        Thresholds::Oxygenation { target, tolerance } => oxygenation(input, target, tolerance),
        Thresholds::SensorFault { stuck_cycles, stuck_mask } => sensor_fault(input, stuck_cycles, stuck_mask),
        Thresholds::DeadlineMiss => {
            if input.deadline_missed {
                Verdict::Trigger(AlarmPriority::High)
            } else {
                Verdict::Clear
            }
        }
    }
}

fn end_expiratory_vte(input: &RuleInput<'_>) -> WindowReading {
    input
        .windows
        .get(SignalKind::TidalVolumeExpired)
        .value_at_phase_end(Phase::Expiratory)
        .filter(|pe| pe.cycle == input.ctx.cycle)
        .map_or(WindowReading::Insufficient, |pe| pe.last)
}

/// Rolling mean end-expiratory pressure below `limit`
pub fn low_airway_pressure(input: &RuleInput<'_>, limit: f64) -> Verdict {
    match input.windows.end_expiratory_pressure(input.ctx.cycle) {
        WindowReading::Value(p) if p < limit => Verdict::Trigger(AlarmPriority::Low),
        WindowReading::Value(_) => Verdict::Clear,
        WindowReading::Insufficient => Verdict::Insufficient,
    }
}

/// Any pressure sample of the cycle at or above `pip_factor` × PIP.
///
/// A reading rejected for exceeding the sensor range counts as above the
/// threshold. Clear needs the cycle's valid coverage to reach the window
/// minimum.
pub fn high_airway_pressure(input: &RuleInput<'_>, pip_factor: f64) -> Verdict {
    let threshold = input.ctx.setpoints.pip * pip_factor;
    let window = input.windows.get(SignalKind::AirwayPressure);
    let stats = match window.last_cycle() {
        Some(s) if s.cycle == input.ctx.cycle => s,
        _ => return Verdict::Insufficient,
    };
    if stats.over_range > 0 {
        return Verdict::Trigger(AlarmPriority::High);
    }
    match stats.peak {
        Some(peak) if peak >= threshold => Verdict::Trigger(AlarmPriority::High),
        Some(_) if stats.coverage() >= window.min_coverage() => Verdict::Clear,
        _ => Verdict::Insufficient,
    }
}

/// Expired tidal volume below the low limit or outside the hard bounds.
///
/// Reports MEDIUM when the breath deviates from the mean of the previous
/// `mean_cycles` breaths by more than `deviation`.
pub fn low_tidal_volume(
    input: &RuleInput<'_>,
    low_limit: f64,
    hard_min: f64,
    hard_max: f64,
    deviation: f64,
    mean_cycles: usize,
) -> Verdict {
    let vte = match end_expiratory_vte(input) {
        WindowReading::Value(v) => v,
        WindowReading::Insufficient => return Verdict::Insufficient,
    };
    if vte >= low_limit && vte >= hard_min && vte <= hard_max {
        return Verdict::Clear;
    }

    let previous: Vec<f64> = input
        .windows
        .get(SignalKind::TidalVolumeExpired)
        .phase_ends(Phase::Expiratory)
        .filter(|pe| pe.cycle < input.ctx.cycle)
        .take(mean_cycles)
        .filter_map(|pe| pe.last.value())
        .collect();

    if previous.is_empty() {
        return Verdict::Trigger(AlarmPriority::Low);
    }
    let mean = previous.iter().sum::<f64>() / previous.len() as f64;
    if mean > 0.0 && (mean - vte).abs() / mean > deviation {
        Verdict::Trigger(AlarmPriority::Medium)
    } else {
        Verdict::Trigger(AlarmPriority::Low)
    }
}

/// Measured PEEP (end-expiratory rolling mean) outside [min, max]
pub fn peep_out_of_range(input: &RuleInput<'_>, min: f64, max: f64) -> Verdict {
    match input.windows.end_expiratory_pressure(input.ctx.cycle) {
        WindowReading::Value(p) if p < min || p > max => Verdict::Trigger(AlarmPriority::Medium),
        WindowReading::Value(_) => Verdict::Clear,
        WindowReading::Insufficient => Verdict::Insufficient,
    }
}

/// End-expiratory pressure above PIP for `consecutive_cycles` cycles in a row
pub fn obstruction(input: &RuleInput<'_>, consecutive_cycles: u32) -> Verdict {
    let pip = input.ctx.setpoints.pip;
    let ends = input
        .windows
        .get(SignalKind::AirwayPressure)
        .phase_ends(Phase::Expiratory);

    let mut expected = input.ctx.cycle;
    let mut held = 0u32;
    for pe in ends {
        if held == consecutive_cycles {
            break;
        }
        if pe.cycle != expected {
            return if held == 0 { Verdict::Insufficient } else { Verdict::Clear };
        }
        match pe.mean {
            WindowReading::Value(p) if p > pip => held += 1,
            WindowReading::Value(_) => return Verdict::Clear,
            WindowReading::Insufficient => return Verdict::Insufficient,
        }
        if expected == 0 {
            break;
        }
        expected -= 1;
    }

    match held {
        0 => Verdict::Insufficient,
        n if n >= consecutive_cycles => Verdict::Trigger(AlarmPriority::High),
        _ => Verdict::Clear,
    }
}

/// Low VTE together with low end-expiratory pressure
pub fn disconnection(input: &RuleInput<'_>, pressure_limit: f64, vte_limit: f64) -> Verdict {
    let pressure = input.windows.end_expiratory_pressure(input.ctx.cycle);
    let vte = end_expiratory_vte(input);

    let low_pressure = pressure.value().map(|p| p < pressure_limit);
    let low_vte = vte.value().map(|v| v < vte_limit);
    match (low_pressure, low_vte) {
        (Some(true), Some(true)) => Verdict::Trigger(AlarmPriority::Medium),
        (Some(false), _) | (_, Some(false)) => Verdict::Clear,
        _ => Verdict::Insufficient,
    }
}

/// Newest SpO2 of the cycle outside target ± tolerance
pub fn oxygenation(input: &RuleInput<'_>, target: f64, tolerance: f64) -> Verdict {
    match input.windows.get(SignalKind::SpO2).latest_in_cycle(input.ctx.cycle) {
        WindowReading::Value(s) if (s - target).abs() > tolerance => Verdict::Trigger(AlarmPriority::Medium),
        WindowReading::Value(_) => Verdict::Clear,
        WindowReading::Insufficient => Verdict::Insufficient,
    }
}

/// Technical fault: undecidable rules, implausible readings, or stuck sensors
pub fn sensor_fault(input: &RuleInput<'_>, stuck_cycles: u32, stuck_mask: u8) -> Verdict {
    let implausible = input
        .windows
        .iter()
        .filter_map(|w| w.last_cycle())
        .any(|s| s.cycle == input.ctx.cycle && s.implausible > 0);
    let stuck = input
        .windows
        .iter()
        .filter(|w| stuck_mask & (1 << w.kind().index()) != 0)
        .any(|w| w.flat_cycles() >= stuck_cycles);

    if input.data_gap || implausible || stuck {
        Verdict::Trigger(AlarmPriority::Medium)
    } else {
        Verdict::Clear
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::{AlarmKind, AlarmRegistry};
    use crate::config::Config;
    use crate::measurement::{Measurement, Setpoints};
    use crate::simulation::CycleBuilder;

    fn setpoints() -> Setpoints {
        Setpoints { pip: 20.0, peep: 5.0, breaths_per_minute: 15.0 }
    }

    fn feed(windows: &mut WindowSet, measurements: &[Measurement], cycle: u64) -> CycleContext {
        for m in measurements {
            windows.push(m);
        }
        let ctx = CycleContext::new(cycle, setpoints());
        windows.close_cycle(&ctx);
        ctx
    }

    fn verdict(kind: AlarmKind, windows: &WindowSet, ctx: &CycleContext) -> Verdict {
        let registry = AlarmRegistry::from_config(&Config::default()).unwrap();
        let input = RuleInput { windows, ctx, data_gap: false, deadline_missed: false };
        evaluate(registry.get(kind), &input)
    }

    fn windows() -> WindowSet {
        let config = Config::default();
        WindowSet::new(&config.window, &config.sensors)
    }

    #[test]
    fn test_normal_breath_clears_everything() {
        let mut w = windows();
        let ctx = feed(&mut w, &CycleBuilder::new(0).build(), 0);
        for kind in AlarmKind::ALL {
            assert_eq!(verdict(kind, &w, &ctx), Verdict::Clear, "{}", kind);
        }
    }

    #[test]
    fn test_lapa_triggers_below_limit() {
        let mut w = windows();
        let ctx = feed(&mut w, &CycleBuilder::new(0).expiratory_pressure(4.0).build(), 0);
        assert_eq!(verdict(AlarmKind::Lapa, &w, &ctx), Verdict::Trigger(AlarmPriority::Low));
    }

    #[test]
    fn test_hapa_threshold_is_inclusive() {
        let mut w = windows();
        let peak = 20.0 * 1.15;
        let ctx = feed(&mut w, &CycleBuilder::new(0).inspiratory_pressure(peak).jitter(0.0).build(), 0);
        assert_eq!(verdict(AlarmKind::Hapa, &w, &ctx), Verdict::Trigger(AlarmPriority::High));

        let mut w = windows();
        let ctx = feed(&mut w, &CycleBuilder::new(0).inspiratory_pressure(22.9).jitter(0.0).build(), 0);
        assert_eq!(verdict(AlarmKind::Hapa, &w, &ctx), Verdict::Clear);
    }

    #[test]
    fn test_missing_pressure_is_insufficient_not_clear() {
        let mut w = windows();
        let ctx = feed(&mut w, &CycleBuilder::new(0).omit(SignalKind::AirwayPressure).build(), 0);
        assert_eq!(verdict(AlarmKind::Lapa, &w, &ctx), Verdict::Insufficient);
        assert_eq!(verdict(AlarmKind::Hapa, &w, &ctx), Verdict::Insufficient);
        assert_eq!(verdict(AlarmKind::PeepOutOfRange, &w, &ctx), Verdict::Insufficient);
    }

    #[test]
    fn test_hapa_low_coverage_is_insufficient() {
        let mut w = windows();
        let breath: Vec<Measurement> = CycleBuilder::new(0)
            .build()
            .into_iter()
            .enumerate()
            .map(|(i, m)| match m.kind {
                SignalKind::AirwayPressure if i > 0 => Measurement::invalid(m.kind, m.timestamp_ms, m.cycle, m.phase),
                _ => m,
            })
            .collect();
        let ctx = feed(&mut w, &breath, 0);
        assert_eq!(verdict(AlarmKind::Hapa, &w, &ctx), Verdict::Insufficient);
    }

    #[test]
    fn test_hapa_over_range_reading_triggers() {
        let mut w = windows();
        let ctx = feed(&mut w, &CycleBuilder::new(0).spike(125.0).build(), 0);
        assert_eq!(verdict(AlarmKind::Hapa, &w, &ctx), Verdict::Trigger(AlarmPriority::High));
    }

    #[test]
    fn test_low_vte_deviation_reports_medium() {
        let mut w = windows();
        for cycle in 0..5 {
            feed(&mut w, &CycleBuilder::new(cycle).tidal_volume(400.0).build(), cycle);
        }
        let ctx = feed(&mut w, &CycleBuilder::new(5).tidal_volume(250.0).build(), 5);
        assert_eq!(verdict(AlarmKind::LowVte, &w, &ctx), Verdict::Trigger(AlarmPriority::Medium));
    }

    #[test]
    fn test_low_vte_small_deviation_reports_low() {
        let mut w = windows();
        for cycle in 0..5 {
            feed(&mut w, &CycleBuilder::new(cycle).tidal_volume(310.0).build(), cycle);
        }
        let ctx = feed(&mut w, &CycleBuilder::new(5).tidal_volume(290.0).build(), 5);
        assert_eq!(verdict(AlarmKind::LowVte, &w, &ctx), Verdict::Trigger(AlarmPriority::Low));
    }

    #[test]
    fn test_obstruction_needs_consecutive_cycles() {
        let mut w = windows();
        let ctx = feed(&mut w, &CycleBuilder::new(0).expiratory_pressure(25.0).build(), 0);
        assert_eq!(verdict(AlarmKind::Obstruction, &w, &ctx), Verdict::Clear);
        let ctx = feed(&mut w, &CycleBuilder::new(1).expiratory_pressure(25.0).build(), 1);
        assert_eq!(verdict(AlarmKind::Obstruction, &w, &ctx), Verdict::Trigger(AlarmPriority::High));
        let ctx = feed(&mut w, &CycleBuilder::new(2).build(), 2);
        assert_eq!(verdict(AlarmKind::Obstruction, &w, &ctx), Verdict::Clear);
    }

    #[test]
    fn test_disconnection_requires_both_signals_low() {
        let mut w = windows();
        let ctx = feed(&mut w, &CycleBuilder::new(0).expiratory_pressure(1.0).tidal_volume(50.0).build(), 0);
        assert_eq!(verdict(AlarmKind::Disconnection, &w, &ctx), Verdict::Trigger(AlarmPriority::Medium));

        let mut w = windows();
        let ctx = feed(&mut w, &CycleBuilder::new(0).expiratory_pressure(1.0).build(), 0);
        assert_eq!(verdict(AlarmKind::Disconnection, &w, &ctx), Verdict::Clear);
    }

    #[test]
    fn test_oxygenation_band() {
        let mut w = windows();
        let ctx = feed(&mut w, &CycleBuilder::new(0).spo2(88.0).build(), 0);
        assert_eq!(verdict(AlarmKind::Oxygenation, &w, &ctx), Verdict::Trigger(AlarmPriority::Medium));
    }

    #[test]
    fn test_stuck_pressure_sensor() {
        let mut w = windows();
        let mut ctx = CycleContext::new(0, setpoints());
        for cycle in 0..3 {
            ctx = feed(&mut w, &CycleBuilder::new(cycle).flat_pressure(12.0).build(), cycle);
        }
        assert_eq!(verdict(AlarmKind::SensorFault, &w, &ctx), Verdict::Trigger(AlarmPriority::Medium));
    }
}
