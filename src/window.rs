// src/window.rs - Fixed-capacity rolling windows per monitored signal
use crate::config::{SensorConfig, WindowConfig};
use crate::measurement::{CycleContext, Measurement, Phase, SignalKind};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{trace, warn};

/// Result of aggregating a window.
///
/// `Insufficient` is never a synonym for normal: rules treat it as an
/// alarm-worthy unknown.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum WindowReading {
    Value(f64),
    Insufficient,
}

impl WindowReading {
    pub fn value(self) -> Option<f64> {
        match self {
            WindowReading::Value(v) => Some(v),
            WindowReading::Insufficient => None,
        }
    }

    pub fn is_insufficient(self) -> bool {
        matches!(self, WindowReading::Insufficient)
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    valid: bool,
    timestamp_ms: u64,
    cycle: u64,
    phase: Phase,
}

/// Signal state captured at the transition out of a phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseEnd {
    pub cycle: u64,
    pub phase: Phase,
    /// Last sample observed in the phase
    pub last: WindowReading,
    /// Rolling mean over the smoothing duration at the transition
    pub mean: WindowReading,
}

/// Per-cycle aggregate, finalized when the cycle closes
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CycleStats {
    pub cycle: u64,
    pub samples: usize,
    pub valid: usize,
    pub implausible: usize,
    /// Implausible readings above the plausible maximum
    pub over_range: usize,
    pub peak: Option<f64>,
    /// Every valid sample of the cycle carried the same value
    pub flat: bool,
}

impl CycleStats {
    fn empty(cycle: u64) -> Self {
        Self {
            cycle,
            samples: 0,
            valid: 0,
            implausible: 0,
            over_range: 0,
            peak: None,
            flat: false,
        }
    }

    pub fn coverage(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.valid as f64 / self.samples as f64
        }
    }

    fn absorb(&mut self, value: f64, valid: bool, first_valid: &mut Option<f64>) {
        self.samples += 1;
        if !valid {
            return;
        }
        self.valid += 1;
        self.peak = Some(self.peak.map_or(value, |p| p.max(value)));
        match *first_valid {
            None => {
                *first_valid = Some(value);
                self.flat = false;
            }
            Some(first) => {
                self.flat = if self.valid == 2 { first == value } else { self.flat && first == value };
            }
        }
    }
}

/// Rolling buffer for one signal.
///
/// Capacity is fixed at construction; the oldest sample is evicted when full.
#[derive(Debug, Clone)]
pub struct SignalWindow {
    kind: SignalKind,
    capacity: usize,
    smoothing_ms: u64,
    min_coverage: f64,
    plausible: (f64, f64),
    samples: VecDeque<Sample>,
    phase_ends: VecDeque<PhaseEnd>,
    history: usize,
    current: CycleStats,
    first_valid: Option<f64>,
    last_cycle: Option<CycleStats>,
    flat_cycles: u32,
}

impl SignalWindow {
    pub fn new(kind: SignalKind, config: &WindowConfig, plausible: (f64, f64)) -> Self {
        Self {
            kind,
            capacity: config.capacity,
            smoothing_ms: config.smoothing_ms,
            min_coverage: config.min_valid_coverage,
            plausible,
            samples: VecDeque::with_capacity(config.capacity),
            phase_ends: VecDeque::with_capacity(config.phase_history),
            history: config.phase_history,
            current: CycleStats::empty(0),
            first_valid: None,
            last_cycle: None,
            flat_cycles: 0,
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// Valid fraction below which an aggregate is not trusted
    pub fn min_coverage(&self) -> f64 {
        self.min_coverage
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append a sample. Returns whether it was accepted as valid.
    ///
    /// Samples flagged invalid, in a foreign unit, or outside the plausible
    /// range are kept (they count against coverage) but never aggregated.
    pub fn push(&mut self, m: &Measurement) -> bool {
        let mut valid = m.is_usable();
        if m.valid && !valid {
            warn!("Dropping {} sample at {} ms: {:?}", self.kind, m.timestamp_ms, m.check().err());
        }
        let (lo, hi) = self.plausible;
        if valid && !(lo..=hi).contains(&m.value) {
            warn!("Implausible {} reading {} outside [{}, {}]", self.kind, m.value, lo, hi);
            self.current.implausible += 1;
            if m.value > hi {
                self.current.over_range += 1;
            }
            valid = false;
        }

        if let Some(prev) = self.samples.back().copied() {
            if prev.cycle == m.cycle && prev.phase != m.phase {
                self.record_phase_end(prev.phase, prev.cycle);
            }
        }

        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            value: m.value,
            valid,
            timestamp_ms: m.timestamp_ms,
            cycle: m.cycle,
            phase: m.phase,
        });
        self.current.absorb(m.value, valid, &mut self.first_valid);
        trace!("{} <- {} (valid={})", self.kind, m.value, valid);
        valid
    }

    /// Mean of the valid samples covering at least `duration_ms` back from
    /// the newest sample.
    pub fn rolling_mean(&self, duration_ms: u64) -> WindowReading {
        let newest = match self.samples.back() {
            Some(s) => s.timestamp_ms,
            None => return WindowReading::Insufficient,
        };
        let horizon = newest.saturating_sub(duration_ms);

        let mut total = 0usize;
        let mut valid = 0usize;
        let mut sum = 0.0;
        let mut covered = false;
        for s in self.samples.iter().rev() {
            total += 1;
            if s.valid {
                valid += 1;
                sum += s.value;
            }
            if s.timestamp_ms <= horizon {
                covered = true;
                break;
            }
        }

        if !covered || valid == 0 || (valid as f64) / (total as f64) < self.min_coverage {
            return WindowReading::Insufficient;
        }
        WindowReading::Value(sum / valid as f64)
    }

    /// Most recent recorded end of `phase`
    pub fn value_at_phase_end(&self, phase: Phase) -> Option<&PhaseEnd> {
        self.phase_ends.iter().rev().find(|pe| pe.phase == phase)
    }

    /// Recorded ends of `phase`, newest first
    pub fn phase_ends(&self, phase: Phase) -> impl Iterator<Item = &PhaseEnd> + '_ {
        self.phase_ends.iter().rev().filter(move |pe| pe.phase == phase)
    }

    /// Newest valid sample stamped with `cycle`
    pub fn latest_in_cycle(&self, cycle: u64) -> WindowReading {
        self.samples
            .iter()
            .rev()
            .take_while(|s| s.cycle == cycle)
            .find(|s| s.valid)
            .map_or(WindowReading::Insufficient, |s| WindowReading::Value(s.value))
    }

    /// Aggregate of the last closed cycle
    pub fn last_cycle(&self) -> Option<&CycleStats> {
        self.last_cycle.as_ref()
    }

    /// Consecutive closed cycles whose samples were perfectly flat
    pub fn flat_cycles(&self) -> u32 {
        self.flat_cycles
    }

    /// Finalize the cycle: record the end of the closing phase and roll the
    /// per-cycle aggregate.
    pub fn close_cycle(&mut self, ctx: &CycleContext) {
        let already = self
            .phase_ends
            .back()
            .map_or(false, |pe| pe.cycle == ctx.cycle && pe.phase == ctx.phase);
        if !already {
            self.record_phase_end(ctx.phase, ctx.cycle);
        }

        let mut stats = std::mem::replace(&mut self.current, CycleStats::empty(ctx.cycle + 1));
        stats.cycle = ctx.cycle;
        if stats.valid >= 2 && stats.flat {
            self.flat_cycles += 1;
        } else if stats.valid > 0 {
            self.flat_cycles = 0;
        }
        self.first_valid = None;
        self.last_cycle = Some(stats);
    }

    fn record_phase_end(&mut self, phase: Phase, cycle: u64) {
        let in_phase = |s: &&Sample| s.cycle == cycle && s.phase == phase;
        let last = match self.samples.iter().rev().find(in_phase) {
            Some(s) if s.valid => WindowReading::Value(s.value),
            _ => WindowReading::Insufficient,
        };
        let mean = if self.samples.iter().rev().any(|s| s.cycle == cycle && s.phase == phase) {
            self.rolling_mean(self.smoothing_ms)
        } else {
            WindowReading::Insufficient
        };

        if self.phase_ends.len() == self.history {
            self.phase_ends.pop_front();
        }
        self.phase_ends.push_back(PhaseEnd { cycle, phase, last, mean });
    }
}

/// One window per [`SignalKind`], indexed by kind
#[derive(Debug, Clone)]
pub struct WindowSet {
    windows: Vec<SignalWindow>,
}

impl WindowSet {
    pub fn new(window: &WindowConfig, sensors: &SensorConfig) -> Self {
        let windows = SignalKind::ALL
            .iter()
            .map(|&kind| SignalWindow::new(kind, window, sensors.plausible_range(kind)))
            .collect();
        Self { windows }
    }

    pub fn get(&self, kind: SignalKind) -> &SignalWindow {
        &self.windows[kind.index()]
    }

    pub fn push(&mut self, m: &Measurement) -> bool {
        self.windows[m.kind.index()].push(m)
    }

    pub fn close_cycle(&mut self, ctx: &CycleContext) {
        for w in &mut self.windows {
            w.close_cycle(ctx);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SignalWindow> {
        self.windows.iter()
    }

    /// End-expiratory rolling mean pressure for `cycle`
    pub fn end_expiratory_pressure(&self, cycle: u64) -> WindowReading {
        self.get(SignalKind::AirwayPressure)
            .value_at_phase_end(Phase::Expiratory)
            .filter(|pe| pe.cycle == cycle)
            .map_or(WindowReading::Insufficient, |pe| pe.mean)
    }
}
