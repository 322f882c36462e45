// src/alarm_manager.rs
// Owns the alarm instances, drives them once per cycle, arbitrates the
// annunciated alarm and publishes a consistent snapshot for readers.

use crate::alarms::{
    AlarmInstance, AlarmKind, AlarmPriority, AlarmRegistry, AlarmState, AlarmTransition, Verdict,
};
use crate::config::Config;
use crate::error::{RejectReason, Result, VentError};
use crate::measurement::{CycleContext, Measurement};
use crate::rules::{self, RuleInput};
use crate::window::{WindowReading, WindowSet};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use metrics::counter;

const MAX_HISTORY: usize = 10_000;

/// The single alarm currently presented to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnnunciatedAlarm {
    pub kind: AlarmKind,
    pub priority: AlarmPriority,
    pub state: AlarmState,
    pub first_triggered: u64,
    pub acknowledged: bool,
}

/// Read-only view of one instance after a tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AlarmStatus {
    pub kind: AlarmKind,
    pub state: AlarmState,
    pub priority: AlarmPriority,
    pub technical: bool,
    pub first_triggered: Option<u64>,
    pub last_cleared: Option<u64>,
    pub suppressed_until: Option<u64>,
    pub acknowledged: bool,
}

/// Consistent post-tick view published to UI/telemetry readers
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlarmSnapshot {
    /// Last cycle evaluated; `None` before the first tick
    pub cycle: Option<u64>,
    pub alarms: Vec<AlarmStatus>,
    pub annunciated: Option<AnnunciatedAlarm>,
}

impl AlarmSnapshot {
    pub fn status(&self, kind: AlarmKind) -> Option<&AlarmStatus> {
        self.alarms.iter().find(|a| a.kind == kind)
    }
}

/// Cheap cloneable handle to the published snapshot
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    inner: Arc<RwLock<AlarmSnapshot>>,
}

impl SnapshotReader {
    pub fn load(&self) -> AlarmSnapshot {
        self.inner.read().clone()
    }

    pub fn annunciated(&self) -> Option<AnnunciatedAlarm> {
        self.inner.read().annunciated
    }

    pub fn cycle(&self) -> Option<u64> {
        self.inner.read().cycle
    }
}

/// Everything that happened in one cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub cycle: u64,
    pub transitions: Vec<AlarmTransition>,
    pub annunciated: Option<AnnunciatedAlarm>,
    /// Acknowledgements applied at the start of this cycle
    pub acknowledged: Vec<AlarmKind>,
    /// Clinical rules that could not decide this cycle
    pub data_gaps: Vec<AlarmKind>,
    pub rejected_samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub kind: AlarmKind,
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: AlarmEventType,
    pub priority: AlarmPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmEventType {
    Pending,
    Triggered,
    Escalated,
    Suppressed,
    Resumed,
    Cleared,
    Acknowledged,
}

impl AlarmEventType {
    fn of(t: &AlarmTransition) -> Self {
        match (t.from, t.to) {
            (AlarmState::Suppressed, AlarmState::Active | AlarmState::Escalated) => AlarmEventType::Resumed,
            (_, AlarmState::Pending) => AlarmEventType::Pending,
            (_, AlarmState::Active) => AlarmEventType::Triggered,
            (_, AlarmState::Escalated) => AlarmEventType::Escalated,
            (_, AlarmState::Suppressed) => AlarmEventType::Suppressed,
            (_, AlarmState::Inactive | AlarmState::Clearing) => AlarmEventType::Cleared,
        }
    }
}

pub struct AlarmManager {
    registry: AlarmRegistry,
    instances: Vec<AlarmInstance>,
    windows: WindowSet,
    pending_ack: [bool; AlarmKind::COUNT],
    pending_suppress: [Option<u32>; AlarmKind::COUNT],
    default_suppression: u32,
    max_suppression: u32,
    last_cycle: Option<u64>,
    deadline_missed: bool,
    published: Arc<RwLock<AlarmSnapshot>>,
    history: VecDeque<AlarmEvent>,
}

impl AlarmManager {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let registry = AlarmRegistry::from_config(config)?;
        let instances = registry.iter().map(|def| AlarmInstance::new(*def)).collect();

        let mut manager = Self {
            registry,
            instances,
            windows: WindowSet::new(&config.window, &config.sensors),
            pending_ack: [false; AlarmKind::COUNT],
            pending_suppress: [None; AlarmKind::COUNT],
            default_suppression: config.alarms.suppression.default_cycles,
            max_suppression: config.alarms.suppression.max_cycles,
            last_cycle: None,
            deadline_missed: false,
            published: Arc::new(RwLock::new(AlarmSnapshot::default())),
            history: VecDeque::with_capacity(1024),
        };
        manager.publish(None);
        info!("Alarm manager ready with {} alarm kinds", AlarmKind::COUNT);
        Ok(manager)
    }

    pub fn registry(&self) -> &AlarmRegistry {
        &self.registry
    }

    pub fn instance(&self, kind: AlarmKind) -> &AlarmInstance {
        &self.instances[kind.index()]
    }

    pub fn windows(&self) -> &WindowSet {
        &self.windows
    }

    pub fn last_cycle(&self) -> Option<u64> {
        self.last_cycle
    }

    pub fn end_expiratory_pressure(&self, cycle: u64) -> WindowReading {
        self.windows.end_expiratory_pressure(cycle)
    }

    pub fn snapshot_reader(&self) -> SnapshotReader {
        SnapshotReader { inner: Arc::clone(&self.published) }
    }

    /// Queue an acknowledgement; applied at the start of the next tick
    pub fn acknowledge(&mut self, kind: AlarmKind) -> Result<()> {
        if !self.instance(kind).state().is_raised() {
            warn!("Acknowledge rejected: {} is not active", kind);
            return Err(RejectReason::NotActive(kind).into());
        }
        self.pending_ack[kind.index()] = true;
        debug!("Acknowledge of {} queued", kind);
        Ok(())
    }

    /// Queue a suppression of `cycles` (default if `None`, clamped to the
    /// configured maximum). Returns the duration that will be applied.
    pub fn suppress(&mut self, kind: AlarmKind, cycles: Option<u32>) -> Result<u32> {
        let instance = self.instance(kind);
        if !instance.definition().suppressible {
            warn!("Suppress rejected: {} is not suppressible", kind);
            return Err(RejectReason::NotSuppressible(kind).into());
        }
        if !instance.state().is_raised() {
            warn!("Suppress rejected: {} is not active", kind);
            return Err(RejectReason::NotActive(kind).into());
        }
        let cycles = cycles.unwrap_or(self.default_suppression).clamp(1, self.max_suppression);
        self.pending_suppress[kind.index()] = Some(cycles);
        debug!("Suppression of {} for {} cycles queued", kind, cycles);
        Ok(cycles)
    }

    /// Evaluate one breath cycle.
    ///
    /// Cycles must strictly increase. Queued operator requests are applied
    /// first, then every rule is evaluated against the updated windows and
    /// every instance is stepped. The snapshot is published last.
    pub fn tick(&mut self, measurements: &[Measurement], ctx: &CycleContext) -> Result<TickReport> {
        if let Some(last) = self.last_cycle {
            if ctx.cycle <= last {
                return Err(VentError::DataQuality(format!(
                    "cycle {} is not after last evaluated cycle {}",
                    ctx.cycle, last
                )));
            }
        }

        let mut report = TickReport { cycle: ctx.cycle, ..TickReport::default() };
        self.apply_requests(ctx.cycle, &mut report);

        for m in measurements {
            if m.valid && m.check().is_err() {
                report.rejected_samples += 1;
            }
            self.windows.push(m);
        }
        self.windows.close_cycle(ctx);

        let mut verdicts = [Verdict::Clear; AlarmKind::COUNT];
        let mut input = RuleInput {
            windows: &self.windows,
            ctx,
            data_gap: false,
            deadline_missed: self.deadline_missed,
        };
        for def in self.registry.iter().filter(|d| !is_supervisory(d.kind)) {
            let verdict = rules::evaluate(def, &input);
            if verdict == Verdict::Insufficient {
                report.data_gaps.push(def.kind);
            }
            verdicts[def.kind.index()] = verdict;
        }
        input.data_gap = !report.data_gaps.is_empty();
        for def in self.registry.iter().filter(|d| is_supervisory(d.kind)) {
            verdicts[def.kind.index()] = rules::evaluate(def, &input);
        }
        if !report.data_gaps.is_empty() {
            debug!("Cycle {}: insufficient data for {:?}", ctx.cycle, report.data_gaps);
        }

        for (instance, verdict) in self.instances.iter_mut().zip(verdicts) {
            report.transitions.extend(instance.step(verdict, ctx.cycle));
        }
        for t in report.transitions.clone() {
            self.record(&t);
        }

        self.last_cycle = Some(ctx.cycle);
        report.annunciated = self.publish(Some(ctx.cycle));

        #[cfg(feature = "metrics")]
        {
            counter!("ventguard_ticks_total").increment(1);
            counter!("ventguard_alarm_transitions_total").increment(report.transitions.len() as u64);
        }

        Ok(report)
    }

    /// Raise the deadline-miss alarm in the current cycle and republish.
    ///
    /// Latched: it never clears for the lifetime of the manager.
    pub fn latch_deadline_miss(&mut self, cycle: u64) -> Vec<AlarmTransition> {
        self.deadline_missed = true;
        let instance = &mut self.instances[AlarmKind::SafetyDeadlineMiss.index()];
        let transitions = instance.step(Verdict::Trigger(AlarmPriority::High), cycle);
        for t in &transitions {
            self.record(t);
        }
        self.publish(Some(cycle));

        #[cfg(feature = "metrics")]
        counter!("ventguard_deadline_misses_total").increment(1);

        transitions
    }

    pub fn deadline_missed(&self) -> bool {
        self.deadline_missed
    }

    /// Most recent `limit` alarm events, oldest first
    pub fn history(&self, limit: usize) -> Vec<AlarmEvent> {
        let start = self.history.len().saturating_sub(limit);
        self.history.iter().skip(start).cloned().collect()
    }

    fn apply_requests(&mut self, cycle: u64, report: &mut TickReport) {
        for kind in AlarmKind::ALL {
            let i = kind.index();
            if let Some(cycles) = self.pending_suppress[i].take() {
                match self.instances[i].suppress(cycle, cycles) {
                    Ok(Some(t)) => report.transitions.push(t),
                    Ok(None) => {}
                    Err(reason) => warn!("Queued suppression of {} dropped: {}", kind, reason),
                }
            }
            if std::mem::take(&mut self.pending_ack[i]) {
                match self.instances[i].acknowledge() {
                    Ok(()) => {
                        info!("{} acknowledged at cycle {}", kind, cycle);
                        report.acknowledged.push(kind);
                        let priority = self.instances[i].priority();
                        self.push_event(kind, cycle, AlarmEventType::Acknowledged, priority);
                    }
                    Err(reason) => warn!("Queued acknowledge of {} dropped: {}", kind, reason),
                }
            }
        }
    }

    fn record(&mut self, t: &AlarmTransition) {
        if t.priority == AlarmPriority::High && t.to != AlarmState::Inactive {
            warn!("{} {:?} -> {:?} at cycle {} ({:?})", t.kind, t.from, t.to, t.cycle, t.priority);
        } else {
            info!("{} {:?} -> {:?} at cycle {} ({:?})", t.kind, t.from, t.to, t.cycle, t.priority);
        }
        self.push_event(t.kind, t.cycle, AlarmEventType::of(t), t.priority);
    }

    fn push_event(&mut self, kind: AlarmKind, cycle: u64, event_type: AlarmEventType, priority: AlarmPriority) {
        if self.history.len() == MAX_HISTORY {
            self.history.drain(0..1000);
        }
        self.history.push_back(AlarmEvent {
            kind,
            cycle,
            timestamp: Utc::now(),
            event_type,
            priority,
        });
    }

    fn publish(&mut self, cycle: Option<u64>) -> Option<AnnunciatedAlarm> {
        let snapshot = AlarmSnapshot {
            cycle,
            alarms: self
                .instances
                .iter()
                .map(|i| AlarmStatus {
                    kind: i.kind(),
                    state: i.state(),
                    priority: i.priority(),
                    technical: i.definition().technical,
                    first_triggered: i.first_triggered(),
                    last_cleared: i.last_cleared(),
                    suppressed_until: i.suppressed_until(),
                    acknowledged: i.is_acknowledged(),
                })
                .collect(),
            annunciated: arbitrate(&self.instances),
        };
        let annunciated = snapshot.annunciated;
        *self.published.write() = snapshot;
        annunciated
    }
}

fn is_supervisory(kind: AlarmKind) -> bool {
    matches!(kind, AlarmKind::SensorFault | AlarmKind::SafetyDeadlineMiss)
}

/// Highest-priority Active/Escalated instance; ties go to the oldest trigger
/// cycle, then to the lower kind index.
pub fn arbitrate(instances: &[AlarmInstance]) -> Option<AnnunciatedAlarm> {
    instances
        .iter()
        .filter(|i| i.state().is_annunciable())
        .min_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.first_triggered().cmp(&b.first_triggered()))
                .then_with(|| a.kind().index().cmp(&b.kind().index()))
        })
        .map(|i| AnnunciatedAlarm {
            kind: i.kind(),
            priority: i.priority(),
            state: i.state(),
            first_triggered: i.first_triggered().unwrap_or_default(),
            acknowledged: i.is_acknowledged(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Setpoints;
    use crate::simulation::CycleBuilder;

    fn manager() -> AlarmManager {
        AlarmManager::new(&Config::default()).unwrap()
    }

    fn run(m: &mut AlarmManager, builder: CycleBuilder) -> TickReport {
        let ctx = builder.context(Setpoints::default());
        m.tick(&builder.build(), &ctx).unwrap()
    }

    #[test]
    fn test_normal_ventilation_is_quiet() {
        let mut m = manager();
        for cycle in 0..5 {
            let report = run(&mut m, CycleBuilder::new(cycle));
            assert!(report.transitions.is_empty(), "{:?}", report.transitions);
            assert!(report.data_gaps.is_empty());
        }
        assert_eq!(m.snapshot_reader().cycle(), Some(4));
        assert!(m.snapshot_reader().annunciated().is_none());
    }

    #[test]
    fn test_cycle_must_advance() {
        let mut m = manager();
        run(&mut m, CycleBuilder::new(3));
        let ctx = CycleContext::new(3, Setpoints::default());
        assert!(matches!(m.tick(&[], &ctx), Err(VentError::DataQuality(_))));
    }

    #[test]
    fn test_missing_signal_raises_sensor_fault() {
        let mut m = manager();
        let report = run(&mut m, CycleBuilder::new(0).omit(crate::measurement::SignalKind::SpO2));
        assert_eq!(report.data_gaps, vec![AlarmKind::Oxygenation]);
        assert_eq!(m.instance(AlarmKind::SensorFault).state(), AlarmState::Active);
        assert_eq!(m.instance(AlarmKind::Oxygenation).state(), AlarmState::Inactive);
    }

    #[test]
    fn test_operator_requests_apply_next_tick() {
        let mut m = manager();
        run(&mut m, CycleBuilder::new(0).expiratory_pressure(4.0));
        run(&mut m, CycleBuilder::new(1).expiratory_pressure(4.0));
        assert_eq!(m.instance(AlarmKind::Lapa).state(), AlarmState::Escalated);

        m.acknowledge(AlarmKind::Lapa).unwrap();
        assert_eq!(m.suppress(AlarmKind::Lapa, Some(1_000)).unwrap(), 300);
        assert!(!m.instance(AlarmKind::Lapa).is_acknowledged());

        let report = run(&mut m, CycleBuilder::new(2).expiratory_pressure(4.0));
        assert_eq!(report.acknowledged, vec![AlarmKind::Lapa]);
        assert_eq!(m.instance(AlarmKind::Lapa).state(), AlarmState::Suppressed);
        assert_eq!(m.instance(AlarmKind::Lapa).suppressed_until(), Some(302));
        assert!(m.snapshot_reader().annunciated().is_none());
    }

    #[test]
    fn test_suppress_rejections() {
        let mut m = manager();
        assert!(matches!(
            m.suppress(AlarmKind::Hapa, None),
            Err(VentError::OperatorRejected(RejectReason::NotSuppressible(AlarmKind::Hapa)))
        ));
        assert!(matches!(
            m.suppress(AlarmKind::Lapa, None),
            Err(VentError::OperatorRejected(RejectReason::NotActive(AlarmKind::Lapa)))
        ));
    }

    #[test]
    fn test_deadline_miss_latches() {
        let mut m = manager();
        run(&mut m, CycleBuilder::new(0));
        let t = m.latch_deadline_miss(0);
        assert_eq!(t[0].to, AlarmState::Active);
        assert_eq!(m.snapshot_reader().annunciated().map(|a| a.kind), Some(AlarmKind::SafetyDeadlineMiss));

        run(&mut m, CycleBuilder::new(1));
        assert_eq!(m.instance(AlarmKind::SafetyDeadlineMiss).state(), AlarmState::Active);
    }

    #[test]
    fn test_history_records_transitions() {
        let mut m = manager();
        run(&mut m, CycleBuilder::new(0).expiratory_pressure(4.0));
        run(&mut m, CycleBuilder::new(1));
        let events: Vec<_> = m.history(10).iter().map(|e| e.event_type).collect();
        assert_eq!(events, vec![AlarmEventType::Triggered, AlarmEventType::Cleared]);
    }
}
