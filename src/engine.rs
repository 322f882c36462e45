// src/engine.rs
use crate::{
    alarm_manager::{AlarmManager, SnapshotReader, TickReport},
    alarms::AlarmKind,
    config::Config,
    error::*,
    measurement::{CycleContext, Measurement, Setpoints},
    safety::{ActuatorSink, SafetyInput, SafetyOutcome, SafetyResponseCoordinator},
    settings_guard::{OperatorAction, SetpointRequest, SettingsGuard},
    signal::MeasurementBus,
    watchdog::Watchdog,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use metrics::{counter, gauge, histogram};

#[derive(Clone, Debug, Default, Serialize)]
pub struct EngineStats {
    pub armed: bool,
    pub halted: bool,
    pub tick_count: u64,
    pub error_count: u64,
    pub budget_overruns: u64,
    pub dropped_measurements: u64,
    pub rejected_commands: u64,
    pub last_tick_us: u64,
    pub max_tick_us: u64,
    pub uptime_secs: u64,
}

/// Result of one evaluated breath cycle
#[derive(Clone, Debug, Serialize)]
pub struct EngineTick {
    pub report: TickReport,
    pub safety: SafetyOutcome,
    /// Setpoints the rules were evaluated against
    pub setpoints: Setpoints,
    pub duration_us: u64,
}

/// Operator input routed into the engine
#[derive(Debug, Clone, Copy)]
pub enum OperatorCommand {
    ConfirmStartup(OperatorAction),
    Acknowledge(AlarmKind),
    Suppress { kind: AlarmKind, cycles: Option<u32> },
    ChangeSetpoints { request: SetpointRequest, action: OperatorAction },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum OperatorReply {
    Confirmed(Setpoints),
    Acknowledged(AlarmKind),
    Suppressed { kind: AlarmKind, cycles: u32 },
    SetpointsApplied(Setpoints),
}

/// Messages accepted by [`Engine::run`]
#[derive(Debug)]
pub enum EngineInput {
    Measurement(Measurement),
    /// The control loop closed a breath cycle
    EndOfCycle(CycleContext),
    /// The control loop lowered PIP on its own
    PipReduced(f64),
    Operator {
        command: OperatorCommand,
        reply: Option<oneshot::Sender<Result<OperatorReply>>>,
    },
    Shutdown,
}

pub struct Engine {
    config: Config,
    manager: AlarmManager,
    safety: SafetyResponseCoordinator,
    guard: SettingsGuard,
    watchdog: Box<dyn Watchdog>,
    bus: MeasurementBus,
    buffer: VecDeque<Measurement>,
    pip_override: Option<f64>,
    halted: bool,
    running: Arc<AtomicBool>,
    stats_handle: Arc<RwLock<EngineStats>>,
    start_time: Instant,
    cycle_budget: Duration,
}

impl Engine {
    /// Build an engine from a validated configuration.
    ///
    /// The engine starts disarmed; [`Engine::confirm_startup`] arms it.
    pub fn new(config: Config, sink: Box<dyn ActuatorSink>, watchdog: Box<dyn Watchdog>) -> Result<Self> {
        config.validate()?;

        #[cfg(feature = "metrics")]
        gauge!("ventguard_cycle_budget_us").set(config.engine.cycle_budget_us as f64);

        let manager = AlarmManager::new(&config)?;
        let safety = SafetyResponseCoordinator::new(sink, config.safety.fallback_pip);
        let guard = SettingsGuard::new(&config.settings);

        info!(
            "Engine created: {} alarm kinds, cycle budget {} us",
            AlarmKind::COUNT,
            config.engine.cycle_budget_us
        );

        Ok(Self {
            buffer: VecDeque::with_capacity(config.engine.measurement_buffer),
            cycle_budget: Duration::from_micros(config.engine.cycle_budget_us),
            config,
            manager,
            safety,
            guard,
            watchdog,
            bus: MeasurementBus::new(),
            pip_override: None,
            halted: false,
            running: Arc::new(AtomicBool::new(false)),
            stats_handle: Arc::new(RwLock::new(EngineStats::default())),
            start_time: Instant::now(),
        })
    }

    pub fn is_armed(&self) -> bool {
        self.guard.is_startup_confirmed() && !self.halted
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn confirm_startup(&mut self, action: OperatorAction) -> Result<Setpoints> {
        if self.halted {
            return Err(VentError::NotArmed("engine halted after a fatal fault".into()));
        }
        let setpoints = self.guard.confirm_startup(action);
        self.stats_handle.write().armed = true;
        info!("Engine armed");
        Ok(setpoints)
    }

    pub fn bus(&self) -> &MeasurementBus {
        &self.bus
    }

    pub fn manager(&self) -> &AlarmManager {
        &self.manager
    }

    pub fn safety(&self) -> &SafetyResponseCoordinator {
        &self.safety
    }

    pub fn snapshot_reader(&self) -> SnapshotReader {
        self.manager.snapshot_reader()
    }

    /// Setpoints currently approved by the guard, PIP override included
    pub fn setpoints(&self) -> Setpoints {
        self.guard.current()
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = self.stats_handle.read().clone();
        stats.uptime_secs = self.start_time.elapsed().as_secs();
        stats
    }

    pub fn stats_handle(&self) -> Arc<RwLock<EngineStats>> {
        Arc::clone(&self.stats_handle)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Buffer a measurement for the current cycle; the oldest sample is
    /// dropped once the buffer is full
    pub fn ingest(&mut self, m: Measurement) {
        self.bus.publish(m);
        if self.buffer.len() == self.config.engine.measurement_buffer {
            self.buffer.pop_front();
            self.stats_handle.write().dropped_measurements += 1;
            debug!("Measurement buffer full, oldest sample dropped");
        }
        self.buffer.push_back(m);
    }

    /// The control loop reports a PIP reduction it applied
    pub fn note_pip_reduction(&mut self, pip: f64) {
        self.apply_pip_override(pip);
    }

    /// Evaluate the cycle closed by `ctx`.
    ///
    /// A `DeadlineMiss` raises the technical alarm, trips the watchdog and
    /// halts the engine before the error is returned.
    pub fn tick(&mut self, ctx: CycleContext) -> Result<EngineTick> {
        if self.halted {
            self.buffer.clear();
            return Err(VentError::NotArmed("engine halted after a fatal fault".into()));
        }
        if !self.guard.is_startup_confirmed() {
            self.buffer.clear();
            return Err(VentError::NotArmed("startup settings not confirmed".into()));
        }

        let started = Instant::now();
        let ctx = self.effective_context(ctx);

        let report = self.manager.tick(self.buffer.make_contiguous(), &ctx);
        self.buffer.clear();
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                self.stats_handle.write().error_count += 1;
                warn!("Cycle {} not evaluated: {}", ctx.cycle, e);
                return Err(e);
            }
        };

        let input = SafetyInput {
            cycle: ctx.cycle,
            setpoints: ctx.setpoints,
            transitions: &report.transitions,
            end_expiratory_pressure: self.manager.end_expiratory_pressure(ctx.cycle),
            obstruction_raised: self.manager.instance(AlarmKind::Obstruction).state().is_raised(),
        };
        let safety = match self.safety.respond(&input) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail(e, ctx.cycle)),
        };
        if let Some(pip) = safety.pip_override {
            self.apply_pip_override(pip);
        }

        if let Err(e) = self.watchdog.feed(ctx.cycle) {
            return Err(self.fail(e, ctx.cycle));
        }

        let elapsed = started.elapsed();
        self.update_timing_stats(ctx.cycle, elapsed);

        Ok(EngineTick {
            report,
            safety,
            setpoints: ctx.setpoints,
            duration_us: elapsed.as_micros() as u64,
        })
    }

    pub fn handle_operator(&mut self, command: OperatorCommand) -> Result<OperatorReply> {
        let reply = match command {
            OperatorCommand::ConfirmStartup(action) => self.confirm_startup(action).map(OperatorReply::Confirmed),
            OperatorCommand::Acknowledge(kind) => self.manager.acknowledge(kind).map(|_| OperatorReply::Acknowledged(kind)),
            OperatorCommand::Suppress { kind, cycles } => self
                .manager
                .suppress(kind, cycles)
                .map(|cycles| OperatorReply::Suppressed { kind, cycles }),
            OperatorCommand::ChangeSetpoints { request, action } => self.guard.request(request, action).map(|s| {
                self.pip_override = None;
                OperatorReply::SetpointsApplied(s)
            }),
        };
        if reply.is_err() {
            self.stats_handle.write().rejected_commands += 1;
        }
        reply
    }

    /// Consume inputs until shutdown, the channel closes, or a fatal fault.
    ///
    /// Tick results are forwarded to `events`; a full event queue drops the
    /// event rather than stalling the cycle.
    pub async fn run(&mut self, mut inputs: mpsc::Receiver<EngineInput>, events: mpsc::Sender<EngineTick>) -> Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Err(VentError::NotArmed("engine is already running".into()));
        }
        info!("Engine loop started");

        #[cfg(feature = "metrics")]
        gauge!("ventguard_engine_running").set(1.0);

        let mut result = Ok(());
        while self.running.load(Ordering::Relaxed) {
            let Some(input) = inputs.recv().await else {
                info!("Input channel closed");
                break;
            };
            match input {
                EngineInput::Measurement(m) => self.ingest(m),
                EngineInput::PipReduced(pip) => self.note_pip_reduction(pip),
                EngineInput::Operator { command, reply } => {
                    let outcome = self.handle_operator(command);
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                }
                EngineInput::EndOfCycle(ctx) => match self.tick(ctx) {
                    Ok(tick) => {
                        if events.try_send(tick).is_err() {
                            debug!("Event queue full, cycle {} event dropped", ctx.cycle);
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        result = Err(e);
                        break;
                    }
                    Err(e) => error!("Cycle {} error: {}", ctx.cycle, e),
                },
                EngineInput::Shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        gauge!("ventguard_engine_running").set(0.0);
        info!("Engine loop stopped");
        result
    }

    fn effective_context(&mut self, mut ctx: CycleContext) -> CycleContext {
        if let Some(pip) = self.pip_override {
            if ctx.setpoints.pip <= pip {
                debug!("Control loop adopted PIP {}", ctx.setpoints.pip);
                self.pip_override = None;
            } else {
                ctx.setpoints.pip = pip;
            }
        }
        ctx
    }

    fn apply_pip_override(&mut self, pip: f64) {
        let pip = self.pip_override.map_or(pip, |held| held.min(pip));
        self.pip_override = Some(pip);
        self.guard.note_pip_override(pip);
    }

    fn fail(&mut self, e: VentError, cycle: u64) -> VentError {
        error!("Fatal fault at cycle {}: {}", cycle, e);
        if matches!(e, VentError::DeadlineMiss { .. }) {
            self.manager.latch_deadline_miss(cycle);
        }
        self.watchdog.trip(&e.to_string());
        self.halted = true;
        let mut stats = self.stats_handle.write();
        stats.halted = true;
        stats.armed = false;
        stats.error_count += 1;
        e
    }

    fn update_timing_stats(&self, cycle: u64, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        let overrun = elapsed > self.cycle_budget;
        if overrun {
            warn!("Cycle {} evaluation took {} us, budget {} us", cycle, us, self.cycle_budget.as_micros());
        }

        #[cfg(feature = "metrics")]
        {
            histogram!("ventguard_tick_duration_us").record(us as f64);
            if overrun {
                counter!("ventguard_budget_overruns_total").increment(1);
            }
        }

        let mut stats = self.stats_handle.write();
        stats.tick_count += 1;
        stats.last_tick_us = us;
        stats.max_tick_us = stats.max_tick_us.max(us);
        if overrun {
            stats.budget_overruns += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::RecordingSink;
    use crate::simulation::CycleBuilder;
    use crate::watchdog::SoftwareWatchdog;

    fn engine() -> Engine {
        Engine::new(Config::default(), Box::new(RecordingSink::new()), Box::new(SoftwareWatchdog::new())).unwrap()
    }

    fn feed(engine: &mut Engine, builder: CycleBuilder) -> Result<EngineTick> {
        for m in builder.build() {
            engine.ingest(m);
        }
        let ctx = builder.context(engine.setpoints());
        engine.tick(ctx)
    }

    #[test]
    fn test_refuses_to_tick_before_confirmation() {
        let mut e = engine();
        assert!(matches!(feed(&mut e, CycleBuilder::new(0)), Err(VentError::NotArmed(_))));
        e.confirm_startup(OperatorAction::new(1)).unwrap();
        assert!(feed(&mut e, CycleBuilder::new(1)).is_ok());
        assert_eq!(e.stats().tick_count, 1);
    }

    #[test]
    fn test_invalid_configuration_refuses_to_arm() {
        let mut config = Config::default();
        config.alarms.hapa.pip_factor = 0.5;
        let r = Engine::new(config, Box::new(RecordingSink::new()), Box::new(SoftwareWatchdog::new()));
        assert!(matches!(r, Err(VentError::ConfigurationInvalid(_))));
    }

    #[test]
    fn test_hapa_override_lowers_pip_for_next_cycle() {
        let mut e = engine();
        e.confirm_startup(OperatorAction::new(1)).unwrap();
        let tick = feed(&mut e, CycleBuilder::new(0).spike(30.0)).unwrap();
        assert_eq!(tick.safety.pip_override, Some(20.0));

        let mut config = Config::default();
        config.safety.fallback_pip = 15.0;
        let mut e = Engine::new(config, Box::new(RecordingSink::new()), Box::new(SoftwareWatchdog::new())).unwrap();
        e.confirm_startup(OperatorAction::new(1)).unwrap();
        feed(&mut e, CycleBuilder::new(0).spike(30.0)).unwrap();
        assert_eq!(e.setpoints().pip, 15.0);
    }

    #[test]
    fn test_buffer_drops_oldest() {
        let mut config = Config::default();
        config.engine.measurement_buffer = 16;
        let mut e = Engine::new(config, Box::new(RecordingSink::new()), Box::new(SoftwareWatchdog::new())).unwrap();
        for m in CycleBuilder::new(0).build().into_iter().take(20) {
            e.ingest(m);
        }
        assert_eq!(e.stats().dropped_measurements, 4);
    }
}
