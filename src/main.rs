use anyhow::{Context, Result};
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use ventguard::simulation::{BreathSimulator, Scenario};
use ventguard::{
    Config, Engine, EngineInput, OperatorAction, SafetyCommand, SoftwareWatchdog, Watchdog,
};

const USAGE: &str = "ventguard [config.yaml|-] [scenario] [cycles]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ventguard=info".parse().context("invalid log directive")?),
        )
        .init();

    info!("Ventguard v{} starting", ventguard::VERSION);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match args.first().map(String::as_str) {
        None | Some("-") => Config::default(),
        Some(path) => Config::from_file(path).with_context(|| format!("loading {} (usage: {})", path, USAGE))?,
    };
    let scenario: Scenario = match args.get(1) {
        Some(s) => s.parse().map_err(|e| anyhow::anyhow!("{} (usage: {})", e, USAGE))?,
        None => Scenario::Obstruction,
    };
    let cycles: u64 = match args.get(2) {
        Some(s) => s.parse().with_context(|| format!("invalid cycle count '{}'", s))?,
        None => 30,
    };
    info!("Scenario {:?} for {} cycles", scenario, cycles);

    let (input_tx, input_rx) = mpsc::channel(config.engine.input_queue);
    let (event_tx, mut event_rx) = mpsc::channel(64);
    let (actuator_tx, mut actuator_rx) = mpsc::channel::<SafetyCommand>(32);

    let watchdog = SoftwareWatchdog::new();
    let mut setpoints = config.settings.initial;
    let mut engine = Engine::new(config, Box::new(actuator_tx), Box::new(watchdog.clone()))
        .context("engine refused to arm")?;
    engine.confirm_startup(OperatorAction::new(0))?;

    let engine_task = tokio::spawn(async move {
        let result = engine.run(input_rx, event_tx).await;
        (engine, result)
    });

    tokio::spawn(async move {
        while let Some(command) = actuator_rx.recv().await {
            info!("Actuator <- {:?}", command);
        }
    });

    let simulate = async {
        let mut simulator = BreathSimulator::new(scenario, 5, 42).recover_at(cycles.saturating_sub(5));
        let mut pace = tokio::time::interval(Duration::from_millis(50));
        for _ in 0..cycles {
            pace.tick().await;
            let (measurements, ctx) = simulator.next_cycle(setpoints);
            for m in measurements {
                if input_tx.send(EngineInput::Measurement(m)).await.is_err() {
                    return;
                }
            }
            if input_tx.send(EngineInput::EndOfCycle(ctx)).await.is_err() {
                return;
            }

            match tokio::time::timeout(Duration::from_millis(500), event_rx.recv()).await {
                Ok(Some(tick)) => {
                    if !tick.report.transitions.is_empty() {
                        match serde_json::to_string(&tick.report.transitions) {
                            Ok(json) => info!("cycle {} transitions {}", tick.report.cycle, json),
                            Err(e) => warn!("Cannot render transitions: {}", e),
                        }
                    }
                    if let Some(alarm) = tick.report.annunciated {
                        info!("cycle {} annunciating {} ({:?})", tick.report.cycle, alarm.kind, alarm.priority);
                    }
                    if let Some(pip) = tick.safety.pip_override {
                        info!("Control loop adopting PIP {}", pip);
                        setpoints.pip = pip;
                    }
                }
                Ok(None) => return,
                Err(_) => warn!("No engine event for cycle {}", ctx.cycle),
            }
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received shutdown signal"),
        _ = simulate => info!("Simulation finished"),
    }

    let _ = input_tx.send(EngineInput::Shutdown).await;
    drop(input_tx);
    let (engine, result) = engine_task.await.context("engine task panicked")?;

    let stats = engine.stats();
    info!(
        "Final stats: {} ticks, {} errors, {} budget overruns, max tick {} us",
        stats.tick_count, stats.error_count, stats.budget_overruns, stats.max_tick_us
    );

    if let Err(e) = result {
        error!("Engine halted: {}", e);
        if watchdog.is_tripped() {
            error!("Watchdog tripped: {}", watchdog.trip_reason().unwrap_or_default());
        }
        std::process::exit(1);
    }
    Ok(())
}
