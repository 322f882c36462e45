// tests/engine_lifecycle.rs
//! Run loop driven over channels the way the acquisition side feeds it

use tokio::sync::{mpsc, oneshot};
use ventguard::simulation::CycleBuilder;
use ventguard::{
    AlarmKind, Config, Engine, EngineInput, OperatorAction, OperatorCommand, OperatorReply, RecordingSink,
    SafetyCommand, Setpoints, SoftwareWatchdog, VentError, Watchdog,
};

async fn send_cycle(tx: &mpsc::Sender<EngineInput>, builder: CycleBuilder) {
    for m in builder.build() {
        let _ = tx.send(EngineInput::Measurement(m)).await;
    }
    let _ = tx.send(EngineInput::EndOfCycle(builder.context(Setpoints::default()))).await;
}

async fn command(tx: &mpsc::Sender<EngineInput>, command: OperatorCommand) -> ventguard::Result<OperatorReply> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(EngineInput::Operator { command, reply: Some(reply_tx) })
        .await
        .expect("engine loop gone");
    reply_rx.await.expect("no reply")
}

#[tokio::test]
async fn test_run_loop_ticks_and_answers_commands() {
    let engine = Engine::new(Config::default(), Box::new(RecordingSink::new()), Box::new(SoftwareWatchdog::new()))
        .unwrap();
    let (tx, rx) = mpsc::channel(1024);
    let (events_tx, mut events) = mpsc::channel(16);

    let handle = tokio::spawn(async move {
        let mut engine = engine;
        let result = engine.run(rx, events_tx).await;
        (engine, result)
    });

    // Not armed yet: the cycle is refused but the loop keeps going
    send_cycle(&tx, CycleBuilder::new(0)).await;

    let reply = command(&tx, OperatorCommand::ConfirmStartup(OperatorAction::new(1))).await.unwrap();
    assert!(matches!(reply, OperatorReply::Confirmed(_)));

    send_cycle(&tx, CycleBuilder::new(1).expiratory_pressure(4.0)).await;
    let tick = events.recv().await.unwrap();
    assert_eq!(tick.report.cycle, 1);
    assert_eq!(tick.report.annunciated.map(|a| a.kind), Some(AlarmKind::Lapa));

    let reply = command(&tx, OperatorCommand::Acknowledge(AlarmKind::Lapa)).await.unwrap();
    assert!(matches!(reply, OperatorReply::Acknowledged(AlarmKind::Lapa)));

    let rejected = command(&tx, OperatorCommand::Suppress { kind: AlarmKind::Hapa, cycles: None }).await;
    assert!(rejected.unwrap_err().rejection().is_some());

    send_cycle(&tx, CycleBuilder::new(2).expiratory_pressure(4.0)).await;
    let tick = events.recv().await.unwrap();
    assert_eq!(tick.report.acknowledged, vec![AlarmKind::Lapa]);
    assert!(tick.report.annunciated.map_or(false, |a| a.acknowledged));

    tx.send(EngineInput::Shutdown).await.unwrap();
    let (engine, result) = handle.await.unwrap();
    assert!(result.is_ok());

    let stats = engine.stats();
    assert_eq!(stats.tick_count, 2);
    assert_eq!(stats.rejected_commands, 1);
    assert!(stats.armed);
    assert!(!stats.halted);
}

#[tokio::test]
async fn test_closed_actuator_channel_stops_the_loop() {
    let (actuator_tx, actuator_rx) = mpsc::channel::<SafetyCommand>(4);
    drop(actuator_rx);

    let watchdog = SoftwareWatchdog::new();
    let mut engine = Engine::new(Config::default(), Box::new(actuator_tx), Box::new(watchdog.clone())).unwrap();
    engine.confirm_startup(OperatorAction::new(1)).unwrap();

    let (tx, rx) = mpsc::channel(2048);
    let (events_tx, _events) = mpsc::channel(16);
    let handle = tokio::spawn(async move {
        let result = engine.run(rx, events_tx).await;
        (engine, result)
    });

    for cycle in 0..4 {
        send_cycle(&tx, CycleBuilder::new(cycle).inspiratory_pressure(21.0).expiratory_pressure(22.0)).await;
    }

    let (engine, result) = handle.await.unwrap();
    assert!(matches!(result, Err(VentError::DeadlineMiss { cycle: 1, .. })));
    assert!(engine.is_halted());
    assert!(engine.stats().halted);
    assert!(watchdog.is_tripped());
}

#[tokio::test]
async fn test_pip_reduction_from_control_loop() {
    let mut engine = Engine::new(Config::default(), Box::new(RecordingSink::new()), Box::new(SoftwareWatchdog::new()))
        .unwrap();
    engine.confirm_startup(OperatorAction::new(1)).unwrap();

    let (tx, rx) = mpsc::channel(1024);
    let (events_tx, mut events) = mpsc::channel(16);
    let handle = tokio::spawn(async move {
        let result = engine.run(rx, events_tx).await;
        (engine, result)
    });

    tx.send(EngineInput::PipReduced(18.0)).await.unwrap();
    send_cycle(&tx, CycleBuilder::new(0)).await;
    let tick = events.recv().await.unwrap();
    assert_eq!(tick.setpoints.pip, 18.0);

    drop(tx);
    let (engine, result) = handle.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(engine.setpoints().pip, 18.0);
}
