// tests/operator_commands.rs
//! Operator commands routed through the engine: startup gate, two-step
//! PIP confirmation and alarm acknowledgement/suppression

use ventguard::simulation::CycleBuilder;
use ventguard::{
    AlarmKind, Config, Engine, OperatorAction, OperatorCommand, OperatorReply, RecordingSink, RejectReason,
    SetpointRequest, SoftwareWatchdog, VentError,
};

fn engine() -> Engine {
    Engine::new(Config::default(), Box::new(RecordingSink::new()), Box::new(SoftwareWatchdog::new())).unwrap()
}

fn change_pip(pip: f64, action: u64) -> OperatorCommand {
    OperatorCommand::ChangeSetpoints { request: SetpointRequest::pip(pip), action: OperatorAction::new(action) }
}

#[test]
fn test_ticks_refused_until_startup_confirmed() {
    let mut engine = engine();
    assert!(!engine.is_armed());

    let breath = CycleBuilder::new(0);
    let err = engine.tick(breath.context(engine.setpoints())).unwrap_err();
    assert!(matches!(err, VentError::NotArmed(_)));
    assert!(!err.is_fatal());

    let err = engine.handle_operator(change_pip(25.0, 1)).unwrap_err();
    assert_eq!(err.rejection(), Some(&RejectReason::StartupUnconfirmed));

    let reply = engine.handle_operator(OperatorCommand::ConfirmStartup(OperatorAction::new(2))).unwrap();
    assert!(matches!(reply, OperatorReply::Confirmed(s) if s.pip == 20.0));
    assert!(engine.is_armed());
    assert!(engine.tick(CycleBuilder::new(1).context(engine.setpoints())).is_ok());
}

#[test]
fn test_high_pip_needs_two_distinct_confirmations() {
    let mut engine = engine();
    engine.confirm_startup(OperatorAction::new(1)).unwrap();

    let err = engine.handle_operator(change_pip(65.0, 7)).unwrap_err();
    assert!(matches!(err.rejection(), Some(RejectReason::ConfirmationRequired { .. })));
    assert_eq!(engine.setpoints().pip, 20.0);

    let err = engine.handle_operator(change_pip(65.0, 7)).unwrap_err();
    assert_eq!(err.rejection(), Some(&RejectReason::RepeatedAction(7)));
    assert_eq!(engine.setpoints().pip, 20.0);

    let reply = engine.handle_operator(change_pip(65.0, 8)).unwrap();
    assert!(matches!(reply, OperatorReply::SetpointsApplied(s) if s.pip == 65.0));
    assert_eq!(engine.setpoints().pip, 65.0);
    assert_eq!(engine.stats().rejected_commands, 2);
}

#[test]
fn test_change_below_limit_applies_at_once() {
    let mut engine = engine();
    engine.confirm_startup(OperatorAction::new(1)).unwrap();

    let reply = engine.handle_operator(change_pip(45.0, 2)).unwrap();
    assert!(matches!(reply, OperatorReply::SetpointsApplied(s) if s.pip == 45.0));

    let err = engine.handle_operator(change_pip(120.0, 3)).unwrap_err();
    assert!(matches!(err.rejection(), Some(RejectReason::OutOfRange(_))));
}

#[test]
fn test_acknowledge_and_suppress_apply_next_cycle() {
    let mut engine = engine();
    engine.confirm_startup(OperatorAction::new(1)).unwrap();

    let err = engine.handle_operator(OperatorCommand::Acknowledge(AlarmKind::Lapa)).unwrap_err();
    assert_eq!(err.rejection(), Some(&RejectReason::NotActive(AlarmKind::Lapa)));

    let breath = CycleBuilder::new(0).expiratory_pressure(4.0);
    for m in breath.build() {
        engine.ingest(m);
    }
    engine.tick(breath.context(engine.setpoints())).unwrap();

    let reply = engine.handle_operator(OperatorCommand::Acknowledge(AlarmKind::Lapa)).unwrap();
    assert!(matches!(reply, OperatorReply::Acknowledged(AlarmKind::Lapa)));
    assert!(!engine.manager().instance(AlarmKind::Lapa).is_acknowledged());

    let reply = engine
        .handle_operator(OperatorCommand::Suppress { kind: AlarmKind::Lapa, cycles: Some(10_000) })
        .unwrap();
    assert!(matches!(reply, OperatorReply::Suppressed { cycles: 300, .. }));

    let breath = CycleBuilder::new(1).expiratory_pressure(4.0);
    for m in breath.build() {
        engine.ingest(m);
    }
    let tick = engine.tick(breath.context(engine.setpoints())).unwrap();
    assert_eq!(tick.report.acknowledged, vec![AlarmKind::Lapa]);
    assert!(engine.manager().instance(AlarmKind::Lapa).is_acknowledged());
}
