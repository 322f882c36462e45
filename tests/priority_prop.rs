use proptest::prelude::*;
use ventguard::alarm_manager::arbitrate;
use ventguard::alarms::{AlarmInstance, AlarmRegistry};
use ventguard::simulation::CycleBuilder;
use ventguard::{AlarmKind, AlarmManager, AlarmPriority, AlarmState, Config, Setpoints, Verdict};

fn verdict() -> impl Strategy<Value = Verdict> {
    prop_oneof![
        Just(Verdict::Clear),
        Just(Verdict::Insufficient),
        Just(Verdict::Trigger(AlarmPriority::Low)),
        Just(Verdict::Trigger(AlarmPriority::Medium)),
        Just(Verdict::Trigger(AlarmPriority::High)),
    ]
}

fn kind() -> impl Strategy<Value = AlarmKind> {
    prop::sample::select(AlarmKind::ALL.to_vec())
}

proptest! {
    #[test]
    fn test_priority_never_drops_while_raised(
        kind in kind(),
        steps in prop::collection::vec((verdict(), prop::option::of(1u32..20)), 1..80)
    ) {
        let registry = AlarmRegistry::from_config(&Config::default()).unwrap();
        let definition = *registry.get(kind);
        let mut instance = AlarmInstance::new(definition);

        for (cycle, (verdict, suppress)) in steps.into_iter().enumerate() {
            let cycle = cycle as u64;
            if let Some(cycles) = suppress {
                let result = instance.suppress(cycle, cycles);
                if !definition.suppressible {
                    prop_assert!(result.is_err());
                }
            }

            let (before_state, before_priority) = (instance.state(), instance.priority());
            let transitions = instance.step(verdict, cycle);
            let (state, priority) = (instance.state(), instance.priority());

            prop_assert!(priority <= definition.max_priority());
            prop_assert!(priority >= definition.priority);
            if before_state.is_raised() && state.is_raised() {
                prop_assert!(priority >= before_priority);
            }
            if !definition.suppressible {
                prop_assert_ne!(state, AlarmState::Suppressed);
            }
            if verdict == Verdict::Insufficient {
                prop_assert!(transitions.is_empty());
                prop_assert_eq!(state, before_state);
            }
            for t in &transitions {
                prop_assert_eq!(t.cycle, cycle);
                prop_assert_ne!(t.from, t.to);
            }
        }
    }

    #[test]
    fn test_annunciated_alarm_has_top_priority(
        script in prop::collection::vec(prop::collection::vec(verdict(), 9), 1..30)
    ) {
        let registry = AlarmRegistry::from_config(&Config::default()).unwrap();
        let mut instances: Vec<AlarmInstance> = registry.iter().map(|d| AlarmInstance::new(*d)).collect();

        for (cycle, verdicts) in script.into_iter().enumerate() {
            for (instance, verdict) in instances.iter_mut().zip(verdicts) {
                instance.step(verdict, cycle as u64);
            }

            let top = instances
                .iter()
                .filter(|i| i.state().is_annunciable())
                .map(|i| i.priority())
                .max();
            let chosen = arbitrate(&instances);
            prop_assert_eq!(chosen.map(|a| a.priority), top);

            if let Some(a) = chosen {
                for other in instances.iter().filter(|i| i.state().is_annunciable() && i.priority() == a.priority) {
                    prop_assert!(other.first_triggered().unwrap_or(u64::MAX) >= a.first_triggered);
                }
            }
        }
    }

    #[test]
    fn test_hapa_fires_exactly_at_threshold(pip in 10.0f64..50.0, factor in 0.8f64..1.5) {
        let mut manager = AlarmManager::new(&Config::default()).unwrap();
        let peak = pip * factor;
        let breath = CycleBuilder::new(0).inspiratory_pressure(peak).jitter(0.0);
        let ctx = breath.context(Setpoints { pip, ..Setpoints::default() });
        manager.tick(&breath.build(), &ctx).unwrap();

        let raised = manager.instance(AlarmKind::Hapa).state() == AlarmState::Active;
        prop_assert_eq!(raised, peak >= pip * 1.15);
    }
}
