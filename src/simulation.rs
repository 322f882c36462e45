// src/simulation.rs
// Synthetic breath generator used by the demo binary, the benches and the tests

use crate::measurement::{CycleContext, Measurement, Phase, Setpoints, SignalKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const SAMPLE_PERIOD_MS: u64 = 10;
pub const INSPIRATION_MS: u64 = 1000;
pub const EXPIRATION_MS: u64 = 2000;
pub const CYCLE_MS: u64 = INSPIRATION_MS + EXPIRATION_MS;

/// Builds the measurements of one breath cycle.
///
/// Pressure and flow are sampled every 10 ms across the whole cycle; VTE and
/// SpO2 are reported once, at the end of expiration.
#[derive(Debug, Clone)]
pub struct CycleBuilder {
    cycle: u64,
    inspiratory_pressure: f64,
    expiratory_pressure: f64,
    flat_pressure: Option<f64>,
    tidal_volume: f64,
    spo2: f64,
    jitter: f64,
    invalid: Vec<SignalKind>,
    omit: Vec<SignalKind>,
    spike: Option<f64>,
}

impl CycleBuilder {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            inspiratory_pressure: 20.0,
            expiratory_pressure: 6.0,
            flat_pressure: None,
            tidal_volume: 450.0,
            spo2: 96.0,
            jitter: 0.1,
            invalid: Vec::new(),
            omit: Vec::new(),
            spike: None,
        }
    }

    pub fn inspiratory_pressure(mut self, value: f64) -> Self {
        self.inspiratory_pressure = value;
        self
    }

    pub fn expiratory_pressure(mut self, value: f64) -> Self {
        self.expiratory_pressure = value;
        self
    }

    /// Every pressure sample carries exactly `value`, as a stuck transducer would
    pub fn flat_pressure(mut self, value: f64) -> Self {
        self.flat_pressure = Some(value);
        self
    }

    pub fn tidal_volume(mut self, value: f64) -> Self {
        self.tidal_volume = value;
        self
    }

    pub fn spo2(mut self, value: f64) -> Self {
        self.spo2 = value;
        self
    }

    /// Alternating +/- offset on every pressure and flow sample
    pub fn jitter(mut self, value: f64) -> Self {
        self.jitter = value;
        self
    }

    /// Report every sample of `kind` flagged invalid
    pub fn invalid(mut self, kind: SignalKind) -> Self {
        self.invalid.push(kind);
        self
    }

    /// Report nothing for `kind`
    pub fn omit(mut self, kind: SignalKind) -> Self {
        self.omit.push(kind);
        self
    }

    /// Replace one mid-inspiration pressure sample with `value`
    pub fn spike(mut self, value: f64) -> Self {
        self.spike = Some(value);
        self
    }

    pub fn context(&self, setpoints: Setpoints) -> CycleContext {
        CycleContext::new(self.cycle, setpoints)
    }

    pub fn build(&self) -> Vec<Measurement> {
        let start = self.cycle * CYCLE_MS;
        let mut out = Vec::with_capacity((2 * CYCLE_MS / SAMPLE_PERIOD_MS + 2) as usize);

        for (i, offset) in (0..CYCLE_MS).step_by(SAMPLE_PERIOD_MS as usize).enumerate() {
            let phase = if offset < INSPIRATION_MS { Phase::Inspiratory } else { Phase::Expiratory };
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            let t = start + offset;

            let mut pressure = match (self.flat_pressure, phase) {
                (Some(v), _) => v,
                (None, Phase::Inspiratory) => self.inspiratory_pressure + sign * self.jitter,
                (None, Phase::Expiratory) => self.expiratory_pressure + sign * self.jitter,
            };
            if offset == INSPIRATION_MS / 2 {
                if let Some(v) = self.spike {
                    pressure = v;
                }
            }
            let flow = match phase {
                Phase::Inspiratory => 30.0,
                Phase::Expiratory => -20.0,
            } + sign * self.jitter.max(0.1);

            self.emit(&mut out, SignalKind::AirwayPressure, pressure, t, phase);
            self.emit(&mut out, SignalKind::Flow, flow, t, phase);
        }

        let end = start + CYCLE_MS - SAMPLE_PERIOD_MS;
        self.emit(&mut out, SignalKind::TidalVolumeExpired, self.tidal_volume, end, Phase::Expiratory);
        self.emit(&mut out, SignalKind::SpO2, self.spo2, end, Phase::Expiratory);
        out
    }

    fn emit(&self, out: &mut Vec<Measurement>, kind: SignalKind, value: f64, t: u64, phase: Phase) {
        if self.omit.contains(&kind) {
            return;
        }
        let m = if self.invalid.contains(&kind) {
            Measurement::invalid(kind, t, self.cycle, phase)
        } else {
            Measurement::new(kind, value, t, self.cycle, phase)
        };
        out.push(m);
    }
}

/// Patient/circuit events the demo simulator can play back
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Normal,
    /// Circuit comes apart: pressure and VTE collapse
    Disconnection,
    /// Expiratory limb blocked: pressure stays above PIP
    Obstruction,
    /// Patient coughs against the breath: peak pressure jumps
    HighPressure,
    Desaturation,
    /// Pressure transducer freezes on one value
    StuckSensor,
}

impl std::str::FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Scenario::Normal),
            "disconnection" => Ok(Scenario::Disconnection),
            "obstruction" => Ok(Scenario::Obstruction),
            "high_pressure" => Ok(Scenario::HighPressure),
            "desaturation" => Ok(Scenario::Desaturation),
            "stuck_sensor" => Ok(Scenario::StuckSensor),
            other => Err(format!("unknown scenario '{}'", other)),
        }
    }
}

/// Plays a scenario back breath by breath, with seeded noise
pub struct BreathSimulator {
    scenario: Scenario,
    onset_cycle: u64,
    recover_cycle: Option<u64>,
    cycle: u64,
    rng: StdRng,
}

impl BreathSimulator {
    pub fn new(scenario: Scenario, onset_cycle: u64, seed: u64) -> Self {
        Self {
            scenario,
            onset_cycle,
            recover_cycle: None,
            cycle: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Return to normal breathing from `cycle` on
    pub fn recover_at(mut self, cycle: u64) -> Self {
        self.recover_cycle = Some(cycle);
        self
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Measurements and closing context for the next breath
    pub fn next_cycle(&mut self, setpoints: Setpoints) -> (Vec<Measurement>, CycleContext) {
        let cycle = self.cycle;
        self.cycle += 1;

        let in_event = cycle >= self.onset_cycle && self.recover_cycle.map_or(true, |r| cycle < r);
        let vte_noise = self.rng.gen_range(-15.0..15.0);
        let spo2_noise = self.rng.gen_range(-0.5..0.5);
        let mut builder = CycleBuilder::new(cycle)
            .inspiratory_pressure(setpoints.pip)
            .expiratory_pressure(setpoints.peep + 1.0)
            .tidal_volume(450.0 + vte_noise)
            .spo2(96.0 + spo2_noise)
            .jitter(self.rng.gen_range(0.05..0.2));

        if in_event {
            builder = match self.scenario {
                Scenario::Normal => builder,
                Scenario::Disconnection => builder
                    .inspiratory_pressure(2.0)
                    .expiratory_pressure(0.5)
                    .tidal_volume(40.0 + vte_noise.abs()),
                Scenario::Obstruction => builder
                    .inspiratory_pressure(setpoints.pip + 8.0)
                    .expiratory_pressure(setpoints.pip + 4.0)
                    .tidal_volume(180.0 + vte_noise),
                Scenario::HighPressure => builder.spike(setpoints.pip * 1.5),
                Scenario::Desaturation => builder.spo2(84.0 + spo2_noise),
                Scenario::StuckSensor => builder.flat_pressure(setpoints.pip),
            };
        }

        (builder.build(), builder.context(setpoints))
    }
}
