//! Cooling tower: condenser loop temperature control staged across cells.
//!
//! Inputs: `loop_temp`, `outdoor_temp`.
//! Outputs per cell `n` (1-based): `cell{n}_enable`, `cell{n}_speed`,
//! `cell{n}_valve`, `cell{n}_heater`.

use super::{
    Commands, DesiredOutputs, PersistedState, StrategyOutcome, capture_secs, pid::PiLoop, setting,
};
use crate::acquisition::{OUTDOOR_TEMP, Readings};

pub const PERSISTED_KEYS: &[&str] = &[INTEGRAL, STAGES, STAGE_CHANGED_AT];

const INTEGRAL: &str = "tower_integral";
const STAGES: &str = "stages";
const STAGE_CHANGED_AT: &str = "stage_changed_at";
const MAX_CELLS: f64 = 8.0;

pub fn run(readings: &Readings, commands: &Commands, state: &PersistedState) -> StrategyOutcome {
    let mut next = state.clone();

    let cells = setting(commands, "cells", 2.0).round().clamp(1.0, MAX_CELLS) as usize;
    let setpoint = setting(commands, "loop_setpoint", 85.0);
    let min_speed = setting(commands, "min_speed", 25.0).clamp(0.0, 100.0);
    let interval = setting(commands, "stage_interval_secs", 300.0);
    let freeze_setpoint = setting(commands, "freeze_setpoint_f", 40.0);

    let tower_loop = PiLoop::new(
        setting(commands, "tower_kp", 4.0),
        setting(commands, "tower_ki", 0.4),
    );
    let demand = match readings.get("loop_temp") {
        Some(temp) => tower_loop.run(temp - setpoint, INTEGRAL, &mut next),
        None => {
            PiLoop::reset(INTEGRAL, &mut next);
            0.0
        }
    };

    let now = capture_secs(readings);
    let staged = state.get(STAGES).copied().unwrap_or(0.0).round().max(0.0);
    let current = (staged as usize).min(cells);
    let target = (demand / 100.0 * cells as f64).ceil() as usize;
    let changed_at = state.get(STAGE_CHANGED_AT).copied().unwrap_or(f64::MIN);
    let stages = if target != current && now - changed_at >= interval {
        next.insert(STAGE_CHANGED_AT.to_string(), now);
        if target > current { current + 1 } else { current - 1 }
    } else {
        current
    };
    next.insert(STAGES.to_string(), stages as f64);

    let speed = if stages == 0 {
        0.0
    } else {
        (demand * cells as f64 / stages as f64).clamp(min_speed, 100.0)
    };
    let freezing = readings
        .get(OUTDOOR_TEMP)
        .is_some_and(|t| t < freeze_setpoint);

    let mut outputs = DesiredOutputs::new();
    for cell in 1..=cells {
        let running = cell <= stages;
        outputs.insert(format!("cell{cell}_enable"), running.into());
        outputs.insert(
            format!("cell{cell}_speed"),
            (if running { speed } else { 0.0 }).into(),
        );
        outputs.insert(format!("cell{cell}_valve"), running.into());
        outputs.insert(format!("cell{cell}_heater"), (!running && freezing).into());
    }

    StrategyOutcome {
        outputs,
        state: next,
    }
}
