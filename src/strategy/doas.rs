//! Dedicated outdoor air system: supply fan, modulating gas heat and two
//! chiller stages.
//!
//! Inputs: `supply_temp`, `outdoor_temp`.
//! Outputs: `fan_enable`, `fan_speed`, `heat_enable`, `gas_valve`,
//! `chiller_stage1`, `chiller_stage2`.

use super::{
    Commands, DesiredOutputs, PersistedState, StrategyOutcome, capture_secs, is_occupied,
    pid::PiLoop, setting,
};
use crate::acquisition::{OUTDOOR_TEMP, Readings};

pub const PERSISTED_KEYS: &[&str] = &[
    HEAT_INTEGRAL,
    STAGE1.on,
    STAGE1.changed_at,
    STAGE2.on,
    STAGE2.changed_at,
];

const HEAT_INTEGRAL: &str = "heat_integral";

struct Stage {
    on: &'static str,
    changed_at: &'static str,
}

const STAGE1: Stage = Stage {
    on: "stage1_on",
    changed_at: "stage1_changed_at",
};

const STAGE2: Stage = Stage {
    on: "stage2_on",
    changed_at: "stage2_changed_at",
};

impl Stage {
    /// Applies minimum on/off time; `force_off` bypasses it.
    fn update(
        &self,
        state: &mut PersistedState,
        want: bool,
        force_off: bool,
        now: f64,
        min_secs: f64,
    ) -> bool {
        let on = state.get(self.on).is_some_and(|v| *v >= 0.5);
        let changed_at = state.get(self.changed_at).copied().unwrap_or(f64::MIN);

        let next = if force_off {
            false
        } else if want != on && now - changed_at >= min_secs {
            want
        } else {
            on
        };

        if next != on {
            state.insert(self.changed_at.to_string(), now);
        }
        state.insert(self.on.to_string(), if next { 1.0 } else { 0.0 });
        next
    }
}

pub fn run(readings: &Readings, commands: &Commands, state: &PersistedState) -> StrategyOutcome {
    let mut next = state.clone();

    let supply = readings.get("supply_temp");
    let outdoor = readings.get(OUTDOOR_TEMP);
    let setpoint = setting(commands, "supply_setpoint", 68.0);

    let fan_on = is_occupied(commands);
    let fan_speed = if fan_on {
        setting(commands, "fan_speed", 75.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    let heat_lockout_f = setting(commands, "heat_lockout_f", 65.0);
    let heat_allowed = fan_on && outdoor.is_some_and(|t| t < heat_lockout_f);
    let heat_loop = PiLoop::new(
        setting(commands, "heat_kp", 5.0),
        setting(commands, "heat_ki", 0.5),
    );
    let demand = match supply {
        Some(temp) if heat_allowed => heat_loop.run(setpoint - temp, HEAT_INTEGRAL, &mut next),
        _ => {
            PiLoop::reset(HEAT_INTEGRAL, &mut next);
            0.0
        }
    };
    let heat_on = demand > 0.0;
    let gas_valve = if fan_on && heat_on { demand } else { 0.0 };

    let now = capture_secs(readings);
    let min_secs = setting(commands, "stage_min_secs", 300.0);
    let cooling_error = supply.map(|temp| temp - setpoint);
    let lockout_f = setting(commands, "cooling_lockout_f", 55.0);
    let cooling_allowed = fan_on && !heat_on && outdoor.is_some_and(|t| t > lockout_f);
    let force_off = !fan_on || heat_on;

    let want1 = cooling_allowed && cooling_error.is_some_and(|e| e > 1.0);
    let stage1 = STAGE1.update(&mut next, want1, force_off, now, min_secs);
    let want2 = want1 && stage1 && cooling_error.is_some_and(|e| e > 3.0);
    let stage2 = STAGE2.update(&mut next, want2, force_off || !stage1, now, min_secs);

    let mut outputs = DesiredOutputs::new();
    outputs.insert("fan_enable".into(), fan_on.into());
    outputs.insert("fan_speed".into(), fan_speed.into());
    outputs.insert("heat_enable".into(), heat_on.into());
    outputs.insert("gas_valve".into(), gas_valve.into());
    outputs.insert("chiller_stage1".into(), stage1.into());
    outputs.insert("chiller_stage2".into(), stage2.into());

    StrategyOutcome {
        outputs,
        state: next,
    }
}
