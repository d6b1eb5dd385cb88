//! Fan coil unit: occupancy fan, chilled water valve and outdoor air damper.
//!
//! Inputs: `space_temp`. Outputs: `fan_enable`, `cooling_valve`, `oa_damper`.

use super::{
    Commands, DesiredOutputs, PersistedState, StrategyOutcome, is_occupied, pid::PiLoop, setting,
};
use crate::acquisition::Readings;

pub const PERSISTED_KEYS: &[&str] = &[INTEGRAL];

const INTEGRAL: &str = "cooling_integral";

pub fn run(readings: &Readings, commands: &Commands, state: &PersistedState) -> StrategyOutcome {
    let mut next = state.clone();
    let occupied = is_occupied(commands);

    let cooling_loop = PiLoop::new(
        setting(commands, "fcu_kp", 8.0),
        setting(commands, "fcu_ki", 0.5),
    );
    let valve = match readings.get("space_temp") {
        Some(temp) if occupied => {
            let setpoint = setting(commands, "space_setpoint", 72.0);
            cooling_loop.run(temp - setpoint, INTEGRAL, &mut next)
        }
        _ => {
            PiLoop::reset(INTEGRAL, &mut next);
            0.0
        }
    };
    let damper = if occupied {
        setting(commands, "min_oa_damper", 20.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    let mut outputs = DesiredOutputs::new();
    outputs.insert("fan_enable".into(), occupied.into());
    outputs.insert("cooling_valve".into(), valve.into());
    outputs.insert("oa_damper".into(), damper.into());

    StrategyOutcome {
        outputs,
        state: next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(temp: f64) -> Readings {
        let mut readings = Readings::default();
        readings.insert("space_temp", temp);
        readings
    }

    #[test]
    fn warm_space_opens_valve_and_accumulates() {
        let first = run(&space(76.0), &Commands::new(), &PersistedState::new());
        assert!(first.outputs["fan_enable"].as_bool());
        assert_eq!(first.outputs["cooling_valve"].as_percent(), 34.0);
        assert_eq!(first.outputs["oa_damper"].as_percent(), 20.0);

        let second = run(&space(76.0), &Commands::new(), &first.state);
        assert_eq!(second.outputs["cooling_valve"].as_percent(), 36.0);
    }

    #[test]
    fn unoccupied_closes_everything_and_resets_integrator() {
        let mut state = PersistedState::new();
        state.insert(INTEGRAL.into(), 40.0);
        let commands = Commands::from([("occupied".to_string(), 0.0)]);
        let outcome = run(&space(80.0), &commands, &state);
        assert!(!outcome.outputs["fan_enable"].as_bool());
        assert_eq!(outcome.outputs["cooling_valve"].as_percent(), 0.0);
        assert_eq!(outcome.outputs["oa_damper"].as_percent(), 0.0);
        assert_eq!(outcome.state[INTEGRAL], 0.0);
    }
}
