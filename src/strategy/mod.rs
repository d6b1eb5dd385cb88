//! Control strategy registry.
//!
//! Each equipment kind has one pure control function mapping
//! `(readings, commands, persisted state)` to desired outputs and the next
//! persisted state. The set of kinds is closed; the engine resolves a kind to
//! its [`Strategy`] once per configuration load and never inspects which kind
//! it is running.

pub mod cooling_tower;
pub mod doas;
pub mod fan_coil;
pub mod pid;

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::acquisition::Readings;

/// External commands: configured settings plus scheduler-derived values.
pub type Commands = BTreeMap<String, f64>;

/// Control-loop memory scoped to one equipment instance.
pub type PersistedState = BTreeMap<String, f64>;

/// Desired value per output name.
pub type DesiredOutputs = BTreeMap<String, OutputValue>;

/// Command key set by the scheduler from the occupancy schedule.
pub const OCCUPIED: &str = "occupied";

/// Target value for one output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    Bool(bool),
    /// 0–100 %.
    Percent(f64),
}

impl OutputValue {
    pub fn as_bool(self) -> bool {
        match self {
            OutputValue::Bool(on) => on,
            OutputValue::Percent(pct) => pct > 0.0,
        }
    }

    pub fn as_percent(self) -> f64 {
        match self {
            OutputValue::Bool(true) => 100.0,
            OutputValue::Bool(false) => 0.0,
            OutputValue::Percent(pct) => pct.clamp(0.0, 100.0),
        }
    }
}

impl From<bool> for OutputValue {
    fn from(on: bool) -> Self {
        OutputValue::Bool(on)
    }
}

impl From<f64> for OutputValue {
    fn from(pct: f64) -> Self {
        OutputValue::Percent(pct)
    }
}

/// Result of one strategy invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyOutcome {
    pub outputs: DesiredOutputs,
    pub state: PersistedState,
}

pub type StrategyFn = fn(&Readings, &Commands, &PersistedState) -> StrategyOutcome;

/// Supported equipment kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Doas,
    CoolingTower,
    FanCoil,
}

impl StrategyKind {
    pub fn resolve(self) -> Strategy {
        match self {
            StrategyKind::Doas => Strategy {
                kind: self,
                run: doas::run,
                persisted_keys: doas::PERSISTED_KEYS,
            },
            StrategyKind::CoolingTower => Strategy {
                kind: self,
                run: cooling_tower::run,
                persisted_keys: cooling_tower::PERSISTED_KEYS,
            },
            StrategyKind::FanCoil => Strategy {
                kind: self,
                run: fan_coil::run,
                persisted_keys: fan_coil::PERSISTED_KEYS,
            },
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrategyKind::Doas => "doas",
            StrategyKind::CoolingTower => "cooling_tower",
            StrategyKind::FanCoil => "fan_coil",
        })
    }
}

/// A resolved control function and the state keys it owns.
#[derive(Clone, Copy)]
pub struct Strategy {
    pub kind: StrategyKind,
    run: StrategyFn,
    persisted_keys: &'static [&'static str],
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Strategy")
            .field("kind", &self.kind)
            .field("persisted_keys", &self.persisted_keys)
            .finish()
    }
}

impl Strategy {
    /// Runs the control function. The returned state holds only the
    /// designated keys.
    pub fn compute(
        &self,
        readings: &Readings,
        commands: &Commands,
        state: &PersistedState,
    ) -> StrategyOutcome {
        let mut outcome = (self.run)(readings, commands, state);
        outcome
            .state
            .retain(|key, _| self.persisted_keys.contains(&key.as_str()));
        outcome
    }

    pub fn persisted_keys(&self) -> &'static [&'static str] {
        self.persisted_keys
    }
}

/// Setting lookup with a default.
pub(crate) fn setting(commands: &Commands, key: &str, default: f64) -> f64 {
    commands.get(key).copied().unwrap_or(default)
}

pub(crate) fn is_occupied(commands: &Commands) -> bool {
    setting(commands, OCCUPIED, 1.0) >= 0.5
}

/// Seconds since the epoch of the reading capture, used for stage timers.
pub(crate) fn capture_secs(readings: &Readings) -> f64 {
    readings.captured_at.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_resolve_to_their_own_function() {
        for kind in [StrategyKind::Doas, StrategyKind::CoolingTower, StrategyKind::FanCoil] {
            let strategy = kind.resolve();
            assert_eq!(strategy.kind, kind);
            assert!(!strategy.persisted_keys().is_empty());
        }
    }

    #[test]
    fn undesignated_state_keys_are_dropped() {
        let strategy = StrategyKind::FanCoil.resolve();
        let mut state = PersistedState::new();
        state.insert("scratch".into(), 1.0);
        let outcome = strategy.compute(&Readings::default(), &Commands::new(), &state);
        assert!(!outcome.state.contains_key("scratch"));
    }

    #[test]
    fn output_value_serializes_untagged() {
        let mut outputs = DesiredOutputs::new();
        outputs.insert("fan_enable".into(), true.into());
        outputs.insert("fan_speed".into(), 75.0.into());
        let json = serde_json::to_string(&outputs).unwrap();
        assert_eq!(json, r#"{"fan_enable":true,"fan_speed":75.0}"#);
        let back: DesiredOutputs = serde_json::from_str(&json).unwrap();
        assert_eq!(back, outputs);
    }

    #[test]
    fn kind_names_match_config_spelling() {
        let kind: StrategyKind = serde_yaml::from_str("cooling_tower").unwrap();
        assert_eq!(kind, StrategyKind::CoolingTower);
        assert_eq!(kind.to_string(), "cooling_tower");
    }
}
