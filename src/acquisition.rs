//! Input acquisition: reads configured channels, converts them to engineering
//! units and merges the outdoor temperature.
//!
//! A channel that fails to read keeps its last-known-good value, flagged as
//! stale. Safety logic must use [`Readings::fresh`] so a stale proof is never
//! mistaken for a live one.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    board::{Boards, ReadKind},
    config::{InputCfg, SignalCfg},
    conversion::{self, VoltageRange},
    error::AcquisitionError,
    weather::Weather,
};

/// Reserved reading name of the outdoor air temperature.
pub const OUTDOOR_TEMP: &str = "outdoor_temp";

/// One cycle's set of engineering values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Readings {
    pub values: BTreeMap<String, f64>,
    /// Names carried over from an earlier cycle because the read failed.
    #[serde(default)]
    pub stale: BTreeSet<String>,
    pub captured_at: DateTime<Utc>,
}

impl Readings {
    pub fn new(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            ..Self::default()
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        self.stale.remove(&name);
        self.values.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Value only if it was read this cycle.
    pub fn fresh(&self, name: &str) -> Option<f64> {
        if self.stale.contains(name) {
            None
        } else {
            self.get(name)
        }
    }

    pub fn is_stale(&self, name: &str) -> bool {
        self.stale.contains(name)
    }
}

/// Board quantity an input signal is read as.
pub fn read_kind(signal: &SignalCfg) -> ReadKind {
    match signal {
        SignalCfg::Rtd1k { .. } => ReadKind::Resistance,
        SignalCfg::Digital => ReadKind::Digital,
        SignalCfg::Thermistor10k { .. }
        | SignalCfg::Voltage { .. }
        | SignalCfg::ValveFeedback { .. }
        | SignalCfg::Current { .. } => ReadKind::Voltage,
    }
}

/// Converts a raw board value; `None` marks an open or shorted sensor.
pub fn convert(signal: &SignalCfg, raw: f64) -> Option<f64> {
    match signal {
        SignalCfg::Thermistor10k { offset } => conversion::thermistor_fahrenheit(raw, *offset),
        SignalCfg::Rtd1k { offset } => conversion::rtd_fahrenheit(raw, *offset),
        SignalCfg::Voltage { min, max } => Some(conversion::scale_voltage(
            raw,
            VoltageRange::ZeroToTen,
            *min,
            *max,
        )),
        SignalCfg::ValveFeedback { min, max } => Some(conversion::scale_voltage(
            raw,
            VoltageRange::TwoToTen,
            *min,
            *max,
        )),
        SignalCfg::Current {
            max_amps,
            noise_floor,
        } => Some(conversion::current_amps(raw, *max_amps, *noise_floor)),
        SignalCfg::Digital => Some(if raw >= 0.5 { 1.0 } else { 0.0 }),
    }
}

/// Per-equipment acquisition state. Owned by one worker.
#[derive(Debug)]
pub struct InputAcquisition {
    boards: Boards,
    weather: Arc<Weather>,
    last_good: Readings,
}

impl InputAcquisition {
    pub fn new(boards: Boards, weather: Arc<Weather>) -> Self {
        Self {
            boards,
            weather,
            last_good: Readings::default(),
        }
    }

    /// Reads every enabled input.
    pub async fn acquire(&mut self, inputs: &[InputCfg]) -> Readings {
        let mut readings = Readings::new(Utc::now());

        for input in inputs.iter().filter(|i| i.enabled) {
            match self.read_input(input).await {
                Ok(value) => readings.insert(input.name.clone(), value),
                Err(e) => {
                    warn!("{e}");
                    if let Some(previous) = self.last_good.get(&input.name) {
                        readings.values.insert(input.name.clone(), previous);
                        readings.stale.insert(input.name.clone());
                    }
                }
            }
        }

        readings.insert(OUTDOOR_TEMP, self.weather.current().await);

        self.last_good = readings.clone();
        readings
    }

    async fn read_input(&self, input: &InputCfg) -> Result<f64, AcquisitionError> {
        let board = self
            .boards
            .get(&input.board)
            .ok_or_else(|| AcquisitionError::UnknownBoard {
                input: input.name.clone(),
                board: input.board.clone(),
            })?;

        let raw = board
            .read(input.channel, read_kind(&input.signal))
            .await
            .map_err(|source| AcquisitionError::Read {
                input: input.name.clone(),
                board: input.board.clone(),
                channel: input.channel,
                source,
            })?;

        convert(&input.signal, raw).ok_or_else(|| AcquisitionError::OutOfRange {
            input: input.name.clone(),
            raw,
        })
    }
}
