//! Output sequencer: reconciles desired outputs with the last written state
//! through ordered, interlocked hardware writes.
//!
//! Per cycle, in order:
//! 1. every cell that must stop is shut down (enable off, speed zero, drain,
//!    valve closed);
//! 2. DOAS groups are reconciled under the gas interlock;
//! 3. running cells get speed-only changes beyond the deadband;
//! 4. every cell that must start is brought up (valve open, settle, speed,
//!    stabilize, enable);
//! 5. ungrouped outputs are written where they changed.
//!
//! A write failure aborts the rest of that group's sequence for this cycle.
//! The channel keeps its previous recorded value, so the next cycle retries.
//! Channels in manual mode take their held value in place of the desired
//! one; group interlocks still apply to them.

mod cell;
mod doas;

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use log::{error, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    acquisition::Readings,
    board::{Boards, OutputCommand},
    config::{EquipmentCfg, GroupCfg, OutputCfg, OutputKind, SequencingCfg},
    conversion::percent_to_volts,
    error::{ConfigError, WriteError},
    strategy::{DesiredOutputs, OutputValue},
};

use cell::CellAction;

/// Tolerance for treating two analog values as equal.
const ANALOG_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    Auto,
    Manual,
}

/// Life cycle of an interlocked output group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPhase {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Externally visible state of one output channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputState {
    /// Last value successfully written; `None` until the first write.
    pub value: Option<OutputValue>,
    pub mode: OutputMode,
}

#[derive(Debug, Clone, Copy)]
struct Written {
    value: OutputValue,
    at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedWrite {
    pub output: String,
    pub value: OutputValue,
}

/// Writes issued during one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceReport {
    pub writes: Vec<AppliedWrite>,
    pub errors: Vec<WriteError>,
}

#[derive(Debug)]
pub struct OutputSequencer {
    equipment_id: String,
    boards: Boards,
    outputs: BTreeMap<String, OutputCfg>,
    groups: Vec<GroupCfg>,
    timing: SequencingCfg,
    written: BTreeMap<String, Written>,
    manual: BTreeMap<String, OutputValue>,
    phases: BTreeMap<String, GroupPhase>,
}

impl OutputSequencer {
    pub fn new(boards: Boards, equipment: &EquipmentCfg) -> Self {
        Self {
            equipment_id: equipment.id.clone(),
            boards,
            outputs: equipment.outputs.clone(),
            groups: equipment.groups.clone(),
            timing: equipment.sequencing.clone(),
            written: BTreeMap::new(),
            manual: BTreeMap::new(),
            phases: BTreeMap::new(),
        }
    }

    /// Applies hot-reloaded timing.
    pub fn set_timing(&mut self, timing: SequencingCfg) {
        self.timing = timing;
    }

    /// Restores overrides persisted by a previous run.
    pub fn load_overrides(&mut self, overrides: impl IntoIterator<Item = (String, OutputValue)>) {
        for (output, value) in overrides {
            if self.outputs.contains_key(&output) {
                self.manual.insert(output, value);
            } else {
                warn!(
                    "{}: dropping override for unknown output '{output}'",
                    self.equipment_id
                );
            }
        }
    }

    pub fn set_manual(&mut self, output: &str, value: OutputValue) -> Result<(), ConfigError> {
        self.known_output(output)?;
        self.manual.insert(output.to_string(), value);
        Ok(())
    }

    pub fn set_auto(&mut self, output: &str) -> Result<(), ConfigError> {
        self.known_output(output)?;
        self.manual.remove(output);
        Ok(())
    }

    pub(crate) fn known_output(&self, output: &str) -> Result<(), ConfigError> {
        if self.outputs.contains_key(output) {
            Ok(())
        } else {
            Err(ConfigError::DanglingReference {
                owner: self.equipment_id.clone(),
                what: "output",
                name: output.to_string(),
            })
        }
    }

    pub fn mode(&self, output: &str) -> OutputMode {
        if self.manual.contains_key(output) {
            OutputMode::Manual
        } else {
            OutputMode::Auto
        }
    }

    pub fn actual(&self, output: &str) -> Option<OutputValue> {
        self.written.get(output).map(|w| w.value)
    }

    pub fn phase(&self, group: &str) -> GroupPhase {
        self.phases.get(group).copied().unwrap_or_default()
    }

    /// Snapshot of every configured output.
    pub fn output_states(&self) -> BTreeMap<String, OutputState> {
        self.outputs
            .keys()
            .map(|name| {
                (
                    name.clone(),
                    OutputState {
                        value: self.actual(name),
                        mode: self.mode(name),
                    },
                )
            })
            .collect()
    }

    /// Brings hardware toward `desired`. `readings` supplies interlock proofs.
    pub async fn reconcile(
        &mut self,
        desired: &DesiredOutputs,
        readings: &Readings,
    ) -> SequenceReport {
        let mut report = SequenceReport::default();
        let groups = self.groups.clone();

        let cells: Vec<_> = groups
            .iter()
            .filter_map(|group| match group {
                GroupCfg::Cell {
                    name,
                    enable,
                    speed,
                    valve,
                    ..
                } => Some(self.plan_cell(name, enable, speed, valve, desired)),
                GroupCfg::Doas { .. } => None,
            })
            .collect();
        let with_action = |action: CellAction| {
            cells
                .iter()
                .filter(move |plan| plan.action == action)
                .collect::<Vec<_>>()
        };

        self.stop_cells(&with_action(CellAction::Stop), &mut report).await;

        for group in &groups {
            if let GroupCfg::Doas { .. } = group {
                self.reconcile_doas(group, desired, readings, &mut report).await;
            }
        }

        self.adjust_cells(&with_action(CellAction::Adjust), &mut report).await;
        self.start_cells(&with_action(CellAction::Start), &mut report).await;
        for plan in with_action(CellAction::Steady) {
            self.phases.insert(plan.name.clone(), GroupPhase::Stopped);
        }

        // basin heaters carry no interlock
        for group in &groups {
            if let GroupCfg::Cell {
                heater: Some(heater),
                ..
            } = group
            {
                if let Some(target) = self.target(heater, desired) {
                    self.step(heater, target, &mut report).await;
                }
            }
        }

        self.reconcile_ungrouped(&groups, desired, &mut report).await;
        report
    }

    async fn reconcile_ungrouped(
        &mut self,
        groups: &[GroupCfg],
        desired: &DesiredOutputs,
        report: &mut SequenceReport,
    ) {
        let grouped: BTreeSet<&str> = groups.iter().flat_map(GroupCfg::outputs).collect();
        let names: Vec<String> = self
            .outputs
            .keys()
            .filter(|name| !grouped.contains(name.as_str()))
            .cloned()
            .collect();

        for name in names {
            if let Some(target) = self.target(&name, desired) {
                self.step(&name, target, report).await;
            }
        }
    }

    /// Manual value if held, else the desired one.
    fn target(&self, output: &str, desired: &DesiredOutputs) -> Option<OutputValue> {
        self.manual
            .get(output)
            .or_else(|| desired.get(output))
            .copied()
    }

    fn actual_bool(&self, output: &str) -> Option<bool> {
        self.actual(output).map(OutputValue::as_bool)
    }

    fn written_at(&self, output: &str) -> Option<Instant> {
        self.written.get(output).map(|w| w.at)
    }

    fn is_switch(&self, output: &str) -> bool {
        self.outputs
            .get(output)
            .is_some_and(|cfg| cfg.kind != OutputKind::Analog)
    }

    /// Whether writing `value` would change the recorded state.
    fn differs(&self, output: &str, value: OutputValue) -> bool {
        match self.actual(output) {
            None => true,
            Some(current) if self.is_switch(output) => current.as_bool() != value.as_bool(),
            Some(current) => (current.as_percent() - value.as_percent()).abs() > ANALOG_EPSILON,
        }
    }

    /// Writes `value` if it differs. Returns false if the write failed.
    async fn step(
        &mut self,
        output: &str,
        value: OutputValue,
        report: &mut SequenceReport,
    ) -> bool {
        if !self.differs(output, value) {
            return true;
        }
        match self.write(output, value).await {
            Ok(value) => {
                report.writes.push(AppliedWrite {
                    output: output.to_string(),
                    value,
                });
                true
            }
            Err(e) => {
                error!("{}: {e}", self.equipment_id);
                report.errors.push(e);
                false
            }
        }
    }

    async fn write(&mut self, output: &str, value: OutputValue) -> Result<OutputValue, WriteError> {
        let cfg = self
            .outputs
            .get(output)
            .ok_or_else(|| WriteError::UnknownBoard {
                output: output.to_string(),
                board: String::new(),
            })?;
        let board = self
            .boards
            .get(&cfg.board)
            .ok_or_else(|| WriteError::UnknownBoard {
                output: output.to_string(),
                board: cfg.board.clone(),
            })?;

        let (command, recorded) = match cfg.kind {
            OutputKind::Triac => (
                OutputCommand::Triac(value.as_bool()),
                OutputValue::Bool(value.as_bool()),
            ),
            OutputKind::Relay => (
                OutputCommand::Relay(value.as_bool()),
                OutputValue::Bool(value.as_bool()),
            ),
            OutputKind::Analog => (
                OutputCommand::Analog(percent_to_volts(value.as_percent(), cfg.range)),
                OutputValue::Percent(value.as_percent()),
            ),
        };

        board
            .write(cfg.channel, command)
            .await
            .map_err(|source| WriteError::Write {
                output: output.to_string(),
                board: cfg.board.clone(),
                channel: cfg.channel,
                source,
            })?;

        self.written.insert(
            output.to_string(),
            Written {
                value: recorded,
                at: Instant::now(),
            },
        );
        Ok(recorded)
    }

    /// Sleeps until `delay` has passed since the latest of `outputs` was written.
    async fn settle(&self, outputs: impl IntoIterator<Item = &str>, delay: f64) {
        let delay = Duration::from_secs_f64(delay.max(0.0));
        if let Some(until) = outputs
            .into_iter()
            .filter_map(|name| self.written_at(name))
            .max()
        {
            tokio::time::sleep_until(until + delay).await;
        }
    }
}
