//! Cooling-tower cell sequencing: VFD enable, speed reference and isolation
//! valve.

use log::{info, warn};

use super::{GroupPhase, OutputSequencer, SequenceReport};
use crate::strategy::{DesiredOutputs, OutputValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CellAction {
    Start,
    Stop,
    /// Running and staying on; speed reference only.
    Adjust,
    /// Off and already in its off state.
    Steady,
}

#[derive(Debug, Clone)]
pub(super) struct CellPlan {
    pub name: String,
    enable: String,
    speed: String,
    valve: String,
    speed_target: OutputValue,
    valve_target: OutputValue,
    pub action: CellAction,
}

impl OutputSequencer {
    pub(super) fn plan_cell(
        &self,
        name: &str,
        enable: &str,
        speed: &str,
        valve: &str,
        desired: &DesiredOutputs,
    ) -> CellPlan {
        let enable_target = self
            .target(enable, desired)
            .is_some_and(OutputValue::as_bool);
        let valve_held = self.manual.get(valve).map(|v| v.as_bool());
        let on = enable_target && valve_held.unwrap_or(true);
        if enable_target && !on {
            warn!(
                "{}: cell '{name}' held off, valve '{valve}' is manually closed",
                self.equipment_id
            );
        }

        let speed_target = self.manual.get(speed).copied().unwrap_or_else(|| {
            if on {
                OutputValue::Percent(desired.get(speed).map_or(0.0, |v| v.as_percent()))
            } else {
                OutputValue::Percent(0.0)
            }
        });
        let valve_target = OutputValue::Bool(valve_held.unwrap_or(on));

        let action = if on {
            if self.actual_bool(enable) == Some(true) {
                CellAction::Adjust
            } else {
                CellAction::Start
            }
        } else if !self.differs(enable, OutputValue::Bool(false))
            && !self.differs(speed, speed_target)
            && !self.differs(valve, valve_target)
        {
            CellAction::Steady
        } else {
            CellAction::Stop
        };

        CellPlan {
            name: name.to_string(),
            enable: enable.to_string(),
            speed: speed.to_string(),
            valve: valve.to_string(),
            speed_target,
            valve_target,
            action,
        }
    }

    /// Enable off and speed zero for every cell, one drain wait, then valves.
    pub(super) async fn stop_cells(&mut self, plans: &[&CellPlan], report: &mut SequenceReport) {
        let mut spun_down = Vec::new();
        for plan in plans {
            self.phases.insert(plan.name.clone(), GroupPhase::Stopping);
            if self.step(&plan.enable, OutputValue::Bool(false), report).await
                && self.step(&plan.speed, plan.speed_target, report).await
            {
                spun_down.push(*plan);
            } else {
                warn!("{}: stop of cell '{}' aborted", self.equipment_id, plan.name);
            }
        }

        self.settle(
            spun_down.iter().map(|plan| plan.enable.as_str()),
            self.timing.drain_secs,
        )
        .await;

        for plan in spun_down {
            if self.step(&plan.valve, plan.valve_target, report).await {
                info!("{}: cell '{}' stopped", self.equipment_id, plan.name);
                self.phases.insert(plan.name.clone(), GroupPhase::Stopped);
            }
        }
    }

    /// Valve open and settle, speed and stabilize, then enable.
    pub(super) async fn start_cells(&mut self, plans: &[&CellPlan], report: &mut SequenceReport) {
        let mut opened = Vec::new();
        for plan in plans {
            self.phases.insert(plan.name.clone(), GroupPhase::Starting);
            if self.step(&plan.valve, OutputValue::Bool(true), report).await {
                opened.push(*plan);
            } else {
                warn!("{}: start of cell '{}' aborted", self.equipment_id, plan.name);
            }
        }
        self.settle(
            opened.iter().map(|plan| plan.valve.as_str()),
            self.timing.valve_open_secs,
        )
        .await;

        let mut referenced = Vec::new();
        for plan in opened {
            if self.step(&plan.speed, plan.speed_target, report).await {
                referenced.push(plan);
            } else {
                warn!("{}: start of cell '{}' aborted", self.equipment_id, plan.name);
            }
        }
        self.settle(
            referenced.iter().map(|plan| plan.speed.as_str()),
            self.timing.stabilize_secs,
        )
        .await;

        for plan in referenced {
            if self.step(&plan.enable, OutputValue::Bool(true), report).await {
                info!("{}: cell '{}' running", self.equipment_id, plan.name);
                self.phases.insert(plan.name.clone(), GroupPhase::Running);
            }
        }
    }

    /// Speed changes beyond the deadband for cells that stay on.
    pub(super) async fn adjust_cells(&mut self, plans: &[&CellPlan], report: &mut SequenceReport) {
        for plan in plans {
            self.phases.insert(plan.name.clone(), GroupPhase::Running);
            let beyond_deadband = match self.actual(&plan.speed) {
                Some(current) => {
                    (current.as_percent() - plan.speed_target.as_percent()).abs()
                        > self.timing.speed_deadband
                }
                None => true,
            };
            if beyond_deadband {
                self.step(&plan.speed, plan.speed_target, report).await;
            }
        }
    }
}
