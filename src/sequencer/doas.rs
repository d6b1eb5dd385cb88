//! DOAS sequencing under the gas interlock.
//!
//! The gas valve is only ever written non-zero while the recorded fan enable
//! and heat enable are both on and the airflow proof (when configured) reads
//! on from a fresh sample. Anything that turns off is turned off gas first.

use log::{info, warn};

use super::{GroupPhase, OutputSequencer, SequenceReport};
use crate::{
    acquisition::Readings,
    config::GroupCfg,
    strategy::{DesiredOutputs, OutputValue},
};

impl OutputSequencer {
    pub(super) async fn reconcile_doas(
        &mut self,
        group: &GroupCfg,
        desired: &DesiredOutputs,
        readings: &Readings,
        report: &mut SequenceReport,
    ) {
        let GroupCfg::Doas {
            name,
            fan_enable,
            fan_speed,
            heat_enable,
            gas_valve,
            airflow_proof,
            chiller_stages,
        } = group
        else {
            return;
        };

        let fan_on = self
            .target(fan_enable, desired)
            .is_some_and(OutputValue::as_bool);
        let heat_on = fan_on
            && self
                .target(heat_enable, desired)
                .is_some_and(OutputValue::as_bool);
        let speed = self.manual.get(fan_speed).copied().unwrap_or_else(|| {
            OutputValue::Percent(if fan_on {
                desired.get(fan_speed).map_or(0.0, |v| v.as_percent())
            } else {
                0.0
            })
        });
        let gas_request = self
            .target(gas_valve, desired)
            .map_or(0.0, OutputValue::as_percent);
        let proven = match airflow_proof {
            Some(input) => readings.fresh(input).is_some_and(|v| v >= 0.5),
            None => true,
        };

        let phase = match (fan_on, self.actual_bool(fan_enable)) {
            (true, Some(true)) => GroupPhase::Running,
            (true, _) => GroupPhase::Starting,
            (false, Some(false)) => GroupPhase::Stopped,
            (false, _) => GroupPhase::Stopping,
        };
        self.phases.insert(name.clone(), phase);

        // safe side first: gas, chillers and heat go off before the fan
        if !(fan_on && heat_on && proven && gas_request > 0.0)
            && !self.step(gas_valve, OutputValue::Percent(0.0), report).await
        {
            return aborted(&self.equipment_id, name, "gas valve close");
        }
        if !fan_on {
            for stage in chiller_stages {
                if !self.step(stage, OutputValue::Bool(false), report).await {
                    return aborted(&self.equipment_id, name, "chiller stage off");
                }
            }
        }
        if !heat_on
            && !self
                .step(heat_enable, OutputValue::Bool(false), report)
                .await
        {
            return aborted(&self.equipment_id, name, "heat disable");
        }

        let speed_due = match self.actual(fan_speed) {
            Some(current) if self.actual_bool(fan_enable) == Some(true) && fan_on => {
                (current.as_percent() - speed.as_percent()).abs() > self.timing.speed_deadband
            }
            _ => self.differs(fan_speed, speed),
        };
        if fan_on {
            // speed reference ahead of the enable
            if speed_due && !self.step(fan_speed, speed, report).await {
                return aborted(&self.equipment_id, name, "fan speed");
            }
            if !self.step(fan_enable, OutputValue::Bool(true), report).await {
                return aborted(&self.equipment_id, name, "fan enable");
            }
        } else {
            // enable drops before the speed reference
            if !self.step(fan_enable, OutputValue::Bool(false), report).await {
                return aborted(&self.equipment_id, name, "fan disable");
            }
            if speed_due && !self.step(fan_speed, speed, report).await {
                return aborted(&self.equipment_id, name, "fan speed");
            }
        }
        if heat_on && !self.step(heat_enable, OutputValue::Bool(true), report).await {
            return aborted(&self.equipment_id, name, "heat enable");
        }

        let fan_confirmed = self.actual_bool(fan_enable) == Some(true);
        let heat_confirmed = self.actual_bool(heat_enable) == Some(true);
        let gas = if fan_confirmed && heat_confirmed && proven {
            gas_request
        } else {
            0.0
        };
        if gas_request > 0.0 && gas == 0.0 && heat_on && !proven {
            info!(
                "{}: '{name}' gas held closed, airflow not proven",
                self.equipment_id
            );
        }
        if !self.step(gas_valve, OutputValue::Percent(gas), report).await {
            return aborted(&self.equipment_id, name, "gas valve");
        }

        for stage in chiller_stages {
            let on = fan_confirmed
                && self
                    .target(stage, desired)
                    .is_some_and(OutputValue::as_bool);
            if !self.step(stage, OutputValue::Bool(on), report).await {
                return aborted(&self.equipment_id, name, "chiller stage");
            }
        }

        self.phases.insert(
            name.clone(),
            if fan_confirmed {
                GroupPhase::Running
            } else {
                GroupPhase::Stopped
            },
        );
    }
}

fn aborted(equipment_id: &str, group: &str, step: &str) {
    warn!("{equipment_id}: '{group}' sequence aborted at {step}");
}
