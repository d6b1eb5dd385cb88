use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use tokio::{
    sync::broadcast::error::RecvError,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::VibrationCfg,
    drivers::vibration::{AlertLevel, VibrationPoller, VibrationSample},
    event::{Event, EventBus},
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

/// Vibration sensor polling service provider.
///
/// Spawns one poller task per configured sensor. A poller that suspends after
/// repeated failures stays idle until an [`Event::ResumeVibration`] names it.
///
/// - **Priority**: 6
/// - **Critical**: No
pub struct VibrationServiceProvider {
    pollers: Mutex<Vec<VibrationPoller>>,
    samples: Arc<DashMap<String, VibrationSample>>,
    event_bus: EventBus,
}

impl VibrationServiceProvider {
    pub fn new(
        sensors: &[VibrationCfg],
        samples: Arc<DashMap<String, VibrationSample>>,
        event_bus: EventBus,
    ) -> Self {
        Self::with_pollers(
            sensors.iter().map(VibrationPoller::from_config).collect(),
            samples,
            event_bus,
        )
    }

    pub fn with_pollers(
        pollers: Vec<VibrationPoller>,
        samples: Arc<DashMap<String, VibrationSample>>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            pollers: Mutex::new(pollers),
            samples,
            event_bus,
        }
    }
}

#[async_trait]
impl ServiceProvider for VibrationServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let pollers = match self.pollers.lock() {
            Ok(mut pollers) => std::mem::take(&mut *pollers),
            Err(_) => anyhow::bail!("Vibration poller list poisoned"),
        };

        for poller in pollers {
            let samples = self.samples.clone();
            let event_bus = self.event_bus.clone();
            let name = format!("{}:{}", self.name(), poller.sensor_id());
            task_manager
                .spawn_task(name, |cancel_token| async move {
                    run_vibration_poller(poller, samples, event_bus, cancel_token).await
                })
                .await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "VibrationService"
    }

    fn priority(&self) -> i32 {
        6
    }
}

async fn run_vibration_poller(
    mut poller: VibrationPoller,
    samples: Arc<DashMap<String, VibrationSample>>,
    event_bus: EventBus,
    cancel_token: CancellationToken,
) -> Result<()> {
    let sensor_id = poller.sensor_id().to_string();
    let mut events = event_bus.subscribe();
    let next_poll = sleep(std::time::Duration::ZERO);
    tokio::pin!(next_poll);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Vibration poller '{sensor_id}' cancelled");
                break;
            }
            () = &mut next_poll, if !poller.is_suspended() => {
                match poller.poll().await {
                    Ok(sample) => {
                        if sample.alert >= AlertLevel::Warning {
                            warn!(
                                "'{sensor_id}' vibration {:.2} mm/s, zone {:?} ({})",
                                sample.velocity_magnitude, sample.zone, sample.alert
                            );
                        }
                        samples.insert(sensor_id.clone(), sample.clone());
                        event_bus.notify(Event::VibrationSampled(sample));
                    }
                    Err(e) => {
                        warn!("'{sensor_id}' read failed: {e}");
                        if poller.is_suspended() {
                            error!(
                                "'{sensor_id}' polling suspended after {} failures",
                                poller.consecutive_failures()
                            );
                            event_bus.notify(Event::VibrationSuspended {
                                sensor_id: sensor_id.clone(),
                                failures: poller.consecutive_failures(),
                            });
                        }
                    }
                }
                next_poll.as_mut().reset(Instant::now() + poller.next_delay());
            }
            event = events.recv() => match event {
                Ok(Event::ResumeVibration { sensor_id: target }) if target == sensor_id => {
                    if poller.is_suspended() {
                        info!("'{sensor_id}' polling resumed");
                        poller.resume();
                        next_poll.as_mut().reset(Instant::now());
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}
