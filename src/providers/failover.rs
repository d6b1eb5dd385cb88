use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::{sync::Arc, time::Duration};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::{
    event::{Event, EventBus},
    failover::{Authority, FailoverMonitor, SharedHealth},
    providers::traits::ServiceProvider,
    remote::RemoteAuthority,
    task_manager::TaskManager,
};

/// Remote authority health probe.
///
/// Runs on its own timer, independent of equipment cycles, and is the only
/// writer of the shared [`HealthStatus`](crate::failover::HealthStatus).
/// Without a configured remote the service does not start.
///
/// - **Priority**: 8
/// - **Critical**: No
pub struct FailoverServiceProvider {
    remote: Option<Arc<dyn RemoteAuthority>>,
    health: SharedHealth,
    event_bus: EventBus,
    period: Duration,
    threshold: u32,
}

impl FailoverServiceProvider {
    pub fn new(
        remote: Option<Arc<dyn RemoteAuthority>>,
        health: SharedHealth,
        event_bus: EventBus,
        period: Duration,
        threshold: u32,
    ) -> Self {
        Self {
            remote,
            health,
            event_bus,
            period,
            threshold,
        }
    }
}

#[async_trait]
impl ServiceProvider for FailoverServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let Some(remote) = self.remote.clone() else {
            info!("No remote authority configured, local control only");
            return Ok(());
        };
        let monitor = FailoverMonitor::new(self.threshold);
        let health = self.health.clone();
        let event_bus = self.event_bus.clone();
        let period = self.period;

        task_manager
            .spawn_task(self.name().to_string(), move |cancel_token| async move {
                run_failover_service(remote, monitor, health, event_bus, period, cancel_token)
                    .await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "FailoverService"
    }

    fn priority(&self) -> i32 {
        8
    }
}

async fn run_failover_service(
    remote: Arc<dyn RemoteAuthority>,
    mut monitor: FailoverMonitor,
    health: SharedHealth,
    event_bus: EventBus,
    period: Duration,
    cancel_token: CancellationToken,
) -> Result<()> {
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Failover service cancelled");
                break;
            }
            _instant = interval.tick() => {
                let outcome = remote.probe().await;
                let transition = monitor.record_probe(outcome);
                *health.write().await = monitor.status().clone();

                if let Some(transition) = transition {
                    if transition.to == Authority::Local {
                        warn!(
                            "Remote authority lost after {} failed probes, \
                             local strategies in control",
                            transition.consecutive_failures
                        );
                    }
                    event_bus.notify(Event::AuthorityChanged(transition));
                }
            }
        }
    }
    Ok(())
}
