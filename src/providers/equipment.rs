use anyhow::Result;
use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::AppState,
    event::{ConfigChangeType, Event, EventBus},
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

/// Equipment control service provider.
///
/// Starts one scheduler worker per loaded equipment instance, applies
/// hot-reloaded configuration between cycles and, on shutdown, waits for
/// every in-flight write sequence before returning.
///
/// - **Priority**: 10 (highest)
/// - **Critical**: Yes
pub struct EquipmentServiceProvider {
    state: Arc<AppState>,
    event_bus: EventBus,
}

impl EquipmentServiceProvider {
    pub fn new(state: Arc<AppState>, event_bus: EventBus) -> Self {
        Self { state, event_bus }
    }
}

#[async_trait]
impl ServiceProvider for EquipmentServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let state = self.state.clone();
        let event_bus = self.event_bus.clone();

        // workers are running before this returns
        state.scheduler.start_all().await?;

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_equipment_service(state, event_bus, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "EquipmentService"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn is_critical(&self) -> bool {
        true
    }
}

async fn run_equipment_service(
    state: Arc<AppState>,
    event_bus: EventBus,
    cancel_token: CancellationToken,
) -> Result<()> {
    let mut events = event_bus.subscribe();

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Equipment service cancelled, waiting for running cycles");
                break;
            }
            event = events.recv() => match event {
                Ok(Event::ConfigChangeDetected(ConfigChangeType::HotReload)) => {
                    let config = state.config_manager().clone_config().await;
                    if let Err(e) = state.scheduler.apply_config(&config).await {
                        error!("Failed to apply configuration: {e:#}");
                    } else {
                        info!("Equipment settings reloaded");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Equipment service lagged by {n} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    state.scheduler.stop_all().await;
    Ok(())
}
