//! System coordinator for managing service lifecycle and dependency injection.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use log::{error, info, warn};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::broadcast::error::RecvError,
};

use crate::{
    app_context::AppState,
    config::{Config, ConfigManager},
    event::{ConfigChangeType, Event, EventBus},
    providers::{
        AppStateProvider, AsyncProvider, ConfigWatcherServiceProvider, EquipmentServiceProvider,
        FailoverServiceProvider, JournalServiceProvider, ServiceProvider,
        VibrationServiceProvider,
    },
    task_manager::TaskManager,
};

const SHUTDOWN_MARGIN: Duration = Duration::from_secs(10);

/// Owns every service and drives the daemon lifecycle.
///
/// Critical services must start; the others may fail and leave the system
/// running in a degraded mode. Shutdown waits long enough for the slowest
/// configured stop sequence to complete.
pub struct SystemCoordinator {
    task_manager: TaskManager,
    event_bus: EventBus,
    shared_state: Option<Arc<AppState>>,
    service_providers: Vec<Box<dyn ServiceProvider>>,
}

impl Default for SystemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Longest time a worker may need to leave its equipment in a safe state.
fn shutdown_timeout(config: &Config) -> Duration {
    let longest = config
        .equipment
        .iter()
        .map(|e| {
            let s = &e.sequencing;
            let startups = e.groups.len().max(1) as f64;
            s.drain_secs + (s.valve_open_secs + s.stabilize_secs) * startups
        })
        .fold(0.0_f64, f64::max);
    Duration::from_secs_f64(longest.max(0.0)) + SHUTDOWN_MARGIN
}

impl SystemCoordinator {
    pub fn new() -> Self {
        Self {
            task_manager: TaskManager::new(),
            event_bus: EventBus::new(),
            shared_state: None,
            service_providers: Vec::new(),
        }
    }

    /// Builds the application state and registers every service.
    pub async fn initialize(&mut self, config_manager: ConfigManager) -> Result<()> {
        info!("Initializing SystemCoordinator...");

        let state = AppStateProvider::new(config_manager, self.event_bus.clone())
            .provide()
            .await
            .context("Failed to initialize application state")?;
        self.shared_state = Some(state.clone());

        let config = state.config().await.clone();
        let timeout = shutdown_timeout(&config);
        self.task_manager =
            std::mem::take(&mut self.task_manager).with_shutdown_timeout(timeout);
        info!("Shutdown timeout set to {timeout:?}");

        self.register_service_providers(state, &config);
        Ok(())
    }

    fn register_service_providers(&mut self, state: Arc<AppState>, config: &Config) {
        let (probe_period, threshold) = config.failover.as_ref().map_or(
            (Duration::from_secs(10), 3),
            |f| (Duration::from_secs(u64::from(f.probe_secs.max(1))), f.threshold),
        );

        let mut providers: Vec<Box<dyn ServiceProvider>> = vec![
            Box::new(EquipmentServiceProvider::new(
                state.clone(),
                self.event_bus.clone(),
            )),
            Box::new(FailoverServiceProvider::new(
                state.remote.clone(),
                state.health.clone(),
                self.event_bus.clone(),
                probe_period,
                threshold,
            )),
            Box::new(VibrationServiceProvider::new(
                &config.vibration,
                state.samples.clone(),
                self.event_bus.clone(),
            )),
            Box::new(ConfigWatcherServiceProvider::new(
                state.config_manager().clone(),
                self.event_bus.clone(),
            )),
            Box::new(JournalServiceProvider::new(
                config.journal.clone(),
                self.event_bus.clone(),
            )),
        ];

        providers.sort_by_key(|b| std::cmp::Reverse(b.priority()));
        self.service_providers = providers;

        info!(
            "Registered {} service providers in priority order",
            self.service_providers.len()
        );
    }

    /// Starts all registered services in priority order.
    pub async fn start_all_services(&mut self) -> Result<()> {
        for provider in &self.service_providers {
            let is_critical = provider.is_critical();

            match provider.start(&mut self.task_manager).await {
                Ok(()) => {
                    info!(
                        "Service '{}' started (priority: {}, critical: {})",
                        provider.name(),
                        provider.priority(),
                        is_critical
                    );
                }
                Err(e) if is_critical => {
                    return Err(e).with_context(|| {
                        format!("Critical service '{}' failed to start", provider.name())
                    });
                }
                Err(e) => {
                    warn!(
                        "Non-critical service '{}' failed to start: {e:#}",
                        provider.name()
                    );
                }
            }
        }

        info!("All critical services started");
        Ok(())
    }

    /// Runs until SIGINT, SIGTERM or a [`Event::SystemShutdown`], then shuts down.
    pub async fn run_main_loop(&mut self) -> Result<()> {
        let mut event_rx = self.event_bus.subscribe();
        let mut terminate = signal(SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        info!("Starting main event loop");

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        bail!("Failed to listen for shutdown signal: {e}");
                    }
                    info!("Received Ctrl+C, initiating graceful shutdown...");
                    break;
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown...");
                    break;
                }
                event = event_rx.recv() => {
                    if !self.handle_event(event)? {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        info!("Main event loop terminated");
        Ok(())
    }

    /// Returns `false` when the loop should stop.
    fn handle_event(&self, event: Result<Event, RecvError>) -> Result<bool> {
        match event {
            Ok(Event::SystemShutdown) => {
                info!("Shutdown requested");
                return Ok(false);
            }
            Ok(Event::ConfigChangeDetected(ConfigChangeType::ColdRestart { changed_sections })) => {
                warn!("Hardware wiring changed in {changed_sections:?}");
                warn!("Restart hvac-sequencerd to apply: sudo systemctl restart hvac-sequencerd");
            }
            Ok(Event::VibrationSuspended { sensor_id, failures }) => {
                warn!(
                    "Vibration sensor '{sensor_id}' suspended after {failures} failures, \
                     publish ResumeVibration to retry"
                );
            }
            Ok(_) => {}
            Err(RecvError::Closed) => bail!("Event bus channel closed unexpectedly"),
            Err(RecvError::Lagged(n)) => warn!("Event bus lagged by {n} messages"),
        }
        Ok(true)
    }

    async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown...");
        if let Err(e) = self.task_manager.shutdown_all().await {
            error!("Error during task shutdown: {e:#}");
        }
        info!("Shutdown complete");
    }

    pub const fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn shared_state(&self) -> Option<&Arc<AppState>> {
        self.shared_state.as_ref()
    }

    pub fn running_services(&self) -> Vec<&'static str> {
        self.service_providers.iter().map(|p| p.name()).collect()
    }
}
