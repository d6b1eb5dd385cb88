//! Application state shared by every service.

use std::sync::Arc;

use dashmap::DashMap;
use log::info;
use tokio::sync::RwLock;

use crate::{
    board::Boards,
    config::{Config, ConfigManager},
    drivers::vibration::VibrationSample,
    event::EventBus,
    failover::{HealthStatus, SharedHealth},
    remote::{RemoteAuthority, TcpAuthority},
    scheduler::{EngineDeps, Scheduler},
    state_store::StateStore,
    weather::Weather,
};

/// Shared application state.
///
/// Hardware handles are created once here and handed to the components that
/// use them; nothing below this struct reaches for a global.
pub struct AppState {
    /// Configuration manager for centralized config handling
    pub config_manager: Arc<ConfigManager>,
    pub boards: Boards,
    pub store: Arc<StateStore>,
    pub weather: Arc<Weather>,
    /// Remote supervisory authority, when configured.
    pub remote: Option<Arc<dyn RemoteAuthority>>,
    /// Written only by the failover service.
    pub health: SharedHealth,
    pub scheduler: Arc<Scheduler>,
    /// Latest sample per vibration sensor.
    pub samples: Arc<DashMap<String, VibrationSample>>,
}

impl AppState {
    /// Builds hardware handles and loads every equipment engine.
    pub async fn new(config_manager: ConfigManager, event_bus: EventBus) -> anyhow::Result<Self> {
        let config = config_manager.clone_config().await;
        config.validate()?;

        let boards = Boards::from_config(&config.boards);
        let store = Arc::new(StateStore::new(config.state_dir.clone()));
        let weather = Arc::new(Weather::from_config(&config.weather));
        let remote = config
            .failover
            .as_ref()
            .map(|cfg| Arc::new(TcpAuthority::from_config(cfg)) as Arc<dyn RemoteAuthority>);
        let health = Arc::new(RwLock::new(if remote.is_some() {
            HealthStatus::default()
        } else {
            HealthStatus::local_only()
        }));

        let scheduler = Arc::new(Scheduler::new(
            EngineDeps {
                boards: boards.clone(),
                weather: weather.clone(),
                store: store.clone(),
                remote: remote.clone(),
            },
            health.clone(),
            event_bus,
        ));
        let loaded = scheduler.load(&config).await;
        info!(
            "{} board(s), {loaded}/{} equipment instance(s) loaded",
            boards.len(),
            config.equipment.len()
        );

        Ok(Self {
            config_manager: Arc::new(config_manager),
            boards,
            store,
            weather,
            remote,
            health,
            scheduler,
            samples: Arc::new(DashMap::new()),
        })
    }

    /// Gets a read-only reference to the current configuration.
    pub async fn config(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config_manager.get().await
    }

    /// Gets the configuration manager.
    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("boards", &self.boards.len())
            .field("equipment", &self.scheduler.equipment_ids())
            .field("remote", &self.remote.is_some())
            .finish_non_exhaustive()
    }
}
