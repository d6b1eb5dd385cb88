use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use notify::{Event, EventHandler, RecursiveMode, Watcher, recommended_watcher};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConfigManager,
    event::{ConfigChangeType, Event as AppEvent, EventBus},
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

const DEBOUNCE: Duration = Duration::from_millis(2000);

/// Configuration file watcher.
///
/// Debounces filesystem notifications for the config file, then classifies
/// the change. Setting-only changes are loaded into the [`ConfigManager`]
/// and announced as [`ConfigChangeType::HotReload`]; wiring changes are
/// announced as [`ConfigChangeType::ColdRestart`] and left unapplied.
///
/// - **Priority**: 5
/// - **Critical**: No
pub struct ConfigWatcherServiceProvider {
    config_manager: Arc<ConfigManager>,
    event_bus: EventBus,
}

impl ConfigWatcherServiceProvider {
    pub fn new(config_manager: Arc<ConfigManager>, event_bus: EventBus) -> Self {
        Self {
            config_manager,
            event_bus,
        }
    }
}

#[async_trait]
impl ServiceProvider for ConfigWatcherServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let config_manager = self.config_manager.clone();
        let event_bus = self.event_bus.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_config_watcher(config_manager, event_bus, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "ConfigWatcherService"
    }

    fn priority(&self) -> i32 {
        5
    }
}

/// Forwards notify callbacks into the async task.
#[derive(Debug)]
struct AsyncEventHandler {
    sender: mpsc::UnboundedSender<notify::Result<Event>>,
}

impl EventHandler for AsyncEventHandler {
    fn handle_event(&mut self, event: notify::Result<Event>) {
        if let Err(e) = self.sender.send(event) {
            error!("Failed to forward filesystem event: {e}");
        }
    }
}

/// True for create or modify events touching the config file.
fn affects_config(config_path: &Path, event: &Event) -> bool {
    (event.kind.is_modify() || event.kind.is_create())
        && event
            .paths
            .iter()
            .any(|path| path == config_path || path.file_name() == config_path.file_name())
}

fn watch_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| config_path.to_path_buf(), Path::to_path_buf)
}

async fn run_config_watcher(
    config_manager: Arc<ConfigManager>,
    event_bus: EventBus,
    cancel_token: CancellationToken,
) -> Result<()> {
    let config_path = config_manager.path().to_path_buf();
    let (sender, mut fs_events) = mpsc::unbounded_channel();
    let mut watcher = recommended_watcher(AsyncEventHandler { sender })?;
    let watch_path = watch_dir(&config_path);
    watcher.watch(&watch_path, RecursiveMode::NonRecursive)?;
    info!("Watching {} for changes", config_path.display());

    let mut debounce = interval(DEBOUNCE);
    debounce.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut pending = false;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Config watcher cancelled");
                break;
            }
            event = fs_events.recv() => match event {
                Some(Ok(event)) => {
                    if affects_config(&config_path, &event) {
                        debug!("Config file event {:?}", event.kind);
                        pending = true;
                    }
                }
                Some(Err(e)) => warn!("Filesystem watcher error: {e}"),
                None => break,
            },
            _ = debounce.tick(), if pending => {
                pending = false;
                if let Err(e) = handle_change(&config_manager, &event_bus).await {
                    error!("Configuration change rejected: {e:#}");
                }
            }
        }
    }

    if let Err(e) = watcher.unwatch(&watch_path) {
        warn!("Failed to unwatch {}: {e}", watch_path.display());
    }
    Ok(())
}

async fn handle_change(config_manager: &ConfigManager, event_bus: &EventBus) -> Result<()> {
    let change = config_manager.analyze_config_changes().await?;
    match &change {
        ConfigChangeType::HotReload => {
            config_manager.reload().await?;
            info!("Settings change applied, engines pick it up at the next cycle");
        }
        ConfigChangeType::ColdRestart { changed_sections } => {
            warn!(
                "Wiring changed in {changed_sections:?}; restart hvac-sequencerd to apply"
            );
        }
    }
    event_bus.notify(AppEvent::ConfigChangeDetected(change));
    Ok(())
}
