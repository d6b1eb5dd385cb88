use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::broadcast::error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::{
    drivers::vibration::VibrationSample,
    event::{Event, EventBus},
    failover::AuthorityTransition,
    providers::traits::ServiceProvider,
    scheduler::CycleSnapshot,
    task_manager::TaskManager,
};

/// Observability journal service provider.
///
/// Logs a one-line summary of every cycle, authority change and vibration
/// sample, and appends each as a JSON line to the journal file when one is
/// configured.
///
/// - **Priority**: 3 (low)
/// - **Critical**: No
pub struct JournalServiceProvider {
    path: Option<PathBuf>,
    event_bus: EventBus,
}

impl JournalServiceProvider {
    pub fn new(path: Option<PathBuf>, event_bus: EventBus) -> Self {
        Self { path, event_bus }
    }
}

#[async_trait]
impl ServiceProvider for JournalServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let path = self.path.clone();
        let events = self.event_bus.subscribe();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_journal_service(path, events, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "JournalService"
    }

    fn priority(&self) -> i32 {
        3
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Entry<'a> {
    Cycle(&'a CycleSnapshot),
    Authority(&'a AuthorityTransition),
    Vibration(&'a VibrationSample),
}

async fn run_journal_service(
    path: Option<PathBuf>,
    mut events: tokio::sync::broadcast::Receiver<Event>,
    cancel_token: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Journal service cancelled");
                break;
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Journal dropped {n} events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(entry) = summarize(&event) else {
                    continue;
                };
                if let Some(path) = &path {
                    if let Err(e) = append(path, &entry).await {
                        warn!("Journal write failed: {e:#}");
                    }
                }
            }
        }
    }
    Ok(())
}

fn summarize(event: &Event) -> Option<Entry<'_>> {
    match event {
        Event::CycleCompleted(snapshot) => {
            let line = format!(
                "{} [{}] {} write(s), {} error(s)",
                snapshot.equipment_id,
                snapshot.authority,
                snapshot.writes.len(),
                snapshot.write_errors.len()
            );
            if snapshot.write_errors.is_empty() {
                debug!("{line}");
            } else {
                warn!("{line}");
            }
            Some(Entry::Cycle(snapshot))
        }
        Event::AuthorityChanged(transition) => {
            info!("Authority {} -> {}", transition.from, transition.to);
            Some(Entry::Authority(transition))
        }
        Event::VibrationSampled(sample) => {
            debug!(
                "{}: {:.2} mm/s {}",
                sample.sensor_id, sample.velocity_magnitude, sample.alert
            );
            Some(Entry::Vibration(sample))
        }
        _ => None,
    }
}

async fn append(path: &Path, entry: &Entry<'_>) -> Result<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open journal {}", path.display()))?;
    file.write_all(&line).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        acquisition::Readings,
        failover::Authority,
    };
    use chrono::Utc;
    use std::{collections::BTreeMap, time::Duration};
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn snapshot() -> CycleSnapshot {
        CycleSnapshot {
            equipment_id: "tower-1".into(),
            strategy: None,
            authority: Authority::Remote,
            test_mode: false,
            inputs: Readings::default(),
            desired: BTreeMap::new(),
            outputs: BTreeMap::new(),
            writes: Vec::new(),
            write_errors: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn journal_service_provider_creation() {
        let provider = JournalServiceProvider::new(None, EventBus::new());
        assert_eq!(provider.name(), "JournalService");
        assert_eq!(provider.priority(), 3);
        assert!(!provider.is_critical());
    }

    #[tokio::test]
    async fn appends_one_line_per_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let event_bus = EventBus::new();
        let provider = JournalServiceProvider::new(Some(path.clone()), event_bus.clone());
        let mut task_manager = TaskManager::new();
        provider.start(&mut task_manager).await.unwrap();

        event_bus.notify(Event::CycleCompleted(Box::new(snapshot())));
        event_bus.notify(Event::SystemShutdown);
        event_bus.notify(Event::CycleCompleted(Box::new(snapshot())));
        sleep(Duration::from_millis(200)).await;
        task_manager.shutdown_all().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "cycle");
        assert_eq!(first["equipment_id"], "tower-1");
        assert_eq!(first["authority"], "remote");
    }

    #[tokio::test]
    async fn runs_without_journal_file() {
        let event_bus = EventBus::new();
        let provider = JournalServiceProvider::new(None, event_bus.clone());
        let mut task_manager = TaskManager::new();
        provider.start(&mut task_manager).await.unwrap();

        event_bus.notify(Event::CycleCompleted(Box::new(snapshot())));
        assert!(task_manager.is_running("JournalService"));
        task_manager.shutdown_all().await.unwrap();
    }
}
