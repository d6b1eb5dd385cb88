//! Per-equipment persisted state: control-loop memory and manual overrides.
//!
//! One JSON file per equipment instance under the configured directory,
//! replaced atomically (temp file + rename). Without a directory the store
//! is memory only.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::strategy::{OutputValue, PersistedState};

/// A channel held at a fixed value by an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub value: OutputValue,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquipmentRecord {
    #[serde(default)]
    pub state: PersistedState,
    /// Output name to override; channels absent here are automatic.
    #[serde(default)]
    pub overrides: BTreeMap<String, ManualOverride>,
}

#[derive(Debug, Default)]
pub struct StateStore {
    dir: Option<PathBuf>,
    cache: DashMap<String, EquipmentRecord>,
}

impl StateStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            cache: DashMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn file_for(dir: &Path, equipment_id: &str) -> PathBuf {
        dir.join(format!("{equipment_id}.json"))
    }

    /// Loads a record, from cache or disk. A missing file is an empty record.
    pub async fn load(&self, equipment_id: &str) -> Result<EquipmentRecord> {
        if let Some(record) = self.cache.get(equipment_id) {
            return Ok(record.clone());
        }

        let record = match &self.dir {
            Some(dir) => {
                let path = Self::file_for(dir, equipment_id);
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => serde_json::from_str(&content)
                        .with_context(|| format!("Corrupt state file: {}", path.display()))?,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        info!("No persisted state for '{equipment_id}', starting empty");
                        EquipmentRecord::default()
                    }
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("Failed to read state file: {}", path.display())
                        });
                    }
                }
            }
            None => EquipmentRecord::default(),
        };

        self.cache.insert(equipment_id.to_string(), record.clone());
        Ok(record)
    }

    /// Replaces the control-loop state of one equipment instance.
    pub async fn save_state(&self, equipment_id: &str, state: PersistedState) -> Result<()> {
        let mut record = self.load(equipment_id).await?;
        if record.state == state {
            return Ok(());
        }
        record.state = state;
        self.store(equipment_id, record).await
    }

    /// Sets or clears the manual override of one output, written through.
    pub async fn set_override(
        &self,
        equipment_id: &str,
        output: &str,
        value: Option<OutputValue>,
    ) -> Result<()> {
        let mut record = self.load(equipment_id).await?;
        match value {
            Some(value) => {
                record.overrides.insert(
                    output.to_string(),
                    ManualOverride {
                        value,
                        since: Utc::now(),
                    },
                );
            }
            None => {
                record.overrides.remove(output);
            }
        }
        self.store(equipment_id, record).await
    }

    async fn store(&self, equipment_id: &str, record: EquipmentRecord) -> Result<()> {
        if let Some(dir) = &self.dir {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create state dir: {}", dir.display()))?;

            let path = Self::file_for(dir, equipment_id);
            let tmp = path.with_extension("json.tmp");
            let content = serde_json::to_vec_pretty(&record)?;
            tokio::fs::write(&tmp, content)
                .await
                .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
            if let Err(e) = tokio::fs::rename(&tmp, &path).await {
                warn!("Failed to replace {}: {e}", path.display());
                return Err(e).context("State file rename failed");
            }
        }

        self.cache.insert(equipment_id.to_string(), record);
        Ok(())
    }
}
