use std::{fmt, path::PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::warn;
use serde::Deserialize;

use crate::config::WeatherCfg;

/// Latest outdoor air temperature supplied by an external collaborator.
#[async_trait]
pub trait OutdoorTemperatureSource: Send + Sync + fmt::Debug {
    async fn outdoor_temperature(&self) -> Result<f64>;
}

/// Observation file written by the weather collector.
#[derive(Debug)]
pub struct FileWeatherSource {
    path: PathBuf,
}

#[derive(Deserialize)]
struct Observation {
    temperature_f: f64,
}

impl FileWeatherSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl OutdoorTemperatureSource for FileWeatherSource {
    async fn outdoor_temperature(&self) -> Result<f64> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read weather file: {}", self.path.display()))?;
        let observation: Observation = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse weather file: {}", self.path.display()))?;
        if !observation.temperature_f.is_finite() {
            anyhow::bail!("Non-finite outdoor temperature in {}", self.path.display());
        }
        Ok(observation.temperature_f)
    }
}

#[derive(Debug)]
pub struct FixedWeatherSource(pub f64);

#[async_trait]
impl OutdoorTemperatureSource for FixedWeatherSource {
    async fn outdoor_temperature(&self) -> Result<f64> {
        Ok(self.0)
    }
}

/// Outdoor temperature with a fixed fallback when the source fails.
#[derive(Debug)]
pub struct Weather {
    source: Box<dyn OutdoorTemperatureSource>,
    fallback_f: f64,
}

impl Weather {
    pub fn new(source: Box<dyn OutdoorTemperatureSource>, fallback_f: f64) -> Self {
        Self { source, fallback_f }
    }

    pub fn from_config(cfg: &WeatherCfg) -> Self {
        let source: Box<dyn OutdoorTemperatureSource> = match &cfg.path {
            Some(path) => Box::new(FileWeatherSource::new(path.clone())),
            None => Box::new(FixedWeatherSource(cfg.fallback_f)),
        };
        Self::new(source, cfg.fallback_f)
    }

    pub async fn current(&self) -> f64 {
        match self.source.outdoor_temperature().await {
            Ok(temp) => temp,
            Err(e) => {
                warn!("Outdoor temperature unavailable, using {}°F: {e:#}", self.fallback_f);
                self.fallback_f
            }
        }
    }
}
