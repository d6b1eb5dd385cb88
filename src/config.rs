//! Configuration management for the sequencer daemon.
//!
//! Handles loading, parsing, and validation of the YAML file that declares
//! boards, equipment wiring, control settings, failover and vibration sensors.

use std::{
    collections::{BTreeMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::NaiveTime;
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{
    conversion::VoltageRange, error::ConfigError, event::ConfigChangeType,
    strategy::StrategyKind,
};

/// Main configuration structure.
///
/// # Example
///
/// ```yaml
/// version: 1
/// tick_seconds: 7
/// state_dir: /var/lib/hvac_sequencer
///
/// boards:
///   - kind: command
///     id: main
///     program: megabas
///     stack: 0
///
/// equipment:
///   - id: doas-1
///     strategy: doas
///     inputs:
///       - name: supply_temp
///         board: main
///         channel: 1
///         signal: { type: thermistor10k }
///     outputs:
///       fan_enable: { board: main, channel: 1, kind: triac }
///       fan_speed: { board: main, channel: 1, kind: analog }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    /// Default cycle interval in seconds for equipment without its own.
    #[serde(default = "defaults::tick_seconds")]
    pub tick_seconds: u16,

    /// Directory for persisted equipment state; memory only when absent.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// JSON-lines file receiving cycle snapshots and vibration samples.
    #[serde(default)]
    pub journal: Option<PathBuf>,

    #[serde(default)]
    pub weather: WeatherCfg,

    #[serde(default)]
    pub boards: Vec<BoardCfg>,

    #[serde(default)]
    pub equipment: Vec<EquipmentCfg>,

    /// Remote supervisory authority; local control only when absent.
    #[serde(default)]
    pub failover: Option<FailoverCfg>,

    #[serde(default)]
    pub vibration: Vec<VibrationCfg>,
}

/// I/O board variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BoardCfg {
    /// Board driven through its vendor command-line program.
    Command {
        id: String,
        program: String,
        /// Stack address of the board.
        #[serde(default)]
        stack: u8,
        #[serde(default)]
        verbs: CommandVerbs,
        #[serde(default = "defaults::command_timeout_ms")]
        timeout_ms: u64,
    },
}

impl BoardCfg {
    pub fn id(&self) -> &str {
        match self {
            BoardCfg::Command { id, .. } => id,
        }
    }
}

/// Sub-commands of a board program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandVerbs {
    pub read_voltage: String,
    pub read_resistance: String,
    pub read_digital: String,
    pub write_triac: String,
    pub write_relay: String,
    pub write_analog: String,
}

impl Default for CommandVerbs {
    fn default() -> Self {
        Self {
            read_voltage: "adcrd".into(),
            read_resistance: "r1krd".into(),
            read_digital: "optord".into(),
            write_triac: "trwr".into(),
            write_relay: "relwr".into(),
            write_analog: "dacwr".into(),
        }
    }
}

/// One hardware input channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputCfg {
    /// Name the reading is published under.
    pub name: String,
    pub board: String,
    pub channel: u8,
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
    pub signal: SignalCfg,
}

/// Electrical type of an input and its engineering conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalCfg {
    /// 10k NTC thermistor in a voltage divider, reported in °F.
    Thermistor10k {
        #[serde(default)]
        offset: f64,
    },
    /// 1k platinum RTD read as resistance, reported in °F.
    Rtd1k {
        #[serde(default)]
        offset: f64,
    },
    /// 0–10 V linear signal.
    Voltage { min: f64, max: f64 },
    /// 2–10 V actuator feedback.
    ValveFeedback { min: f64, max: f64 },
    /// 0–10 V current transducer.
    Current {
        max_amps: f64,
        #[serde(default = "defaults::noise_floor")]
        noise_floor: f64,
    },
    /// Dry contact, reported as 0 or 1.
    Digital,
}

/// Physical kind of an output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Triac,
    Relay,
    Analog,
}

/// One hardware output channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputCfg {
    pub board: String,
    pub channel: u8,
    pub kind: OutputKind,
    #[serde(default)]
    pub range: VoltageRange,
}

/// Outputs sequenced together under safety interlocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupCfg {
    /// Cooling-tower cell: VFD enable + speed reference + isolation valve.
    Cell {
        name: String,
        enable: String,
        speed: String,
        valve: String,
        #[serde(default)]
        heater: Option<String>,
    },
    /// DOAS supply fan and gas heat.
    Doas {
        #[serde(default = "defaults::doas_group_name")]
        name: String,
        fan_enable: String,
        fan_speed: String,
        heat_enable: String,
        gas_valve: String,
        /// Input that proves airflow; gas stays off unless it reads on.
        #[serde(default)]
        airflow_proof: Option<String>,
        /// Cooling stages allowed only while the supply fan runs.
        #[serde(default)]
        chiller_stages: Vec<String>,
    },
}

impl GroupCfg {
    pub fn name(&self) -> &str {
        match self {
            GroupCfg::Cell { name, .. } | GroupCfg::Doas { name, .. } => name,
        }
    }

    /// Output names owned by this group.
    pub fn outputs(&self) -> Vec<&str> {
        match self {
            GroupCfg::Cell {
                enable,
                speed,
                valve,
                heater,
                ..
            } => {
                let mut names = vec![enable.as_str(), speed.as_str(), valve.as_str()];
                names.extend(heater.as_deref());
                names
            }
            GroupCfg::Doas {
                fan_enable,
                fan_speed,
                heat_enable,
                gas_valve,
                chiller_stages,
                ..
            } => {
                let mut names = vec![
                    fan_enable.as_str(),
                    fan_speed.as_str(),
                    heat_enable.as_str(),
                    gas_valve.as_str(),
                ];
                names.extend(chiller_stages.iter().map(String::as_str));
                names
            }
        }
    }
}

/// Timing of interlocked start/stop sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencingCfg {
    /// Mechanical spin-down wait before an isolation valve closes.
    pub drain_secs: f64,
    /// Wait after opening an isolation valve before the speed reference.
    pub valve_open_secs: f64,
    /// Wait after setting the speed reference before enabling.
    pub stabilize_secs: f64,
    /// Minimum speed change, in percent, that is written while running.
    pub speed_deadband: f64,
}

impl Default for SequencingCfg {
    fn default() -> Self {
        Self {
            drain_secs: 30.0,
            valve_open_secs: 5.0,
            stabilize_secs: 3.0,
            speed_deadband: 1.0,
        }
    }
}

/// Daily occupied period in local time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleCfg {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ScheduleCfg {
    /// Whether `time` falls in the occupied period; periods may wrap midnight.
    pub fn is_occupied(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// One controlled equipment instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentCfg {
    pub id: String,

    /// Local control strategy; remote-only when absent.
    #[serde(default)]
    pub strategy: Option<StrategyKind>,

    /// Cycle interval override in seconds.
    #[serde(default)]
    pub tick_seconds: Option<u16>,

    #[serde(default)]
    pub inputs: Vec<InputCfg>,

    #[serde(default)]
    pub outputs: BTreeMap<String, OutputCfg>,

    #[serde(default)]
    pub groups: Vec<GroupCfg>,

    /// Setpoints and tuning passed to the strategy as external commands.
    #[serde(default)]
    pub settings: BTreeMap<String, f64>,

    #[serde(default)]
    pub schedule: Option<ScheduleCfg>,

    #[serde(default)]
    pub sequencing: SequencingCfg,
}

impl EquipmentCfg {
    /// Sections whose change needs a restart: wiring, not tuning.
    fn wiring(&self) -> (&Option<StrategyKind>, &BTreeMap<String, OutputCfg>, &Vec<GroupCfg>) {
        (&self.strategy, &self.outputs, &self.groups)
    }
}

/// Outdoor temperature source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherCfg {
    /// JSON file holding the latest observation.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "defaults::outdoor_fallback_f")]
    pub fallback_f: f64,
}

impl Default for WeatherCfg {
    fn default() -> Self {
        Self {
            path: None,
            fallback_f: defaults::outdoor_fallback_f(),
        }
    }
}

/// Remote supervisory authority and failover thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverCfg {
    /// `host:port` of the remote authority.
    pub address: String,
    #[serde(default = "defaults::probe_secs")]
    pub probe_secs: u16,
    #[serde(default = "defaults::failure_threshold")]
    pub threshold: u32,
    #[serde(default = "defaults::remote_timeout_ms")]
    pub timeout_ms: u64,
}

/// Serial vibration sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VibrationCfg {
    pub id: String,
    pub port: String,
    #[serde(default = "defaults::baud")]
    pub baud: u32,
    #[serde(default = "defaults::sensor_address")]
    pub address: u8,
    #[serde(default = "defaults::start_register")]
    pub start_register: u16,
    #[serde(default = "defaults::register_count")]
    pub register_count: u16,
    #[serde(default = "defaults::poll_secs")]
    pub poll_secs: u16,
    #[serde(default = "defaults::max_failures")]
    pub max_failures: u32,
    /// Vibration frequency assumed when integrating acceleration to velocity.
    #[serde(default = "defaults::assumed_frequency_hz")]
    pub assumed_frequency_hz: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            tick_seconds: defaults::tick_seconds(),
            state_dir: None,
            journal: None,
            weather: WeatherCfg::default(),
            boards: Vec::new(),
            equipment: Vec::new(),
            failover: None,
            vibration: Vec::new(),
        }
    }
}

impl Config {
    /// Parses a configuration from YAML text without validating it.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse YAML configuration")
    }

    /// Validates the plant-wide parts of the configuration.
    ///
    /// Checks id uniqueness and the failover and vibration sections. Wiring
    /// of a single equipment instance is checked by
    /// [`check_equipment`](Self::check_equipment) so a broken instance only
    /// takes itself out.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut board_ids = HashSet::new();
        for board in &self.boards {
            if !board_ids.insert(board.id()) {
                return Err(ConfigError::Duplicate {
                    what: "board",
                    id: board.id().to_string(),
                });
            }
        }

        let mut equipment_ids = HashSet::new();
        for equipment in &self.equipment {
            if !equipment_ids.insert(equipment.id.as_str()) {
                return Err(ConfigError::Duplicate {
                    what: "equipment",
                    id: equipment.id.clone(),
                });
            }
        }

        let mut sensor_ids = HashSet::new();
        for sensor in &self.vibration {
            if !sensor_ids.insert(sensor.id.as_str()) {
                return Err(ConfigError::Duplicate {
                    what: "vibration sensor",
                    id: sensor.id.clone(),
                });
            }
            if sensor.register_count < 3 {
                return Err(ConfigError::Invalid(format!(
                    "vibration sensor '{}' must read at least the 3 acceleration registers",
                    sensor.id
                )));
            }
            let frequency = sensor.assumed_frequency_hz;
            if !frequency.is_finite() || frequency <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "vibration sensor '{}' has invalid assumed_frequency_hz {frequency}",
                    sensor.id
                )));
            }
        }

        if let Some(failover) = &self.failover {
            if failover.threshold == 0 {
                return Err(ConfigError::Invalid(
                    "failover threshold must be at least 1".into(),
                ));
            }
        }

        Ok(())
    }

    /// Checks that every board, input and output reference of one equipment
    /// instance resolves.
    pub fn check_equipment(
        &self,
        equipment: &EquipmentCfg,
    ) -> std::result::Result<(), ConfigError> {
        let board_ids: HashSet<&str> = self.boards.iter().map(BoardCfg::id).collect();
        validate_equipment(equipment, &board_ids)
    }

    pub fn find_equipment(&self, id: &str) -> Option<&EquipmentCfg> {
        self.equipment.iter().find(|e| e.id == id)
    }

    /// Cycle interval for an equipment instance.
    pub fn tick_for(&self, equipment: &EquipmentCfg) -> u16 {
        equipment.tick_seconds.unwrap_or(self.tick_seconds).max(1)
    }

    /// Classifies the difference between two configurations.
    ///
    /// Board, wiring, failover, vibration and weather changes cannot be
    /// applied to running workers. Everything else is read at the next cycle
    /// boundary.
    pub fn classify_change(&self, new: &Config) -> ConfigChangeType {
        let mut changed_sections = Vec::new();

        if self.boards != new.boards {
            changed_sections.push("boards".to_string());
        }
        let old_ids: Vec<_> = self.equipment.iter().map(|e| &e.id).collect();
        let new_ids: Vec<_> = new.equipment.iter().map(|e| &e.id).collect();
        if old_ids != new_ids {
            changed_sections.push("equipment".to_string());
        } else {
            for (old, new) in self.equipment.iter().zip(&new.equipment) {
                if old.wiring() != new.wiring() {
                    changed_sections.push(format!("equipment.{}", old.id));
                }
            }
        }
        if self.failover != new.failover {
            changed_sections.push("failover".to_string());
        }
        if self.vibration != new.vibration {
            changed_sections.push("vibration".to_string());
        }
        if self.weather != new.weather {
            changed_sections.push("weather".to_string());
        }
        if self.state_dir != new.state_dir || self.journal != new.journal {
            changed_sections.push("paths".to_string());
        }

        if changed_sections.is_empty() {
            ConfigChangeType::HotReload
        } else {
            ConfigChangeType::ColdRestart { changed_sections }
        }
    }
}

fn validate_equipment(
    equipment: &EquipmentCfg,
    board_ids: &HashSet<&str>,
) -> std::result::Result<(), ConfigError> {
    let dangling = |what: &'static str, name: &str| ConfigError::DanglingReference {
        owner: equipment.id.clone(),
        what,
        name: name.to_string(),
    };

    let mut input_names = HashSet::new();
    for input in &equipment.inputs {
        if !board_ids.contains(input.board.as_str()) {
            return Err(dangling("board", &input.board));
        }
        if !input_names.insert(input.name.as_str()) {
            return Err(ConfigError::Duplicate {
                what: "input",
                id: format!("{}.{}", equipment.id, input.name),
            });
        }
    }

    for output in equipment.outputs.values() {
        if !board_ids.contains(output.board.as_str()) {
            return Err(dangling("board", &output.board));
        }
    }

    let mut grouped = HashSet::new();
    for group in &equipment.groups {
        for name in group.outputs() {
            if !equipment.outputs.contains_key(name) {
                return Err(dangling("output", name));
            }
            if !grouped.insert(name) {
                return Err(ConfigError::Invalid(format!(
                    "output '{name}' of '{}' belongs to more than one group",
                    equipment.id
                )));
            }
        }
        if let GroupCfg::Doas {
            airflow_proof: Some(proof),
            ..
        } = group
        {
            if !input_names.contains(proof.as_str()) {
                return Err(dangling("input", proof));
            }
        }
    }

    Ok(())
}

mod defaults {
    pub fn tick_seconds() -> u16 {
        7
    }

    pub fn enabled() -> bool {
        true
    }

    pub fn noise_floor() -> f64 {
        crate::conversion::CURRENT_NOISE_FLOOR_AMPS
    }

    pub fn command_timeout_ms() -> u64 {
        2000
    }

    pub fn doas_group_name() -> String {
        "doas".to_string()
    }

    pub fn outdoor_fallback_f() -> f64 {
        72.0
    }

    pub fn probe_secs() -> u16 {
        10
    }

    pub fn failure_threshold() -> u32 {
        3
    }

    pub fn remote_timeout_ms() -> u64 {
        2000
    }

    pub fn baud() -> u32 {
        9600
    }

    pub fn sensor_address() -> u8 {
        0x50
    }

    pub fn start_register() -> u16 {
        0x34
    }

    pub fn register_count() -> u16 {
        12
    }

    pub fn poll_secs() -> u16 {
        5
    }

    pub fn max_failures() -> u32 {
        3
    }

    pub fn assumed_frequency_hz() -> f64 {
        30.0
    }
}

fn locate_config() -> Result<PathBuf> {
    if let Ok(env_path) = env::var("HVAC_SEQUENCER_CONFIG") {
        return Ok(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("hvac_sequencer/config.yml");
        if cfg_dir.exists() {
            return Ok(cfg_dir);
        }
    }

    let etc = Path::new("/etc/hvac_sequencer/config.yml");
    if etc.exists() {
        return Ok(etc.to_path_buf());
    }

    anyhow::bail!("Configuration file not found in any standard location")
}

/// Configuration manager that handles both config data and file operations.
///
/// # Example
///
/// ```no_run
/// use hvac_sequencer::config::ConfigManager;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(None).await?;
/// let tick = config_manager.get().await.tick_seconds;
/// config_manager.reload().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration from file or standard locations.
    ///
    /// Searches in order: the provided path, `HVAC_SEQUENCER_CONFIG`,
    /// `$XDG_CONFIG_HOME/hvac_sequencer/config.yml` (or `~/.config/...`),
    /// `/etc/hvac_sequencer/config.yml`.
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => locate_config().context("No configuration file found")?,
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::load_config_from_path(&config_path)?;

        Ok(Self::new(config, config_path))
    }

    pub async fn get(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reloads configuration from the same file.
    pub async fn reload(&self) -> Result<()> {
        info!("Reloading config from: {}", self.path.display());
        let new_config = Self::load_config_from_path(&self.path)?;

        *self.config.write().await = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Compares the file on disk with the active configuration.
    pub async fn analyze_config_changes(&self) -> Result<ConfigChangeType> {
        let on_disk = Self::load_config_from_path(&self.path)?;
        Ok(self.config.read().await.classify_change(&on_disk))
    }

    /// Snapshot of the current configuration.
    pub async fn clone_config(&self) -> Config {
        self.config.read().await.clone()
    }

    fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Config::from_yaml(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        if config.version != 1 {
            anyhow::bail!(
                "Unsupported config version {} in file: {}",
                config.version,
                path.display()
            );
        }

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TOWER_YAML: &str = r#"
version: 1
tick_seconds: 5
boards:
  - kind: command
    id: main
    program: megabas
    stack: 1
equipment:
  - id: tower-1
    strategy: cooling_tower
    inputs:
      - name: loop_temp
        board: main
        channel: 1
        signal: { type: thermistor10k, offset: -0.5 }
      - name: pump_amps
        board: main
        channel: 2
        signal: { type: current, max_amps: 50 }
    outputs:
      cell1_enable: { board: main, channel: 1, kind: triac }
      cell1_speed: { board: main, channel: 1, kind: analog }
      cell1_valve: { board: main, channel: 2, kind: triac }
    groups:
      - kind: cell
        name: cell1
        enable: cell1_enable
        speed: cell1_speed
        valve: cell1_valve
    settings:
      loop_setpoint: 85
    schedule:
      start: "06:00:00"
      end: "18:00:00"
failover:
  address: "10.0.0.5:1880"
vibration:
  - id: tower-fan
    port: /dev/ttyUSB0
"#;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[tokio::test]
    async fn config_load_valid_yaml() {
        let temp_file = create_temp_config(TOWER_YAML);
        let manager = ConfigManager::load(Some(temp_file.path().to_path_buf()))
            .await
            .unwrap();
        let config = manager.clone_config().await;

        assert_eq!(config.tick_seconds, 5);
        assert_eq!(config.boards.len(), 1);
        let tower = config.find_equipment("tower-1").unwrap();
        assert_eq!(tower.strategy, Some(StrategyKind::CoolingTower));
        assert_eq!(
            tower.inputs[0].signal,
            SignalCfg::Thermistor10k { offset: -0.5 }
        );
        assert_eq!(
            tower.inputs[1].signal,
            SignalCfg::Current {
                max_amps: 50.0,
                noise_floor: 2.2
            }
        );
        assert_eq!(tower.sequencing, SequencingCfg::default());
        assert_eq!(config.tick_for(tower), 5);

        let failover = config.failover.unwrap();
        assert_eq!(failover.threshold, 3);
        assert_eq!(failover.probe_secs, 10);

        let sensor = &config.vibration[0];
        assert_eq!(sensor.address, 0x50);
        assert_eq!(sensor.start_register, 0x34);
        assert_eq!(sensor.register_count, 12);
        assert_eq!(sensor.baud, 9600);
    }

    #[test]
    fn defaults_without_optional_sections() {
        let config = Config::from_yaml("version: 1\n").unwrap();
        assert_eq!(config.tick_seconds, 7);
        assert_eq!(config.weather.fallback_f, 72.0);
        assert!(config.failover.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_board_rejects_only_that_equipment() {
        let yaml = TOWER_YAML.replace(
            "board: main, channel: 2, kind: triac",
            "board: aux, channel: 2, kind: triac",
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert!(config.validate().is_ok());
        let err = config.check_equipment(&config.equipment[0]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::DanglingReference {
                owner: "tower-1".into(),
                what: "board",
                name: "aux".into()
            }
        );
    }

    #[test]
    fn group_with_undeclared_output_is_rejected() {
        let yaml = TOWER_YAML.replace("valve: cell1_valve", "valve: cell9_valve");
        let config = Config::from_yaml(&yaml).unwrap();
        let err = config.check_equipment(&config.equipment[0]).unwrap_err();
        assert!(err.to_string().contains("cell9_valve"));
    }

    #[test]
    fn validate_rejects_bad_vibration_frequency() {
        for bad in ["0", "-30", ".nan", ".inf"] {
            let yaml = TOWER_YAML.replace(
                "port: /dev/ttyUSB0",
                &format!("port: /dev/ttyUSB0\n    assumed_frequency_hz: {bad}"),
            );
            let config = Config::from_yaml(&yaml).unwrap();
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{bad} accepted"
            );
        }
        assert!(Config::from_yaml(TOWER_YAML).unwrap().validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_equipment() {
        let mut config = Config::from_yaml(TOWER_YAML).unwrap();
        let duplicate = config.equipment[0].clone();
        config.equipment.push(duplicate);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Duplicate { what: "equipment", .. })
        ));
    }

    #[test]
    fn settings_change_is_hot_reload() {
        let old = Config::from_yaml(TOWER_YAML).unwrap();
        let new =
            Config::from_yaml(&TOWER_YAML.replace("loop_setpoint: 85", "loop_setpoint: 82"))
                .unwrap();
        assert!(matches!(old.classify_change(&new), ConfigChangeType::HotReload));
    }

    #[test]
    fn wiring_change_requires_restart() {
        let old = Config::from_yaml(TOWER_YAML).unwrap();
        let new = Config::from_yaml(&TOWER_YAML.replace(
            "cell1_valve: { board: main, channel: 2, kind: triac }",
            "cell1_valve: { board: main, channel: 3, kind: triac }",
        ))
        .unwrap();
        match old.classify_change(&new) {
            ConfigChangeType::ColdRestart { changed_sections } => {
                assert_eq!(changed_sections, vec!["equipment.tower-1".to_string()]);
            }
            other => panic!("expected cold restart, got {other:?}"),
        }
    }

    #[test]
    fn weather_change_requires_restart() {
        let old = Config::default();
        let mut new = Config::default();
        new.weather.fallback_f = 50.0;
        new.weather.path = Some(PathBuf::from("/run/weather.json"));
        match old.classify_change(&new) {
            ConfigChangeType::ColdRestart { changed_sections } => {
                assert_eq!(changed_sections, vec!["weather".to_string()]);
            }
            other => panic!("expected cold restart, got {other:?}"),
        }
    }

    #[test]
    fn schedule_wraps_midnight() {
        let schedule = ScheduleCfg {
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        };
        assert!(schedule.is_occupied(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(schedule.is_occupied(NaiveTime::from_hms_opt(5, 59, 0).unwrap()));
        assert!(!schedule.is_occupied(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }

    #[tokio::test]
    async fn load_rejects_unsupported_version() {
        let temp_file = create_temp_config("version: 2\n");
        let result = ConfigManager::load(Some(temp_file.path().to_path_buf())).await;
        assert!(result.unwrap_err().to_string().contains("Unsupported config version"));
    }
}
