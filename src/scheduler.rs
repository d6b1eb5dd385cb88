//! Execution scheduler: one serialized read → compute → write worker per
//! equipment instance.
//!
//! A worker only observes cancellation between cycles, so a sequence of
//! hardware writes is never cut short. Stopping a worker waits for its
//! current cycle to finish.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveTime, Utc};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, broadcast::error::RecvError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    acquisition::{InputAcquisition, Readings},
    board::Boards,
    config::{Config, EquipmentCfg},
    error::ConfigError,
    event::{Event, EventBus},
    failover::{Authority, SharedHealth},
    remote::RemoteAuthority,
    sequencer::{AppliedWrite, OutputSequencer, OutputState},
    state_store::StateStore,
    strategy::{
        Commands, DesiredOutputs, OCCUPIED, OutputValue, PersistedState, Strategy, StrategyKind,
    },
    weather::Weather,
};

/// Inspection record of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSnapshot {
    pub equipment_id: String,
    /// Local strategy of the instance, if any.
    pub strategy: Option<StrategyKind>,
    /// Source the desired outputs actually came from.
    pub authority: Authority,
    pub test_mode: bool,
    pub inputs: Readings,
    pub desired: DesiredOutputs,
    pub outputs: BTreeMap<String, OutputState>,
    pub writes: Vec<AppliedWrite>,
    pub write_errors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Everything an engine needs besides its own configuration.
#[derive(Clone)]
pub struct EngineDeps {
    pub boards: Boards,
    pub weather: Arc<Weather>,
    pub store: Arc<StateStore>,
    pub remote: Option<Arc<dyn RemoteAuthority>>,
}

/// Control engine of one equipment instance.
pub struct EquipmentEngine {
    cfg: EquipmentCfg,
    strategy: Option<Strategy>,
    acquisition: InputAcquisition,
    sequencer: OutputSequencer,
    store: Arc<StateStore>,
    remote: Option<Arc<dyn RemoteAuthority>>,
    state: PersistedState,
    skip_reported: bool,
}

struct Decision {
    desired: DesiredOutputs,
    state: PersistedState,
    source: Authority,
}

impl EquipmentEngine {
    /// Builds the engine and restores persisted state and overrides.
    pub async fn load(cfg: EquipmentCfg, deps: EngineDeps) -> Result<Self> {
        let record = deps
            .store
            .load(&cfg.id)
            .await
            .with_context(|| format!("Failed to restore state of '{}'", cfg.id))?;

        let mut sequencer = OutputSequencer::new(deps.boards.clone(), &cfg);
        sequencer.load_overrides(
            record
                .overrides
                .into_iter()
                .map(|(output, held)| (output, held.value)),
        );

        Ok(Self {
            strategy: cfg.strategy.map(StrategyKind::resolve),
            acquisition: InputAcquisition::new(deps.boards, deps.weather),
            sequencer,
            store: deps.store,
            remote: deps.remote,
            state: record.state,
            skip_reported: false,
            cfg,
        })
    }

    pub fn id(&self) -> &str {
        &self.cfg.id
    }

    /// Picks up settings, inputs, schedule, strategy and timing changes.
    pub fn apply_config(&mut self, cfg: &EquipmentCfg) {
        self.strategy = cfg.strategy.map(StrategyKind::resolve);
        self.sequencer.set_timing(cfg.sequencing.clone());
        self.cfg = cfg.clone();
        self.skip_reported = false;
    }

    pub fn commands_at(&self, time: NaiveTime) -> Commands {
        let mut commands = self.cfg.settings.clone();
        if let Some(schedule) = &self.cfg.schedule {
            let occupied = if schedule.is_occupied(time) {
                1.0
            } else {
                0.0
            };
            commands.insert(OCCUPIED.to_string(), occupied);
        }
        commands
    }

    async fn decide(&mut self, readings: &Readings, authority: Authority) -> Option<Decision> {
        if authority == Authority::Remote {
            if let Some(remote) = &self.remote {
                match remote.request_outputs(&self.cfg.id, readings).await {
                    Ok(desired) => {
                        return Some(Decision {
                            desired,
                            state: self.state.clone(),
                            source: Authority::Remote,
                        });
                    }
                    Err(e) => warn!("{}: {e}, using local strategy", self.cfg.id),
                }
            }
        }

        let Some(strategy) = self.strategy else {
            if !self.skip_reported {
                error!(
                    "{}, cycle skipped",
                    ConfigError::NoLocalStrategy(self.cfg.id.clone())
                );
                self.skip_reported = true;
            }
            return None;
        };
        self.skip_reported = false;

        let commands = self.commands_at(Local::now().time());
        let outcome = strategy.compute(readings, &commands, &self.state);
        Some(Decision {
            desired: outcome.outputs,
            state: outcome.state,
            source: Authority::Local,
        })
    }

    /// Runs one full cycle. `None` when the cycle was skipped.
    pub async fn run_cycle(&mut self, authority: Authority) -> Option<CycleSnapshot> {
        let readings = self.acquisition.acquire(&self.cfg.inputs).await;
        let decision = self.decide(&readings, authority).await?;
        let report = self.sequencer.reconcile(&decision.desired, &readings).await;

        if decision.state != self.state {
            if let Err(e) = self
                .store
                .save_state(&self.cfg.id, decision.state.clone())
                .await
            {
                error!("{}: failed to persist state: {e:#}", self.cfg.id);
            }
            self.state = decision.state;
        }

        debug!(
            "{}: cycle via {} wrote {} output(s)",
            self.cfg.id,
            decision.source,
            report.writes.len()
        );
        Some(CycleSnapshot {
            equipment_id: self.cfg.id.clone(),
            strategy: self.cfg.strategy,
            authority: decision.source,
            test_mode: false,
            inputs: readings,
            desired: decision.desired,
            outputs: self.sequencer.output_states(),
            writes: report.writes,
            write_errors: report.errors.iter().map(ToString::to_string).collect(),
            timestamp: Utc::now(),
        })
    }

    /// Read and compute only: no hardware writes, nothing persisted.
    pub async fn test_cycle(
        &mut self,
        authority: Authority,
        inputs: Option<Readings>,
    ) -> Result<CycleSnapshot, ConfigError> {
        let readings = match inputs {
            Some(readings) => readings,
            None => self.acquisition.acquire(&self.cfg.inputs).await,
        };
        let decision = self
            .decide(&readings, authority)
            .await
            .ok_or_else(|| ConfigError::NoLocalStrategy(self.cfg.id.clone()))?;

        Ok(CycleSnapshot {
            equipment_id: self.cfg.id.clone(),
            strategy: self.cfg.strategy,
            authority: decision.source,
            test_mode: true,
            inputs: readings,
            desired: decision.desired,
            outputs: self.sequencer.output_states(),
            writes: Vec::new(),
            write_errors: Vec::new(),
            timestamp: Utc::now(),
        })
    }

    /// Persists the override, then holds the output at `value`.
    pub async fn set_manual(&mut self, output: &str, value: OutputValue) -> Result<()> {
        self.sequencer.known_output(output)?;
        self.store
            .set_override(&self.cfg.id, output, Some(value))
            .await?;
        self.sequencer.set_manual(output, value)?;
        Ok(())
    }

    pub async fn set_auto(&mut self, output: &str) -> Result<()> {
        self.sequencer.known_output(output)?;
        self.store.set_override(&self.cfg.id, output, None).await?;
        self.sequencer.set_auto(output)?;
        Ok(())
    }

    pub fn output_states(&self) -> BTreeMap<String, OutputState> {
        self.sequencer.output_states()
    }
}

type SharedEngine = Arc<Mutex<EquipmentEngine>>;

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns every equipment engine and its worker task.
pub struct Scheduler {
    engines: DashMap<String, SharedEngine>,
    ticks: DashMap<String, Duration>,
    workers: Mutex<HashMap<String, Worker>>,
    snapshots: Arc<DashMap<String, CycleSnapshot>>,
    deps: EngineDeps,
    health: SharedHealth,
    event_bus: EventBus,
}

impl Scheduler {
    pub fn new(deps: EngineDeps, health: SharedHealth, event_bus: EventBus) -> Self {
        Self {
            engines: DashMap::new(),
            ticks: DashMap::new(),
            workers: Mutex::new(HashMap::new()),
            snapshots: Arc::new(DashMap::new()),
            deps,
            health,
            event_bus,
        }
    }

    /// Builds an engine per equipment instance. An instance with broken
    /// wiring or unreadable state is skipped; the others still load. Returns
    /// the loaded count.
    pub async fn load(&self, config: &Config) -> usize {
        for cfg in &config.equipment {
            if let Err(e) = config.check_equipment(cfg) {
                error!("Skipping equipment '{}': {e}", cfg.id);
                continue;
            }
            let tick = Duration::from_secs(u64::from(config.tick_for(cfg)));
            match EquipmentEngine::load(cfg.clone(), self.deps.clone()).await {
                Ok(engine) => {
                    info!(
                        "Loaded equipment '{}' ({}) every {tick:?}",
                        cfg.id,
                        cfg.strategy
                            .map_or_else(|| "remote only".to_string(), |k| k.to_string())
                    );
                    self.engines.insert(cfg.id.clone(), Arc::new(Mutex::new(engine)));
                    self.ticks.insert(cfg.id.clone(), tick);
                }
                Err(e) => error!("Skipping equipment '{}': {e:#}", cfg.id),
            }
        }
        self.engines.len()
    }

    /// Hot reload: applied between cycles. Workers whose interval changed
    /// are restarted.
    pub async fn apply_config(&self, config: &Config) -> Result<()> {
        for cfg in &config.equipment {
            let Some(engine) = self.engine(&cfg.id) else {
                continue;
            };
            if let Err(e) = config.check_equipment(cfg) {
                error!("Keeping previous settings of '{}': {e}", cfg.id);
                continue;
            }
            engine.lock().await.apply_config(cfg);

            let tick = Duration::from_secs(u64::from(config.tick_for(cfg)));
            let previous = self.ticks.insert(cfg.id.clone(), tick);
            if previous != Some(tick) && self.is_running(&cfg.id).await {
                info!("'{}' interval now {tick:?}, restarting worker", cfg.id);
                self.stop(&cfg.id).await;
                self.start(&cfg.id).await?;
            }
        }
        Ok(())
    }

    fn engine(&self, id: &str) -> Option<SharedEngine> {
        self.engines.get(id).map(|e| e.value().clone())
    }

    fn require(&self, id: &str) -> Result<SharedEngine, ConfigError> {
        self.engine(id)
            .ok_or_else(|| ConfigError::UnknownEquipment(id.to_string()))
    }

    pub fn equipment_ids(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.key().clone()).collect()
    }

    /// Starts the worker of `id`. Starting a running worker is a no-op.
    pub async fn start(&self, id: &str) -> Result<()> {
        let engine = self.require(id)?;
        let mut workers = self.workers.lock().await;
        if workers.get(id).is_some_and(|w| !w.handle.is_finished()) {
            return Ok(());
        }

        let tick = self
            .ticks
            .get(id)
            .map(|t| *t.value())
            .unwrap_or(Duration::from_secs(7));
        let token = CancellationToken::new();
        let worker = EquipmentWorker {
            engine,
            tick,
            health: self.health.clone(),
            event_bus: self.event_bus.clone(),
            snapshots: self.snapshots.clone(),
        };
        let handle = tokio::spawn(worker.run(token.clone()));
        workers.insert(id.to_string(), Worker { token, handle });
        info!("Started worker for '{id}'");
        Ok(())
    }

    /// Stops the worker of `id` after its current cycle. Idempotent.
    pub async fn stop(&self, id: &str) {
        let worker = self.workers.lock().await.remove(id);
        if let Some(worker) = worker {
            worker.token.cancel();
            if let Err(e) = worker.handle.await {
                error!("Worker for '{id}' ended abnormally: {e}");
            }
            info!("Stopped worker for '{id}'");
        }
    }

    pub async fn start_all(&self) -> Result<()> {
        for id in self.equipment_ids() {
            self.start(&id).await?;
        }
        Ok(())
    }

    /// Stops every worker after its current cycle. Workers may be started
    /// again afterwards.
    pub async fn stop_all(&self) {
        let workers: Vec<_> = self.workers.lock().await.drain().collect();
        for (_, worker) in &workers {
            worker.token.cancel();
        }
        let stopped = workers.into_iter().map(|(id, worker)| async move {
            if let Err(e) = worker.handle.await {
                error!("Worker for '{id}' ended abnormally: {e}");
            }
        });
        futures::future::join_all(stopped).await;
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.workers
            .lock()
            .await
            .get(id)
            .is_some_and(|w| !w.handle.is_finished())
    }

    pub async fn set_manual(&self, id: &str, output: &str, value: OutputValue) -> Result<()> {
        let engine = self.require(id)?;
        let mut engine = engine.lock().await;
        engine.set_manual(output, value).await?;
        info!("'{id}' output '{output}' held at {value:?}");
        Ok(())
    }

    pub async fn set_auto(&self, id: &str, output: &str) -> Result<()> {
        let engine = self.require(id)?;
        engine.lock().await.set_auto(output).await?;
        info!("'{id}' output '{output}' returned to auto");
        Ok(())
    }

    /// Runs a cycle without writing, with `inputs` or freshly read ones.
    pub async fn test_cycle(&self, id: &str, inputs: Option<Readings>) -> Result<CycleSnapshot> {
        let engine = self.require(id)?;
        let authority = self.health.read().await.authority;
        let snapshot = engine.lock().await.test_cycle(authority, inputs).await?;
        Ok(snapshot)
    }

    /// Latest completed cycle of `id`.
    pub fn snapshot(&self, id: &str) -> Option<CycleSnapshot> {
        self.snapshots.get(id).map(|s| s.value().clone())
    }
}

struct EquipmentWorker {
    engine: SharedEngine,
    tick: Duration,
    health: SharedHealth,
    event_bus: EventBus,
    snapshots: Arc<DashMap<String, CycleSnapshot>>,
}

impl EquipmentWorker {
    async fn run(self, token: CancellationToken) {
        let id = self.engine.lock().await.id().to_string();
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events = self.event_bus.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
                event = events.recv() => match event {
                    Ok(Event::AuthorityChanged(transition)) => {
                        info!("{id}: control source now {}", transition.to);
                        interval.reset();
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            }

            let authority = self.health.read().await.authority;
            let snapshot = self.engine.lock().await.run_cycle(authority).await;
            if let Some(snapshot) = snapshot {
                self.snapshots.insert(id.clone(), snapshot.clone());
                self.event_bus.notify(Event::CycleCompleted(Box::new(snapshot)));
            }
        }
        debug!("{id}: worker exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        board::{OutputCommand, ReadKind},
        config::{
            BoardCfg, CommandVerbs, InputCfg, OutputCfg, OutputKind, ScheduleCfg, SequencingCfg,
            SignalCfg,
        },
        conversion::VoltageRange,
        drivers::fake::RecordingBoard,
        error::RemoteError,
        failover::{AuthorityTransition, HealthStatus},
        remote::MockRemoteAuthority,
        sequencer::OutputMode,
        weather::FixedWeatherSource,
    };
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tokio::{sync::RwLock, time::timeout};

    const VALVE: u8 = 1;
    const FAN: u8 = 1;

    fn fan_coil(strategy: Option<StrategyKind>) -> EquipmentCfg {
        let output = |channel, kind| OutputCfg {
            board: "main".into(),
            channel,
            kind,
            range: VoltageRange::ZeroToTen,
        };
        EquipmentCfg {
            id: "fcu-1".into(),
            strategy,
            tick_seconds: Some(5),
            inputs: vec![InputCfg {
                name: "space_temp".into(),
                board: "main".into(),
                channel: 1,
                enabled: true,
                signal: SignalCfg::Voltage {
                    min: 50.0,
                    max: 100.0,
                },
            }],
            outputs: BTreeMap::from([
                ("fan_enable".to_string(), output(FAN, OutputKind::Triac)),
                ("cooling_valve".to_string(), output(VALVE, OutputKind::Analog)),
                ("oa_damper".to_string(), output(2, OutputKind::Analog)),
            ]),
            groups: Vec::new(),
            settings: BTreeMap::from([("space_setpoint".to_string(), 72.0)]),
            schedule: None,
            sequencing: SequencingCfg::default(),
        }
    }

    fn deps(fake: &RecordingBoard, store: Arc<StateStore>) -> EngineDeps {
        fake.set_input(1, ReadKind::Voltage, 5.0);
        EngineDeps {
            boards: Boards::with_boards([fake.clone().into_board()]),
            weather: Arc::new(Weather::new(Box::new(FixedWeatherSource(60.0)), 72.0)),
            store,
            remote: None,
        }
    }

    #[tokio::test]
    async fn local_cycle_writes_and_persists() {
        let fake = RecordingBoard::new("main");
        let store = Arc::new(StateStore::in_memory());
        let mut engine = EquipmentEngine::load(
            fan_coil(Some(StrategyKind::FanCoil)),
            deps(&fake, store.clone()),
        )
        .await
        .unwrap();

        let snapshot = engine.run_cycle(Authority::Local).await.unwrap();
        assert_eq!(snapshot.inputs.get("space_temp"), Some(75.0));
        assert_eq!(snapshot.authority, Authority::Local);
        assert_eq!(snapshot.strategy, Some(StrategyKind::FanCoil));
        assert!(snapshot.desired["cooling_valve"].as_percent() > 0.0);
        assert!(fake.log().find(FAN, OutputCommand::Triac(true)).is_some());

        let record = store.load("fcu-1").await.unwrap();
        assert!(record.state["cooling_integral"] > 0.0);
    }

    #[tokio::test]
    async fn remote_outputs_used_while_remote_active() {
        let fake = RecordingBoard::new("main");
        let mut remote = MockRemoteAuthority::new();
        remote
            .expect_request_outputs()
            .withf(|id, inputs| id == "fcu-1" && inputs.get("space_temp") == Some(75.0))
            .returning(|_, _| {
                Ok(DesiredOutputs::from([(
                    "cooling_valve".to_string(),
                    OutputValue::Percent(33.0),
                )]))
            });
        let mut deps = deps(&fake, Arc::new(StateStore::in_memory()));
        deps.remote = Some(Arc::new(remote));

        let mut engine = EquipmentEngine::load(fan_coil(Some(StrategyKind::FanCoil)), deps)
            .await
            .unwrap();
        let snapshot = engine.run_cycle(Authority::Remote).await.unwrap();
        assert_eq!(snapshot.authority, Authority::Remote);
        assert_eq!(
            engine.output_states()["cooling_valve"].value,
            Some(OutputValue::Percent(33.0))
        );
        assert_eq!(engine.output_states()["fan_enable"].value, None);
    }

    #[tokio::test]
    async fn failed_remote_request_falls_back_to_local() {
        let fake = RecordingBoard::new("main");
        let mut remote = MockRemoteAuthority::new();
        remote
            .expect_request_outputs()
            .returning(|_, _| Err(RemoteError::Timeout(Duration::from_secs(2))));
        let mut deps = deps(&fake, Arc::new(StateStore::in_memory()));
        deps.remote = Some(Arc::new(remote));

        let mut engine = EquipmentEngine::load(fan_coil(Some(StrategyKind::FanCoil)), deps)
            .await
            .unwrap();
        let snapshot = engine.run_cycle(Authority::Remote).await.unwrap();
        assert_eq!(snapshot.authority, Authority::Local);
    }

    #[tokio::test]
    async fn local_without_strategy_skips_cycle() {
        let fake = RecordingBoard::new("main");
        let mut engine = EquipmentEngine::load(
            fan_coil(None),
            deps(&fake, Arc::new(StateStore::in_memory())),
        )
        .await
        .unwrap();

        assert!(engine.run_cycle(Authority::Local).await.is_none());
        assert_eq!(fake.log().len(), 0);
        assert!(matches!(
            engine.test_cycle(Authority::Local, None).await,
            Err(ConfigError::NoLocalStrategy(_))
        ));
    }

    #[tokio::test]
    async fn test_cycle_never_writes_or_persists() {
        let fake = RecordingBoard::new("main");
        let store = Arc::new(StateStore::in_memory());
        let mut engine = EquipmentEngine::load(
            fan_coil(Some(StrategyKind::FanCoil)),
            deps(&fake, store.clone()),
        )
        .await
        .unwrap();

        let mut supplied = Readings::default();
        supplied.insert("space_temp", 80.0);
        let snapshot = engine
            .test_cycle(Authority::Local, Some(supplied))
            .await
            .unwrap();

        assert!(snapshot.test_mode);
        assert_eq!(snapshot.inputs.get("space_temp"), Some(80.0));
        assert!(snapshot.desired["fan_enable"].as_bool());
        assert_eq!(fake.log().len(), 0);
        assert!(store.load("fcu-1").await.unwrap().state.is_empty());
    }

    #[tokio::test]
    async fn schedule_drives_occupancy_command() {
        let fake = RecordingBoard::new("main");
        let mut cfg = fan_coil(Some(StrategyKind::FanCoil));
        cfg.schedule = Some(ScheduleCfg {
            start: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
        });
        let engine = EquipmentEngine::load(cfg, deps(&fake, Arc::new(StateStore::in_memory())))
            .await
            .unwrap();

        let noon = engine.commands_at(NaiveTime::from_hms_opt(12, 0, 0).unwrap());
        let night = engine.commands_at(NaiveTime::from_hms_opt(23, 0, 0).unwrap());
        assert_eq!(noon[OCCUPIED], 1.0);
        assert_eq!(night[OCCUPIED], 0.0);
        assert_eq!(noon["space_setpoint"], 72.0);
    }

    #[tokio::test]
    async fn manual_override_survives_restart() {
        let dir = TempDir::new().unwrap();
        let fake = RecordingBoard::new("main");
        let store = Arc::new(StateStore::new(Some(dir.path().to_path_buf())));
        let mut engine = EquipmentEngine::load(
            fan_coil(Some(StrategyKind::FanCoil)),
            deps(&fake, store),
        )
        .await
        .unwrap();
        engine
            .set_manual("cooling_valve", OutputValue::Percent(15.0))
            .await
            .unwrap();

        let reopened = Arc::new(StateStore::new(Some(dir.path().to_path_buf())));
        let mut engine = EquipmentEngine::load(
            fan_coil(Some(StrategyKind::FanCoil)),
            deps(&fake, reopened),
        )
        .await
        .unwrap();
        engine.run_cycle(Authority::Local).await.unwrap();
        let state = engine.output_states()["cooling_valve"];
        assert_eq!(state.mode, OutputMode::Manual);
        assert_eq!(state.value, Some(OutputValue::Percent(15.0)));
    }

    fn scheduler(fake: &RecordingBoard) -> Scheduler {
        let health = Arc::new(RwLock::new(HealthStatus::local_only()));
        Scheduler::new(
            deps(fake, Arc::new(StateStore::in_memory())),
            health,
            EventBus::new(),
        )
    }

    fn config() -> Config {
        Config {
            boards: vec![BoardCfg::Command {
                id: "main".into(),
                program: "megabas".into(),
                stack: 0,
                verbs: CommandVerbs::default(),
                timeout_ms: 1000,
            }],
            equipment: vec![fan_coil(Some(StrategyKind::FanCoil))],
            ..Config::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn worker_cycles_and_records_snapshot() {
        let fake = RecordingBoard::new("main");
        let scheduler = scheduler(&fake);
        assert_eq!(scheduler.load(&config()).await, 1);

        scheduler.start("fcu-1").await.unwrap();
        scheduler.start("fcu-1").await.unwrap();
        assert!(scheduler.is_running("fcu-1").await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = scheduler.snapshot("fcu-1").unwrap();
        assert_eq!(snapshot.equipment_id, "fcu-1");

        scheduler.stop("fcu-1").await;
        scheduler.stop("fcu-1").await;
        assert!(!scheduler.is_running("fcu-1").await);

        let writes = fake.log().len();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fake.log().len(), writes);
    }

    #[tokio::test]
    async fn unknown_equipment_is_rejected() {
        let fake = RecordingBoard::new("main");
        let scheduler = scheduler(&fake);
        scheduler.load(&config()).await;

        assert!(scheduler.start("nope").await.is_err());
        assert!(
            scheduler
                .set_manual("nope", "fan_enable", OutputValue::Bool(true))
                .await
                .is_err()
        );
        assert!(scheduler.test_cycle("nope", None).await.is_err());
    }

    #[tokio::test]
    async fn scheduler_manual_and_auto_round_trip() {
        let fake = RecordingBoard::new("main");
        let scheduler = scheduler(&fake);
        scheduler.load(&config()).await;

        scheduler
            .set_manual("fcu-1", "oa_damper", OutputValue::Percent(50.0))
            .await
            .unwrap();
        assert!(
            scheduler
                .set_manual("fcu-1", "missing", OutputValue::Percent(50.0))
                .await
                .is_err()
        );
        scheduler.set_auto("fcu-1", "oa_damper").await.unwrap();

        let snapshot = scheduler.test_cycle("fcu-1", None).await.unwrap();
        assert_eq!(snapshot.outputs["oa_damper"].mode, OutputMode::Auto);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_ends_every_worker() {
        let fake = RecordingBoard::new("main");
        let scheduler = scheduler(&fake);
        scheduler.load(&config()).await;
        scheduler.start_all().await.unwrap();

        scheduler.stop_all().await;
        assert!(!scheduler.is_running("fcu-1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn workers_restart_after_stop_all() {
        let fake = RecordingBoard::new("main");
        let scheduler = scheduler(&fake);
        scheduler.load(&config()).await;
        scheduler.start_all().await.unwrap();
        scheduler.stop_all().await;

        scheduler.start("fcu-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.is_running("fcu-1").await);
        assert!(scheduler.snapshot("fcu-1").is_some());
        scheduler.stop_all().await;
    }

    #[tokio::test]
    async fn miswired_equipment_is_skipped_and_others_load() {
        let fake = RecordingBoard::new("main");
        let scheduler = scheduler(&fake);
        let mut config = config();
        let mut broken = fan_coil(Some(StrategyKind::FanCoil));
        broken.id = "fcu-2".into();
        broken.outputs.get_mut("oa_damper").unwrap().board = "missing".into();
        config.equipment.push(broken);

        assert_eq!(scheduler.load(&config).await, 1);
        assert_eq!(scheduler.equipment_ids(), vec!["fcu-1".to_string()]);
        assert!(scheduler.test_cycle("fcu-1", None).await.is_ok());
        assert!(matches!(
            scheduler.start("fcu-2").await.unwrap_err().downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownEquipment(_))
        ));
    }

    #[tokio::test]
    async fn miswired_reload_keeps_running_settings() {
        let fake = RecordingBoard::new("main");
        let scheduler = scheduler(&fake);
        scheduler.load(&config()).await;

        let mut reloaded = config();
        let fcu = &mut reloaded.equipment[0];
        fcu.settings.insert("space_setpoint".into(), 80.0);
        fcu.inputs[0].board = "missing".into();
        scheduler.apply_config(&reloaded).await.unwrap();

        let snapshot = scheduler.test_cycle("fcu-1", None).await.unwrap();
        assert!(snapshot.desired["cooling_valve"].as_percent() > 0.0);
    }

    async fn next_cycle(events: &mut tokio::sync::broadcast::Receiver<Event>) -> CycleSnapshot {
        loop {
            if let Event::CycleCompleted(snapshot) = events.recv().await.unwrap() {
                return *snapshot;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failover_switches_source_without_losing_state() {
        let fake = RecordingBoard::new("main");
        let store = Arc::new(StateStore::in_memory());
        store
            .save_state(
                "fcu-1",
                PersistedState::from([("cooling_integral".to_string(), 5.0)]),
            )
            .await
            .unwrap();
        let mut remote = MockRemoteAuthority::new();
        remote.expect_request_outputs().returning(|_, _| {
            Ok(DesiredOutputs::from([(
                "cooling_valve".to_string(),
                OutputValue::Percent(33.0),
            )]))
        });
        let mut deps = deps(&fake, store.clone());
        deps.remote = Some(Arc::new(remote));
        let health = Arc::new(RwLock::new(HealthStatus::default()));
        let event_bus = EventBus::new();
        let mut events = event_bus.subscribe();
        let scheduler = Scheduler::new(deps, health.clone(), event_bus.clone());
        scheduler.load(&config()).await;
        scheduler.start("fcu-1").await.unwrap();

        let first = next_cycle(&mut events).await;
        assert_eq!(first.authority, Authority::Remote);
        assert_eq!(first.desired["cooling_valve"], OutputValue::Percent(33.0));

        health.write().await.authority = Authority::Local;
        event_bus.notify(Event::AuthorityChanged(AuthorityTransition {
            from: Authority::Remote,
            to: Authority::Local,
            consecutive_failures: 3,
            at: Utc::now(),
        }));

        // well before the 5 s tick
        let second = timeout(Duration::from_secs(1), next_cycle(&mut events))
            .await
            .unwrap();
        assert_eq!(second.authority, Authority::Local);
        let record = store.load("fcu-1").await.unwrap();
        assert_eq!(record.state["cooling_integral"], 6.5);

        scheduler.stop_all().await;
    }

    #[tokio::test]
    async fn failed_override_write_leaves_output_in_auto() {
        let dir = TempDir::new().unwrap();
        let state_dir = dir.path().join("state");
        let fake = RecordingBoard::new("main");
        let store = Arc::new(StateStore::new(Some(state_dir.clone())));
        let mut engine = EquipmentEngine::load(
            fan_coil(Some(StrategyKind::FanCoil)),
            deps(&fake, store),
        )
        .await
        .unwrap();
        std::fs::write(&state_dir, b"not a directory").unwrap();

        assert!(
            engine
                .set_manual("cooling_valve", OutputValue::Percent(15.0))
                .await
                .is_err()
        );
        assert_eq!(engine.output_states()["cooling_valve"].mode, OutputMode::Auto);
    }
}
