//! # hvac_sequencer
//!
//! A Linux daemon that runs HVAC equipment control loops against
//! command-line driven I/O boards.
//!
//! Each configured equipment instance gets its own cycle: inputs are read
//! and converted to engineering units, a control strategy (or a remote
//! supervisory controller, while it is reachable) decides the desired
//! outputs, and the output sequencer applies them in interlocked order.
//!
//! ## Architecture
//!
//! - [`SystemCoordinator`](coordinator::SystemCoordinator) starts services in priority order
//! - [`EventBus`](event::EventBus) carries cycle, authority and config events
//! - [`AppState`](app_context::AppState) owns the board registry, state store and scheduler
//! - [`Scheduler`](scheduler::Scheduler) runs one worker per equipment instance
//! - [`OutputSequencer`](sequencer::OutputSequencer) enforces start/stop ordering
//!
//! ## Example
//!
//! ```no_run
//! use hvac_sequencer::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()
//!         .await?
//!         .run()
//!         .await
//! }
//! ```

pub mod acquisition;
pub mod app_context;
pub mod application;
pub mod board;
pub mod cli;
pub mod config;
pub mod conversion;
pub mod coordinator;
pub mod drivers;
pub mod error;
pub mod event;
pub mod failover;
pub mod providers;
pub mod remote;
pub mod scheduler;
pub mod sequencer;
pub mod state_store;
pub mod strategy;
pub mod task_manager;
pub mod weather;
