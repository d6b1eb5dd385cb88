//! Dependency injection providers for service management.
//!
//! Each long-running concern of the daemon is a [`ServiceProvider`] started by
//! the [`SystemCoordinator`](crate::coordinator::SystemCoordinator) in priority
//! order.

pub mod app_state;
pub mod config_watcher;
pub mod equipment;
pub mod failover;
pub mod journal;
pub mod traits;
pub mod vibration;

pub use app_state::AppStateProvider;
pub use config_watcher::ConfigWatcherServiceProvider;
pub use equipment::EquipmentServiceProvider;
pub use failover::FailoverServiceProvider;
pub use journal::JournalServiceProvider;
pub use traits::{AsyncProvider, ServiceProvider};
pub use vibration::VibrationServiceProvider;
