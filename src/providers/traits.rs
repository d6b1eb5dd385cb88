use anyhow::Result;
use async_trait::async_trait;

use crate::task_manager::TaskManager;

/// Creates a component asynchronously.
///
/// # Example
///
/// ```no_run
/// use hvac_sequencer::providers::traits::AsyncProvider;
///
/// struct SiteName;
///
/// #[async_trait::async_trait]
/// impl AsyncProvider<String> for SiteName {
///     async fn provide(&self) -> anyhow::Result<String> {
///         Ok("plant-room-2".to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait AsyncProvider<T> {
    async fn provide(&self) -> Result<T>;
}

/// A service started through the [`TaskManager`].
///
/// Services start in descending [`priority`](Self::priority) order. A
/// critical service that fails to start aborts startup; any other failure
/// only degrades the system.
///
/// # Example
///
/// ```no_run
/// use hvac_sequencer::providers::traits::ServiceProvider;
/// use hvac_sequencer::task_manager::TaskManager;
/// use anyhow::Result;
///
/// struct Heartbeat;
///
/// #[async_trait::async_trait]
/// impl ServiceProvider for Heartbeat {
///     async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
///         task_manager.spawn_task("heartbeat".to_string(), |token| async move {
///             token.cancelled().await;
///             Ok(())
///         }).await
///     }
///
///     fn name(&self) -> &'static str { "Heartbeat" }
/// }
/// ```
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()>;

    fn name(&self) -> &'static str;

    /// Higher numbers start first.
    fn priority(&self) -> i32 {
        0
    }

    fn is_critical(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };
    use tokio_test::{assert_err, assert_ok};

    struct FixedProvider(u16);

    #[async_trait]
    impl AsyncProvider<u16> for FixedProvider {
        async fn provide(&self) -> Result<u16> {
            Ok(self.0)
        }
    }

    struct BrokenProvider;

    #[async_trait]
    impl AsyncProvider<u16> for BrokenProvider {
        async fn provide(&self) -> Result<u16> {
            Err(anyhow!("board registry unavailable"))
        }
    }

    struct StubService {
        name: &'static str,
        priority: i32,
        fail: bool,
        stopped: Arc<AtomicBool>,
    }

    impl StubService {
        fn new(name: &'static str, priority: i32) -> Self {
            Self {
                name,
                priority,
                fail: false,
                stopped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl ServiceProvider for StubService {
        async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
            if self.fail {
                return Err(anyhow!("{} failed to start", self.name));
            }
            let stopped = self.stopped.clone();
            task_manager
                .spawn_task(self.name.to_string(), |token| async move {
                    token.cancelled().await;
                    stopped.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }

        fn name(&self) -> &'static str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }
    }

    #[tokio::test]
    async fn async_provider_as_trait_object() {
        let providers: Vec<Box<dyn AsyncProvider<u16> + Send + Sync>> =
            vec![Box::new(FixedProvider(5)), Box::new(BrokenProvider)];

        assert_eq!(assert_ok!(providers[0].provide().await), 5);
        let error = assert_err!(providers[1].provide().await);
        assert!(error.to_string().contains("board registry"));
    }

    #[tokio::test]
    async fn service_provider_defaults() {
        struct Bare;

        #[async_trait]
        impl ServiceProvider for Bare {
            async fn start(&self, _task_manager: &mut TaskManager) -> Result<()> {
                Ok(())
            }

            fn name(&self) -> &'static str {
                "Bare"
            }
        }

        assert_eq!(Bare.priority(), 0);
        assert!(!Bare.is_critical());
    }

    #[tokio::test]
    async fn started_services_stop_on_shutdown() {
        let service = StubService::new("Poller", 4);
        let stopped = service.stopped.clone();
        let mut task_manager = TaskManager::new();

        assert_ok!(service.start(&mut task_manager).await);
        assert!(task_manager.is_running("Poller"));
        assert!(!stopped.load(Ordering::SeqCst));

        assert_ok!(task_manager.shutdown_all().await);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_start_spawns_nothing() {
        let mut service = StubService::new("Broken", 1);
        service.fail = true;
        let mut task_manager = TaskManager::new();

        assert_err!(service.start(&mut task_manager).await);
        assert_eq!(task_manager.active_count(), 0);
    }

    #[tokio::test]
    async fn sorting_by_priority_puts_highest_first() {
        let mut services: Vec<Box<dyn ServiceProvider>> = vec![
            Box::new(StubService::new("Low", 1)),
            Box::new(StubService::new("High", 9)),
            Box::new(StubService::new("Mid", 5)),
        ];
        services.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        let names: Vec<_> = services.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["High", "Mid", "Low"]);
    }
}
