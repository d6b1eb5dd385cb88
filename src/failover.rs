//! Control authority failover between the remote supervisory system and
//! local strategies.
//!
//! Failing over needs `threshold` consecutive probe failures. Recovery is
//! immediate: one successful probe while local hands control back.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    #[default]
    Remote,
    Local,
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Authority::Remote => "REMOTE_ACTIVE",
            Authority::Local => "LOCAL_ACTIVE",
        })
    }
}

/// Remote health as seen by the last probe cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub authority: Authority,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    /// Round-trip time of the last successful probe.
    pub last_latency: Option<Duration>,
    pub last_error: Option<String>,
}

impl HealthStatus {
    /// Status of a process that has no remote authority configured.
    pub fn local_only() -> Self {
        Self {
            authority: Authority::Local,
            ..Self::default()
        }
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            authority: Authority::Remote,
            consecutive_failures: 0,
            last_success: None,
            last_latency: None,
            last_error: None,
        }
    }
}

/// Published on every authority change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityTransition {
    pub from: Authority,
    pub to: Authority,
    pub consecutive_failures: u32,
    pub at: DateTime<Utc>,
}

/// Health shared with readers; written only by the failover service.
pub type SharedHealth = Arc<RwLock<HealthStatus>>;

#[derive(Debug)]
pub struct FailoverMonitor {
    threshold: u32,
    status: HealthStatus,
}

impl FailoverMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            status: HealthStatus::default(),
        }
    }

    pub fn status(&self) -> &HealthStatus {
        &self.status
    }

    pub fn authority(&self) -> Authority {
        self.status.authority
    }

    /// Folds one probe outcome into the state machine.
    pub fn record_probe(
        &mut self,
        outcome: Result<Duration, ProbeError>,
    ) -> Option<AuthorityTransition> {
        let from = self.status.authority;
        match outcome {
            Ok(latency) => {
                self.status.consecutive_failures = 0;
                self.status.last_success = Some(Utc::now());
                self.status.last_latency = Some(latency);
                self.status.last_error = None;
                self.status.authority = Authority::Remote;
            }
            Err(e) => {
                self.status.consecutive_failures =
                    self.status.consecutive_failures.saturating_add(1);
                self.status.last_error = Some(e.to_string());
                warn!(
                    "Remote probe failed ({}/{}): {e}",
                    self.status.consecutive_failures, self.threshold
                );
                if self.status.consecutive_failures >= self.threshold {
                    self.status.authority = Authority::Local;
                }
            }
        }

        let to = self.status.authority;
        (from != to).then(|| {
            info!("Control authority {from} -> {to}");
            AuthorityTransition {
                from,
                to,
                consecutive_failures: self.status.consecutive_failures,
                at: Utc::now(),
            }
        })
    }
}
