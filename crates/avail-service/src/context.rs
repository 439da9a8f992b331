//! What the service and group state machines are handed on every call.

use std::path::PathBuf;
use std::time::Duration;

use avail_core::config::{PathsConfig, TimersConfig};
use avail_core::{AvailConfig, TimerRegistry};
use avail_state::Tables;

use crate::process::ProcessLauncher;

/// Timer tags owned by this crate. The daemon wraps them in its own tag
/// enum; each FSM only needs `T: From<ServiceTimer>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceTimer {
    /// Running action exceeded its `timeout_secs`.
    Action(String),
    /// Periodic audit of an enabled or disabled service.
    Audit(String),
    /// Overall enabling deadline, or the throttle retry tick.
    State(String),
    FailCountdown(String),
    GroupTransition(String),
    Notification(String),
}

/// Tunables both state machines read.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub enabling_timeout: Duration,
    pub throttle_retry: Duration,
    pub max_concurrent_enables: usize,
    pub fail_countdown_interval: Duration,
    pub group_transition_timeout: Duration,
    pub notification_timeout: Duration,
    pub notification_max_retries: u32,
    pub notification_script: Option<PathBuf>,
}

impl ServiceSettings {
    pub fn from_config(config: &AvailConfig) -> Self {
        Self::from_parts(&config.timers, &config.paths)
    }

    pub fn from_parts(timers: &TimersConfig, paths: &PathsConfig) -> Self {
        Self {
            enabling_timeout: timers.enabling_timeout(),
            throttle_retry: Duration::from_millis(250),
            max_concurrent_enables: timers.max_concurrent_enables,
            fail_countdown_interval: timers.fail_countdown_interval(),
            group_transition_timeout: timers.group_transition_timeout(),
            notification_timeout: timers.notification_timeout(),
            notification_max_retries: timers.notification_max_retries,
            notification_script: paths.notification_script.clone(),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_parts(&TimersConfig::default(), &PathsConfig::default())
    }
}

pub struct ServiceContext<'a, T> {
    pub tables: &'a mut Tables,
    pub timers: &'a mut TimerRegistry<T>,
    pub launcher: &'a dyn ProcessLauncher,
    pub settings: &'a ServiceSettings,
}

impl<'a, T> ServiceContext<'a, T> {
    pub fn new(
        tables: &'a mut Tables,
        timers: &'a mut TimerRegistry<T>,
        launcher: &'a dyn ProcessLauncher,
        settings: &'a ServiceSettings,
    ) -> Self {
        Self {
            tables,
            timers,
            launcher,
            settings,
        }
    }
}
