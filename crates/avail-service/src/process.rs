//! Action plugin contract and the launcher seam.
//!
//! A plugin is invoked as `<plugin> <action> [params]`. Exit code 0 is
//! success; the negative sentinels below are reported by the launcher or
//! by the plugin itself and are distinct from an ordinary failure code.

use std::collections::HashMap;
use std::sync::Mutex;

use avail_core::{AvailError, AvailResult, ServiceActionResult};
use avail_state::ServiceActionDef;

/// Child died from a signal or could not be waited on.
pub const EXIT_PROCESS_FAILED: i32 = -65533;
/// Plugin detected its own timeout.
pub const EXIT_PLUGIN_TIMEOUT: i32 = -65534;
/// Plugin detected a failure.
pub const EXIT_PLUGIN_FAILURE: i32 = -65535;
/// Plugin asks for success regardless of outcome.
pub const EXIT_FORCE_SUCCESS: i32 = -65536;

/// A child process to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Short label for logs (`<service>:<action>` or `<group>:notify`).
    pub label: String,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            label: label.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Starts and kills child processes. Spawning must return immediately; the
/// exit status arrives later through the engine as `(pid, code)`.
pub trait ProcessLauncher {
    fn spawn(&self, spec: &ProcessSpec) -> AvailResult<u32>;
    fn kill(&self, pid: u32);
}

/// Map a plugin exit code to an action result.
pub fn classify_exit(def: &ServiceActionDef, code: i32) -> ServiceActionResult {
    match code {
        0 | EXIT_FORCE_SUCCESS => ServiceActionResult::Success,
        EXIT_PLUGIN_TIMEOUT => ServiceActionResult::Timeout,
        EXIT_PLUGIN_FAILURE | EXIT_PROCESS_FAILED => ServiceActionResult::Failed,
        other => def.mapped_result(other).unwrap_or(ServiceActionResult::Failed),
    }
}

/// Launcher that records what it was asked to do without running anything.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    inner: Mutex<Recorded>,
}

#[derive(Debug, Default)]
struct Recorded {
    next_pid: u32,
    spawned: Vec<(u32, ProcessSpec)>,
    killed: Vec<u32>,
    fail_next: usize,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` spawns fail.
    pub fn fail_next(&self, n: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_next = n;
        }
    }

    pub fn spawned(&self) -> Vec<(u32, ProcessSpec)> {
        self.inner.lock().map(|i| i.spawned.clone()).unwrap_or_default()
    }

    /// Most recent pid spawned for a label.
    pub fn pid_of(&self, label: &str) -> Option<u32> {
        self.inner.lock().ok().and_then(|i| {
            i.spawned
                .iter()
                .rev()
                .find(|(_, spec)| spec.label == label)
                .map(|(pid, _)| *pid)
        })
    }

    /// Spawn counts per label.
    pub fn counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        if let Ok(inner) = self.inner.lock() {
            for (_, spec) in &inner.spawned {
                *counts.entry(spec.label.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn killed(&self) -> Vec<u32> {
        self.inner.lock().map(|i| i.killed.clone()).unwrap_or_default()
    }
}

impl ProcessLauncher for RecordingLauncher {
    fn spawn(&self, spec: &ProcessSpec) -> AvailResult<u32> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| AvailError::failed("launcher lock poisoned"))?;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(AvailError::failed(format!(
                "spawn {} refused",
                spec.label
            )));
        }
        inner.next_pid += 1;
        let pid = 1000 + inner.next_pid;
        inner.spawned.push((pid, spec.clone()));
        Ok(pid)
    }

    fn kill(&self, pid: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.killed.push(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avail_core::config::ExitCodeMapping;
    use avail_core::ServiceAction;

    fn def() -> ServiceActionDef {
        ServiceActionDef {
            action: ServiceAction::Enable,
            plugin: "/usr/lib/ocf/resource.d/haproxy".into(),
            params: Vec::new(),
            timeout_secs: 10,
            interval_secs: 0,
            max_failure_retries: 2,
            max_timeout_retries: 1,
            max_total_retries: 10,
            results: vec![ExitCodeMapping {
                code: 7,
                result: ServiceActionResult::Fatal,
            }],
        }
    }

    #[test]
    fn sentinels_map_to_results() {
        let d = def();
        assert_eq!(classify_exit(&d, 0), ServiceActionResult::Success);
        assert_eq!(classify_exit(&d, EXIT_FORCE_SUCCESS), ServiceActionResult::Success);
        assert_eq!(classify_exit(&d, EXIT_PLUGIN_TIMEOUT), ServiceActionResult::Timeout);
        assert_eq!(classify_exit(&d, EXIT_PLUGIN_FAILURE), ServiceActionResult::Failed);
        assert_eq!(classify_exit(&d, EXIT_PROCESS_FAILED), ServiceActionResult::Failed);
        assert_eq!(classify_exit(&d, 7), ServiceActionResult::Fatal);
        assert_eq!(classify_exit(&d, 1), ServiceActionResult::Failed);
    }

    #[test]
    fn recording_launcher_hands_out_pids() {
        let launcher = RecordingLauncher::new();
        let a = launcher.spawn(&ProcessSpec::new("/bin/true", "a")).unwrap();
        launcher.fail_next(1);
        assert!(launcher.spawn(&ProcessSpec::new("/bin/true", "b")).is_err());
        let b = launcher.spawn(&ProcessSpec::new("/bin/true", "b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(launcher.pid_of("b"), Some(b));
        launcher.kill(a);
        assert_eq!(launcher.killed(), vec![a]);
    }
}
