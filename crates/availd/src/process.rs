//! Plugin processes on the tokio runtime.
//!
//! Each spawned child gets a reaper task that waits for it and posts the
//! exit back to the engine as [`EngineEvent::ProcessExit`]. A killed child
//! is reaped silently; the engine has already moved on from it.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use avail_core::{AvailError, AvailResult};
use avail_service::{ProcessLauncher, ProcessSpec, EXIT_PROCESS_FAILED};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::engine::EngineEvent;

type KillSwitches = Arc<Mutex<HashMap<u32, oneshot::Sender<()>>>>;

pub struct TokioLauncher {
    handle: Handle,
    events: mpsc::UnboundedSender<EngineEvent>,
    children: KillSwitches,
}

impl TokioLauncher {
    pub fn new(handle: Handle, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            handle,
            events,
            children: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn running(&self) -> usize {
        match self.children.lock() {
            Ok(children) => children.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl ProcessLauncher for TokioLauncher {
    fn spawn(&self, spec: &ProcessSpec) -> AvailResult<u32> {
        let _runtime = self.handle.enter();
        let mut child = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AvailError::failed(format!("spawn {} ({}): {e}", spec.label, spec.program)))?;
        let pid = child
            .id()
            .ok_or_else(|| AvailError::failed(format!("{} exited before it was tracked", spec.label)))?;

        let (kill_tx, kill_rx) = oneshot::channel();
        self.children
            .lock()
            .map_err(|_| AvailError::failed("child table poisoned"))?
            .insert(pid, kill_tx);
        debug!(pid, label = %spec.label, "plugin started");

        let events = self.events.clone();
        let children = Arc::clone(&self.children);
        let label = spec.label.clone();
        self.handle.spawn(async move {
            let code = tokio::select! {
                status = child.wait() => Some(match status {
                    Ok(status) => exit_code(status),
                    Err(e) => {
                        warn!(pid, %label, error = %e, "wait failed");
                        EXIT_PROCESS_FAILED
                    }
                }),
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(pid, %label, error = %e, "kill failed");
                    }
                    None
                }
            };
            if let Ok(mut children) = children.lock() {
                children.remove(&pid);
            }
            if let Some(code) = code {
                debug!(pid, %label, code, "plugin exited");
                // The receiver is gone only during shutdown.
                let _ = events.send(EngineEvent::ProcessExit { pid, code });
            }
        });
        Ok(pid)
    }

    fn kill(&self, pid: u32) {
        let switch = self.children.lock().ok().and_then(|mut c| c.remove(&pid));
        match switch {
            Some(tx) => {
                let _ = tx.send(());
                debug!(pid, "plugin killed");
            }
            None => debug!(pid, "kill of an unknown pid"),
        }
    }
}

/// Children killed by a signal report [`EXIT_PROCESS_FAILED`].
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(EXIT_PROCESS_FAILED)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn exit_codes_are_posted_back() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let launcher = TokioLauncher::new(Handle::current(), tx);
        let spec = ProcessSpec::new("/bin/sh", "probe:enable").arg("-c").arg("exit 3");
        let pid = launcher.spawn(&spec).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            EngineEvent::ProcessExit { pid: got, code } => {
                assert_eq!(got, pid);
                assert_eq!(code, 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn killed_children_are_not_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let launcher = TokioLauncher::new(Handle::current(), tx);
        let pid = launcher
            .spawn(&ProcessSpec::new("/bin/sleep", "slow:enable").arg("30"))
            .unwrap();
        launcher.kill(pid);

        let waited = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(waited.is_err());
        assert_eq!(launcher.running(), 0);
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let launcher = TokioLauncher::new(Handle::current(), tx);
        let err = launcher
            .spawn(&ProcessSpec::new("/nonexistent/plugin", "gone:enable"))
            .unwrap_err();
        assert!(err.to_string().contains("gone:enable"));
    }
}
