//! Executor that runs `[Service] ExecStart=` as a child process.
//!
//! Enough of an init system to run the daemon on a plain host: one child
//! per started unit, killed on stop, unload, or drop.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use armada_core::{UnitFile, UnitState};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::*;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct ProcessUnit {
    argv: Vec<String>,
    hash: String,
    child: Option<Child>,
    /// Exit status of the last child, if it ended.
    exited: Option<bool>,
}

impl ProcessUnit {
    /// Reap the child if it has exited.
    fn poll(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(?status, "unit process exited");
                self.exited = Some(status.success());
                self.child = None;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "could not poll unit process"),
        }
    }
}

/// Split `ExecStart=` into argv. Leading `-`, `@` and `+` prefixes are
/// dropped.
fn parse_exec_start(value: &str) -> Vec<String> {
    let value = value.trim_start_matches(['-', '@', '+']);
    value.split_whitespace().map(str::to_string).collect()
}

#[derive(Default)]
pub struct ProcessExecutor {
    units: Mutex<BTreeMap<String, ProcessUnit>>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    async fn kill(name: &str, mut child: Child) -> ExecutorResult<()> {
        child.start_kill()?;
        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(unit = %name, ?status, "unit process stopped");
                Ok(())
            }
            Err(_) => Err(ExecutorError::Failed {
                op: "stop",
                unit: name.to_string(),
                reason: format!("process did not exit within {STOP_TIMEOUT:?}"),
            }),
        }
    }
}

#[async_trait]
impl UnitExecutor for ProcessExecutor {
    async fn load(&self, name: &str, unit: &UnitFile) -> ExecutorResult<()> {
        let argv = unit
            .values("Service", "ExecStart")
            .last()
            .map(parse_exec_start)
            .unwrap_or_default();
        if argv.is_empty() {
            return Err(ExecutorError::Invalid {
                unit: name.to_string(),
                reason: "no [Service] ExecStart".into(),
            });
        }

        let mut units = self.units.lock().await;
        let previous = units.insert(
            name.to_string(),
            ProcessUnit {
                argv,
                hash: unit.hash(),
                child: None,
                exited: None,
            },
        );
        drop(units);
        if let Some(child) = previous.and_then(|p| p.child) {
            Self::kill(name, child).await?;
        }
        Ok(())
    }

    async fn unload(&self, name: &str) -> ExecutorResult<()> {
        let removed = self.units.lock().await.remove(name);
        if let Some(child) = removed.and_then(|u| u.child) {
            Self::kill(name, child).await?;
        }
        Ok(())
    }

    async fn start(&self, name: &str) -> ExecutorResult<()> {
        let mut units = self.units.lock().await;
        let unit = units
            .get_mut(name)
            .ok_or_else(|| ExecutorError::NotLoaded(name.to_string()))?;
        unit.poll();
        if unit.child.is_some() {
            return Ok(());
        }

        let child = Command::new(&unit.argv[0])
            .args(&unit.argv[1..])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::Failed {
                op: "start",
                unit: name.to_string(),
                reason: e.to_string(),
            })?;
        info!(unit = %name, pid = ?child.id(), "unit process started");
        unit.child = Some(child);
        unit.exited = None;
        Ok(())
    }

    async fn stop(&self, name: &str) -> ExecutorResult<()> {
        let child = {
            let mut units = self.units.lock().await;
            let unit = units
                .get_mut(name)
                .ok_or_else(|| ExecutorError::NotLoaded(name.to_string()))?;
            unit.child.take()
        };
        match child {
            Some(child) => Self::kill(name, child).await,
            None => Ok(()),
        }
    }

    async fn units(&self) -> ExecutorResult<Vec<String>> {
        Ok(self.units.lock().await.keys().cloned().collect())
    }

    async fn unit_state(&self, name: &str) -> ExecutorResult<Option<UnitState>> {
        let mut units = self.units.lock().await;
        let Some(unit) = units.get_mut(name) else {
            return Ok(None);
        };
        unit.poll();
        let (active, sub) = match (&unit.child, unit.exited) {
            (Some(_), _) => (ACTIVE_ACTIVE, SUB_RUNNING),
            (None, Some(false)) => (ACTIVE_FAILED, SUB_FAILED),
            (None, _) => (ACTIVE_INACTIVE, SUB_DEAD),
        };
        let mut state = UnitState::new(name, LOAD_LOADED, active, sub);
        state.unit_hash = unit.hash.clone();
        Ok(Some(state))
    }

    async fn reload_unit_files(&self) -> ExecutorResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(exec: &str) -> UnitFile {
        UnitFile::parse(&format!("[Service]\nExecStart={exec}\n")).unwrap()
    }

    #[test]
    fn exec_start_prefixes_are_dropped() {
        assert_eq!(parse_exec_start("-/bin/sleep 30"), ["/bin/sleep", "30"]);
        assert_eq!(parse_exec_start("  "), Vec::<String>::new());
    }

    #[tokio::test]
    async fn load_requires_exec_start() {
        let exec = ProcessExecutor::new();
        let unit = UnitFile::parse("[Unit]\nDescription=nothing\n").unwrap();
        assert!(matches!(
            exec.load("a.service", &unit).await,
            Err(ExecutorError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn runs_and_stops_a_process() {
        let exec = ProcessExecutor::new();
        exec.load("sleep.service", &file("/bin/sleep 30")).await.unwrap();
        exec.start("sleep.service").await.unwrap();

        let state = exec.unit_state("sleep.service").await.unwrap().unwrap();
        assert_eq!(state.active_state, ACTIVE_ACTIVE);

        exec.stop("sleep.service").await.unwrap();
        let state = exec.unit_state("sleep.service").await.unwrap().unwrap();
        assert_eq!(state.active_state, ACTIVE_INACTIVE);

        exec.unload("sleep.service").await.unwrap();
        assert!(exec.units().await.unwrap().is_empty());
    }
}
