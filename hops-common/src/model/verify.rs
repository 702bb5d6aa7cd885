// hops-common/src/model/verify.rs
//! Declarative smoke tests: commands to run and auxiliary services to manage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifySpec {
    /// Overall limit for the procedure; the configured default applies otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub actions: Vec<VerifyAction>,
}

impl VerifySpec {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerifyAction {
    /// Run a command and compare its exit status (and optionally its output).
    Run {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
        #[serde(default)]
        expect_exit: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect_output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// Bring up an auxiliary service for the remaining actions.
    Service(ServiceSpec),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Detects an instance that is already running; such an instance is
    /// used as is and never stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detect: Option<Probe>,
    pub start: ServiceStart,
    #[serde(default)]
    pub readiness: Readiness,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Probe {
    PathExists(String),
    Command(CommandTemplate),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ServiceStart {
    /// A child process owned by the runner, stopped by killing it.
    Spawn(CommandTemplate),
    /// A service controlled through start and stop commands.
    Managed {
        start: CommandTemplate,
        stop: CommandTemplate,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<Probe>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    250
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            delay_ms: None,
            probe: None,
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_and_service_actions() {
        let spec: VerifySpec = serde_json::from_str(
            r#"{
              "actions": [
                {"type": "run", "command": "{bin}/Rscript", "args": ["-e", "print(1+1)"], "expect_output": "2"},
                {"type": "service", "name": "postgres",
                 "detect": {"path_exists": "{testpath}/data/postmaster.pid"},
                 "start": {"mode": "managed",
                           "start": {"command": "pg_ctl", "args": ["start"]},
                           "stop": {"command": "pg_ctl", "args": ["stop"]}},
                 "readiness": {"delay_ms": 2000}}
              ]
            }"#,
        )
        .unwrap();
        assert_eq!(spec.actions.len(), 2);
        match &spec.actions[0] {
            VerifyAction::Run {
                command,
                expect_exit,
                ..
            } => {
                assert_eq!(command, "{bin}/Rscript");
                assert_eq!(*expect_exit, 0);
            }
            other => panic!("unexpected action {other:?}"),
        }
        match &spec.actions[1] {
            VerifyAction::Service(svc) => {
                assert!(matches!(svc.start, ServiceStart::Managed { .. }));
                assert_eq!(svc.readiness.delay_ms, Some(2000));
                assert_eq!(svc.readiness.timeout_ms, 30_000);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }
}
