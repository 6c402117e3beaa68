//! Per-attempt configuration and identity.
//!
//! The host framework hands over a string mapping (`JobConf`); it is
//! resolved exactly once at task start into an immutable [`TaskContext`].
//! The environment variable override for the worker command is read at
//! resolution time, never re-read later.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::Command;
use crate::stage;

/// Configuration keys understood in the host-supplied mapping.
pub const CONF_COMMAND: &str = "piplet_command";
pub const CONF_SEND_KEYS: &str = "piplet_send_keys";
pub const CONF_COPY_FILE: &str = "piplet_copy_file";
pub const CONF_COPY_DEST: &str = "piplet_copy_dest";
pub const CONF_INPUT_FILE: &str = "piplet_input_file";

/// Environment override for the worker command, taking precedence over
/// [`CONF_COMMAND`].
pub const ENV_COMMAND: &str = "PIPLET_COMMAND";

/// Environment handed to the spawned worker.
pub const ENV_JOB_ID: &str = "PIPLET_JOB_ID";
pub const ENV_TASK_ID: &str = "PIPLET_TASK_ID";
pub const ENV_KEYED: &str = "PIPLET_KEYED";
pub const ENV_INPUT_FILE: &str = "PIPLET_INPUT_FILE";
pub const ENV_STAGE_DIR: &str = "PIPLET_STAGE_DIR";

/// Host-supplied job configuration mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobConf(HashMap<String, String>);

impl JobConf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Map,
    Reduce,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Map => "map",
            TaskKind::Reduce => "reduce",
        }
    }
}

/// Whether records are forwarded as key+value frame pairs or value frames
/// only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyMode {
    #[default]
    Pairs,
    ValuesOnly,
}

/// Immutable per-attempt context, resolved once from the job configuration.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: String,
    pub task_id: String,
    pub kind: TaskKind,
    pub key_mode: KeyMode,
    pub copy_output: bool,
    pub copy_dest: Option<PathBuf>,
    pub command: Option<String>,
    pub input_file: Option<String>,
}

impl TaskContext {
    /// Resolve the context for one attempt. A missing worker command is a
    /// warning, not an error: the attempt runs without a worker.
    pub fn resolve(
        job_id: impl Into<String>,
        task_id: impl Into<String>,
        kind: TaskKind,
        conf: &JobConf,
    ) -> Self {
        Self::resolve_from(std::env::var(ENV_COMMAND).ok(), job_id, task_id, kind, conf)
    }

    fn resolve_from(
        env_command: Option<String>,
        job_id: impl Into<String>,
        task_id: impl Into<String>,
        kind: TaskKind,
        conf: &JobConf,
    ) -> Self {
        let command = env_command
            .filter(|c| !c.trim().is_empty())
            .or_else(|| conf.get(CONF_COMMAND).map(str::to_owned));
        if command.is_none() {
            tracing::warn!("no worker command configured; task will run without a worker");
        }

        // Missing flags fall back to the permissive defaults: pairs mode,
        // no copy-out.
        let key_mode = match conf.get(CONF_SEND_KEYS) {
            Some("0") => KeyMode::ValuesOnly,
            _ => KeyMode::Pairs,
        };
        let copy_output = conf.get(CONF_COPY_FILE).is_some_and(|v| v == "TRUE");

        Self {
            job_id: job_id.into(),
            task_id: task_id.into(),
            kind,
            key_mode,
            copy_output,
            copy_dest: conf.get(CONF_COPY_DEST).map(PathBuf::from),
            command,
            input_file: conf.get(CONF_INPUT_FILE).map(str::to_owned),
        }
    }

    pub fn setup_command(&self) -> Command {
        match self.kind {
            TaskKind::Map => Command::SetupMap,
            TaskKind::Reduce => Command::SetupReduce,
        }
    }

    pub fn cleanup_command(&self) -> Command {
        match self.kind {
            TaskKind::Map => Command::CleanupMap,
            TaskKind::Reduce => Command::CleanupReduce,
        }
    }

    /// Environment handed to the spawned worker.
    pub fn worker_env(&self) -> Vec<(String, String)> {
        let keyed = match self.key_mode {
            KeyMode::Pairs => "1",
            KeyMode::ValuesOnly => "0",
        };
        let mut env = vec![
            (ENV_JOB_ID.to_string(), self.job_id.clone()),
            (ENV_TASK_ID.to_string(), self.task_id.clone()),
            (ENV_KEYED.to_string(), keyed.to_string()),
        ];
        if let Some(input) = &self.input_file {
            env.push((ENV_INPUT_FILE.to_string(), input.clone()));
        }
        if self.copy_output {
            let dir = stage::staging_dir(&self.task_id);
            env.push((ENV_STAGE_DIR.to_string(), dir.display().to_string()));
        }
        env
    }
}
