//! piplet: a per-task bridge between a record-oriented host framework and a
//! long-lived worker subprocess.
//!
//! The host side streams key/value records to the worker over its stdin as
//! length-prefixed frames, multiplexed with a small set of control markers,
//! while two background drains pull result frames and diagnostics back. A
//! first-error-wins fault monitor turns any asynchronous worker failure into
//! a synchronous abort of the record feed, so a worker crash is surfaced
//! before the host task can report success.

pub mod bridge;
mod config;
mod driver;
mod fault;
mod handle;
mod stage;
pub mod worker;

pub use bridge::codec::{MAX_FRAME_LEN, RecordCodec};
pub use bridge::protocol::{Command, FATAL_MARKER, Frame, Record};
pub use config::{
    CONF_COMMAND, CONF_COPY_DEST, CONF_COPY_FILE, CONF_INPUT_FILE, CONF_SEND_KEYS, ENV_COMMAND,
    ENV_INPUT_FILE, ENV_JOB_ID, ENV_KEYED, ENV_STAGE_DIR, ENV_TASK_ID, JobConf, KeyMode,
    TaskContext, TaskKind,
};
pub use driver::{
    Counters, LogCounters, RecordSource, TIMING_GROUP, TaskDriver, TaskReport, TaskState,
};
pub use fault::{FaultMonitor, TaskError};
pub use handle::{ResultSink, ShellSpawner, SpawnError, SpawnSpec, WorkerHandle, WorkerSpawner};
pub use stage::{copy_staged, staging_dir};
pub use worker::{OutputSender, RecordHandler, run_worker, run_worker_io};
