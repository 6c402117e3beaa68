//! Task lifecycle state machine.
//!
//! One driver per task attempt. The driver resolves nothing itself — it is
//! handed an immutable [`TaskContext`] — and owns the only write path to the
//! worker. Every loop iteration and every transition checkpoints the fault
//! monitor, so a fault latched by a background drain aborts the attempt
//! before the next record is written.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::bridge::protocol::{Command, Record};
use crate::config::{TaskContext, TaskKind};
use crate::fault::{FaultMonitor, TaskError};
use crate::handle::{ResultSink, ShellSpawner, SpawnSpec, WorkerHandle, WorkerSpawner};
use crate::stage;

/// Counter group receiving the per-attempt timing increment.
pub const TIMING_GROUP: &str = "piplet_timing";

/// Pull interface the host framework drives the task with. Exactly one pass
/// per attempt; `None` terminates the stream.
#[async_trait]
pub trait RecordSource: Send {
    async fn next_record(&mut self) -> Option<Record>;
}

/// Named counters supplied by the host framework.
pub trait Counters: Send + Sync {
    fn increment(&self, group: &str, name: &str, amount: u64);
}

/// Counter sink that just logs; hosts normally supply their own.
#[derive(Debug, Default)]
pub struct LogCounters;

impl Counters for LogCounters {
    fn increment(&self, group: &str, name: &str, amount: u64) {
        tracing::debug!(group, name, amount, "counter increment");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Setup,
    Streaming,
    Cleanup,
    Flush,
    Finished,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Aborted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Setup => "setup",
            TaskState::Streaming => "streaming",
            TaskState::Cleanup => "cleanup",
            TaskState::Flush => "flush",
            TaskState::Finished => "finished",
            TaskState::Aborted => "aborted",
        }
    }
}

/// Outcome of a completed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    /// Records pulled from the source and forwarded (or consumed in no-op
    /// mode).
    pub records: u64,
    /// Worker exit code, when a worker ran.
    pub exit: Option<i32>,
}

/// Drives one task attempt through
/// SETUP → STREAMING → CLEANUP → FLUSH → FINISHED.
pub struct TaskDriver {
    ctx: TaskContext,
    monitor: FaultMonitor,
    state: TaskState,
    worker: Option<WorkerHandle>,
    spawner: Arc<dyn WorkerSpawner>,
    counters: Arc<dyn Counters>,
}

impl TaskDriver {
    pub fn new(ctx: TaskContext) -> Self {
        Self {
            ctx,
            monitor: FaultMonitor::new(),
            state: TaskState::Created,
            worker: None,
            spawner: Arc::new(ShellSpawner),
            counters: Arc::new(LogCounters),
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_counters(mut self, counters: Arc<dyn Counters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// The attempt's fault monitor; external observers may latch faults into
    /// it (they lose to any earlier fault).
    pub fn monitor(&self) -> FaultMonitor {
        self.monitor.clone()
    }

    /// Run the attempt to completion. Consumes the driver: one attempt per
    /// driver, retries are the host scheduler's concern.
    ///
    /// Teardown always runs, even on the abort path, so the subprocess and
    /// its pipes are never leaked; no protocol traffic is attempted once a
    /// fault is latched.
    pub async fn run(
        mut self,
        source: &mut dyn RecordSource,
        sink: Box<dyn ResultSink>,
    ) -> Result<TaskReport, TaskError> {
        let started = Instant::now();
        let outcome = self.drive(source, sink).await;

        let exit = match self.worker.as_mut() {
            Some(worker) => worker.finish().await,
            None => None,
        };

        let name = match self.ctx.kind {
            TaskKind::Map => "overall_map_ms",
            TaskKind::Reduce => "overall_reduce_ms",
        };
        self.counters
            .increment(TIMING_GROUP, name, started.elapsed().as_millis() as u64);

        // The final checkpoint also surfaces faults latched after the last
        // in-stream check, including an abnormal exit seen by finish().
        match outcome.and_then(|records| self.monitor.checkpoint().map(|()| records)) {
            Ok(records) => {
                if self.ctx.copy_output {
                    if let Err(err) = self.copy_out() {
                        self.transition(TaskState::Aborted);
                        return Err(err);
                    }
                }
                self.transition(TaskState::Finished);
                Ok(TaskReport { records, exit })
            }
            Err(err) => {
                self.transition(TaskState::Aborted);
                tracing::error!(error = %err, ?exit, task_id = %self.ctx.task_id, "task attempt aborted");
                Err(err)
            }
        }
    }

    async fn drive(
        &mut self,
        source: &mut dyn RecordSource,
        sink: Box<dyn ResultSink>,
    ) -> Result<u64, TaskError> {
        self.setup(sink).await?;
        let records = self.stream(source).await?;
        self.cleanup().await?;
        Ok(records)
    }

    async fn setup(&mut self, sink: Box<dyn ResultSink>) -> Result<(), TaskError> {
        self.transition(TaskState::Setup);
        if let Some(command) = self.ctx.command.clone() {
            let spec = SpawnSpec {
                command,
                env: self.ctx.worker_env(),
            };
            let mut worker = WorkerHandle::start(&spec, self.spawner.as_ref(), self.monitor.clone())
                .map_err(|e| self.monitor.latch(e))?;
            worker.spawn_drains(sink);
            let wrote = worker.write_command(self.ctx.setup_command()).await;
            // Keep the handle either way so teardown reaps the subprocess.
            self.worker = Some(worker);
            if let Err(e) = wrote {
                return Err(self.monitor.latch(e));
            }
        } else {
            tracing::warn!(task_id = %self.ctx.task_id, "no worker command; streaming to a no-op worker");
        }
        self.monitor.checkpoint()
    }

    async fn stream(&mut self, source: &mut dyn RecordSource) -> Result<u64, TaskError> {
        self.transition(TaskState::Streaming);
        let mut records = 0u64;
        while let Some(record) = source.next_record().await {
            self.monitor.checkpoint()?;
            if let Some(worker) = self.worker.as_mut() {
                if let Err(e) = worker.write_record(&record, self.ctx.key_mode).await {
                    tracing::info!(exit = ?worker.exit_value(), "record write failed mid-stream");
                    return Err(self.monitor.latch(e));
                }
            }
            records += 1;
        }
        Ok(records)
    }

    async fn cleanup(&mut self) -> Result<(), TaskError> {
        self.transition(TaskState::Cleanup);
        self.monitor.checkpoint()?;
        if self.worker.is_some() {
            let cleanup_command = self.ctx.cleanup_command();
            if let Err(e) = self.worker.as_mut().unwrap().write_command(cleanup_command).await {
                return Err(self.monitor.latch(e));
            }
            self.transition(TaskState::Flush);
            if let Err(e) = self.worker.as_mut().unwrap().write_command(Command::Flush).await {
                return Err(self.monitor.latch(e));
            }
        } else {
            self.transition(TaskState::Flush);
        }
        self.monitor.checkpoint()
    }

    fn copy_out(&self) -> Result<(), TaskError> {
        let Some(dest) = self.ctx.copy_dest.as_deref() else {
            tracing::warn!("copy flag set but no copy destination configured; skipping copy-out");
            return Ok(());
        };
        match stage::copy_staged(&self.ctx.task_id, dest) {
            Ok(copied) => {
                if copied > 0 {
                    tracing::info!(copied, dest = %dest.display(), "staged files copied out");
                }
                Ok(())
            }
            Err(e) => Err(TaskError::Write(format!("copy-out failed: {e}"))),
        }
    }

    fn transition(&mut self, next: TaskState) {
        tracing::debug!(
            from = self.state.as_str(),
            to = next.as_str(),
            task_id = %self.ctx.task_id,
            "task state"
        );
        self.state = next;
    }
}
