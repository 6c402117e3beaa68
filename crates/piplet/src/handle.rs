//! Worker subprocess ownership: spawn, framed writes, output drains.
//!
//! The handle owns the child and all three pipes. The driving task is the
//! only writer; two background drains consume stdout (result frames) and
//! stderr (diagnostics). Drains never kill the subprocess — on any error
//! they latch the fault monitor and stop, leaving teardown to the driver.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command as ProcessCommand};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::bridge::codec::RecordCodec;
use crate::bridge::protocol::{Command, FATAL_MARKER, Frame, Record};
use crate::config::KeyMode;
use crate::fault::{FaultMonitor, TaskError};

/// Diagnostic lines longer than this indicate a worker writing garbage to
/// stderr, not diagnostics.
const MAX_DIAG_LINE: usize = 1024 * 1024;

/// Sink for result values decoded off the worker's stdout, delivered in
/// arrival order.
#[async_trait]
pub trait ResultSink: Send + 'static {
    async fn put(&mut self, value: Bytes) -> io::Result<()>;
}

#[async_trait]
impl ResultSink for tokio::sync::mpsc::Sender<Bytes> {
    async fn put(&mut self, value: Bytes) -> io::Result<()> {
        self.send(value)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "result receiver dropped"))
    }
}

/// Resolved spawn request: the command string and the environment the worker
/// runs with.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec) -> Result<Child, SpawnError>;
}

/// Default spawner: runs the configured command string through `sh -c` with
/// all three stdio pipes captured.
pub struct ShellSpawner;

impl WorkerSpawner for ShellSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> Result<Child, SpawnError> {
        let mut cmd = ProcessCommand::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        Ok(cmd.spawn()?)
    }
}

/// One worker session: the subprocess, its framed input pipe, and the two
/// drain tasks.
pub struct WorkerHandle {
    child: Child,
    stdin: Option<FramedWrite<ChildStdin, RecordCodec>>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    stdout_drain: Option<JoinHandle<()>>,
    stderr_drain: Option<JoinHandle<()>>,
    monitor: FaultMonitor,
    exit: Option<std::process::ExitStatus>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("exit", &self.exit)
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    pub fn start(
        spec: &SpawnSpec,
        spawner: &dyn WorkerSpawner,
        monitor: FaultMonitor,
    ) -> Result<Self, TaskError> {
        let mut child = spawner
            .spawn(spec)
            .map_err(|e| TaskError::Launch(e.to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TaskError::Launch("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskError::Launch("worker stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TaskError::Launch("worker stderr not captured".into()))?;

        tracing::debug!(command = %spec.command, "worker spawned");
        Ok(Self {
            child,
            stdin: Some(FramedWrite::new(stdin, RecordCodec::new())),
            stdout: Some(stdout),
            stderr: Some(stderr),
            stdout_drain: None,
            stderr_drain: None,
            monitor,
            exit: None,
        })
    }

    /// Spawn the stdout and stderr drain tasks.
    ///
    /// The stdout drain decodes result frames and delivers them to `sink`
    /// until end-of-stream or a fault. The stderr drain forwards diagnostic
    /// lines to the log and watches for the fatal marker.
    pub fn spawn_drains(&mut self, mut sink: Box<dyn ResultSink>) {
        if let Some(stdout) = self.stdout.take() {
            let monitor = self.monitor.clone();
            self.stdout_drain = Some(tokio::spawn(async move {
                let mut frames = FramedRead::new(stdout, RecordCodec::new());
                while let Some(next) = frames.next().await {
                    match next {
                        Ok(Frame::Data(value)) => {
                            if let Err(e) = sink.put(value).await {
                                monitor.set(TaskError::Write(format!(
                                    "result sink rejected record: {e}"
                                )));
                                break;
                            }
                        }
                        Ok(Frame::Command(cmd)) => {
                            monitor.set(TaskError::MalformedFrame(format!(
                                "unexpected {cmd:?} marker on worker stdout"
                            )));
                            break;
                        }
                        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                            monitor.set(TaskError::MalformedFrame(e.to_string()));
                            break;
                        }
                        Err(e) => {
                            monitor.set(TaskError::worker(
                                format!("worker stdout read failed: {e}"),
                                None,
                            ));
                            break;
                        }
                    }
                }
                tracing::trace!("stdout drain exiting");
            }));
        }

        if let Some(stderr) = self.stderr.take() {
            let monitor = self.monitor.clone();
            self.stderr_drain = Some(tokio::spawn(async move {
                let mut lines =
                    FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_DIAG_LINE));
                while let Some(next) = lines.next().await {
                    match next {
                        Ok(line) => {
                            if let Some(reason) = line.strip_prefix(FATAL_MARKER) {
                                tracing::error!(target: "piplet::worker", "{}", line);
                                monitor.set(TaskError::worker(reason.trim(), None));
                            } else if !line.trim().is_empty() {
                                tracing::info!(target: "piplet::worker", "{}", line);
                            }
                        }
                        Err(e) => {
                            monitor.set(TaskError::worker(
                                format!("worker stderr read failed: {e}"),
                                None,
                            ));
                            break;
                        }
                    }
                }
                tracing::trace!("stderr drain exiting");
            }));
        }
    }

    pub async fn write_command(&mut self, command: Command) -> Result<(), TaskError> {
        self.write_frame(Frame::Command(command)).await
    }

    /// Forward one record. In pairs mode the record becomes two frames (key
    /// then value, a missing key becoming an empty frame); in values-only
    /// mode a single value frame.
    pub async fn write_record(&mut self, record: &Record, mode: KeyMode) -> Result<(), TaskError> {
        if mode == KeyMode::Pairs {
            let key = record.key.clone().unwrap_or_else(Bytes::new);
            self.write_frame(Frame::Data(key)).await?;
        }
        self.write_frame(Frame::Data(record.value.clone())).await
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), TaskError> {
        let Some(writer) = self.stdin.as_mut() else {
            return Err(TaskError::Write("worker input pipe already closed".into()));
        };
        writer
            .send(frame)
            .await
            .map_err(|e| TaskError::Write(e.to_string()))
    }

    /// Worker exit code once the process has been reaped; `None` before.
    pub fn exit_value(&self) -> Option<i32> {
        self.exit.and_then(|status| status.code())
    }

    /// Close the input pipe, join both drains, reap the child. An abnormal
    /// exit latches a worker fault. Safe to call more than once.
    pub async fn finish(&mut self) -> Option<i32> {
        if let Some(mut writer) = self.stdin.take() {
            if let Err(e) = writer.close().await {
                tracing::debug!(error = %e, "closing worker stdin failed");
            }
        }
        if let Some(drain) = self.stdout_drain.take() {
            let _ = drain.await;
        }
        if let Some(drain) = self.stderr_drain.take() {
            let _ = drain.await;
        }
        if self.exit.is_none() {
            match self.child.wait().await {
                Ok(status) => {
                    if !status.success() {
                        self.monitor.set(TaskError::worker(
                            format!("worker exited abnormally: {status}"),
                            status.code(),
                        ));
                    }
                    self.exit = Some(status);
                }
                Err(e) => {
                    self.monitor
                        .set(TaskError::worker(format!("failed to reap worker: {e}"), None));
                }
            }
        }
        self.exit_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(command: &str, monitor: FaultMonitor) -> WorkerHandle {
        let spec = SpawnSpec {
            command: command.to_string(),
            env: Vec::new(),
        };
        WorkerHandle::start(&spec, &ShellSpawner, monitor).unwrap()
    }

    fn sink() -> (Box<dyn ResultSink>, tokio::sync::mpsc::Receiver<Bytes>) {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        (Box::new(tx), rx)
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        let spec = SpawnSpec {
            command: "true".to_string(),
            env: Vec::new(),
        };
        struct Failing;
        impl WorkerSpawner for Failing {
            fn spawn(&self, _spec: &SpawnSpec) -> Result<Child, SpawnError> {
                Err(SpawnError::Other("no such executable".into()))
            }
        }
        let err = WorkerHandle::start(&spec, &Failing, FaultMonitor::new()).unwrap_err();
        assert!(matches!(err, TaskError::Launch(_)));
    }

    #[tokio::test]
    async fn cat_worker_echoes_frames_in_order() {
        let monitor = FaultMonitor::new();
        let mut worker = start("cat", monitor.clone());
        let (sink, mut rx) = sink();
        worker.spawn_drains(sink);

        for value in ["v1", "v2", "v3"] {
            worker
                .write_record(&Record::unkeyed(value), KeyMode::ValuesOnly)
                .await
                .unwrap();
        }
        let exit = worker.finish().await;

        assert_eq!(exit, Some(0));
        assert!(monitor.checkpoint().is_ok());
        let mut values = Vec::new();
        while let Some(v) = rx.recv().await {
            values.push(v);
        }
        assert_eq!(values, vec![Bytes::from("v1"), Bytes::from("v2"), Bytes::from("v3")]);
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let monitor = FaultMonitor::new();
        let mut worker = start("cat > /dev/null", monitor.clone());
        let (sink, _rx) = sink();
        worker.spawn_drains(sink);

        assert_eq!(worker.exit_value(), None);
        assert_eq!(worker.finish().await, Some(0));
        assert_eq!(worker.finish().await, Some(0));
        assert!(monitor.checkpoint().is_ok());
    }

    #[tokio::test]
    async fn write_after_finish_fails() {
        let monitor = FaultMonitor::new();
        let mut worker = start("cat > /dev/null", monitor);
        let (sink, _rx) = sink();
        worker.spawn_drains(sink);
        worker.finish().await;

        let err = worker
            .write_record(&Record::unkeyed("late"), KeyMode::ValuesOnly)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Write(_)));
    }

    #[tokio::test]
    async fn fatal_marker_latches_worker_fault() {
        let monitor = FaultMonitor::new();
        let mut worker = start("echo 'PIPLET-FATAL: interpreter panicked' 1>&2; exit 1", monitor.clone());
        let (sink, _rx) = sink();
        worker.spawn_drains(sink);
        worker.finish().await;

        match monitor.first() {
            Some(TaskError::Worker { reason, .. }) => {
                assert_eq!(reason, "interpreter panicked");
            }
            other => panic!("expected worker fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn abnormal_exit_latches_worker_fault_with_code() {
        let monitor = FaultMonitor::new();
        let mut worker = start("exit 7", monitor.clone());
        let (sink, _rx) = sink();
        worker.spawn_drains(sink);
        assert_eq!(worker.finish().await, Some(7));

        match monitor.first() {
            Some(err @ TaskError::Worker { .. }) => assert_eq!(err.exit_status(), Some(7)),
            other => panic!("expected worker fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_on_stdout_is_malformed() {
        let monitor = FaultMonitor::new();
        // FF FF FF 80 is the prefix -128: negative but not a known opcode.
        let mut worker = start("printf '\\377\\377\\377\\200'", monitor.clone());
        let (sink, _rx) = sink();
        worker.spawn_drains(sink);
        worker.finish().await;

        assert!(matches!(monitor.first(), Some(TaskError::MalformedFrame(_))));
    }

    #[tokio::test]
    async fn pairs_mode_writes_key_then_value() {
        let monitor = FaultMonitor::new();
        let mut worker = start("cat", monitor.clone());
        let (sink, mut rx) = sink();
        worker.spawn_drains(sink);

        worker
            .write_record(&Record::keyed("k1", "v1"), KeyMode::Pairs)
            .await
            .unwrap();
        worker.finish().await;

        // cat echoes both frames of the pair back verbatim.
        let mut values = Vec::new();
        while let Some(v) = rx.recv().await {
            values.push(v);
        }
        assert_eq!(values, vec![Bytes::from("k1"), Bytes::from("v1")]);
        assert!(monitor.checkpoint().is_ok());
    }
}
