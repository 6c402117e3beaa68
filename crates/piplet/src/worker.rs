//! Worker-side protocol loop.
//!
//! This is the child half of the bridge: it decodes the multiplexed
//! command/record stream from stdin, dispatches to a [`RecordHandler`], and
//! frames emitted values back onto stdout. The host side (spawning, drains,
//! lifecycle) is in `handle` and `driver`.
//!
//! A handler failure is reported through the stderr fatal marker before the
//! process exits non-zero, which the host's stderr drain converts into a
//! worker fault.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::RecordCodec;
use crate::bridge::protocol::{Command, FATAL_MARKER, Frame, Record};
use crate::config::{ENV_KEYED, TaskKind};

type SharedWriter = Arc<Mutex<FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, RecordCodec>>>;

/// Handle for emitting result values from inside a [`RecordHandler`].
///
/// Cloneable; emissions from one handler invocation are written in call
/// order.
#[derive(Clone)]
pub struct OutputSender {
    out: SharedWriter,
}

impl OutputSender {
    pub async fn emit(&self, value: impl Into<Bytes>) -> io::Result<()> {
        self.out.lock().await.send(Frame::Data(value.into())).await
    }
}

/// Per-record computation plugged into the worker loop.
#[async_trait]
pub trait RecordHandler: Send + 'static {
    async fn setup(&mut self, kind: TaskKind, out: &OutputSender) -> io::Result<()> {
        let _ = (kind, out);
        Ok(())
    }

    async fn process(&mut self, record: Record, out: &OutputSender) -> io::Result<()>;

    async fn cleanup(&mut self, kind: TaskKind, out: &OutputSender) -> io::Result<()> {
        let _ = (kind, out);
        Ok(())
    }
}

/// Run the worker loop over the process's stdin/stdout.
///
/// Key pairing follows the `PIPLET_KEYED` environment variable set by the
/// spawning side.
pub async fn run_worker<H: RecordHandler>(handler: H) -> io::Result<()> {
    let keyed = std::env::var(ENV_KEYED).map(|v| v != "0").unwrap_or(true);
    let result = run_worker_io(
        tokio::io::stdin(),
        Box::new(tokio::io::stdout()),
        handler,
        keyed,
    )
    .await;
    if let Err(ref e) = result {
        eprintln!("{FATAL_MARKER} {e}");
    }
    result
}

/// Worker loop over arbitrary streams; `run_worker` binds it to stdio.
///
/// In keyed mode data frames arrive as key/value pairs; an input that ends
/// on an unpaired key frame is malformed.
pub async fn run_worker_io<R, H>(
    input: R,
    output: Box<dyn AsyncWrite + Send + Unpin>,
    mut handler: H,
    keyed: bool,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    H: RecordHandler,
{
    let mut frames = FramedRead::new(input, RecordCodec::new());
    let writer: SharedWriter = Arc::new(Mutex::new(FramedWrite::new(output, RecordCodec::new())));
    let out = OutputSender {
        out: Arc::clone(&writer),
    };
    let mut pending_key: Option<Bytes> = None;

    while let Some(frame) = frames.next().await {
        match frame? {
            Frame::Command(Command::SetupMap) => handler.setup(TaskKind::Map, &out).await?,
            Frame::Command(Command::SetupReduce) => handler.setup(TaskKind::Reduce, &out).await?,
            Frame::Command(Command::CleanupMap) => handler.cleanup(TaskKind::Map, &out).await?,
            Frame::Command(Command::CleanupReduce) => {
                handler.cleanup(TaskKind::Reduce, &out).await?
            }
            Frame::Command(Command::Flush) => writer.lock().await.flush().await?,
            Frame::Data(bytes) => {
                if keyed {
                    match pending_key.take() {
                        None => pending_key = Some(bytes),
                        Some(key) => handler.process(Record::keyed(key, bytes), &out).await?,
                    }
                } else {
                    handler.process(Record::unkeyed(bytes), &out).await?;
                }
            }
        }
    }

    if pending_key.is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "input ended with an unpaired key frame",
        ));
    }

    writer.lock().await.flush().await?;
    Ok(())
}
