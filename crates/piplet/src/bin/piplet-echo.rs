//! Echo worker: speaks the piplet wire protocol and reflects every record's
//! value back as a result frame.
//!
//! Used by the end-to-end tests and handy for smoke-testing a deployment
//! without a real worker. `PIPLET_ECHO_FAIL_AFTER=<n>` makes the worker fail
//! fatally after processing `n` records, exercising the host's abort path.

use std::io;

use anyhow::Result;
use async_trait::async_trait;
use piplet::worker::{OutputSender, RecordHandler, run_worker};
use piplet::{Record, TaskKind};

struct EchoHandler {
    processed: u64,
    fail_after: Option<u64>,
}

#[async_trait]
impl RecordHandler for EchoHandler {
    async fn setup(&mut self, kind: TaskKind, _out: &OutputSender) -> io::Result<()> {
        tracing::debug!(kind = kind.as_str(), "echo worker setup");
        Ok(())
    }

    async fn process(&mut self, record: Record, out: &OutputSender) -> io::Result<()> {
        out.emit(record.value).await?;
        self.processed += 1;
        if let Some(limit) = self.fail_after
            && self.processed >= limit
        {
            return Err(io::Error::other(format!(
                "injected failure after {limit} records"
            )));
        }
        Ok(())
    }

    async fn cleanup(&mut self, kind: TaskKind, _out: &OutputSender) -> io::Result<()> {
        tracing::debug!(kind = kind.as_str(), processed = self.processed, "echo worker cleanup");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Stdout carries frames; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let fail_after = std::env::var("PIPLET_ECHO_FAIL_AFTER")
        .ok()
        .and_then(|v| v.parse().ok());

    run_worker(EchoHandler {
        processed: 0,
        fail_after,
    })
    .await?;
    Ok(())
}
