//! External fetch collaborator: batched curl invocations.
//!
//! The pipeline hands a batch of (index, url, destination) triples to a
//! `Fetcher` and later receives one `BatchFinished` event attributed to the
//! batch's `(start, count)` range. A non-zero exit code — including failure
//! to spawn the process at all — means the whole batch failed and every
//! affected index reverts to the download pool.

use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::{mpsc::UnboundedSender, watch};
use tracing::{debug, warn};

use crate::pipeline::PipelineEvent;

/// One file to transfer.
#[derive(Clone, Debug)]
pub struct FetchItem {
    pub index: usize,
    pub url: String,
    pub dest: PathBuf,
}

/// A contiguous run of frame indices submitted together.
#[derive(Clone, Debug)]
pub struct FetchBatch {
    /// Session generation this batch belongs to; completions from a
    /// superseded session are discarded by the pipeline.
    pub generation: u64,
    pub start: usize,
    pub count: usize,
    pub items: Vec<FetchItem>,
}

/// Fetch collaborator seam. `submit` must not block; completion is reported
/// through `events` as a `PipelineEvent::BatchFinished`. Multiple batches
/// may be in flight concurrently.
pub trait Fetcher: Send + Sync {
    fn submit(&self, batch: FetchBatch, events: UnboundedSender<PipelineEvent>);

    /// Request cancellation of every outstanding transfer. Used by reset so
    /// a superseded session's processes do not linger.
    fn cancel_all(&self);
}

/// Spawns one `curl` process per batch, with one `-o dest url` pair per
/// item and `--parallel` so curl multiplexes the transfers itself.
pub struct CurlFetcher {
    curl_bin: String,
    /// Bumped by `cancel_all`; every in-flight batch task watches it and
    /// kills its child when the epoch moves.
    cancel_epoch: watch::Sender<u64>,
}

impl CurlFetcher {
    pub fn new(curl_bin: impl Into<String>) -> Self {
        let (cancel_epoch, _) = watch::channel(0);
        Self { curl_bin: curl_bin.into(), cancel_epoch }
    }
}

impl Fetcher for CurlFetcher {
    fn submit(&self, batch: FetchBatch, events: UnboundedSender<PipelineEvent>) {
        let mut cmd = Command::new(&self.curl_bin);
        cmd.args([
            "--fail",
            "--parallel",
            "--silent",
            "--show-error",
            "--connect-timeout",
            "5",
            "--max-time",
            "30",
            "--retry",
            "2",
            "--retry-delay",
            "0",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

        for item in &batch.items {
            cmd.arg("-o").arg(&item.dest).arg(&item.url);
        }

        debug!(
            start = batch.start,
            count = batch.count,
            files = batch.items.len(),
            "starting curl batch"
        );

        let mut cancel_rx = self.cancel_epoch.subscribe();
        tokio::spawn(async move {
            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    // Spawn failure is treated identically to an in-flight
                    // failure: the batch reverts with no partial credit.
                    warn!(start = batch.start, count = batch.count, "curl failed to start: {e}");
                    let _ = events.send(PipelineEvent::BatchFinished {
                        generation: batch.generation,
                        start: batch.start,
                        count: batch.count,
                        exit_code: -1,
                    });
                    return;
                }
            };

            let exit_code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(e) => {
                        warn!(start = batch.start, "failed to await curl: {e}");
                        -1
                    }
                },
                _ = cancel_rx.changed() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    -1
                }
            };

            let _ = events.send(PipelineEvent::BatchFinished {
                generation: batch.generation,
                start: batch.start,
                count: batch.count,
                exit_code,
            });
        });
    }

    fn cancel_all(&self) {
        self.cancel_epoch.send_modify(|epoch| *epoch += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    // CurlFetcher against a missing binary: the batch must still complete,
    // with a failure code, so the scheduler can revert and retry.
    #[tokio::test]
    async fn spawn_failure_reports_batch_failure() {
        let fetcher = CurlFetcher::new("volustream-no-such-binary");
        let (tx, mut rx) = mpsc::unbounded_channel();

        fetcher.submit(
            FetchBatch {
                generation: 7,
                start: 3,
                count: 2,
                items: vec![FetchItem {
                    index: 3,
                    url: "https://localhost/1003.drc".to_string(),
                    dest: std::env::temp_dir().join("volustream-test-1003.drc"),
                }],
            },
            tx,
        );

        match rx.recv().await {
            Some(PipelineEvent::BatchFinished { generation, start, count, exit_code }) => {
                assert_eq!(generation, 7);
                assert_eq!(start, 3);
                assert_eq!(count, 2);
                assert_ne!(exit_code, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
