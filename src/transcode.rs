//! External transcoding filter with concurrent feeding and draining.
//!
//! The filter's stdin and stdout are serviced by two independent tasks joined
//! to the caller through bounded queues, so a filter that buffers output
//! until its input is drained can never deadlock the relay.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::wg::{WaitGroup, WaitGroupGuard};

const QUEUE_DEPTH: usize = 32;
const READ_CHUNK: usize = 8 * 1024;
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Filter command line and the container tag it produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeSettings {
    /// Executable name or path, e.g. `ffmpeg`.
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Format tag reported on transcoded audio chunks.
    pub format: String,
}

/// A running filter process.
pub struct TranscodePipe {
    child: Child,
    input: Option<mpsc::Sender<Vec<u8>>>,
    output: mpsc::Receiver<Vec<u8>>,
    pumps: WaitGroup,
    format: String,
}

/// Input half of a [`TranscodePipe`].
pub struct TranscodeSink<'a> {
    input: &'a mut Option<mpsc::Sender<Vec<u8>>>,
}

/// Output half of a [`TranscodePipe`].
pub struct TranscodeSource<'a> {
    output: &'a mut mpsc::Receiver<Vec<u8>>,
}

impl TranscodePipe {
    /// Starts the filter process.
    ///
    /// Returns [`Error::TranscodeUnavailable`] if it cannot be launched.
    pub fn spawn(settings: &TranscodeSettings) -> Result<Self, Error> {
        let mut child = Command::new(&settings.program)
            .args(&settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::TranscodeUnavailable(format!("{}: {}", settings.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::TranscodeUnavailable("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::TranscodeUnavailable("stdout not captured".to_string()))?;

        let (input_tx, input_rx) = mpsc::channel(QUEUE_DEPTH);
        let (output_tx, output_rx) = mpsc::channel(QUEUE_DEPTH);
        let pumps = WaitGroup::new();

        tokio::spawn(pump_input(stdin, input_rx, pumps.add()));
        tokio::spawn(pump_output(stdout, output_tx, pumps.add()));

        info!(program = %settings.program, pid = ?child.id(), "Transcoder started");

        Ok(Self {
            child,
            input: Some(input_tx),
            output: output_rx,
            pumps,
            format: settings.format.clone(),
        })
    }

    /// Returns the output format tag.
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Splits the pipe into halves that can be driven concurrently.
    pub fn split(&mut self) -> (TranscodeSink<'_>, TranscodeSource<'_>) {
        (
            TranscodeSink {
                input: &mut self.input,
            },
            TranscodeSource {
                output: &mut self.output,
            },
        )
    }

    /// Queues bytes for the filter's input.
    pub async fn feed(&mut self, bytes: Vec<u8>) -> Result<(), Error> {
        self.split().0.feed(bytes).await
    }

    /// Closes the filter's input.
    pub fn finish(&mut self) {
        self.split().0.finish();
    }

    /// Waits for the next output chunk; `None` means the filter is done.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.split().1.next_chunk().await
    }

    /// Shuts the filter down and waits for the pump tasks.
    ///
    /// Unread output is discarded. A filter that does not exit in time is killed.
    pub async fn close(self) {
        let TranscodePipe {
            mut child,
            input,
            output,
            pumps,
            ..
        } = self;
        drop(input);
        drop(output);

        match timeout(EXIT_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => debug!(status = %status, "Transcoder exited"),
            Ok(Err(e)) => warn!(error = %e, "Transcoder wait failed"),
            Err(_) => {
                warn!("Transcoder did not exit, killing");
                let _ = child.kill().await;
            }
        }
        pumps.wait().await;
    }
}

impl TranscodeSink<'_> {
    /// Queues bytes for the filter's input.
    ///
    /// Waits while the queue is full; the output side must be drained
    /// concurrently.
    pub async fn feed(&mut self, bytes: Vec<u8>) -> Result<(), Error> {
        if bytes.is_empty() {
            return Ok(());
        }
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| Error::Transcode("input already finished".to_string()))?;
        input
            .send(bytes)
            .await
            .map_err(|_| Error::Transcode("filter input closed".to_string()))
    }

    /// Closes the filter's input; the filter then flushes and ends its output.
    pub fn finish(&mut self) {
        if self.input.take().is_some() {
            debug!("Transcoder input finished");
        }
    }
}

impl TranscodeSource<'_> {
    /// Waits for the next output chunk; `None` means the filter is done.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.output.recv().await
    }
}

async fn pump_input(mut stdin: ChildStdin, mut rx: mpsc::Receiver<Vec<u8>>, _guard: WaitGroupGuard) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = stdin.write_all(&bytes).await {
            warn!(error = %e, "Transcoder input write failed");
            return;
        }
    }
    if let Err(e) = stdin.shutdown().await {
        debug!(error = %e, "Transcoder input shutdown failed");
    }
}

async fn pump_output(mut stdout: ChildStdout, tx: mpsc::Sender<Vec<u8>>, _guard: WaitGroupGuard) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Transcoder output read failed");
                break;
            }
        }
    }
}
