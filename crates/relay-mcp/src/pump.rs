//! Background I/O between a child's pipes and in-memory channels.
//!
//! One writer task drains the outbound frame channel into stdin, one reader
//! task decodes stdout into the inbound envelope channel, and an optional
//! stderr task keeps diagnostic text out of the protocol stream. The inbound
//! channel closing is the connection-loss signal.

use crate::envelope::Envelope;
use crate::error::McpError;
use crate::framing::{FrameReader, Framing};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Number of stderr lines retained for diagnostics.
pub const STDERR_TAIL_LINES: usize = 64;

const OUTBOUND_CAPACITY: usize = 64;

/// Recent stderr output of a child process.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl Diagnostics {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Retained lines, oldest first.
    pub fn tail(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }

    pub fn joined(&self) -> String {
        self.tail().join("\n")
    }
}

/// Cloneable handle that encodes envelopes and queues them for the writer.
#[derive(Clone)]
pub struct Outbound {
    server: Arc<str>,
    framing: Framing,
    tx: mpsc::Sender<Vec<u8>>,
}

impl Outbound {
    pub async fn send(&self, envelope: &Envelope) -> Result<(), McpError> {
        let frame = self.framing.encode(envelope)?;
        self.tx.send(frame).await.map_err(|_| McpError::ConnectionLost {
            server: self.server.to_string(),
        })
    }

    /// Queue a frame only if the writer has room.
    pub fn try_send(&self, envelope: &Envelope) -> Result<(), McpError> {
        let frame = self.framing.encode(envelope)?;
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => McpError::Protocol(format!(
                "outbound queue to '{}' is full",
                self.server
            )),
            mpsc::error::TrySendError::Closed(_) => McpError::ConnectionLost {
                server: self.server.to_string(),
            },
        })
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }
}

/// The running reader/writer/stderr tasks of one connection.
pub struct IoPump {
    server: Arc<str>,
    outbound: Outbound,
    close_input: Mutex<Option<oneshot::Sender<()>>>,
    tasks: Vec<JoinHandle<()>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    diagnostics: Diagnostics,
}

impl IoPump {
    /// Start reader and writer tasks over the given streams.
    ///
    /// Returns the pump and the receive side of the inbound envelope channel.
    pub fn start<R, W>(
        server: &str,
        stdout: R,
        stdin: W,
        framing: Framing,
    ) -> (Self, mpsc::UnboundedReceiver<Envelope>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let server: Arc<str> = Arc::from(server);
        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();

        let writer = tokio::spawn(write_frames(Arc::clone(&server), stdin, write_rx, close_rx));
        let reader = tokio::spawn(read_frames(
            Arc::clone(&server),
            stdout,
            framing,
            inbound_tx,
        ));

        let pump = Self {
            outbound: Outbound {
                server: Arc::clone(&server),
                framing,
                tx: write_tx,
            },
            server,
            close_input: Mutex::new(Some(close_tx)),
            tasks: vec![writer, reader],
            stderr_task: Mutex::new(None),
            diagnostics: Diagnostics::default(),
        };
        (pump, inbound_rx)
    }

    /// Capture the child's stderr on its own task.
    pub fn capture_stderr<E>(&self, stderr: E)
    where
        E: AsyncRead + Unpin + Send + 'static,
    {
        let server = Arc::clone(&self.server);
        let diagnostics = self.diagnostics.clone();
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %server, "stderr: {line}");
                diagnostics.push(line);
            }
        });
        let mut slot = self.stderr_task.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(handle);
    }

    /// A sender for queuing envelopes to the child.
    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Wait up to `wait` for the stderr reader to reach end of file.
    pub async fn drain_stderr(&self, wait: Duration) {
        let handle = self
            .stderr_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(wait, handle).await.is_err() {
                abort.abort();
            }
        }
    }

    /// Stop writing and close the child's stdin.
    pub fn close_input(&self) {
        let signal = self
            .close_input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(signal) = signal {
            let _ = signal.send(());
        }
    }

    /// Abort every background task.
    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Some(task) = self
            .stderr_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            task.abort();
        }
    }
}

impl Drop for IoPump {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn write_frames<W>(
    server: Arc<str>,
    mut stdin: W,
    mut frames: mpsc::Receiver<Vec<u8>>,
    mut close: oneshot::Receiver<()>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = &mut close => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = stdin.write_all(&frame).await {
            tracing::debug!(server = %server, "stdin write failed: {e}");
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::debug!(server = %server, "stdin flush failed: {e}");
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

async fn read_frames<R>(
    server: Arc<str>,
    stdout: R,
    framing: Framing,
    inbound: mpsc::UnboundedSender<Envelope>,
) where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(BufReader::new(stdout), framing);
    loop {
        match frames.next_envelope().await {
            Ok(Some(envelope)) => {
                if inbound.send(envelope).is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!(server = %server, "stdout closed");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %server, "stdout read failed: {e}");
                break;
            }
        }
    }
}
