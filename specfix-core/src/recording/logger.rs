use super::types::RecordedEvent;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Appends recorded events to a JSONL file from a background task.
///
/// Clones share one writer; events from all of them land in send order.
#[derive(Clone)]
pub struct RecordingLogger {
    events: mpsc::UnboundedSender<RecordedEvent>,
}

impl RecordingLogger {
    /// Must be called from within a tokio runtime.
    pub fn new(path: PathBuf) -> Result<Self> {
        let (events, queue) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            match open_append(&path).await {
                Ok(file) => {
                    info!(path = %path.display(), "Recording traffic");
                    drain(BufWriter::new(file), queue).await;
                }
                Err(e) => error!(path = %path.display(), "Cannot open recording file: {:#}", e),
            }
        });
        Ok(Self { events })
    }

    /// Queues an event. Never blocks; a dead writer only costs a log line.
    pub fn record(&self, event: RecordedEvent) {
        if self.events.send(event).is_err() {
            warn!("Recording writer has stopped; event dropped");
        }
    }
}

async fn open_append(path: &Path) -> Result<File> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => tokio::fs::create_dir_all(dir).await?,
        _ => {}
    }
    Ok(OpenOptions::new().create(true).append(true).open(path).await?)
}

async fn drain(mut out: BufWriter<File>, mut queue: mpsc::UnboundedReceiver<RecordedEvent>) {
    while let Some(event) = queue.recv().await {
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                error!(operation = %event.operation, "Unserialisable recording event: {}", e);
                continue;
            }
        };
        line.push(b'\n');
        // Flush per line so a crash loses at most the event in flight.
        let written = match out.write_all(&line).await {
            Ok(()) => out.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            error!("Writing recording event failed: {}", e);
        }
    }
    debug!("Recording writer finished");
}
