//! Run-framed MPD file writer.
//!
//! The writer is a small state machine: `open` writes the start-run
//! header and arms it, `write` appends records while armed and silently
//! discards otherwise, `flush` writes the stop-run header, fsyncs and
//! disarms. One writer task per device owns the file handle; operator
//! commands arrive on a dedicated control channel so a persist or flush
//! is ordered against the record stream.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{start_run_header, stop_run_header};
use crate::types::DeviceName;

/// Operator commands routed to a writer task.
#[derive(Debug, Clone)]
pub enum WriterCommand {
    /// Open `path` (flushing any armed file first) and start a run.
    Open(PathBuf),
    /// Close the run: stop header, fsync, disarm.
    Flush,
}

/// Build the acquisition file name: `{prefix}_{device}_{timestamp}.data`,
/// prefix optional.
pub fn persist_filename(
    dir: &Path,
    prefix: Option<&str>,
    device: &DeviceName,
    timestamp: &str,
) -> PathBuf {
    let name = match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}_{device}_{timestamp}.data"),
        _ => format!("{device}_{timestamp}.data"),
    };
    dir.join(name)
}

/// Per-device MPD writer.
pub struct MpdWriter {
    device: DeviceName,
    file: Option<File>,
}

impl MpdWriter {
    pub fn new(device: DeviceName) -> Self {
        Self { device, file: None }
    }

    pub fn is_armed(&self) -> bool {
        self.file.is_some()
    }

    /// Open a new acquisition file and write the start-run header. An
    /// already-armed writer closes its current run first.
    pub async fn open(&mut self, path: &Path) -> Result<()> {
        if self.file.is_some() {
            self.flush().await?;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = File::create(path).await?;
        file.write_all(&start_run_header()).await?;
        info!(device = %self.device, path = %path.display(), "opened acquisition file");
        self.file = Some(file);
        Ok(())
    }

    /// Append one MPD record; discarded when no run is open.
    pub async fn write(&mut self, record: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(record).await?,
            None => debug!(device = %self.device, bytes = record.len(), "discarding record"),
        }
        Ok(())
    }

    /// Close the run with the stop header and fsync. No-op when
    /// disarmed.
    pub async fn flush(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.write_all(&stop_run_header()).await?;
            file.sync_all().await?;
            info!(device = %self.device, "flushed acquisition file");
        }
        Ok(())
    }
}

/// Writer task: drain MPD records and apply operator commands until both
/// channels close, then close the run.
pub async fn run_writer(
    mut writer: MpdWriter,
    mut records: mpsc::Receiver<Vec<u8>>,
    mut commands: mpsc::Receiver<WriterCommand>,
) -> Result<()> {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(WriterCommand::Open(path)) => {
                    if let Err(err) = writer.open(&path).await {
                        warn!(path = %path.display(), %err, "failed to open acquisition file");
                    }
                }
                Some(WriterCommand::Flush) => writer.flush().await?,
                None => {
                    writer.flush().await?;
                    return Ok(());
                }
            },
            record = records.recv() => match record {
                Some(record) => writer.write(&record).await?,
                None => {
                    writer.flush().await?;
                    return Ok(());
                }
            },
        }
    }
}
