//! Acquisition server: per-device pipeline wiring and lifecycle.
//!
//! For every configured device the server runs four tasks joined by
//! bounded channels:
//!
//! ```text
//! receiver ──1──▶ defragmenter ──128──▶ event builder ──128──▶ writer
//! ```
//!
//! The tight receiver→defragmenter bound makes the receiver pause reading
//! when assembly falls behind, letting the kernel absorb or drop
//! datagrams; the device's own ACK pacing is the only flow control.
//! Pipelines are independent: a dead device socket takes down its own
//! tasks and nothing else.

mod event_builder;
mod receiver;
mod writer;

pub use event_builder::{Event, EventBuilder, MAX_EVENT_DIFF};
pub use receiver::{MStreamReceiver, INPUT_BUFFER_SIZE};
pub use writer::{persist_filename, run_writer, MpdWriter, WriterCommand};

use std::collections::HashMap;
use std::path::Path;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::defrag::Defragmenter;
use crate::error::{Error, Result, TransportError};
use crate::types::DeviceName;

/// Receiver → defragmenter channel bound.
const FRAGMENT_CH_SIZE: usize = 1;
/// Defragmenter → event builder channel bound.
const EVENT_CH_SIZE: usize = 128;
/// Event builder → writer channel bound.
const RECORD_CH_SIZE: usize = 128;

/// Clonable handle for driving the writers and peeking at the newest
/// event while the server runs: the contract the external operator API
/// consumes.
#[derive(Clone)]
pub struct AcquisitionHandle {
    writer_commands: HashMap<DeviceName, mpsc::Sender<WriterCommand>>,
    last_events: HashMap<DeviceName, watch::Receiver<Vec<u8>>>,
}

impl AcquisitionHandle {
    /// Open a new acquisition file for every device:
    /// `{prefix}_{device}_{UTC timestamp}.data` under `dir`.
    pub async fn persist(&self, dir: &Path, prefix: Option<&str>) -> Result<()> {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
        for (device, commands) in &self.writer_commands {
            let path = persist_filename(dir, prefix, device, &timestamp);
            info!(device = %device, path = %path.display(), "persist");
            commands
                .send(WriterCommand::Open(path))
                .await
                .map_err(|_| Error::Transport(TransportError::ChannelClosed))?;
        }
        Ok(())
    }

    /// Close the current run on every device.
    pub async fn flush(&self) -> Result<()> {
        for (device, commands) in &self.writer_commands {
            info!(device = %device, "flush");
            commands
                .send(WriterCommand::Flush)
                .await
                .map_err(|_| Error::Transport(TransportError::ChannelClosed))?;
        }
        Ok(())
    }

    /// The most recent MPD record of one device, or `None` before the
    /// first event closes.
    pub fn last_event(&self, device: &DeviceName) -> Result<Option<Vec<u8>>> {
        let rx = self
            .last_events
            .get(device)
            .ok_or_else(|| Error::DeviceNotFound(device.to_string()))?;
        let record = rx.borrow();
        Ok(if record.is_empty() {
            None
        } else {
            Some(record.clone())
        })
    }
}

/// The acquisition server: owns every device pipeline and the writer
/// command fan-out consumed by the operator API.
pub struct MStreamServer {
    writer_commands: HashMap<DeviceName, mpsc::Sender<WriterCommand>>,
    last_events: HashMap<DeviceName, watch::Receiver<Vec<u8>>>,
    writer_tasks: Vec<(DeviceName, JoinHandle<Result<()>>)>,
    tasks: JoinSet<()>,
}

impl MStreamServer {
    /// Bind sockets, perform the stream handshake and spawn the pipeline
    /// tasks for every configured device.
    pub async fn start(config: &Config) -> Result<Self> {
        let mut server = Self {
            writer_commands: HashMap::new(),
            last_events: HashMap::new(),
            writer_tasks: Vec::new(),
            tasks: JoinSet::new(),
        };

        for device in &config.devices {
            let name = device.name.clone();
            let family = device.family;

            let (fragment_tx, mut fragment_rx) = mpsc::channel(FRAGMENT_CH_SIZE);
            let (event_tx, mut event_rx) = mpsc::channel(EVENT_CH_SIZE);
            let (record_tx, record_rx) = mpsc::channel(RECORD_CH_SIZE);
            let (command_tx, command_rx) = mpsc::channel(1);
            let (last_tx, last_rx) = watch::channel(Vec::new());

            let receiver = MStreamReceiver::bind(
                name.clone(),
                config.server.ip,
                device.ip,
                config.server.mstream_port,
                fragment_tx,
            )
            .await?;
            receiver.handshake().await?;

            server.tasks.spawn(stage(name.clone(), "receiver", receiver.run()));

            let defrag_name = name.clone();
            server.tasks.spawn(stage(name.clone(), "defrag", async move {
                let mut defrag = Defragmenter::new(defrag_name.clone(), family);
                while let Some(piece) = fragment_rx.recv().await {
                    if let Err(err) = defrag.insert(piece) {
                        warn!(device = %defrag_name, %err, "fragment list dropped");
                    }
                    for fragment in defrag.drain() {
                        if event_tx.send(fragment).await.is_err() {
                            return Err(TransportError::ChannelClosed.into());
                        }
                    }
                }
                Ok(())
            }));

            let builder_name = name.clone();
            server.tasks.spawn(stage(name.clone(), "events", async move {
                let mut builder = EventBuilder::new(builder_name.clone(), family);
                while let Some(fragment) = event_rx.recv().await {
                    match builder.handle(&fragment) {
                        Ok(records) => {
                            for record in records {
                                let _ = last_tx.send(record.clone());
                                if record_tx.send(record).await.is_err() {
                                    return Err(TransportError::ChannelClosed.into());
                                }
                            }
                        }
                        Err(err) if err.is_transient() => {
                            warn!(device = %builder_name, %err, "dropping fragment");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Ok(())
            }));

            let writer = MpdWriter::new(name.clone());
            let writer_task = tokio::spawn(run_writer(writer, record_rx, command_rx));
            server.writer_tasks.push((name.clone(), writer_task));
            server.last_events.insert(name.clone(), last_rx);
            server.writer_commands.insert(name, command_tx);
        }

        Ok(server)
    }

    /// Handle for persist/flush commands, clonable into the operator
    /// API.
    pub fn handle(&self) -> AcquisitionHandle {
        AcquisitionHandle {
            writer_commands: self.writer_commands.clone(),
            last_events: self.last_events.clone(),
        }
    }

    /// Supervise the pipelines until shutdown, then flush every writer
    /// and wind the tasks down.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                joined = self.tasks.join_next() => match joined {
                    // Stages log their own failures; a finished pipeline
                    // stage only affects its device.
                    Some(_) => continue,
                    None => break,
                },
            }
        }

        info!("acquisition server shutting down");
        // Tear down the pipelines first: aborting the event builders
        // closes the record channels, which makes every writer write the
        // stop-run header and exit even if operator handles still hold
        // command senders.
        self.tasks.shutdown().await;
        self.writer_commands.clear();
        for (device, task) in self.writer_tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(device = %device, %err, "writer failed during shutdown"),
                Err(err) => error!(device = %device, %err, "writer task panicked"),
            }
        }
        Ok(())
    }
}

/// Wrap a pipeline stage so its failure is logged with device context and
/// only ever takes down its own device.
async fn stage(
    device: DeviceName,
    name: &'static str,
    fut: impl std::future::Future<Output = Result<()>>,
) {
    if let Err(err) = fut.await {
        error!(device = %device, stage = name, %err, "pipeline stage terminated");
    }
}
