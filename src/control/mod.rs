//! Control channel: sequenced register/memory requests and response
//! dispatch.
//!
//! One UDP socket serves every configured device. Outbound requests are
//! fire-and-forget: the device does not acknowledge writes, and a lost
//! read is repaired by the next periodic poll. Inbound register responses
//! are matched to a device by the sender's IP address and written into
//! the register cache, which is where device models read from.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::device::DeviceModel;
use crate::error::{Error, Result, TransportError};
use crate::protocol::{
    decode_mlink_payload, encode_mem_request, encode_reg_request, MLinkFrame, MLinkPayload,
    MLinkType, MemOp, RegOp,
};
use crate::store::RegStore;
use crate::types::DeviceName;

/// Default device control port.
pub const REG_PORT: u16 = 33300;

/// Default interval between bulk register polls.
pub const REG_READ_INTERVAL: Duration = Duration::from_secs(30);

/// Clonable sending half of the control channel: the shared socket, the
/// wrapping sequence counter and the device control port. Device models
/// capture one of these instead of referencing the server.
#[derive(Clone)]
pub struct ControlLink {
    socket: Arc<UdpSocket>,
    seq: Arc<AtomicU16>,
    control_port: u16,
}

impl ControlLink {
    fn new(socket: Arc<UdpSocket>, control_port: u16) -> Self {
        Self {
            socket,
            seq: Arc::new(AtomicU16::new(0)),
            control_port,
        }
    }

    /// Hand out the next request sequence number; wraps naturally.
    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one register request datagram to a device. Returns the
    /// sequence number the request was stamped with.
    pub async fn reg_request(&self, ops: &[RegOp], ip: Ipv4Addr) -> Result<u16> {
        let seq = self.next_seq();
        let bytes = encode_reg_request(ops, seq)?;
        debug!(%ip, seq, frame = %hex::encode(&bytes), "send reg request");
        self.socket
            .send_to(&bytes, SocketAddr::from((ip, self.control_port)))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(seq)
    }

    /// Send one memory request datagram to a device.
    pub async fn mem_request(&self, op: &MemOp, ip: Ipv4Addr) -> Result<u16> {
        let seq = self.next_seq();
        let bytes = encode_mem_request(op, seq)?;
        debug!(%ip, seq, addr = op.addr, words = op.size, frame = %hex::encode(&bytes),
            "send mem request");
        self.socket
            .send_to(&bytes, SocketAddr::from((ip, self.control_port)))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(seq)
    }
}

/// The control server: owns the control socket, the device models and the
/// periodic register poll.
pub struct ControlServer {
    link: ControlLink,
    store: Arc<RegStore>,
    by_ip: Arc<DashMap<Ipv4Addr, DeviceName>>,
    models: HashMap<DeviceName, DeviceModel>,
    poll_interval: Duration,
}

impl ControlServer {
    /// Bind the control socket and build one device model per configured
    /// device. Register-cache namespaces are created eagerly here.
    pub async fn bind(config: &Config, store: Arc<RegStore>) -> Result<Self> {
        let addr = SocketAddr::from((config.server.ip, config.server.control_port));
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed {
                addr,
                reason: e.to_string(),
            })?;
        info!(%addr, "control server listening");

        let link = ControlLink::new(Arc::new(socket), config.server.control_port);

        let by_ip = Arc::new(DashMap::new());
        let mut models = HashMap::new();
        for device in &config.devices {
            store.create_namespace(&device.name)?;
            by_ip.insert(device.ip, device.name.clone());
            models.insert(
                device.name.clone(),
                DeviceModel::new(device, link.clone(), Arc::clone(&store)),
            );
        }

        Ok(Self {
            link,
            store,
            by_ip,
            models,
            poll_interval: config.server.poll_interval,
        })
    }

    /// The clonable sending half.
    pub fn link(&self) -> ControlLink {
        self.link.clone()
    }

    /// Look up a device model by name.
    pub fn device(&self, name: &DeviceName) -> Result<&DeviceModel> {
        self.models
            .get(name)
            .ok_or_else(|| Error::DeviceNotFound(name.to_string()))
    }

    /// All device models.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceModel> {
        self.models.values()
    }

    /// Start streaming on every device.
    pub async fn start_all(&self) -> Result<()> {
        for model in self.models.values() {
            model.start_stream().await?;
        }
        Ok(())
    }

    /// Stop streaming on every device.
    pub async fn stop_all(&self) -> Result<()> {
        for model in self.models.values() {
            model.stop_stream().await?;
        }
        Ok(())
    }

    /// Run the control loop until shutdown: dispatch inbound responses
    /// and issue the periodic bulk register poll.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut poll = tokio::time::interval(self.poll_interval);
        let mut buf = vec![0u8; 65536];

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("control server shutting down");
                    return Ok(());
                }
                _ = poll.tick() => {
                    self.poll_registers().await;
                }
                received = self.link.socket.recv_from(&mut buf) => {
                    let (len, from) = received
                        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
                    if let Err(err) = self.handle_datagram(&buf[..len], from) {
                        if err.is_fatal() {
                            error!(%err, "control dispatch failed");
                            return Err(err);
                        }
                        debug!(%from, %err, "dropping control datagram");
                    }
                }
            }
        }
    }

    /// Issue one bulk read of every known register for every device.
    async fn poll_registers(&self) {
        for model in self.models.values() {
            let ops: Vec<RegOp> = model
                .family()
                .reg_aliases()
                .iter()
                .map(|&addr| RegOp::read(addr))
                .collect();
            if let Err(err) = self.link.reg_request(&ops, model.ip()).await {
                warn!(device = %model.name(), %err, "register poll failed");
            }
        }
    }

    /// Decode one inbound datagram and apply it to the register cache.
    ///
    /// Response trailers are not verified; whatever the device filled in
    /// is accepted. Datagrams from unknown senders and memory responses
    /// are dropped.
    fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> Result<()> {
        let frame = MLinkFrame::decode(data)?;

        let ip = match from {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => {
                debug!(%from, "ignoring non-IPv4 sender");
                return Ok(());
            }
        };
        let device = match self.by_ip.get(&ip) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(%ip, "datagram from unknown device");
                return Ok(());
            }
        };

        match frame.header.frame_type {
            MLinkType::RegResponse => {
                let payload = decode_mlink_payload(frame.header.frame_type, &frame.payload)?;
                if let MLinkPayload::Reg(ops) = payload {
                    debug!(device = %device, seq = frame.header.seq, ops = ops.len(),
                        "register response");
                    for op in ops {
                        self.store.set_reg(&device, op.reg)?;
                    }
                }
                Ok(())
            }
            MLinkType::MemResponse => {
                // Device-initiated memory responses are not part of the
                // cache read path.
                debug!(device = %device, seq = frame.header.seq, "ignoring mem response");
                Ok(())
            }
            other => {
                debug!(device = %device, ?other, "unexpected frame type on control socket");
                Ok(())
            }
        }
    }
}
