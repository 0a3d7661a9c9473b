//! Per-device MStream UDP receiver.
//!
//! Binds an ephemeral socket, registers it as the device's stream peer
//! with the handshake sentinel, then loops: decode each datagram as
//! MLink+MStream, push every fragment piece downstream and answer it with
//! a cumulative acknowledgement on the same socket. Devices resend
//! unacknowledged pieces, so duplicates are expected and re-ACKed
//! identically.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::protocol::{decode_fragments, encode_ack, encode_handshake, MLinkFrame, MLinkType,
    MStreamFragment};
use crate::types::DeviceName;

/// Receive buffer size per device.
pub const INPUT_BUFFER_SIZE: usize = 262144;

/// Per-device acquisition receiver.
pub struct MStreamReceiver {
    device: DeviceName,
    socket: UdpSocket,
    device_addr: SocketAddr,
    out: mpsc::Sender<MStreamFragment>,
}

impl MStreamReceiver {
    /// Bind an ephemeral socket for one device's stream.
    pub async fn bind(
        device: DeviceName,
        local_ip: Ipv4Addr,
        device_ip: Ipv4Addr,
        mstream_port: u16,
        out: mpsc::Sender<MStreamFragment>,
    ) -> Result<Self> {
        let bind_addr = SocketAddr::from((local_ip, 0));
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| TransportError::BindFailed {
                addr: bind_addr,
                reason: e.to_string(),
            })?;
        let device_addr = SocketAddr::from((device_ip, mstream_port));
        info!(
            device = %device,
            local = %socket.local_addr()?,
            remote = %device_addr,
            "mstream receiver bound"
        );
        Ok(Self {
            device,
            socket,
            device_addr,
            out,
        })
    }

    /// Send the handshake ACK that registers this socket as the stream
    /// peer.
    pub async fn handshake(&self) -> Result<()> {
        self.socket
            .send_to(&encode_handshake(), self.device_addr)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        debug!(device = %self.device, "mstream handshake sent");
        Ok(())
    }

    /// Receive loop. Malformed datagrams are dropped at debug level;
    /// socket errors are fatal for this device's pipeline.
    pub async fn run(self) -> Result<()> {
        let mut buf = vec![0u8; INPUT_BUFFER_SIZE];
        loop {
            let (len, _) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;

            let frame = match MLinkFrame::decode(&buf[..len]) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(
                        device = %self.device,
                        %err,
                        head = %hex::encode(&buf[..len.min(16)]),
                        "dropping malformed datagram"
                    );
                    continue;
                }
            };
            if frame.header.frame_type != MLinkType::MStream {
                debug!(device = %self.device, frame_type = ?frame.header.frame_type,
                    "unexpected frame on mstream socket");
                continue;
            }

            let fragments = match decode_fragments(&frame.payload) {
                Ok(fragments) => fragments,
                Err(err) => {
                    debug!(device = %self.device, %err, "dropping undecodable fragment train");
                    continue;
                }
            };

            for fragment in fragments {
                // ACK mirrors the sender's addressing: our src is the
                // frame's dst and vice versa.
                let ack = encode_ack(
                    frame.header.seq,
                    frame.header.dst,
                    frame.header.src,
                    fragment.fragment_id,
                    fragment.fragment_offset,
                );

                if self.out.send(fragment).await.is_err() {
                    return Err(TransportError::ChannelClosed.into());
                }
                self.socket
                    .send_to(&ack, self.device_addr)
                    .await
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
            }
        }
    }
}
