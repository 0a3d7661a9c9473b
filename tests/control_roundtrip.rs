//! Control channel over loopback UDP: a fake device on 127.0.0.2 checks
//! what the gateway sends, then feeds responses back into the register
//! cache.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::timeout;

use adcd::config::{Config, DeviceConfig};
use adcd::control::ControlServer;
use adcd::protocol::{
    checksum, decode_mlink_payload, MLinkFrame, MLinkHeader, MLinkPayload, MLinkType, Reg,
};
use adcd::store::RegStore;
use adcd::types::{DeviceFamily, DeviceName};

const HOST_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const DEVICE_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

struct Fixture {
    server: ControlServer,
    store: Arc<RegStore>,
    device_socket: UdpSocket,
    name: DeviceName,
}

/// Bind a fake device socket first to learn a free port, then point both
/// ends of the control exchange at it.
async fn fixture() -> Fixture {
    let device_socket = UdpSocket::bind((DEVICE_IP, 0)).await.unwrap();
    let port = device_socket.local_addr().unwrap().port();

    let name = DeviceName::from("adc64-0");
    let mut config = Config::default();
    config.server.ip = HOST_IP;
    config.server.control_port = port;
    config.server.poll_interval = Duration::from_secs(3600);
    config.devices = vec![DeviceConfig {
        name: name.clone(),
        ip: DEVICE_IP,
        family: DeviceFamily::Adc64,
        zero_suppression: false,
    }];

    let store = Arc::new(RegStore::in_memory().unwrap());
    let server = ControlServer::bind(&config, Arc::clone(&store)).await.unwrap();

    Fixture {
        server,
        store,
        device_socket,
        name,
    }
}

async fn recv_frame(socket: &UdpSocket) -> (Vec<u8>, std::net::SocketAddr) {
    let mut buf = vec![0u8; 2048];
    let (len, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .unwrap();
    buf.truncate(len);
    (buf, from)
}

#[tokio::test]
async fn register_write_reaches_the_device_with_valid_crc() {
    let fx = fixture().await;

    fx.server
        .device(&fx.name)
        .unwrap()
        .reg_write(Reg::new(0x40, 0x8000))
        .await
        .unwrap();

    let (datagram, _) = recv_frame(&fx.device_socket).await;
    let frame = MLinkFrame::decode(&datagram).unwrap();
    assert_eq!(frame.header.frame_type, MLinkType::RegRequest);
    assert_eq!(frame.header.seq, 0);
    assert_eq!(frame.trailer, checksum(&datagram[..datagram.len() - 4]));

    match decode_mlink_payload(frame.header.frame_type, &frame.payload).unwrap() {
        MLinkPayload::Reg(ops) => {
            assert_eq!(ops.len(), 1);
            assert!(!ops[0].read);
            assert_eq!(ops[0].reg, Reg::new(0x40, 0x8000));
        }
        other => panic!("unexpected payload {other:?}"),
    }

    // The sequence counter advances per request.
    fx.server
        .device(&fx.name)
        .unwrap()
        .reg_write(Reg::new(0x41, 1))
        .await
        .unwrap();
    let (datagram, _) = recv_frame(&fx.device_socket).await;
    assert_eq!(MLinkFrame::decode(&datagram).unwrap().header.seq, 1);
}

#[tokio::test]
async fn response_updates_the_cache_regardless_of_trailer() {
    let fx = fixture().await;
    let store = Arc::clone(&fx.store);
    let name = fx.name.clone();
    let device_socket = fx.device_socket;
    let server = fx.server;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server_task = tokio::spawn(async move { server.run(shutdown_rx).await });

    // The poll fires immediately on startup: a bulk read of the whole
    // alias set.
    let (datagram, reply_to) = recv_frame(&device_socket).await;
    let frame = MLinkFrame::decode(&datagram).unwrap();
    assert_eq!(frame.header.frame_type, MLinkType::RegRequest);
    match decode_mlink_payload(frame.header.frame_type, &frame.payload).unwrap() {
        MLinkPayload::Reg(ops) => {
            assert_eq!(ops.len(), DeviceFamily::Adc64.reg_aliases().len());
            assert!(ops.iter().all(|op| op.read));
        }
        other => panic!("unexpected payload {other:?}"),
    }

    // Answer with a RegResponse whose trailer is garbage: responses are
    // accepted without trailer verification.
    let payload = {
        // One word: write-form encoding of addr 0x40 value 0x8000.
        let word: u32 = (0x40u32 << 16) | 0x8000;
        word.to_le_bytes().to_vec()
    };
    let header = MLinkHeader {
        frame_type: MLinkType::RegResponse,
        seq: frame.header.seq,
        len: 5,
        src: 0xfefe,
        dst: 0x0001,
    };
    let response = MLinkFrame {
        header,
        payload,
        trailer: 0xdeadbeef,
    }
    .encode();
    device_socket.send_to(&response, reply_to).await.unwrap();

    // The cache becomes eventually consistent with the response.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(reg) = store.get_reg(&name, 0x40).unwrap() {
            assert_eq!(reg.value, 0x8000);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "cache never updated");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(()).unwrap();
    timeout(Duration::from_secs(5), server_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn start_stream_emits_the_family_sequence() {
    let fx = fixture().await;

    fx.server.device(&fx.name).unwrap().start_stream().await.unwrap();

    let (datagram, _) = recv_frame(&fx.device_socket).await;
    let frame = MLinkFrame::decode(&datagram).unwrap();
    match decode_mlink_payload(frame.header.frame_type, &frame.payload).unwrap() {
        MLinkPayload::Reg(ops) => {
            let writes: Vec<(u16, u16)> =
                ops.iter().map(|op| (op.reg.addr, op.reg.value)).collect();
            assert_eq!(writes, vec![(0x40, 0x0000), (0x40, 0x8000), (0x42, 1)]);
            assert!(ops.iter().all(|op| !op.read));
        }
        other => panic!("unexpected payload {other:?}"),
    }
}
