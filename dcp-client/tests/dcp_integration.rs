//! End-to-end tests driving a `Conductor` against an in-memory mock DCP
//! node: a bare TCP listener that speaks just enough of the memcached
//! binary protocol to exercise cold start, rollback, flow control, OSO
//! snapshots, and dead-connection recovery without a real cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use compio::buf::BufResult;
use compio::io::{AsyncReadExt, AsyncWriteExt};
use compio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;

use dcp_client::prelude::*;
use dcp_core::options::ChannelOptions;
use dcp_protocol::header::FrameHeader;
use dcp_protocol::message::{OSO_FLAG_END, OSO_FLAG_START, SNAPSHOT_FLAG_MEMORY};
use dcp_protocol::opcode::{Magic, Opcode, Status};
use dcp_protocol::utils::build_request;

// --- wire helpers -----------------------------------------------------

async fn read_frame(stream: &mut TcpStream) -> (FrameHeader, Bytes) {
    let header_buf = vec![0u8; 24];
    let BufResult(res, header_buf) = stream.read_exact(header_buf).await;
    res.expect("mock node: read frame header");
    let header = FrameHeader::decode(&header_buf).expect("mock node: decode frame header");

    let body_len = header.total_body_len as usize;
    let body = if body_len == 0 {
        Bytes::new()
    } else {
        let body_buf = vec![0u8; body_len];
        let BufResult(res, body_buf) = stream.read_exact(body_buf).await;
        res.expect("mock node: read frame body");
        Bytes::from(body_buf)
    };
    (header, body)
}

async fn write_frame(stream: &mut TcpStream, frame: Bytes) {
    let BufResult(res, _) = stream.write_all(frame.to_vec()).await;
    res.expect("mock node: write frame");
}

/// An empty-bodied response frame that just echoes `opaque` back, used for
/// DCP_OPEN/DCP_CONTROL acks (the session demuxer doesn't check their
/// status or body at all).
fn ack_response(opcode: Opcode, opaque: u32) -> Bytes {
    response_frame(opcode, Status::Success.as_u16(), opaque, &[])
}

fn response_frame(opcode: Opcode, status: u16, opaque: u32, body: &[u8]) -> Bytes {
    let mut header = FrameHeader::request(opcode, status, opaque).with_total_body_len(body.len() as u32);
    header.magic = Magic::Response;
    let mut buf = BytesMut::new();
    header.encode(&mut buf);
    buf.extend_from_slice(body);
    buf.freeze()
}

/// A server-push frame (snapshot marker, mutation, stream end, ...). These
/// are demultiplexed by `header.vbucket()` regardless of magic, so they're
/// built the same way a real client request is.
fn push_frame(opcode: Opcode, vbid: u16, extras: &[u8], key: &[u8], value: &[u8]) -> Bytes {
    let header = FrameHeader::request(opcode, vbid, 0)
        .with_extras_len(extras.len() as u8)
        .with_key_len(key.len() as u16)
        .with_total_body_len((extras.len() + key.len() + value.len()) as u32);
    build_request(header, key, extras, value)
}

fn snapshot_marker_frame(vbid: u16, start: u64, end: u64) -> Bytes {
    let mut extras = BytesMut::new();
    extras.put_u64(start);
    extras.put_u64(end);
    extras.put_u32(SNAPSHOT_FLAG_MEMORY);
    push_frame(Opcode::DcpSnapshotMarker, vbid, &extras, &[], &[])
}

fn mutation_frame(vbid: u16, by_seqno: u64, key: &[u8], value: &[u8]) -> Bytes {
    let mut extras = BytesMut::new();
    extras.put_u64(by_seqno);
    extras.put_u64(1); // rev_seqno
    extras.put_u32(0); // flags
    extras.put_u32(0); // expiration
    extras.put_u32(0); // lock_time
    extras.put_u16(0); // nmeta
    extras.put_u8(0); // nru
    push_frame(Opcode::DcpMutation, vbid, &extras, key, value)
}

fn oso_frame(vbid: u16, flag: u32) -> Bytes {
    let mut extras = BytesMut::new();
    extras.put_u32(flag);
    push_frame(Opcode::DcpOsoSnapshot, vbid, &extras, &[], &[])
}

fn failover_log_body(uuid: u64, seqno: u64) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u64(uuid);
    body.put_u64(seqno);
    body.freeze()
}

/// Acks the DCP_OPEN and every DCP_CONTROL request a freshly connected
/// channel sends, in whatever order they arrive.
async fn handshake(stream: &mut TcpStream, control_params: usize) {
    for _ in 0..=control_params {
        let (header, _) = read_frame(stream).await;
        write_frame(stream, ack_response(header.opcode, header.opaque)).await;
    }
}

async fn expect_stream_req(stream: &mut TcpStream, vbid: u16) -> u32 {
    let (header, _) = read_frame(stream).await;
    assert_eq!(header.opcode, Opcode::DcpStreamReq);
    assert_eq!(header.vbucket(), vbid);
    header.opaque
}

// --- callback recorder --------------------------------------------------

#[derive(Default)]
struct Recorder {
    data: Mutex<Vec<DataFrame>>,
    control: Mutex<Vec<ControlFrame>>,
    system: Mutex<Vec<SystemEvent>>,
}

impl Recorder {
    fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl DataCallback for Recorder {
    fn data_event(&self, ack_handle: Arc<AckHandle>, frame: DataFrame) {
        ack_handle.ack();
        self.data.lock().push(frame);
    }
}

impl ControlCallback for Recorder {
    fn control_event(&self, ack_handle: Arc<AckHandle>, frame: ControlFrame) {
        ack_handle.ack();
        self.control.lock().push(frame);
    }
}

impl SystemEventCallback for Recorder {
    fn system_event(&self, event: SystemEvent) {
        self.system.lock().push(event);
    }
}

fn persisted_seqno(json: &str, vbid: u16) -> u64 {
    let value: serde_json::Value = serde_json::from_str(json).expect("valid session json");
    value["partitions"]
        .as_array()
        .expect("partitions array")
        .iter()
        .find(|p| p["vbid"].as_u64() == Some(u64::from(vbid)))
        .and_then(|p| p["seqno"].as_u64())
        .unwrap_or_else(|| panic!("no persisted partition for vbid {vbid}"))
}

fn single_node_config(node: NodeAddress, vbids: Vec<u16>) -> ClientConfig {
    ClientConfig::new("bucket", vec![node.to_string()]).with_vbuckets(vbids)
}

fn single_node_provider(node: NodeAddress, vbids: &[u16]) -> Arc<dyn ConfigProvider> {
    let mut map = BTreeMap::new();
    for &vbid in vbids {
        map.insert(vbid, node);
    }
    Arc::new(StaticConfigProvider::new(map))
}

// --- scenarios -----------------------------------------------------------

#[compio::test]
async fn cold_start_delivers_mutations_for_every_vbucket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let node = NodeAddress::new(addr);

    compio::runtime::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake(&mut stream, 4).await;

        for vbid in [0u16, 1u16] {
            let opaque = expect_stream_req(&mut stream, vbid).await;
            write_frame(
                &mut stream,
                response_frame(Opcode::DcpStreamReq, Status::Success.as_u16(), opaque, &failover_log_body(1, 0)),
            )
            .await;
            write_frame(&mut stream, snapshot_marker_frame(vbid, 0, 10)).await;
            for seqno in 1..=10u64 {
                write_frame(&mut stream, mutation_frame(vbid, seqno, b"doc", b"value")).await;
            }
        }
    })
    .detach();

    let recorder = Recorder::shared();
    let config_provider = single_node_provider(node, &[0, 1]);
    let config = single_node_config(node, vec![0, 1]);
    let conductor = Conductor::new(
        config,
        config_provider,
        Arc::new(NoAuth),
        recorder.clone(),
        recorder.clone(),
        recorder.clone(),
    )
    .unwrap();

    conductor.connect().await.unwrap();
    compio::time::sleep(Duration::from_millis(200)).await;

    let json = conductor.persist_session();
    assert_eq!(persisted_seqno(&json, 0), 10);
    assert_eq!(persisted_seqno(&json, 1), 10);
    assert_eq!(recorder.data.lock().len(), 20);
}

#[compio::test]
async fn stream_rollback_disconnects_and_reports_exactly_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let node = NodeAddress::new(addr);

    compio::runtime::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake(&mut stream, 4).await;
        let opaque = expect_stream_req(&mut stream, 0).await;
        write_frame(
            &mut stream,
            response_frame(Opcode::DcpStreamReq, Status::Rollback.as_u16(), opaque, &5u64.to_be_bytes()),
        )
        .await;
    })
    .detach();

    let recorder = Recorder::shared();
    let config_provider = single_node_provider(node, &[0]);
    let config = single_node_config(node, vec![0]);
    let conductor = Conductor::new(
        config,
        config_provider,
        Arc::new(NoAuth),
        recorder.clone(),
        recorder.clone(),
        recorder.clone(),
    )
    .unwrap();

    conductor.connect().await.unwrap();
    compio::time::sleep(Duration::from_millis(200)).await;

    let rollbacks: Vec<_> = recorder
        .system
        .lock()
        .iter()
        .filter(|event| matches!(event, SystemEvent::Rollback { vbid: 0, seqno: 5 }))
        .count();
    assert_eq!(rollbacks, 1);
}

#[compio::test]
async fn flow_control_acks_once_the_watermark_is_crossed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let node = NodeAddress::new(addr);

    let (ack_tx, ack_rx) = flume::bounded::<u32>(1);

    compio::runtime::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake(&mut stream, 4).await;
        let opaque = expect_stream_req(&mut stream, 0).await;
        write_frame(
            &mut stream,
            response_frame(Opcode::DcpStreamReq, Status::Success.as_u16(), opaque, &failover_log_body(1, 0)),
        )
        .await;
        write_frame(&mut stream, snapshot_marker_frame(0, 0, 1)).await;

        // key.len() + value.len() == 600 bytes of unacked credit against a
        // 1024-byte buffer at a 50% watermark: one mutation is enough to
        // cross it.
        let value = vec![b'x'; 599];
        write_frame(&mut stream, mutation_frame(0, 1, b"k", &value)).await;

        let (ack_header, ack_body) = read_frame(&mut stream).await;
        assert_eq!(ack_header.opcode, Opcode::DcpBufferAck);
        let bytes_acked = u32::from_be_bytes(ack_body[..4].try_into().unwrap());
        let _ = ack_tx.send_async(bytes_acked).await;
    })
    .detach();

    let recorder = Recorder::shared();
    let config_provider = single_node_provider(node, &[0]);
    let config = single_node_config(node, vec![0])
        .with_flow_control_buffer_size(1024)
        .with_buffer_ack_watermark_percent(50);
    let conductor = Conductor::new(
        config,
        config_provider,
        Arc::new(NoAuth),
        recorder.clone(),
        recorder.clone(),
        recorder.clone(),
    )
    .unwrap();

    conductor.connect().await.unwrap();

    let bytes_acked = compio::time::timeout(Duration::from_secs(2), ack_rx.recv_async())
        .await
        .expect("buffer ack observed before timeout")
        .expect("ack channel closed");
    assert_eq!(bytes_acked, 600);
}

#[compio::test]
async fn oso_snapshot_promotes_seqno_to_the_observed_max_on_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let node = NodeAddress::new(addr);

    compio::runtime::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        handshake(&mut stream, 4).await;
        let opaque = expect_stream_req(&mut stream, 0).await;
        write_frame(
            &mut stream,
            response_frame(Opcode::DcpStreamReq, Status::Success.as_u16(), opaque, &failover_log_body(1, 0)),
        )
        .await;

        write_frame(&mut stream, oso_frame(0, OSO_FLAG_START)).await;
        for seqno in [7u64, 5, 9] {
            write_frame(&mut stream, mutation_frame(0, seqno, b"k", b"v")).await;
        }
        write_frame(&mut stream, oso_frame(0, OSO_FLAG_END)).await;
    })
    .detach();

    let recorder = Recorder::shared();
    let config_provider = single_node_provider(node, &[0]);
    let config = single_node_config(node, vec![0]);
    let conductor = Conductor::new(
        config,
        config_provider,
        Arc::new(NoAuth),
        recorder.clone(),
        recorder.clone(),
        recorder.clone(),
    )
    .unwrap();

    conductor.connect().await.unwrap();
    compio::time::sleep(Duration::from_millis(200)).await;

    // The out-of-order window delivers 7, 5, 9 but only the max observed
    // (9) is promoted into `seqno` once the window closes; the snapshot
    // window itself isn't part of the persisted shape, so `seqno` is the
    // only externally observable witness here.
    let json = conductor.persist_session();
    assert_eq!(persisted_seqno(&json, 0), 9);
}

#[compio::test]
async fn dead_connection_is_detected_and_the_stream_reopens_on_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let node = NodeAddress::new(addr);

    let (connected_tx, connected_rx) = flume::unbounded::<()>();

    compio::runtime::spawn(async move {
        for _ in 0..2 {
            let (mut stream, _) = listener.accept().await.unwrap();
            handshake(&mut stream, 4).await;
            let opaque = expect_stream_req(&mut stream, 0).await;
            write_frame(
                &mut stream,
                response_frame(Opcode::DcpStreamReq, Status::Success.as_u16(), opaque, &failover_log_body(1, 0)),
            )
            .await;
            let _ = connected_tx.send_async(()).await;
            // Go silent well past the dead-connection threshold, then drop
            // so the channel's reconnect attempt has something to land on.
            compio::time::sleep(Duration::from_millis(300)).await;
        }
    })
    .detach();

    let recorder = Recorder::shared();
    let config_provider = single_node_provider(node, &[0]);
    let channel_options = ChannelOptions::default().with_dead_connection_detection_interval(Duration::from_millis(50));
    let config = single_node_config(node, vec![0])
        .with_dead_connection_detection_interval(Duration::from_millis(50))
        .with_channel_options(channel_options);
    let conductor = Conductor::new(
        config,
        config_provider,
        Arc::new(NoAuth),
        recorder.clone(),
        recorder.clone(),
        recorder.clone(),
    )
    .unwrap();

    conductor.connect().await.unwrap();

    connected_rx.recv_async().await.expect("first connection established");
    connected_rx.recv_async().await.expect("reconnect after dead-connection detection");

    let dropped = recorder
        .system
        .lock()
        .iter()
        .filter(|event| matches!(event, SystemEvent::ChannelDropped { .. }))
        .count();
    assert!(dropped >= 1);
}
