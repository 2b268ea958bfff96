/// End-to-end runs over loopback sockets: UDP in, TCP out, CSV on disk.

use std::io::{ErrorKind, Read};
use std::net::{TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use score_relay::capture::{write_capture, CaptureReader};
use score_relay::forwarder::{Forwarder, TcpSink};
use score_relay::ingest::MulticastReceiver;
use score_relay::metrics::Metrics;
use score_relay::orderbook::BookRegistry;
use score_relay::pipeline::{Dispatcher, PacketHandler, Pipeline};
use score_relay::recorder::{LatencyRecorder, LATENCY_HEADER};
use score_relay::types::*;
use score_relay::wire;

/// Accepts one connection and collects score records until EOF.
fn spawn_destination() -> (String, JoinHandle<Vec<ScoreMessage>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; wire::SCORE_LEN];
        loop {
            match stream.read_exact(&mut buf) {
                Ok(()) => out.push(wire::decode_score(&buf)),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => panic!("destination read failed: {e}"),
            }
        }
        out
    });
    (addr, handle)
}

fn relay(addr: &str, latency_log: &std::path::Path) -> Pipeline<TcpSink> {
    let clock = quanta::Clock::new();
    Pipeline::new(
        Arc::new(BookRegistry::new()),
        Arc::new(Forwarder::new(TcpSink::connect(addr).unwrap(), clock.clone())),
        Arc::new(LatencyRecorder::open(latency_log).unwrap()),
        Arc::new(Metrics::new()),
        clock,
    )
}

fn example_packet() -> Vec<u8> {
    wire::encode_update(&UpdateMessage {
        subject_id: 42,
        updates: vec![
            LevelUpdate { level: 0, side: Side::Demand, value: 150_000_000_000, volume: 100 },
            LevelUpdate { level: 0, side: Side::Supply, value: 151_000_000_000, volume: 200 },
        ],
    })
    .unwrap()
}

fn latency_rows(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_single_packet_forwards_expected_record() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("results/latency_trace.csv");
    let (addr, dest) = spawn_destination();

    let p = relay(&addr, &log);
    p.handle(example_packet()).unwrap();
    drop(p);

    assert_eq!(
        dest.join().unwrap(),
        vec![ScoreMessage { subject_id: 42, score: 150_333_333_333 }]
    );
    let rows = latency_rows(&log);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], LATENCY_HEADER);
    assert!(rows[1].starts_with("42,"));
    assert!(rows[1].ends_with(",2"));
}

#[test]
fn test_repeated_packet_forwards_once() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("latency_trace.csv");
    let (addr, dest) = spawn_destination();

    let p = relay(&addr, &log);
    p.handle(example_packet()).unwrap();
    p.handle(example_packet()).unwrap();
    let m = p.metrics().snapshot();
    drop(p);

    assert_eq!(dest.join().unwrap().len(), 1);
    assert_eq!((m.forwarded, m.suppressed), (1, 1));
    assert_eq!(latency_rows(&log).len(), 2);
}

#[test]
fn test_truncated_packet_is_dropped_whole() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("latency_trace.csv");
    let (addr, dest) = spawn_destination();

    // Declares 5 updates, carries 2.
    let mut raw = example_packet();
    raw[8..10].copy_from_slice(&5u16.to_be_bytes());

    let p = relay(&addr, &log);
    assert!(p.handle(raw).is_err());
    assert!(p.registry().get(42).is_none());
    assert_eq!(p.metrics().snapshot().framing_errors, 1);
    drop(p);

    assert!(dest.join().unwrap().is_empty());
    // Nothing recorded, so not even the header.
    assert!(latency_rows(&log).is_empty());
}

#[test]
fn test_latency_log_reopen_appends() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("latency_trace.csv");

    for _ in 0..2 {
        let (addr, dest) = spawn_destination();
        let p = relay(&addr, &log);
        p.handle(example_packet()).unwrap();
        drop(p);
        dest.join().unwrap();
    }

    let rows = latency_rows(&log);
    assert_eq!(rows.len(), 3);
    assert_eq!(rows.iter().filter(|r| r.as_str() == LATENCY_HEADER).count(), 1);
}

#[test]
fn test_udp_to_tcp_through_dispatcher() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("latency_trace.csv");
    let (addr, dest) = spawn_destination();

    let dispatcher = Dispatcher::start(Arc::new(relay(&addr, &log)), 3, 64).unwrap();
    let receiver = MulticastReceiver::from_socket(UdpSocket::bind("127.0.0.1:0").unwrap()).unwrap();
    let target = receiver.local_addr().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let recv_handle = {
        let ingress = dispatcher.ingress();
        let stop = Arc::clone(&stop);
        thread::spawn(move || receiver.run(&ingress, &stop))
    };

    let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
    let subjects = [7u32, 8, 9];
    for (i, sid) in subjects.iter().enumerate() {
        let raw = wire::encode_update(&UpdateMessage {
            subject_id: *sid,
            updates: vec![
                LevelUpdate { level: 0, side: Side::Demand, value: 10 * (i as i64 + 1), volume: 1 },
                LevelUpdate { level: 0, side: Side::Supply, value: 30 * (i as i64 + 1), volume: 1 },
            ],
        })
        .unwrap();
        tx.send_to(&raw, target).unwrap();
    }

    let pipeline = Arc::clone(dispatcher.pipeline());
    for _ in 0..200 {
        if pipeline.metrics().snapshot().forwarded == 3 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    stop.store(true, Ordering::Release);
    recv_handle.join().unwrap();
    assert_eq!(dispatcher.drain(), 3);
    drop(pipeline);

    let mut got = dest.join().unwrap();
    got.sort_by_key(|m| m.subject_id);
    assert_eq!(
        got,
        vec![
            ScoreMessage { subject_id: 7, score: 20 },
            ScoreMessage { subject_id: 8, score: 40 },
            ScoreMessage { subject_id: 9, score: 60 },
        ]
    );
    assert_eq!(latency_rows(&log).len(), 4);
}

#[test]
fn test_capture_replay_matches_inline_processing() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("input_packets.bin");
    let packets: Vec<Vec<u8>> = (0..50u32)
        .map(|i| {
            wire::encode_update(&UpdateMessage {
                subject_id: 100 + i % 5,
                updates: vec![LevelUpdate {
                    level: 0,
                    side: if i % 2 == 0 { Side::Demand } else { Side::Supply },
                    value: 1_000 + i as i64,
                    volume: 10,
                }],
            })
            .unwrap()
        })
        .collect();
    write_capture(&capture, packets.iter().map(Vec::as_slice)).unwrap();

    let (addr, dest) = spawn_destination();
    let dispatcher = Dispatcher::start(
        Arc::new(relay(&addr, &dir.path().join("latency.csv"))),
        2,
        4,
    )
    .unwrap();
    let ingress = dispatcher.ingress();
    let reader = CaptureReader::open(&capture).unwrap();
    for p in reader.packets() {
        ingress.handle(p.to_vec()).unwrap();
    }
    drop(ingress);
    let pipeline = Arc::clone(dispatcher.pipeline());
    assert_eq!(dispatcher.drain(), 50);

    // Per subject, the last forwarded score is what the final book yields.
    for sid in 100..105u32 {
        let top = pipeline.registry().get(sid).unwrap().top();
        let expected = score_relay::score::composite_score(&top);
        assert_eq!(pipeline.forwarder().detector().last_forwarded(sid), Some(expected));
    }
    let forwarded = pipeline.metrics().snapshot().forwarded as usize;
    drop(pipeline);
    assert_eq!(dest.join().unwrap().len(), forwarded);
}
