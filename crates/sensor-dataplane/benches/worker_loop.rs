//! Worker Loop Benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use sensor_common::frame::testing::{tcp4, udp4};
use sensor_common::{PowerConfig, SensorConfig};
use sensor_dataplane::power::idle_hint;
use sensor_dataplane::{BurstIo, Packet, PortStatsTable, RingPorts, SensorContext, TxBuffer, Worker};
use std::sync::Arc;

const BURST: usize = 32;

fn context(io: Arc<RingPorts>) -> Arc<SensorContext> {
    let config = SensorConfig::from_json(
        r#"{
            "ports": [{"interface": "ring0", "ip_addrs": ["10.0.0.1"]}],
            "power": {"interrupts": false},
            "stats_interval_secs": 0,
            "pcap_chain": [
                {"filter": "tcp port 80", "nm_queue_url": "inproc://http", "nm_queue_type": "PUB"},
                {"filter": "udp and dst port 53", "nm_queue_url": "inproc://dns", "nm_queue_type": "PUB"}
            ],
            "re_chain": [{"re": "\\.example\\.com$", "nm_queue_url": "inproc://re", "nm_queue_type": "PUB"}],
            "cidr_table": [
                {"cidr": "10.0.0.0/8", "nm_queue_url": "inproc://ten", "nm_queue_type": "PUB"},
                {"cidr": "192.168.1.1", "nm_queue_url": "inproc://host", "nm_queue_type": "PUB"}
            ]
        }"#,
    )
    .unwrap();
    Arc::new(SensorContext::new(config, io).unwrap())
}

fn bench_worker_iteration(c: &mut Criterion) {
    let io = Arc::new(RingPorts::new(1, 1, 1024));
    let mut worker = Worker::new(0, context(io.clone()));
    let frames: Vec<Vec<u8>> = (0..BURST as u16)
        .map(|i| match i % 2 {
            0 => tcp4([192, 168, 1, 1], [10, 0, 0, 9], 40000 + i, 80, 0x18),
            _ => udp4([10, 0, 0, 9], [8, 8, 8, 8], 40000 + i, 53, b""),
        })
        .collect();

    let mut group = c.benchmark_group("worker");
    group.throughput(Throughput::Elements(BURST as u64));
    group.bench_function("iteration_full_burst", |b| {
        b.iter(|| {
            for frame in &frames {
                io.inject(0, 0, frame.clone());
            }
            worker.run_once();
        })
    });
    group.finish();
}

fn bench_tx_buffer(c: &mut Criterion) {
    let io = RingPorts::new(1, 1, 4096);
    let stats = PortStatsTable::new(1);
    let mut buf = TxBuffer::new(0, BURST);
    let packet = Packet::new(0, vec![0u8; 64]);

    c.bench_function("tx_enqueue_flush", |b| {
        b.iter(|| {
            for _ in 0..BURST {
                buf.enqueue(black_box(packet.clone()), &io, 0, &stats);
            }
            io.collect(0);
        })
    });
}

fn bench_idle_hint(c: &mut Criterion) {
    let config = PowerConfig::default();
    c.bench_function("idle_hint", |b| {
        b.iter(|| black_box(idle_hint(&config, black_box(12_345))))
    });
}

fn bench_ring_burst(c: &mut Criterion) {
    let io = RingPorts::new(1, 1, 1024);
    let frame = bytes::Bytes::from(tcp4([10, 0, 0, 1], [10, 0, 0, 2], 1, 2, 0));
    let mut out = Vec::with_capacity(BURST);

    c.bench_function("ring_receive_burst", |b| {
        b.iter(|| {
            for _ in 0..BURST {
                io.inject(0, 0, frame.clone());
            }
            out.clear();
            black_box(io.receive_burst(0, 0, &mut out, BURST))
        })
    });
}

criterion_group!(benches, bench_worker_iteration, bench_tx_buffer, bench_idle_hint, bench_ring_burst);
criterion_main!(benches);
