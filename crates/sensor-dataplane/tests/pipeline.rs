//! End-to-end runs of the engine over in-memory ports

use sensor_chains::InprocRegistry;
use sensor_common::frame::testing::{arp_request, icmp4_echo, tcp4, udp4};
use sensor_common::{FrameView, MacAddr, Network, SensorConfig};
use sensor_dataplane::{Engine, NoopScaler, RingPorts, SensorContext, TelemetryReport};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CONFIG: &str = r#"{
    "cores": 1,
    "ports": [{"interface": "ring0", "ip_addrs": ["10.0.0.1"]}],
    "scheduler": {"burst_size": 8, "tx_drain_usecs": 50},
    "stats_interval_secs": 0,
    "pcap_chain": [
        {"name": "http", "filter": "tcp port 80", "nm_queue_url": "inproc://http", "nm_queue_type": "PUSH"}
    ],
    "cidr_table": [
        {"name": "lab", "cidr": "10.0.0.0/8", "nm_queue_url": "inproc://lab", "nm_queue_type": "PUB"},
        {"name": "core", "cidr": "10.1.0.0/16", "nm_queue_url": "inproc://core", "nm_queue_type": "PUB"}
    ]
}"#;

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn start(registry: InprocRegistry) -> (Engine, Arc<RingPorts>) {
    let io = Arc::new(RingPorts::new(1, 1, 256));
    let config = SensorConfig::from_json(CONFIG).unwrap();
    let ctx = SensorContext::with_registry(config, io.clone(), Arc::new(NoopScaler), registry).unwrap();
    let mut engine = Engine::new(Arc::new(ctx));
    engine.start().unwrap();
    (engine, io)
}

#[test]
fn test_http_filter_scenario() {
    let registry = InprocRegistry::new();
    let http = registry.subscribe("inproc://http", 16);
    let (mut engine, io) = start(registry);

    for i in 0..3u16 {
        io.inject(0, 0, tcp4([192, 168, 0, 2], [192, 168, 0, 3], 40000 + i, 80, 0x18));
    }
    io.inject(0, 0, tcp4([192, 168, 0, 2], [192, 168, 0, 3], 40000, 22, 0x18));
    io.inject(0, 0, udp4([192, 168, 0, 2], [192, 168, 0, 3], 5353, 53, b""));

    let ctx = engine.context().clone();
    wait_for("http matches", || ctx.chains().filter.entries()[0].core().matches() == 3);
    wait_for("rx counted", || ctx.port_stats().snapshot(0).rx == 5);
    engine.stop();

    let entry = ctx.chains().filter.entries()[0].core();
    assert_eq!(entry.matches(), 3);
    assert_eq!(entry.queue().stats().tx_messages, 3);
    assert_eq!(http.try_iter().count(), 3);
}

#[test]
fn test_longest_prefix_scenario() {
    let registry = InprocRegistry::new();
    let lab = registry.subscribe("inproc://lab", 16);
    let core = registry.subscribe("inproc://core", 16);
    let (mut engine, io) = start(registry);

    io.inject(0, 0, udp4([10, 1, 2, 3], [192, 168, 1, 1], 1, 2, b""));
    io.inject(0, 0, udp4([10, 2, 2, 3], [192, 168, 1, 1], 1, 2, b""));
    io.inject(0, 0, udp4([192, 168, 1, 1], [192, 168, 1, 2], 1, 2, b""));

    let ctx = engine.context().clone();
    wait_for("all frames", || ctx.port_stats().snapshot(0).rx == 3);
    engine.stop();

    assert_eq!(core.try_iter().count(), 1);
    let lab_records: Vec<serde_json::Value> = lab
        .try_iter()
        .map(|b| serde_json::from_slice(&b).unwrap())
        .collect();
    assert_eq!(lab_records.len(), 1);
    assert_eq!(lab_records[0]["entry"], "lab");
    assert_eq!(lab_records[0]["metadata"]["sip"], "10.2.2.3");
    assert_eq!(ctx.chains().table.stats().cidr4, 2);
}

#[test]
fn test_sensor_answers_arp_and_ping() {
    let (mut engine, io) = start(InprocRegistry::new());
    let asker = MacAddr([0x02, 0, 0, 0, 0, 0x42]);

    io.inject(0, 0, arp_request(asker, [10, 0, 0, 42], [10, 0, 0, 1]));
    io.inject(0, 0, icmp4_echo([10, 0, 0, 42], [10, 0, 0, 1], 9, 1));

    let mut sent = Vec::new();
    wait_for("replies", || {
        sent.extend(io.collect(0));
        sent.len() >= 2
    });
    engine.stop();

    let arp = FrameView::parse(&sent[0]).unwrap();
    assert_eq!(arp.dst_mac, asker);
    assert!(matches!(arp.network, Network::Arp(h) if h.op == 2));

    let echo = FrameView::parse(&sent[1]).unwrap();
    assert_eq!(echo.icmp(), Some((0, 0)));
    assert_eq!(echo.dst_ip(), Some("10.0.0.42".parse().unwrap()));

    let report = TelemetryReport::collect(engine.context());
    assert_eq!(report.ports[0].stats.tx, 2);
    assert_eq!(report.ports[0].stats.dropped, 0);
}
