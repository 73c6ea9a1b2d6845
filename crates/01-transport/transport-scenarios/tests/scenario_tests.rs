//! Runs every scenario kind over both reference drivers.

use std::sync::Arc;

use rand::Rng;
use transport_scenarios::{
    ArcStatsSink, FrameScenarioEngine, ScenarioKind, TestConfig,
};
use xfer::drivers::{DATAGRAM_PROTOCOL, PIO_PROTOCOL};

fn scenario(tag: &str, config: TestConfig) -> TestConfig {
    let dir = std::env::temp_dir().join(format!("scenario-{tag}-{}", std::process::id()));
    config.with_smb_dir(dir)
}

fn run(config: TestConfig) {
    let name = format!("{:?} over {}", config.kind, config.protocol);
    let mut engine = FrameScenarioEngine::new(config).expect("engine");
    let result = engine.run_and_verify().expect("run");
    assert!(result.passed(), "{name}: {result}");
}

#[test]
fn flood_over_shared_memory() {
    run(scenario("flood", TestConfig::flood(200)));
}

#[test]
fn burst_larger_than_the_rings() {
    run(scenario("burst", TestConfig::burst(5, 11)));
}

#[test]
fn backpressure_holds_the_producer() {
    let sink = ArcStatsSink::new();
    let config = scenario("backpressure", TestConfig::backpressure(40).with_buffers(2, 32));
    let mut engine = FrameScenarioEngine::new(config)
        .expect("engine")
        .with_stats_sink(Arc::new(sink.clone()));
    let result = engine.run_and_verify().expect("run");
    assert!(result.passed(), "{result}");

    let stats = sink.snapshot();
    assert_eq!(stats.sent, 40);
    assert_eq!(stats.received, 40);
    assert_eq!(stats.bytes, 40 * 32);
    assert!(stats.stalls > 0);
    assert!(stats.max_outstanding <= 4);
}

#[test]
fn flood_over_datagrams() {
    run(scenario(
        "udp-flood",
        TestConfig::flood(100)
            .with_protocol(DATAGRAM_PROTOCOL)
            .with_buffers(4, 1024),
    ));
}

#[test]
fn random_geometries_deliver_everything() {
    let mut rng = rand::thread_rng();
    for round in 0..6 {
        let count = rng.gen_range(1..=6);
        let length = rng.gen_range(4..=256);
        let kind = match round % 3 {
            0 => TestConfig::flood(rng.gen_range(1..64)),
            1 => TestConfig::burst(rng.gen_range(1..4), rng.gen_range(1..16)),
            _ => TestConfig::backpressure(rng.gen_range(1..48)),
        };
        let config = scenario(&format!("random-{round}"), kind)
            .with_buffers(count, length)
            .with_protocol(PIO_PROTOCOL);
        run(config);
    }
}

#[test]
fn tiny_buffers_are_refused() {
    let config = scenario("tiny", TestConfig::flood(1).with_buffers(2, 2));
    assert!(FrameScenarioEngine::new(config).is_err());
    assert_eq!(
        TestConfig::from_raw(2, 9, 0).map(|config| config.kind),
        Some(ScenarioKind::Backpressure { frames: 9 })
    );
}
