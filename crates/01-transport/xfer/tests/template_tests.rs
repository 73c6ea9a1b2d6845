//! Templates driven through the registry, the way a circuit drives them.

use std::sync::Arc;

use rand::Rng;
use xfer::drivers::{DATAGRAM_PROTOCOL, PIO_PROTOCOL};
use xfer::{
    DriverRegistry, SmemServices, StartOutcome, TransferTemplate, TransferTemplateManager,
    XferConfig, XferFlags, XferServices, FLAG_SIZE,
};

const PAYLOAD_AT: u64 = 0;
const FLAG_AT: u64 = 1024;
const SLOT: u64 = 256;

fn registry(tag: &str) -> DriverRegistry {
    let dir = std::env::temp_dir().join(format!("xfer-templates-{tag}-{}", std::process::id()));
    DriverRegistry::with_default_drivers(XferConfig::default().with_smb_dir(dir))
}

fn pair(registry: &DriverRegistry, protocol: &str) -> (Arc<dyn SmemServices>, Arc<dyn SmemServices>) {
    let src = registry
        .allocate_local_endpoint(protocol, Some(4096))
        .expect("source endpoint");
    let dst = registry
        .allocate_local_endpoint(protocol, Some(4096))
        .expect("target endpoint");
    (
        registry.smem(&src).expect("source smem"),
        registry.smem(&dst).expect("target smem"),
    )
}

/// Payload into slot `slot` of the target, then a flag holding `slot + 1`.
fn slot_template(services: &dyn XferServices, id: xfer::ServicesId, slot: u64) -> TransferTemplate {
    let request = services.group(vec![
        services.create_request(
            PAYLOAD_AT,
            slot * SLOT,
            SLOT,
            XferFlags::DATA | XferFlags::SIZE_MODIFIABLE,
        ),
        services.create_request(FLAG_AT, FLAG_AT + slot * FLAG_SIZE, FLAG_SIZE, XferFlags::FLAG),
    ]);
    TransferTemplate::new().with_step(id, request)
}

fn settle(manager: &mut TransferTemplateManager, target: &Arc<dyn SmemServices>, flag_at: u64, value: u64) {
    let memory = target.handle().expect("target memory");
    for _ in 0..100_000 {
        manager.poll().expect("poll");
        target.poll().expect("target poll");
        if memory.load_flag(flag_at).expect("flag") == value && manager.in_flight() == 0 {
            return;
        }
        std::thread::yield_now();
    }
    panic!("flag at {flag_at} never reached {value}");
}

fn round_trip(protocol: &str, tag: &str) {
    let registry = registry(tag);
    let (src, dst) = pair(&registry, protocol);
    let services = registry.create_xfer_services(&src, &dst).expect("services");

    let mut manager = TransferTemplateManager::new(4);
    let first = slot_template(services.as_ref(), xfer::ServicesId(0), 0);
    let second = slot_template(services.as_ref(), xfer::ServicesId(0), 1);
    let id = manager.add_services(services);
    assert_eq!(id, xfer::ServicesId(0));
    let first = manager.add(first).expect("first");
    let second = manager.add(second).expect("second");
    assert!(manager.services(id).expect("services").target().is_compatible(dst.endpoint()));

    let source = src.handle().expect("source memory");
    let target = dst.handle().expect("target memory");
    let mut rng = rand::thread_rng();
    for (slot, template) in [(0u64, first), (1u64, second)] {
        let length = rng.gen_range(1..=SLOT);
        let payload: Vec<u8> = (0..length).map(|_| rng.gen()).collect();
        source.write(PAYLOAD_AT, &payload).expect("payload");
        source.store_flag(FLAG_AT, slot + 1).expect("flag source");

        assert_eq!(
            manager.start(template, Some(length)).expect("start"),
            StartOutcome::Started
        );
        settle(&mut manager, &dst, FLAG_AT + slot * FLAG_SIZE, slot + 1);
        assert_eq!(
            target.read_vec(slot * SLOT, length).expect("read"),
            payload,
            "{protocol} slot {slot}"
        );
        assert!(manager.drain_completed().contains(&template));
    }
}

#[test]
fn shared_memory_templates_deliver_payload_then_flag() {
    round_trip(PIO_PROTOCOL, "pio");
}

#[test]
fn datagram_templates_deliver_payload_then_flag() {
    round_trip(DATAGRAM_PROTOCOL, "udp");
}

#[test]
fn a_full_manager_reports_busy_and_starts_nothing() {
    let registry = registry("busy");
    let (src, dst) = pair(&registry, PIO_PROTOCOL);
    let services = registry.create_xfer_services(&src, &dst).expect("services");
    let first = slot_template(services.as_ref(), xfer::ServicesId(0), 0);
    let second = slot_template(services.as_ref(), xfer::ServicesId(0), 1);

    let mut manager = TransferTemplateManager::new(1);
    manager.add_services(services);
    let first = manager.add(first).expect("first");
    let second = manager.add(second).expect("second");

    src.handle().expect("source").store_flag(FLAG_AT, 9).expect("flag");
    assert_eq!(manager.start(first, None).expect("start"), StartOutcome::Started);
    assert_eq!(manager.start(second, None).expect("busy"), StartOutcome::Busy);
    assert_eq!(manager.start(first, None).expect("again"), StartOutcome::Busy);

    let target = dst.handle().expect("target");
    assert_eq!(target.load_flag(FLAG_AT + FLAG_SIZE).expect("flag"), 0);

    assert_eq!(manager.poll().expect("poll"), 1);
    assert_eq!(manager.start(second, None).expect("start"), StartOutcome::Started);
    settle(&mut manager, &dst, FLAG_AT + FLAG_SIZE, 9);
}

#[test]
fn templates_on_unknown_services_are_refused() {
    let registry = registry("unknown");
    let (src, dst) = pair(&registry, PIO_PROTOCOL);
    let services = registry.create_xfer_services(&src, &dst).expect("services");
    let orphan = slot_template(services.as_ref(), xfer::ServicesId(3), 0);
    let mut manager = TransferTemplateManager::new(2);
    manager.add_services(services);
    assert!(manager.add(orphan).is_err());
    assert_eq!(manager.template_count(), 0);
}
