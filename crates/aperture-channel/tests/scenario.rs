//! End-to-end lifecycle over the wire protocol: device, channel, kill
//! subscription, ring traffic, device-side kill.

use std::sync::{Arc, Mutex};

use aperture_broker::{Broker, ClassRegistry, Client, Completion};
use aperture_channel::{
    classes, ApertureKind, Channel, ChannelEvents, ChannelParams, DeviceBackend, EngineId,
    EngineOps, CHANNEL_CLASS, CHANNEL_GROUP_CLASS, DEVICE_CLASS,
};
use aperture_protocol::{ControlKind, Envelope, EventRequest, MthdPayload, NewPayload, Status};
use aperture_ring::sim::SimConsumer;
use pretty_assertions::assert_eq;

struct NullOps;

impl EngineOps for NullOps {
    fn init(&self, _engine: EngineId) -> aperture_broker::Result<()> {
        Ok(())
    }
    fn fini(&self, _engine: EngineId) {}
}

struct Rig {
    broker: Arc<Broker>,
    client: Arc<Client>,
    backend: Arc<DeviceBackend>,
    sim: Arc<SimConsumer>,
    events: Arc<Mutex<Vec<(u64, u32)>>>,
}

fn rig() -> Rig {
    let sim = Arc::new(SimConsumer::new(0));
    let ring_sim = sim.clone();
    let backend = DeviceBackend::new(
        Arc::new(NullOps),
        Box::new(move |_identity| Box::new(ring_sim.clone())),
    );

    let mut registry = ClassRegistry::default();
    classes::register(&mut registry, &backend);

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = events.clone();
    let client = Client::new(
        vec![DEVICE_CLASS],
        Arc::new(move |handle, prefix, _payload| {
            sink_events.lock().unwrap().push((handle, prefix.types));
        }),
    );

    Rig {
        broker: Broker::new(registry),
        client,
        backend,
        sim,
        events,
    }
}

impl Rig {
    fn new_object(&self, target: u64, handle: u32, class_id: i32, payload: Vec<u8>) -> Completion {
        let body = NewPayload {
            handle,
            class_id,
            class_payload: payload,
        };
        self.broker.submit(
            &self.client,
            &Envelope::local(ControlKind::New, target, body.encode()),
        )
    }

    fn mthd(&self, target: u64, method: u8, payload: Vec<u8>) -> Completion {
        let body = MthdPayload {
            method,
            method_payload: payload,
        };
        self.broker.submit(
            &self.client,
            &Envelope::local(ControlKind::Mthd, target, body.encode()),
        )
    }

    fn del(&self, target: u64) -> Completion {
        self.broker.submit(
            &self.client,
            &Envelope::local(ControlKind::Del, target, Vec::new()),
        )
    }
}

fn channel_params(chan_id: u32, ring_words: u32) -> Vec<u8> {
    ChannelParams {
        runlist: 0,
        chan_id,
        ring_words,
        aperture: ApertureKind::SysMemCoherent,
        instance_address: 0x10_0000,
        engines: vec![2],
    }
    .encode()
}

fn words_wire(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

#[test]
fn full_channel_lifecycle_over_the_protocol() {
    let rig = rig();

    // Device at handle 1, channel at handle 2 with an 8192-word ring.
    assert_eq!(rig.new_object(0, 1, DEVICE_CLASS, Vec::new()).status, Status::Ok);
    let done = rig.new_object(1, 2, CHANNEL_CLASS, channel_params(4, 8192));
    assert_eq!(done.status, Status::Ok);
    assert_eq!(done.new_handle, Some(2));

    // Kill subscription at handle 3, parented on the channel.
    let sub = rig.new_object(
        2,
        3,
        aperture_broker::EVENT_CLASS_ID,
        EventRequest::new(ChannelEvents::KILLED.bits()).encode(),
    );
    assert_eq!(sub.status, Status::Ok);

    // 64 words in, doorbell, device drains them all.
    let words: Vec<u32> = (0..64).collect();
    assert_eq!(
        rig.mthd(2, Channel::MTHD_APPEND, words_wire(&words)).status,
        Status::Ok
    );
    assert_eq!(rig.mthd(2, Channel::MTHD_KICK, Vec::new()).status, Status::Ok);
    assert_eq!(rig.sim.published_put(), Some(64));
    rig.sim.drain(64);

    // With the ring drained, a large reservation succeeds immediately.
    assert_eq!(
        rig.mthd(2, Channel::MTHD_RESERVE, 4096u32.to_le_bytes().to_vec())
            .status,
        Status::Ok
    );

    // Device reports the channel killed: exactly one delivery carrying the
    // killed bit, then every ring operation fails fatal.
    assert!(rig.backend.kill_channel(0, 4));
    assert_eq!(
        *rig.events.lock().unwrap(),
        vec![(3, ChannelEvents::KILLED.bits())]
    );
    assert!(rig.backend.kill_channel(0, 4), "repeat report is absorbed");
    assert_eq!(rig.events.lock().unwrap().len(), 1);

    assert_eq!(
        rig.mthd(2, Channel::MTHD_APPEND, words_wire(&[1])).status,
        Status::Fatal
    );
    assert_eq!(rig.mthd(2, Channel::MTHD_KICK, Vec::new()).status, Status::Fatal);

    // Teardown still works on a killed channel.
    assert_eq!(rig.del(2).status, Status::ObjectGone);
}

#[test]
fn channels_construct_under_groups_too() {
    let rig = rig();
    assert_eq!(rig.new_object(0, 1, DEVICE_CLASS, Vec::new()).status, Status::Ok);
    assert_eq!(
        rig.new_object(1, 5, CHANNEL_GROUP_CLASS, Vec::new()).status,
        Status::Ok
    );
    assert_eq!(
        rig.new_object(5, 6, CHANNEL_CLASS, channel_params(9, 64)).status,
        Status::Ok
    );

    // Identity query reflects the construction parameters.
    let done = rig.mthd(6, Channel::MTHD_IDENTITY, Vec::new());
    assert_eq!(done.status, Status::Ok);
    assert_eq!(&done.payload[0..4], &9u32.to_le_bytes());

    // Same id on the same runlist, same group: refused.
    assert_eq!(
        rig.new_object(5, 7, CHANNEL_CLASS, channel_params(9, 64)).status,
        Status::Busy
    );

    // Kill reports reach channels in protocol-made groups.
    assert!(rig.backend.kill_channel(0, 9));
    assert_eq!(
        rig.mthd(6, Channel::MTHD_KICK, Vec::new()).status,
        Status::Fatal
    );
}

#[test]
fn pio_channel_rejects_ring_methods() {
    let rig = rig();
    rig.new_object(0, 1, DEVICE_CLASS, Vec::new());
    assert_eq!(
        rig.new_object(1, 2, CHANNEL_CLASS, channel_params(4, 0)).status,
        Status::Ok
    );
    assert_eq!(
        rig.mthd(2, Channel::MTHD_KICK, Vec::new()).status,
        Status::NotSupported
    );
}

#[test]
fn bad_channel_parameters_construct_nothing() {
    let rig = rig();
    rig.new_object(0, 1, DEVICE_CLASS, Vec::new());
    let live = rig.client.live_objects();

    // Misaligned instance block.
    let bad = ChannelParams {
        runlist: 0,
        chan_id: 4,
        ring_words: 64,
        aperture: ApertureKind::VidMem,
        instance_address: 0x1234,
        engines: Vec::new(),
    }
    .encode();
    assert_eq!(
        rig.new_object(1, 2, CHANNEL_CLASS, bad).status,
        Status::NotSupported
    );
    assert_eq!(rig.client.live_objects(), live);
}
