//! In-memory Bean for session tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bean_proto::{Frame, Packetizer, RESPONSE_FLAG, Reassembler};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{
    BATTERY_LEVEL, FIRMWARE_VERSION, HARDWARE_VERSION, OAD_BLOCK, OAD_IDENTIFY, OAD_SERVICE,
    SCRATCH_CHARS, SERIAL_CHAR, SERIAL_SERVICE, SOFTWARE_VERSION,
};
use crate::error::TransportError;
use crate::transport::{Discovery, GattService, GattTransport, LinkEvent};

/// Services a real Bean exposes
pub fn bean_services() -> Vec<GattService> {
    let uuid = |s: &str| Uuid::parse_str(s).unwrap();
    vec![
        GattService {
            uuid: SERIAL_SERVICE,
            characteristics: vec![SERIAL_CHAR],
        },
        GattService {
            uuid: uuid(bean_proto::ble::SCRATCH_SERVICE_UUID),
            characteristics: SCRATCH_CHARS.to_vec(),
        },
        GattService {
            uuid: OAD_SERVICE,
            characteristics: vec![OAD_IDENTIFY, OAD_BLOCK],
        },
        GattService {
            uuid: uuid(bean_proto::ble::DEVICE_INFO_SERVICE_UUID),
            characteristics: vec![FIRMWARE_VERSION, HARDWARE_VERSION, SOFTWARE_VERSION],
        },
        GattService {
            uuid: uuid(bean_proto::ble::BATTERY_SERVICE_UUID),
            characteristics: vec![BATTERY_LEVEL],
        },
    ]
}

#[derive(Default)]
struct DeviceState {
    link: Option<mpsc::UnboundedSender<LinkEvent>>,
    reads: HashMap<Uuid, Vec<u8>>,
    subscribed: Vec<Uuid>,
    connects: u32,
    disconnects: u32,
    /// Writes never complete while set
    stall_writes: bool,
    stalled_writes: u32,
}

pub struct MockTransport {
    services: Vec<GattService>,
    state: Arc<Mutex<DeviceState>>,
    writes: mpsc::UnboundedSender<(Uuid, Vec<u8>)>,
}

#[async_trait]
impl GattTransport for MockTransport {
    async fn connect(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        state.subscribed.clear();
        state.link = Some(events);
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError> {
        Ok(self.services.clone())
    }

    async fn write(&self, characteristic: Uuid, value: Vec<u8>) -> Result<(), TransportError> {
        let stalled = {
            let mut state = self.state.lock().unwrap();
            if state.stall_writes {
                state.stalled_writes += 1;
            }
            state.stall_writes
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        let _ = self.writes.send((characteristic, value));
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        self.state
            .lock()
            .unwrap()
            .reads
            .get(&characteristic)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(characteristic))
    }

    async fn enable_notifications(&self, characteristic: Uuid) -> Result<(), TransportError> {
        self.state.lock().unwrap().subscribed.push(characteristic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.disconnects += 1;
        state.link = None;
        Ok(())
    }
}

/// Always finds the device again
pub struct MockDiscovery;

#[async_trait]
impl Discovery for MockDiscovery {
    async fn rediscover(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// The test's side of the link
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
    writes: mpsc::UnboundedReceiver<(Uuid, Vec<u8>)>,
    reassembler: Reassembler,
    packetizer: Mutex<Packetizer>,
}

impl MockDevice {
    pub fn new(services: Vec<GattService>) -> (Arc<MockTransport>, MockDevice) {
        let state = Arc::new(Mutex::new(DeviceState::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = MockTransport {
            services,
            state: state.clone(),
            writes: tx,
        };
        let device = MockDevice {
            state,
            writes: rx,
            reassembler: Reassembler::new(),
            packetizer: Mutex::new(Packetizer::new()),
        };
        (Arc::new(transport), device)
    }

    pub async fn next_write(&mut self) -> (Uuid, Vec<u8>) {
        self.writes.recv().await.unwrap()
    }

    pub fn try_write(&mut self) -> Option<(Uuid, Vec<u8>)> {
        self.writes.try_recv().ok()
    }

    /// Reassemble the next message the client wrote to the serial channel
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            let (characteristic, packet) = self.next_write().await;
            assert_eq!(characteristic, SERIAL_CHAR, "expected a serial write");
            if let Some(body) = self.reassembler.push(&packet).unwrap() {
                return Frame::from_body(&body).unwrap();
            }
        }
    }

    /// Send a message to the client over the serial channel
    pub fn send(&self, msg_type: u16, payload: &[u8]) {
        let envelope = Frame::new(msg_type, payload.to_vec())
            .to_envelope()
            .unwrap();
        let packets = self.packetizer.lock().unwrap().packetize(&envelope).unwrap();
        for packet in packets {
            self.notify(SERIAL_CHAR, packet);
        }
    }

    pub fn respond(&self, msg_type: u16, payload: &[u8]) {
        self.send(msg_type | RESPONSE_FLAG, payload);
    }

    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        let state = self.state.lock().unwrap();
        let link = state.link.as_ref().expect("not connected");
        link.send(LinkEvent::Notification {
            characteristic,
            value,
        })
        .unwrap();
    }

    /// The device walks away
    pub fn drop_link(&self) {
        let link = self.state.lock().unwrap().link.take();
        if let Some(link) = link {
            let _ = link.send(LinkEvent::Disconnected);
        }
    }

    pub fn set_read(&self, characteristic: Uuid, value: Vec<u8>) {
        self.state.lock().unwrap().reads.insert(characteristic, value);
    }

    pub fn subscribed(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().subscribed.clone()
    }

    /// Stop confirming writes
    pub fn stall_writes(&self) {
        self.state.lock().unwrap().stall_writes = true;
    }

    pub fn stalled_writes(&self) -> u32 {
        self.state.lock().unwrap().stalled_writes
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> u32 {
        self.state.lock().unwrap().disconnects
    }
}
