//! One Bean connection
//!
//! [`Session`] is an actor: a single task owns the reassembler, the packet
//! sequence counter, the operation queue, the pending-request table and both
//! upload controllers. Callers talk to it through a [`Connection`] handle;
//! transport operations and timers run as spawned tasks that report back on
//! an internal channel, so no state is ever shared.
//!
//! Every completion carries the connection epoch it was started in. A
//! disconnect bumps the epoch, which turns anything still in flight from the
//! old link into a no-op.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bean_proto::firmware::FirmwareBundle;
use bean_proto::{
    Frame, MSG_BL_STATUS, MSG_BT_END_GATE, MSG_SERIAL_DATA, Packetizer, Reassembler, Status,
    is_unsolicited, message_name,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{BeanConfig, GattProfile};
use crate::error::{BeanError, TransportError};
use crate::firmware::{FirmwareAction, FirmwareState, FirmwareUpload, OadChannel};
use crate::queue::OperationQueue;
use crate::sketch::{SketchAction, SketchUpload};
use crate::timer::TimerToken;
use crate::transport::{Discovery, GattService, GattTransport, LinkEvent, has_characteristic};
use crate::upload::{Upload, UploadEvent, UploadKind};

type Reply<T> = oneshot::Sender<Result<T, BeanError>>;

/// Broadcast to every [`Connection::events`] subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum BeanEvent {
    /// Bytes the sketch wrote to its serial port
    SerialData(Vec<u8>),
    /// Bootloader status, reported whether or not an upload is running
    Status(Status),
    ScratchChanged { bank: u8, data: Vec<u8> },
    BatteryLevel(u8),
    Connected,
    Disconnected,
    /// The link was torn down because of a protocol or transport fault
    LinkError(String),
}

pub(crate) enum Command {
    Connect(Reply<()>),
    Disconnect(Reply<()>),
    Send {
        frame: Frame,
        expect_response: bool,
        reply: Reply<Vec<u8>>,
    },
    Gatt {
        op: OpKind,
        reply: Reply<Vec<u8>>,
    },
    ProgramFirmware {
        bundle: FirmwareBundle,
        events: mpsc::UnboundedSender<UploadEvent>,
        reply: Reply<()>,
    },
    ProgramSketch {
        name: String,
        image: Vec<u8>,
        timestamp: u32,
        events: mpsc::UnboundedSender<UploadEvent>,
        reply: Reply<()>,
    },
    ApproveFirmware {
        approved: bool,
        reply: Reply<()>,
    },
    CancelUpload(UploadKind),
}

/// Reports from tasks the session spawned
enum Internal {
    Connected {
        epoch: u64,
        result: Result<(Vec<GattService>, mpsc::UnboundedReceiver<LinkEvent>), BeanError>,
    },
    OperationDone {
        epoch: u64,
        reply: OpReply,
        result: Result<Vec<u8>, TransportError>,
    },
    Timer {
        owner: UploadKind,
        token: TimerToken,
    },
    Rediscovered(Result<(), TransportError>),
}

/// One GATT operation
#[derive(Debug, Clone)]
pub(crate) enum OpKind {
    Write { characteristic: Uuid, value: Vec<u8> },
    Read { characteristic: Uuid },
    EnableNotifications { characteristic: Uuid },
}

impl OpKind {
    fn characteristic(&self) -> Uuid {
        match self {
            OpKind::Write { characteristic, .. }
            | OpKind::Read { characteristic }
            | OpKind::EnableNotifications { characteristic } => *characteristic,
        }
    }

    /// Run the operation, retrying when the transport does not confirm it in
    /// time.
    async fn execute(
        &self,
        transport: &dyn GattTransport,
        timeout: Duration,
        retries: u32,
    ) -> Result<Vec<u8>, TransportError> {
        let attempts = retries + 1;
        for attempt in 1..=attempts {
            let result = match self {
                OpKind::Write { characteristic, value } => {
                    tokio::time::timeout(timeout, transport.write(*characteristic, value.clone()))
                        .await
                        .map(|r| r.map(|()| Vec::new()))
                }
                OpKind::Read { characteristic } => {
                    tokio::time::timeout(timeout, transport.read(*characteristic)).await
                }
                OpKind::EnableNotifications { characteristic } => {
                    tokio::time::timeout(timeout, transport.enable_notifications(*characteristic))
                        .await
                        .map(|r| r.map(|()| Vec::new()))
                }
            };
            match result {
                Ok(result) => return result,
                Err(_) => log::warn!(
                    "operation on {} unconfirmed after {:?} (attempt {}/{})",
                    self.characteristic(),
                    timeout,
                    attempt,
                    attempts
                ),
            }
        }
        Err(TransportError::Timeout { attempts })
    }
}

/// Who is waiting for an operation
enum OpReply {
    /// Serial packet. The last packet of a frame sent without expecting a
    /// response carries the caller's reply.
    Packet(Option<Reply<Vec<u8>>>),
    Caller(Reply<Vec<u8>>),
    Firmware(FirmwareOp),
}

#[derive(Debug, Clone, Copy)]
enum FirmwareOp {
    ReadVersion,
    EnableNotifications,
    Write,
}

impl OpReply {
    fn abandon(self, error: BeanError) {
        match self {
            OpReply::Packet(Some(reply)) | OpReply::Caller(reply) => {
                let _ = reply.send(Err(error));
            }
            OpReply::Packet(None) | OpReply::Firmware(_) => {}
        }
    }
}

struct Operation {
    kind: OpKind,
    reply: OpReply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct Session {
    transport: Arc<dyn GattTransport>,
    discovery: Option<Arc<dyn Discovery>>,
    config: BeanConfig,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: broadcast::Sender<BeanEvent>,

    state: LinkState,
    epoch: u64,
    link: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    services: Vec<GattService>,
    connect_waiters: Vec<Reply<()>>,

    queue: OperationQueue<Operation>,
    packetizer: Packetizer,
    reassembler: Reassembler,
    pending: HashMap<u16, VecDeque<Reply<Vec<u8>>>>,

    firmware: FirmwareUpload,
    sketch: SketchUpload,
    upload_events: HashMap<UploadKind, mpsc::UnboundedSender<UploadEvent>>,
    timers: HashMap<UploadKind, JoinHandle<()>>,
}

impl Session {
    /// Start the session task. Must be called from within a tokio runtime.
    pub fn spawn(transport: Arc<dyn GattTransport>, config: BeanConfig) -> Connection {
        Self::start(transport, None, config)
    }

    /// Like [`spawn`](Self::spawn), with a way to find the device again after
    /// it reboots during a firmware update.
    pub fn spawn_with_discovery(
        transport: Arc<dyn GattTransport>,
        discovery: Arc<dyn Discovery>,
        config: BeanConfig,
    ) -> Connection {
        Self::start(transport, Some(discovery), config)
    }

    fn start(
        transport: Arc<dyn GattTransport>,
        discovery: Option<Arc<dyn Discovery>>,
        config: BeanConfig,
    ) -> Connection {
        let (commands_tx, commands) = mpsc::channel(config.session.command_buffer.max(1));
        let (events, _) = broadcast::channel(config.session.event_buffer.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let profile = config.profile.clone();

        let session = Session {
            transport,
            discovery,
            firmware: FirmwareUpload::new(config.firmware.clone()),
            sketch: SketchUpload::new(config.sketch.clone()),
            config,
            commands,
            internal_tx,
            internal_rx,
            events: events.clone(),
            state: LinkState::Disconnected,
            epoch: 0,
            link: None,
            services: Vec::new(),
            connect_waiters: Vec::new(),
            queue: OperationQueue::new(),
            packetizer: Packetizer::new(),
            reassembler: Reassembler::new(),
            pending: HashMap::new(),
            upload_events: HashMap::new(),
            timers: HashMap::new(),
        };
        tokio::spawn(session.run());

        Connection {
            commands: commands_tx,
            events,
            profile,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
                event = next_link_event(&mut self.link) => self.on_link_event(event),
            }
        }

        log::debug!("last handle dropped, closing session");
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        if self.state != LinkState::Disconnected {
            if let Err(e) = self.transport.disconnect().await {
                log::debug!("disconnect on close failed: {}", e);
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => self.connect(Some(reply)),
            Command::Disconnect(reply) => self.disconnect(reply),
            Command::Send {
                frame,
                expect_response,
                reply,
            } => self.send_frame(frame, expect_response, reply),
            Command::Gatt { op, reply } => self.enqueue(Operation {
                kind: op,
                reply: OpReply::Caller(reply),
            }),
            Command::ProgramFirmware {
                bundle,
                events,
                reply,
            } => {
                let result = self.check_firmware_preconditions().and_then(|()| {
                    self.firmware.start(bundle)
                });
                if result.is_ok() {
                    self.upload_events.insert(UploadKind::Firmware, events);
                }
                let _ = reply.send(result);
            }
            Command::ProgramSketch {
                name,
                image,
                timestamp,
                events,
                reply,
            } => {
                let result = if self.sketch.is_active() {
                    Err(BeanError::UploadInProgress)
                } else if self.state != LinkState::Connected {
                    Err(BeanError::NotConnected)
                } else {
                    self.sketch.start(&name, &image, timestamp)
                };
                if result.is_ok() {
                    self.upload_events.insert(UploadKind::Sketch, events);
                }
                let _ = reply.send(result);
            }
            Command::ApproveFirmware { approved, reply } => {
                if !self.firmware.answer_approval(approved) {
                    log::warn!("no firmware update is waiting for approval");
                }
                let _ = reply.send(Ok(()));
            }
            Command::CancelUpload(UploadKind::Firmware) => self.firmware.cancel(),
            Command::CancelUpload(UploadKind::Sketch) => self.sketch.cancel(),
        }
        self.apply_actions();
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Connected { epoch, result } => self.on_connected(epoch, result),
            Internal::OperationDone {
                epoch,
                reply,
                result,
            } => {
                if epoch != self.epoch {
                    reply.abandon(BeanError::Disconnected);
                    return;
                }
                // Keep the link busy before acting on the result
                if let Some(next) = self.queue.on_operation_complete() {
                    self.execute(next);
                }
                self.on_operation_done(reply, result.map_err(BeanError::from));
            }
            Internal::Timer { owner, token } => match owner {
                UploadKind::Firmware => self.firmware.on_timeout(token),
                UploadKind::Sketch => self.sketch.on_timeout(token),
            },
            Internal::Rediscovered(result) => {
                if self.firmware.state() == FirmwareState::Reconnecting {
                    match result {
                        Ok(()) => {
                            log::info!("device is back, reconnecting");
                            self.connect(None);
                        }
                        Err(e) => self.firmware.on_reconnect_failed(e.into()),
                    }
                }
            }
        }
        self.apply_actions();
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Disconnected => {
                if self.state == LinkState::Connected {
                    log::info!("link lost");
                    self.teardown(None);
                }
            }
            LinkEvent::Notification {
                characteristic,
                value,
            } => self.on_notification(characteristic, value),
        }
        self.apply_actions();
    }

    fn connect(&mut self, reply: Option<Reply<()>>) {
        match self.state {
            LinkState::Connected => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                return;
            }
            LinkState::Connecting => {
                self.connect_waiters.extend(reply);
                return;
            }
            LinkState::Disconnected => self.connect_waiters.extend(reply),
        }

        log::info!("connecting");
        self.state = LinkState::Connecting;
        let epoch = self.epoch;
        let transport = self.transport.clone();
        let internal = self.internal_tx.clone();
        let profile = self.config.profile.clone();
        tokio::spawn(async move {
            let (tx, rx) = mpsc::unbounded_channel();
            let result = match transport.connect(tx).await {
                Ok(()) => match prepare_link(transport.as_ref(), profile.serial_service, profile.serial).await {
                    Ok(services) => Ok((services, rx)),
                    Err(e) => {
                        let _ = transport.disconnect().await;
                        Err(e)
                    }
                },
                Err(e) => Err(e.into()),
            };
            let _ = internal.send(Internal::Connected { epoch, result });
        });
    }

    fn on_connected(
        &mut self,
        epoch: u64,
        result: Result<(Vec<GattService>, mpsc::UnboundedReceiver<LinkEvent>), BeanError>,
    ) {
        if epoch != self.epoch {
            if result.is_ok() {
                log::debug!("connect finished after the session gave up on it");
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    let _ = transport.disconnect().await;
                });
            }
            return;
        }

        match result {
            Ok((services, link)) => {
                log::info!("connected, {} services", services.len());
                self.state = LinkState::Connected;
                self.services = services;
                self.link = Some(link);
                self.reassembler.reset();
                self.packetizer.reset();

                if let Ok(packets) = self.packetize(&Frame::new(MSG_BT_END_GATE, Vec::new())) {
                    self.enqueue_packets(packets, None);
                }
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.broadcast(BeanEvent::Connected);
                self.firmware.on_reconnected();
            }
            Err(e) => {
                log::error!("connect failed: {}", e);
                self.state = LinkState::Disconnected;
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(e.clone()));
                }
                self.firmware.on_reconnect_failed(e);
            }
        }
    }

    fn disconnect(&mut self, reply: Reply<()>) {
        if self.state == LinkState::Disconnected {
            self.firmware.cancel();
            let _ = reply.send(Ok(()));
            return;
        }
        log::info!("disconnecting");
        self.firmware.cancel();
        self.sketch.cancel();
        self.teardown(None);

        let transport = self.transport.clone();
        tokio::spawn(async move {
            let result = transport.disconnect().await.map_err(BeanError::from);
            let _ = reply.send(result);
        });
    }

    /// Tear the link down after a fault, reporting it once
    fn fail_link(&mut self, error: BeanError) {
        if self.state == LinkState::Disconnected {
            return;
        }
        log::error!("dropping link: {}", error);
        self.broadcast(BeanEvent::LinkError(error.to_string()));
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.disconnect().await {
                log::debug!("disconnect after link fault failed: {}", e);
            }
        });
        self.teardown(Some(error));
    }

    /// Forget everything tied to the current link. `cause` is the fault that
    /// ended it, if the session ended it.
    fn teardown(&mut self, cause: Option<BeanError>) {
        let was_connected = self.state == LinkState::Connected;
        self.epoch += 1;
        self.state = LinkState::Disconnected;
        self.link = None;
        self.services.clear();

        let error = cause.clone().unwrap_or(BeanError::Disconnected);
        for op in self.queue.on_disconnect() {
            op.reply.abandon(error.clone());
        }
        for (_, waiters) in self.pending.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        self.reassembler.reset();
        self.packetizer.reset();

        self.firmware.on_disconnect(cause.clone());
        self.sketch.on_disconnect(cause);
        if was_connected {
            self.broadcast(BeanEvent::Disconnected);
        }
    }

    fn check_firmware_preconditions(&self) -> Result<(), BeanError> {
        if self.firmware.is_active() {
            return Err(BeanError::UploadInProgress);
        }
        if self.state != LinkState::Connected {
            return Err(BeanError::NotConnected);
        }
        let profile = &self.config.profile;
        if !self.services.iter().any(|s| s.uuid == profile.oad_service) {
            return Err(BeanError::MissingOadService);
        }
        if !has_characteristic(&self.services, profile.oad_service, profile.oad_identify) {
            return Err(BeanError::MissingOadIdentify);
        }
        if !has_characteristic(&self.services, profile.oad_service, profile.oad_block) {
            return Err(BeanError::MissingOadBlock);
        }
        Ok(())
    }

    fn send_frame(&mut self, frame: Frame, expect_response: bool, reply: Reply<Vec<u8>>) {
        let packets = match self.packetize(&frame) {
            Ok(packets) => packets,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        if expect_response {
            self.pending
                .entry(frame.message_id())
                .or_default()
                .push_back(reply);
            self.enqueue_packets(packets, None);
        } else {
            self.enqueue_packets(packets, Some(reply));
        }
    }

    fn packetize(&mut self, frame: &Frame) -> Result<Vec<Vec<u8>>, BeanError> {
        if self.state != LinkState::Connected {
            return Err(BeanError::NotConnected);
        }
        let envelope = frame.to_envelope()?;
        let packets = self.packetizer.packetize(&envelope)?;
        log::debug!(
            "-> {} ({} byte payload, {} packets)",
            describe(frame.message_id()),
            frame.payload.len(),
            packets.len()
        );
        Ok(packets)
    }

    fn enqueue_packets(&mut self, packets: Vec<Vec<u8>>, mut done: Option<Reply<Vec<u8>>>) {
        let serial = self.config.profile.serial;
        let last = packets.len().saturating_sub(1);
        for (i, value) in packets.into_iter().enumerate() {
            let reply = if i == last { done.take() } else { None };
            self.enqueue(Operation {
                kind: OpKind::Write {
                    characteristic: serial,
                    value,
                },
                reply: OpReply::Packet(reply),
            });
        }
    }

    fn enqueue(&mut self, op: Operation) {
        if self.state != LinkState::Connected {
            self.on_operation_done(op.reply, Err(BeanError::NotConnected));
            return;
        }
        if let Some(op) = self.queue.enqueue(op) {
            self.execute(op);
        }
    }

    fn execute(&self, op: Operation) {
        let transport = self.transport.clone();
        let internal = self.internal_tx.clone();
        let epoch = self.epoch;
        let timeout = self.config.session.operation_timeout();
        let retries = self.config.session.operation_retries;
        tokio::spawn(async move {
            let result = op.kind.execute(transport.as_ref(), timeout, retries).await;
            let _ = internal.send(Internal::OperationDone {
                epoch,
                reply: op.reply,
                result,
            });
        });
    }

    fn on_operation_done(&mut self, reply: OpReply, result: Result<Vec<u8>, BeanError>) {
        // An operation the link never confirmed means the link is gone
        let link_dead = match &result {
            Err(e @ BeanError::Transport(TransportError::Timeout { .. })) => Some(e.clone()),
            _ => None,
        };
        match reply {
            OpReply::Packet(reply) => match result {
                Ok(_) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(Vec::new()));
                    }
                }
                Err(BeanError::NotConnected) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(BeanError::NotConnected));
                    }
                }
                Err(e) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e.clone()));
                    }
                    // A lost packet leaves the device mid-envelope
                    self.fail_link(e);
                    return;
                }
            },
            OpReply::Caller(reply) => {
                let _ = reply.send(result.clone());
            }
            OpReply::Firmware(op) => match (op, result.clone()) {
                (FirmwareOp::ReadVersion, Ok(value)) => {
                    let version = String::from_utf8_lossy(&value)
                        .trim_end_matches('\0')
                        .to_string();
                    self.firmware.on_version(Ok(version));
                }
                (FirmwareOp::EnableNotifications, Err(e)) => self
                    .firmware
                    .on_operation_failed(BeanError::EnableOadNotifyFailed(e.to_string())),
                (_, Err(e)) => self.firmware.on_operation_failed(e),
                (_, Ok(_)) => {}
            },
        }
        if let Some(e) = link_dead {
            self.fail_link(e);
        }
    }

    fn on_notification(&mut self, characteristic: Uuid, value: Vec<u8>) {
        let profile = &self.config.profile;
        if characteristic == profile.serial {
            self.on_serial_packet(&value);
        } else if characteristic == profile.oad_identify {
            self.firmware.on_notification(OadChannel::Identify, &value);
        } else if characteristic == profile.oad_block {
            self.firmware.on_notification(OadChannel::Block, &value);
        } else if let Some(bank) = profile.scratch_bank(&characteristic) {
            self.broadcast(BeanEvent::ScratchChanged { bank, data: value });
        } else if characteristic == profile.battery_level {
            match value.first() {
                Some(&percent) => self.broadcast(BeanEvent::BatteryLevel(percent.min(100))),
                None => log::warn!("empty battery level notification"),
            }
        } else {
            log::debug!("ignoring notification from {}", characteristic);
        }
    }

    /// Any reassembly error, corrupt envelopes included, ends the link
    fn on_serial_packet(&mut self, packet: &[u8]) {
        match self.reassembler.push(packet) {
            Ok(None) => {}
            Ok(Some(body)) => self.on_body(&body),
            Err(e) => self.fail_link(e.into()),
        }
    }

    fn on_body(&mut self, body: &[u8]) {
        let frame = match Frame::from_body(body) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("dropping envelope: {}", e);
                return;
            }
        };
        let id = frame.message_id();
        log::debug!("<- {} ({} byte payload)", describe(id), frame.payload.len());

        if is_unsolicited(id) {
            return self.on_device_message(id, frame.payload);
        }
        let waiter = self.pending.get_mut(&id).and_then(VecDeque::pop_front);
        match waiter {
            Some(reply) => {
                let _ = reply.send(Ok(frame.payload));
            }
            None if message_name(id).is_some() => {
                log::warn!("dropping {} response, nothing is waiting for it", describe(id))
            }
            None => log::warn!("dropping response: {}", BeanError::UnknownMessageId(id)),
        }
    }

    fn on_device_message(&mut self, id: u16, payload: Vec<u8>) {
        match id {
            MSG_SERIAL_DATA => self.broadcast(BeanEvent::SerialData(payload)),
            MSG_BL_STATUS => match Status::from_bytes(&payload) {
                Ok(status) => {
                    self.sketch.on_status(&status);
                    self.broadcast(BeanEvent::Status(status));
                }
                Err(e) => log::warn!("bad bootloader status: {}", e),
            },
            _ => log::debug!("ignoring {}", describe(id)),
        }
    }

    /// Carry out whatever the upload controllers asked for, until they stop
    /// asking.
    fn apply_actions(&mut self) {
        loop {
            let firmware = self.firmware.take_actions();
            let sketch = self.sketch.take_actions();
            if firmware.is_empty() && sketch.is_empty() {
                break;
            }
            for action in firmware {
                self.apply_firmware(action);
            }
            for action in sketch {
                self.apply_sketch(action);
            }
        }
    }

    fn apply_firmware(&mut self, action: FirmwareAction) {
        let profile = &self.config.profile;
        let channel = |channel: OadChannel| match channel {
            OadChannel::Identify => profile.oad_identify,
            OadChannel::Block => profile.oad_block,
        };
        let op = match action {
            FirmwareAction::ReadVersion => Operation {
                kind: OpKind::Read {
                    characteristic: profile.firmware_version,
                },
                reply: OpReply::Firmware(FirmwareOp::ReadVersion),
            },
            FirmwareAction::EnableNotifications(ch) => Operation {
                kind: OpKind::EnableNotifications {
                    characteristic: channel(ch),
                },
                reply: OpReply::Firmware(FirmwareOp::EnableNotifications),
            },
            FirmwareAction::Write(ch, value) => Operation {
                kind: OpKind::Write {
                    characteristic: channel(ch),
                    value,
                },
                reply: OpReply::Firmware(FirmwareOp::Write),
            },
            FirmwareAction::ArmTimer(token, after) => {
                return self.arm_timer(UploadKind::Firmware, token, after);
            }
            FirmwareAction::CancelTimer => return self.cancel_timer(UploadKind::Firmware),
            FirmwareAction::Reconnect => return self.rediscover(),
            FirmwareAction::Emit(event) => return self.emit(UploadKind::Firmware, event),
        };
        self.enqueue(op);
    }

    fn apply_sketch(&mut self, action: SketchAction) {
        match action {
            SketchAction::Send(frame) => match self.packetize(&frame) {
                Ok(packets) => self.enqueue_packets(packets, None),
                Err(e) => self.sketch.on_operation_failed(e),
            },
            SketchAction::ArmTimer(token, after) => self.arm_timer(UploadKind::Sketch, token, after),
            SketchAction::CancelTimer => self.cancel_timer(UploadKind::Sketch),
            SketchAction::Emit(event) => self.emit(UploadKind::Sketch, event),
        }
    }

    fn arm_timer(&mut self, owner: UploadKind, token: TimerToken, after: Duration) {
        let internal = self.internal_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = internal.send(Internal::Timer { owner, token });
        });
        if let Some(previous) = self.timers.insert(owner, timer) {
            previous.abort();
        }
    }

    fn cancel_timer(&mut self, owner: UploadKind) {
        if let Some(timer) = self.timers.remove(&owner) {
            timer.abort();
        }
    }

    fn rediscover(&mut self) {
        let internal = self.internal_tx.clone();
        match self.discovery.clone() {
            Some(discovery) => {
                tokio::spawn(async move {
                    let result = discovery.rediscover().await;
                    let _ = internal.send(Internal::Rediscovered(result));
                });
            }
            // Nothing to scan with; try the same peripheral straight away
            None => {
                let _ = internal.send(Internal::Rediscovered(Ok(())));
            }
        }
    }

    fn emit(&mut self, kind: UploadKind, event: UploadEvent) {
        let finished = matches!(event, UploadEvent::Finished(_));
        if let Some(events) = self.upload_events.get(&kind) {
            let _ = events.send(event);
        }
        if finished {
            self.upload_events.remove(&kind);
        }
    }

    fn broadcast(&self, event: BeanEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Discover services and open the serial channel on a fresh link
async fn prepare_link(
    transport: &dyn GattTransport,
    serial_service: Uuid,
    serial: Uuid,
) -> Result<Vec<GattService>, BeanError> {
    let services = transport.discover_services().await?;
    if !has_characteristic(&services, serial_service, serial) {
        return Err(BeanError::ServicesNotDiscovered);
    }
    transport.enable_notifications(serial).await?;
    Ok(services)
}

/// Pends forever while there is no link
async fn next_link_event(link: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>) -> LinkEvent {
    let Some(events) = link.as_mut() else {
        return std::future::pending().await;
    };
    match events.recv().await {
        Some(event) => event,
        None => {
            *link = None;
            LinkEvent::Disconnected
        }
    }
}

fn describe(id: u16) -> String {
    match message_name(id) {
        Some(name) => name.to_string(),
        None => format!("0x{id:04x}"),
    }
}

/// Handle to a [`Session`]. Cheap to clone; the session stops once every
/// handle (and every [`Upload`]) is dropped.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<BeanEvent>,
    profile: GattProfile,
}

impl Connection {
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, BeanError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| BeanError::SessionClosed)?;
        rx.await.map_err(|_| BeanError::SessionClosed)?
    }

    /// Connect, discover services, enable serial notifications and open the
    /// serial gate.
    pub async fn connect(&self) -> Result<(), BeanError> {
        self.call(Command::Connect).await
    }

    /// Drop the link. Pending requests fail and running uploads are cancelled.
    pub async fn disconnect(&self) -> Result<(), BeanError> {
        self.call(Command::Disconnect).await
    }

    pub fn events(&self) -> broadcast::Receiver<BeanEvent> {
        self.events.subscribe()
    }

    /// Characteristics this connection's session was configured with
    pub fn profile(&self) -> &GattProfile {
        &self.profile
    }

    /// Send a message and wait for the response of the same type. Responses
    /// of one type resolve requests in the order they were sent.
    pub async fn request(&self, msg_type: u16, payload: Vec<u8>) -> Result<Vec<u8>, BeanError> {
        self.call(|reply| Command::Send {
            frame: Frame::new(msg_type, payload),
            expect_response: true,
            reply,
        })
        .await
    }

    /// Send a message that has no response. Resolves once it is written.
    pub async fn send(&self, msg_type: u16, payload: Vec<u8>) -> Result<(), BeanError> {
        self.call(|reply| Command::Send {
            frame: Frame::new(msg_type, payload),
            expect_response: false,
            reply,
        })
        .await
        .map(|_| ())
    }

    pub async fn read_characteristic(&self, characteristic: Uuid) -> Result<Vec<u8>, BeanError> {
        self.call(|reply| Command::Gatt {
            op: OpKind::Read { characteristic },
            reply,
        })
        .await
    }

    pub async fn enable_notifications(&self, characteristic: Uuid) -> Result<(), BeanError> {
        self.call(|reply| Command::Gatt {
            op: OpKind::EnableNotifications { characteristic },
            reply,
        })
        .await
        .map(|_| ())
    }

    /// Start a firmware update. The device's version is checked first and
    /// nothing is written before [`Upload::approve`].
    pub async fn program_firmware(&self, bundle: FirmwareBundle) -> Result<Upload, BeanError> {
        let (events, rx) = mpsc::unbounded_channel();
        self.call(|reply| Command::ProgramFirmware {
            bundle,
            events,
            reply,
        })
        .await?;
        Ok(Upload::new(UploadKind::Firmware, rx, self.commands.clone()))
    }

    /// Program a sketch image (raw bytes, already converted from Intel hex)
    pub async fn program_sketch(&self, name: &str, image: Vec<u8>) -> Result<Upload, BeanError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let (events, rx) = mpsc::unbounded_channel();
        self.call(|reply| Command::ProgramSketch {
            name: name.to_string(),
            image,
            timestamp,
            events,
            reply,
        })
        .await?;
        Ok(Upload::new(UploadKind::Sketch, rx, self.commands.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FIRMWARE_VERSION, OAD_BLOCK, OAD_IDENTIFY, SCRATCH_CHARS, SERIAL_CHAR};
    use crate::error::UploadStage;
    use crate::mock::{MockDevice, MockDiscovery, bean_services};
    use crate::upload::UploadOutcome;
    use bean_proto::firmware::{FirmwareHeader, FirmwareImage, ImageSlot};
    use bean_proto::{ProtoError, RESPONSE_FLAG};
    use bean_proto::{BootloaderState, MSG_BL_CMD_START, MSG_BL_FW_BLOCK, MSG_CC_LED_READ_ALL, MSG_CC_TEMP_READ};

    async fn connected() -> (Connection, MockDevice) {
        let (transport, mut device) = MockDevice::new(bean_services());
        let conn = Session::spawn(transport, BeanConfig::default());
        conn.connect().await.unwrap();
        let gate = device.next_frame().await;
        assert_eq!(gate, Frame::new(MSG_BT_END_GATE, vec![]));
        (conn, device)
    }

    fn bundle(blocks: usize) -> FirmwareBundle {
        let image = |id: &[u8; 4]| {
            let mut data = vec![
                0x2B, 0x65, 0xFF, 0xFF, 0x64, 0x00, 0x00, 0x7C, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF,
            ];
            data[8..12].copy_from_slice(id);
            data.resize(blocks * 16, 0x5A);
            FirmwareImage::parse("image.bin", data).unwrap()
        };
        FirmwareBundle::with_version(vec![image(b"AAAA"), image(b"BBBB")], 200).unwrap()
    }

    fn status(state: BootloaderState) -> Vec<u8> {
        let code = match state {
            BootloaderState::Ready => 2,
            BootloaderState::Programming => 3,
            BootloaderState::Complete => 5,
            BootloaderState::Error => 6,
            _ => 0,
        };
        vec![code, 0, 0, 0, 0, 0]
    }

    #[tokio::test(start_paused = true)]
    async fn connect_opens_serial_gate() {
        let (transport, mut device) = MockDevice::new(bean_services());
        let conn = Session::spawn(transport, BeanConfig::default());
        let mut events = conn.events();
        conn.connect().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), BeanEvent::Connected);
        assert_eq!(device.subscribed(), vec![SERIAL_CHAR]);
        assert_eq!(device.next_frame().await.msg_type, MSG_BT_END_GATE);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_serial_service_fails_connect() {
        let (transport, _device) = MockDevice::new(vec![]);
        let conn = Session::spawn(transport, BeanConfig::default());
        assert_eq!(conn.connect().await, Err(BeanError::ServicesNotDiscovered));
        assert_eq!(
            conn.request(MSG_CC_TEMP_READ, vec![]).await,
            Err(BeanError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn responses_resolve_in_request_order() {
        let (conn, mut device) = connected().await;

        let first = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(MSG_CC_TEMP_READ, vec![]).await }
        });
        assert_eq!(device.next_frame().await.msg_type, MSG_CC_TEMP_READ);
        let second = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(MSG_CC_TEMP_READ, vec![]).await }
        });
        assert_eq!(device.next_frame().await.msg_type, MSG_CC_TEMP_READ);

        device.respond(MSG_CC_TEMP_READ, &[21]);
        device.respond(MSG_CC_TEMP_READ, &[22]);
        assert_eq!(first.await.unwrap(), Ok(vec![21]));
        assert_eq!(second.await.unwrap(), Ok(vec![22]));
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_responses_are_dropped() {
        let (conn, mut device) = connected().await;
        let mut events = conn.events();

        // Nobody asked for these
        device.respond(MSG_CC_LED_READ_ALL, &[1, 2, 3]);
        device.respond(0x7777, &[]);
        device.send(MSG_SERIAL_DATA, b"hi");
        assert_eq!(
            events.recv().await.unwrap(),
            BeanEvent::SerialData(b"hi".to_vec())
        );

        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(MSG_CC_TEMP_READ, vec![]).await }
        });
        device.next_frame().await;
        device.respond(MSG_CC_TEMP_READ, &[30]);
        assert_eq!(request.await.unwrap(), Ok(vec![30]));
    }

    #[tokio::test(start_paused = true)]
    async fn desync_tears_down_the_link() {
        let (conn, mut device) = connected().await;
        let mut events = conn.events();
        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(MSG_CC_TEMP_READ, vec![]).await }
        });
        device.next_frame().await;

        // First packet promises two more, the next claims to be the last
        device.notify(SERIAL_CHAR, vec![0x82, 1, 2, 3]);
        device.notify(SERIAL_CHAR, vec![0x00, 4]);

        let error = request.await.unwrap().unwrap_err();
        assert!(matches!(error, BeanError::Protocol(ProtoError::Desync(_))));
        assert!(matches!(events.recv().await.unwrap(), BeanEvent::LinkError(_)));
        assert_eq!(events.recv().await.unwrap(), BeanEvent::Disconnected);
        assert_eq!(
            conn.request(MSG_CC_TEMP_READ, vec![]).await,
            Err(BeanError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn bootloader_status_is_broadcast_without_an_upload() {
        let (conn, device) = connected().await;
        let mut events = conn.events();
        device.send(MSG_BL_STATUS, &status(BootloaderState::Ready));
        assert_eq!(
            events.recv().await.unwrap(),
            BeanEvent::Status(Status::from_bytes(&status(BootloaderState::Ready)).unwrap())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_envelope_tears_down_the_link() {
        let (conn, mut device) = connected().await;
        let mut events = conn.events();
        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(MSG_CC_TEMP_READ, vec![]).await }
        });
        device.next_frame().await;

        let mut envelope = Frame::new(MSG_CC_TEMP_READ | RESPONSE_FLAG, vec![21])
            .to_envelope()
            .unwrap();
        *envelope.last_mut().unwrap() ^= 0xFF;
        let mut packet = vec![0x80];
        packet.extend(envelope);
        device.notify(SERIAL_CHAR, packet);

        let error = request.await.unwrap().unwrap_err();
        assert!(matches!(
            error,
            BeanError::Protocol(ProtoError::Checksum { .. })
        ));
        assert!(matches!(events.recv().await.unwrap(), BeanEvent::LinkError(_)));
        assert_eq!(events.recv().await.unwrap(), BeanEvent::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_write_is_retried_then_drops_link() {
        let (conn, device) = connected().await;
        let mut events = conn.events();
        device.stall_writes();

        assert_eq!(
            conn.request(MSG_CC_TEMP_READ, vec![]).await,
            Err(BeanError::Transport(TransportError::Timeout { attempts: 4 }))
        );
        assert_eq!(device.stalled_writes(), 4);
        assert!(matches!(events.recv().await.unwrap(), BeanEvent::LinkError(_)));
        assert_eq!(events.recv().await.unwrap(), BeanEvent::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_fails_pending_requests() {
        let (conn, mut device) = connected().await;
        let request = tokio::spawn({
            let conn = conn.clone();
            async move { conn.request(MSG_CC_TEMP_READ, vec![]).await }
        });
        device.next_frame().await;
        device.drop_link();
        assert_eq!(request.await.unwrap(), Err(BeanError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_become_events() {
        let (conn, device) = connected().await;
        let mut events = conn.events();
        device.notify(SCRATCH_CHARS[2], vec![9, 9]);
        device.notify(crate::config::BATTERY_LEVEL, vec![150]);
        assert_eq!(
            events.recv().await.unwrap(),
            BeanEvent::ScratchChanged {
                bank: 3,
                data: vec![9, 9]
            }
        );
        assert_eq!(events.recv().await.unwrap(), BeanEvent::BatteryLevel(100));
    }

    /// Walk an approved update up to the first block request. The device
    /// runs image A.
    async fn start_firmware(conn: &Connection, device: &mut MockDevice, blocks: usize) -> Upload {
        device.set_read(FIRMWARE_VERSION, b"100 Img-A\0".to_vec());
        let mut upload = conn.program_firmware(bundle(blocks)).await.unwrap();
        assert!(matches!(
            upload.next_event().await,
            Some(UploadEvent::ApprovalRequired { bundle_version: 200, .. })
        ));
        assert!(device.try_write().is_none());
        upload.approve().await.unwrap();

        assert_eq!(device.next_write().await, (OAD_IDENTIFY, vec![0x00]));
        assert!(device.subscribed().contains(&OAD_IDENTIFY));
        assert!(device.subscribed().contains(&OAD_BLOCK));

        let running = FirmwareHeader {
            version: 100,
            length: 0x7C00,
            slot: ImageSlot::A,
        };
        device.notify(OAD_IDENTIFY, running.to_bytes().to_vec());
        let (characteristic, proposal) = device.next_write().await;
        assert_eq!(characteristic, OAD_IDENTIFY);
        assert_eq!(FirmwareHeader::from_bytes(&proposal).unwrap().slot, ImageSlot::B);
        upload
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_update_streams_requested_blocks() {
        let (conn, mut device) = connected().await;
        let mut upload = start_firmware(&conn, &mut device, 3).await;

        for index in 0..3u16 {
            device.notify(OAD_BLOCK, index.to_le_bytes().to_vec());
            let (characteristic, record) = device.next_write().await;
            assert_eq!(characteristic, OAD_BLOCK);
            assert_eq!(&record[..2], &index.to_le_bytes());
            assert_eq!(record.len(), 18);
        }

        let mut progress = 0;
        loop {
            match upload.next_event().await {
                Some(UploadEvent::Progress(p)) => progress = p.blocks_sent,
                Some(UploadEvent::Finished(result)) => {
                    assert_eq!(result, Ok(UploadOutcome::Updated));
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(progress, 3);
        assert!(upload.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn up_to_date_device_is_left_alone() {
        let (conn, mut device) = connected().await;
        device.set_read(FIRMWARE_VERSION, b"201507230001 Img-B".to_vec());
        let upload = conn.program_firmware(bundle(2)).await.unwrap();
        assert_eq!(upload.finished().await, Ok(UploadOutcome::AlreadyUpToDate));
        assert!(device.try_write().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_declines_approval() {
        let (conn, mut device) = connected().await;
        device.set_read(FIRMWARE_VERSION, b"1".to_vec());
        let upload = conn.program_firmware(bundle(2)).await.unwrap();
        assert_eq!(upload.finished().await, Err(BeanError::ClientRejected));
        assert!(device.try_write().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn firmware_requires_oad_service() {
        let services = bean_services()
            .into_iter()
            .filter(|s| s.uuid != crate::config::OAD_SERVICE)
            .collect();
        let (transport, mut device) = MockDevice::new(services);
        let conn = Session::spawn(transport, BeanConfig::default());
        assert!(matches!(
            conn.program_firmware(bundle(2)).await,
            Err(BeanError::NotConnected)
        ));
        conn.connect().await.unwrap();
        device.next_frame().await;
        assert!(matches!(
            conn.program_firmware(bundle(2)).await,
            Err(BeanError::MissingOadService)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn second_firmware_upload_is_refused() {
        let (conn, mut device) = connected().await;
        device.set_read(FIRMWARE_VERSION, b"1".to_vec());
        let _upload = conn.program_firmware(bundle(2)).await.unwrap();
        assert!(matches!(
            conn.program_firmware(bundle(2)).await,
            Err(BeanError::UploadInProgress)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out_offer() {
        let (conn, mut device) = connected().await;
        device.set_read(FIRMWARE_VERSION, b"1".to_vec());
        let mut upload = conn.program_firmware(bundle(2)).await.unwrap();
        upload.next_event().await;
        upload.approve().await.unwrap();
        assert_eq!(
            upload.next_event().await,
            Some(UploadEvent::Finished(Err(BeanError::UploadTimeout(
                UploadStage::OfferingImages
            ))))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_transfer_stops_writes() {
        let (conn, mut device) = connected().await;
        let mut upload = start_firmware(&conn, &mut device, 4).await;
        device.notify(OAD_BLOCK, vec![0, 0]);
        device.next_write().await;
        device.drop_link();

        let mut finished = Vec::new();
        while let Some(event) = upload.next_event().await {
            if let UploadEvent::Finished(result) = event {
                finished.push(result);
            }
        }
        assert_eq!(finished, vec![Err(BeanError::Disconnected)]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(device.try_write().is_none());
        assert_eq!(device.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reboot_after_last_block_is_verified() {
        let (transport, mut device) = MockDevice::new(bean_services());
        let conn = Session::spawn_with_discovery(
            transport,
            Arc::new(MockDiscovery),
            BeanConfig::default(),
        );
        conn.connect().await.unwrap();
        device.next_frame().await;

        let upload = start_firmware(&conn, &mut device, 2).await;
        for index in 0..2u16 {
            device.notify(OAD_BLOCK, index.to_le_bytes().to_vec());
            device.next_write().await;
        }
        // The device boots its new image
        device.set_read(FIRMWARE_VERSION, b"200 Img-B".to_vec());
        device.drop_link();

        assert_eq!(upload.finished().await, Ok(UploadOutcome::Updated));
        assert_eq!(device.connects(), 2);
        assert_eq!(device.next_frame().await.msg_type, MSG_BT_END_GATE);
    }

    #[tokio::test(start_paused = true)]
    async fn sketch_upload_paces_blocks() {
        let (conn, mut device) = connected().await;
        let mut events = conn.events();
        let upload = conn.program_sketch("blink", vec![0xAA; 130]).await.unwrap();

        let start = device.next_frame().await;
        assert_eq!(start.msg_type, MSG_BL_CMD_START);
        assert_eq!(&start.payload[..4], &130u32.to_le_bytes());

        device.send(MSG_BL_STATUS, &status(BootloaderState::Ready));
        let mut sent_at = Vec::new();
        let mut sizes = Vec::new();
        for _ in 0..3 {
            let block = device.next_frame().await;
            assert_eq!(block.msg_type, MSG_BL_FW_BLOCK);
            sizes.push(block.payload.len());
            sent_at.push(tokio::time::Instant::now());
        }
        assert_eq!(sizes, vec![64, 64, 2]);
        for pair in sent_at.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
        assert!(matches!(events.recv().await.unwrap(), BeanEvent::Status(_)));

        device.send(MSG_BL_STATUS, &status(BootloaderState::Complete));
        assert_eq!(upload.finished().await, Ok(UploadOutcome::Updated));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_sketch_sends_only_start() {
        let (conn, mut device) = connected().await;
        let upload = conn.program_sketch("erase", Vec::new()).await.unwrap();
        assert_eq!(upload.finished().await, Ok(UploadOutcome::Updated));
        let start = device.next_frame().await;
        assert_eq!(start.msg_type, MSG_BL_CMD_START);
        assert_eq!(&start.payload[..4], &[0, 0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn bootloader_error_fails_sketch() {
        let (conn, mut device) = connected().await;
        let upload = conn.program_sketch("blink", vec![1; 10]).await.unwrap();
        device.next_frame().await;
        device.send(MSG_BL_STATUS, &status(BootloaderState::Error));
        assert_eq!(
            upload.finished().await,
            Err(BeanError::SketchUploadFailed {
                substate: "Init".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_disconnects() {
        let (conn, device) = connected().await;
        drop(conn);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(device.disconnects(), 1);
    }
}
