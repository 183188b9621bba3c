//! Over-the-air firmware update of the radio controller
//!
//! The controller is a plain state machine: the session feeds it link events
//! and carries out the [`FirmwareAction`]s it queues. It never touches the
//! transport or the clock itself.
//!
//! ```text
//! Inactive -> CheckingVersion -> AwaitingApproval -> OfferingImages
//!          -> AwaitingTransferAccept -> SendingBlocks -> Inactive
//! ```
//!
//! A disconnect once images are being negotiated (or after the final block,
//! when the device reboots) parks the update in `Reconnecting`; once the link
//! is back the version check runs again and negotiation restarts from the
//! header exchange.

use std::time::Duration;

use bean_proto::firmware::{self, FirmwareBundle, FirmwareHeader, FirmwareImage};

use crate::config::{BlockPacing, FirmwareConfig, millis};
use crate::error::{BeanError, UploadStage};
use crate::timer::{TimerSlot, TimerToken};
use crate::upload::{UploadEvent, UploadOutcome, UploadProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareState {
    Inactive,
    CheckingVersion,
    AwaitingApproval,
    OfferingImages,
    AwaitingTransferAccept,
    SendingBlocks,
    Reconnecting,
}

/// The two OAD characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OadChannel {
    /// Image header exchange
    Identify,
    /// Block requests and block records
    Block,
}

#[derive(Debug, PartialEq)]
pub(crate) enum FirmwareAction {
    ReadVersion,
    EnableNotifications(OadChannel),
    Write(OadChannel, Vec<u8>),
    ArmTimer(TimerToken, Duration),
    CancelTimer,
    Reconnect,
    Emit(UploadEvent),
}

pub(crate) struct FirmwareUpload {
    config: FirmwareConfig,
    state: FirmwareState,
    bundle: Option<FirmwareBundle>,
    image: Option<FirmwareImage>,
    approved: bool,
    resumed: bool,
    timer: TimerSlot,
    last_requested: Option<u16>,
    next_block: u16,
    final_requested: bool,
    actions: Vec<FirmwareAction>,
}

impl FirmwareUpload {
    pub fn new(config: FirmwareConfig) -> Self {
        Self {
            config,
            state: FirmwareState::Inactive,
            bundle: None,
            image: None,
            approved: false,
            resumed: false,
            timer: TimerSlot::default(),
            last_requested: None,
            next_block: 0,
            final_requested: false,
            actions: Vec::new(),
        }
    }

    pub fn state(&self) -> FirmwareState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != FirmwareState::Inactive
    }

    pub fn take_actions(&mut self) -> Vec<FirmwareAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn start(&mut self, bundle: FirmwareBundle) -> Result<(), BeanError> {
        if self.is_active() {
            return Err(BeanError::UploadInProgress);
        }
        log::info!(
            "starting firmware update to version {} ({} images)",
            bundle.version(),
            bundle.images().len()
        );
        self.bundle = Some(bundle);
        self.approved = false;
        self.resumed = false;
        self.check_version();
        Ok(())
    }

    pub fn on_version(&mut self, version: Result<String, BeanError>) {
        if self.state != FirmwareState::CheckingVersion {
            return;
        }
        let version = match version {
            Ok(version) => version,
            Err(e) => return self.fail(e),
        };
        let Some(bundle_version) = self.bundle.as_ref().map(|b| b.version()) else {
            return;
        };
        let needed = match firmware::needs_update(&version, bundle_version) {
            Ok(needed) => needed,
            Err(_) => return self.fail(BeanError::UnparsableVersionHeader(version)),
        };
        log::info!("device firmware {:?}, bundle {}", version, bundle_version);

        if !needed {
            let outcome = if self.resumed {
                UploadOutcome::Updated
            } else {
                UploadOutcome::AlreadyUpToDate
            };
            return self.finish(outcome);
        }

        if self.approved {
            self.offer_images();
        } else {
            self.enter(FirmwareState::AwaitingApproval, self.config.approval_timeout_ms);
            self.actions.push(FirmwareAction::Emit(UploadEvent::ApprovalRequired {
                device_version: version,
                bundle_version,
            }));
        }
    }

    /// Returns false when no update is waiting for an answer.
    pub fn answer_approval(&mut self, approved: bool) -> bool {
        if self.state != FirmwareState::AwaitingApproval {
            return false;
        }
        if approved {
            self.approved = true;
            self.offer_images();
        } else {
            self.fail(BeanError::ClientRejected);
        }
        true
    }

    pub fn on_notification(&mut self, channel: OadChannel, value: &[u8]) {
        match (self.state, channel) {
            (FirmwareState::OfferingImages, OadChannel::Identify) => self.propose_image(value),
            (FirmwareState::AwaitingTransferAccept, OadChannel::Identify)
            | (FirmwareState::SendingBlocks, OadChannel::Identify) => {
                log::warn!("device re-sent its image header, image rejected");
                self.fail(BeanError::DeviceRejectedUpdate);
            }
            (FirmwareState::AwaitingTransferAccept, OadChannel::Block) => {
                log::info!("device accepted the image, sending blocks");
                self.state = FirmwareState::SendingBlocks;
                self.on_block_request(value);
            }
            (FirmwareState::SendingBlocks, OadChannel::Block) => self.on_block_request(value),
            (state, channel) => {
                log::debug!("ignoring {:?} notification in {:?}", channel, state);
            }
        }
    }

    /// A link operation issued on behalf of the update failed
    pub fn on_operation_failed(&mut self, error: BeanError) {
        if self.is_active() && self.state != FirmwareState::Reconnecting {
            self.fail(error);
        }
    }

    pub fn on_timeout(&mut self, token: TimerToken) {
        if !self.timer.fire(token) {
            return;
        }
        let stage = match self.state {
            FirmwareState::SendingBlocks if self.final_requested => {
                log::info!("no further block requests, firmware transfer complete");
                return self.finish(UploadOutcome::Updated);
            }
            FirmwareState::CheckingVersion => UploadStage::CheckingVersion,
            FirmwareState::AwaitingApproval => UploadStage::AwaitingApproval,
            FirmwareState::OfferingImages => UploadStage::OfferingImages,
            FirmwareState::AwaitingTransferAccept => UploadStage::AwaitingTransferAccept,
            FirmwareState::SendingBlocks => UploadStage::SendingBlocks,
            FirmwareState::Inactive | FirmwareState::Reconnecting => return,
        };
        self.fail(BeanError::UploadTimeout(stage));
    }

    /// The link went down. `cause` is set when the session tore it down
    /// because of a protocol or transport fault.
    pub fn on_disconnect(&mut self, cause: Option<BeanError>) {
        if !self.is_active() || self.state == FirmwareState::Reconnecting {
            return;
        }
        if let Some(cause) = cause {
            return self.fail(cause);
        }
        match self.state {
            FirmwareState::OfferingImages | FirmwareState::AwaitingTransferAccept => {}
            FirmwareState::SendingBlocks if self.final_requested => {}
            _ => return self.fail(BeanError::Disconnected),
        }
        log::info!("device dropped during {:?}, waiting for it to return", self.state);
        self.cancel_timer();
        self.state = FirmwareState::Reconnecting;
        self.actions.push(FirmwareAction::Reconnect);
    }

    pub fn on_reconnected(&mut self) {
        if self.state == FirmwareState::Reconnecting {
            self.resumed = true;
            self.check_version();
        }
    }

    pub fn on_reconnect_failed(&mut self, error: BeanError) {
        if self.state == FirmwareState::Reconnecting {
            self.fail(error);
        }
    }

    pub fn cancel(&mut self) {
        if self.is_active() {
            self.fail(BeanError::Cancelled);
        }
    }

    fn check_version(&mut self) {
        self.enter(FirmwareState::CheckingVersion, self.config.check_version_timeout_ms);
        self.actions.push(FirmwareAction::ReadVersion);
    }

    fn offer_images(&mut self) {
        self.enter(FirmwareState::OfferingImages, self.config.offer_timeout_ms);
        self.actions.extend([
            FirmwareAction::EnableNotifications(OadChannel::Identify),
            FirmwareAction::EnableNotifications(OadChannel::Block),
            FirmwareAction::Write(OadChannel::Identify, vec![0x00]),
        ]);
    }

    fn propose_image(&mut self, value: &[u8]) {
        let running = match FirmwareHeader::from_bytes(value) {
            Ok(header) => header,
            Err(_) => return self.fail(BeanError::UnparsableVersionHeader(hex(value))),
        };
        let Some(bundle) = self.bundle.as_mut() else {
            return;
        };
        let image = bundle.offer_for(running.slot).clone();
        log::info!(
            "device runs {:?} v{}, offering {:?} v{} ({} blocks)",
            running.slot,
            running.version,
            image.slot(),
            image.version(),
            image.block_count()
        );

        self.last_requested = None;
        self.next_block = 0;
        self.final_requested = false;
        self.actions.push(FirmwareAction::Write(
            OadChannel::Identify,
            image.header().to_bytes().to_vec(),
        ));
        self.image = Some(image);
        self.enter(
            FirmwareState::AwaitingTransferAccept,
            self.config.transfer_accept_timeout_ms,
        );
    }

    fn on_block_request(&mut self, value: &[u8]) {
        let Some(image) = self.image.as_ref() else {
            return;
        };
        if value.len() < 2 {
            log::warn!("short block request {}", hex(value));
            return;
        }
        let requested = u16::from_le_bytes([value[0], value[1]]);
        let total = image.block_count();
        if requested >= total {
            log::warn!("device requested block {} of {}", requested, total);
            return;
        }

        let window = match self.config.pacing {
            BlockPacing::OnRequest => 1,
            BlockPacing::Lookahead { blocks_in_flight } => blocks_in_flight.max(1),
        };
        let repeated = self.last_requested.is_some_and(|last| requested <= last);
        if repeated || requested > self.next_block {
            if repeated {
                log::debug!("block {} requested again, rewinding", requested);
            }
            self.next_block = requested;
        }
        self.last_requested = Some(requested);

        let end = requested.saturating_add(window).min(total);
        let mut writes = Vec::new();
        while self.next_block < end {
            if let Some(record) = image.block(self.next_block) {
                log::trace!("sending block {}", self.next_block);
                writes.push(FirmwareAction::Write(OadChannel::Block, record));
            }
            self.next_block += 1;
        }
        self.actions.extend(writes);
        self.actions.push(FirmwareAction::Emit(UploadEvent::Progress(
            UploadProgress::new(requested as u32 + 1, total as u32),
        )));

        if requested + 1 == total {
            self.final_requested = true;
            self.arm(self.config.completion_timeout_ms);
        } else {
            self.final_requested = false;
            self.arm(self.config.block_request_timeout_ms);
        }
    }

    fn enter(&mut self, state: FirmwareState, timeout_ms: u64) {
        log::debug!("firmware update {:?} -> {:?}", self.state, state);
        self.state = state;
        self.arm(timeout_ms);
    }

    fn arm(&mut self, timeout_ms: u64) {
        let token = self.timer.arm();
        self.actions
            .push(FirmwareAction::ArmTimer(token, millis(timeout_ms)));
    }

    fn cancel_timer(&mut self) {
        if self.timer.is_armed() {
            self.timer.cancel();
            self.actions.push(FirmwareAction::CancelTimer);
        }
    }

    fn finish(&mut self, outcome: UploadOutcome) {
        log::info!("firmware update finished: {:?}", outcome);
        self.end(Ok(outcome));
    }

    fn fail(&mut self, error: BeanError) {
        log::error!("firmware update failed in {:?}: {}", self.state, error);
        self.end(Err(error));
    }

    fn end(&mut self, result: Result<UploadOutcome, BeanError>) {
        self.cancel_timer();
        self.state = FirmwareState::Inactive;
        self.bundle = None;
        self.image = None;
        self.approved = false;
        self.resumed = false;
        self.last_requested = None;
        self.next_block = 0;
        self.final_requested = false;
        self.actions.push(FirmwareAction::Emit(UploadEvent::Finished(result)));
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bean_proto::firmware::ImageSlot;

    fn image(id: &[u8; 4], blocks: usize) -> FirmwareImage {
        let mut data = vec![
            0x2B, 0x65, 0xFF, 0xFF, 0x64, 0x00, 0x00, 0x7C, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF,
        ];
        data[8..12].copy_from_slice(id);
        data.resize(blocks * 16, 0xAB);
        FirmwareImage::parse("test.bin", data).unwrap()
    }

    fn bundle(blocks: usize) -> FirmwareBundle {
        FirmwareBundle::with_version(vec![image(b"AAAA", blocks), image(b"BBBB", blocks)], 200)
            .unwrap()
    }

    fn header(id: &[u8; 4]) -> Vec<u8> {
        let mut h = vec![0x64, 0x00, 0x00, 0x7C];
        h.extend_from_slice(id);
        h
    }

    fn timer_token(actions: &[FirmwareAction]) -> TimerToken {
        actions
            .iter()
            .rev()
            .find_map(|a| match a {
                FirmwareAction::ArmTimer(token, _) => Some(*token),
                _ => None,
            })
            .unwrap()
    }

    fn block_writes(actions: &[FirmwareAction]) -> Vec<u16> {
        actions
            .iter()
            .filter_map(|a| match a {
                FirmwareAction::Write(OadChannel::Block, record) => {
                    Some(u16::from_le_bytes([record[0], record[1]]))
                }
                _ => None,
            })
            .collect()
    }

    fn finished(actions: &[FirmwareAction]) -> Vec<&Result<UploadOutcome, BeanError>> {
        actions
            .iter()
            .filter_map(|a| match a {
                FirmwareAction::Emit(UploadEvent::Finished(result)) => Some(result),
                _ => None,
            })
            .collect()
    }

    /// Drive an upload to SendingBlocks with the device running image A
    fn sending(config: FirmwareConfig, blocks: usize) -> FirmwareUpload {
        let mut upload = FirmwareUpload::new(config);
        upload.start(bundle(blocks)).unwrap();
        upload.on_version(Ok("100 Img-A".into()));
        assert!(upload.answer_approval(true));
        upload.on_notification(OadChannel::Identify, &header(b"AAAA"));
        upload.on_notification(OadChannel::Block, &[0, 0]);
        assert_eq!(upload.state(), FirmwareState::SendingBlocks);
        upload.take_actions();
        upload
    }

    #[test]
    fn up_to_date_device_finishes_without_writes() {
        let mut upload = FirmwareUpload::new(FirmwareConfig::default());
        upload.start(bundle(4)).unwrap();
        assert_eq!(upload.take_actions()[1], FirmwareAction::ReadVersion);

        upload.on_version(Ok("200 Img-B".into()));
        let actions = upload.take_actions();
        assert!(!actions.iter().any(|a| matches!(a, FirmwareAction::Write(..))));
        assert_eq!(finished(&actions), vec![&Ok(UploadOutcome::AlreadyUpToDate)]);
        assert!(!upload.is_active());
    }

    #[test]
    fn newer_bundle_waits_for_approval() {
        let mut upload = FirmwareUpload::new(FirmwareConfig::default());
        upload.start(bundle(4)).unwrap();
        upload.on_version(Ok("OAD Img-A".into()));
        assert_eq!(upload.state(), FirmwareState::AwaitingApproval);
        let actions = upload.take_actions();
        assert!(actions.contains(&FirmwareAction::Emit(UploadEvent::ApprovalRequired {
            device_version: "OAD Img-A".into(),
            bundle_version: 200,
        })));
        assert!(!actions.iter().any(|a| matches!(a, FirmwareAction::Write(..))));

        assert!(upload.answer_approval(true));
        let actions = upload.take_actions();
        assert_eq!(upload.state(), FirmwareState::OfferingImages);
        assert!(actions.contains(&FirmwareAction::EnableNotifications(OadChannel::Identify)));
        assert!(actions.contains(&FirmwareAction::EnableNotifications(OadChannel::Block)));
        assert!(actions.contains(&FirmwareAction::Write(OadChannel::Identify, vec![0x00])));
    }

    #[test]
    fn rejection_by_client() {
        let mut upload = FirmwareUpload::new(FirmwareConfig::default());
        upload.start(bundle(4)).unwrap();
        upload.on_version(Ok("1".into()));
        upload.take_actions();
        assert!(upload.answer_approval(false));
        assert_eq!(
            finished(&upload.take_actions()),
            vec![&Err(BeanError::ClientRejected)]
        );
        assert!(!upload.answer_approval(true));
    }

    #[test]
    fn garbage_version_is_unparsable() {
        let mut upload = FirmwareUpload::new(FirmwareConfig::default());
        upload.start(bundle(4)).unwrap();
        upload.on_version(Ok("Img-A".into()));
        assert_eq!(
            finished(&upload.take_actions()),
            vec![&Err(BeanError::UnparsableVersionHeader("Img-A".into()))]
        );
    }

    #[test]
    fn offers_image_for_the_other_slot() {
        for (running, offered) in [(b"AAAA", ImageSlot::B), (b"BBBB", ImageSlot::A)] {
            let mut upload = FirmwareUpload::new(FirmwareConfig::default());
            upload.start(bundle(4)).unwrap();
            upload.on_version(Ok("1".into()));
            upload.answer_approval(true);
            upload.take_actions();

            upload.on_notification(OadChannel::Identify, &header(running));
            assert_eq!(upload.state(), FirmwareState::AwaitingTransferAccept);
            let actions = upload.take_actions();
            let proposal = actions
                .iter()
                .find_map(|a| match a {
                    FirmwareAction::Write(OadChannel::Identify, value) => Some(value.clone()),
                    _ => None,
                })
                .unwrap();
            assert_eq!(proposal.len(), 8);
            assert_eq!(
                FirmwareHeader::from_bytes(&proposal).unwrap().slot,
                offered
            );
        }
    }

    #[test]
    fn header_resent_means_rejected() {
        let mut upload = FirmwareUpload::new(FirmwareConfig::default());
        upload.start(bundle(4)).unwrap();
        upload.on_version(Ok("1".into()));
        upload.answer_approval(true);
        upload.on_notification(OadChannel::Identify, &header(b"AAAA"));
        upload.take_actions();

        upload.on_notification(OadChannel::Identify, &header(b"AAAA"));
        assert_eq!(
            finished(&upload.take_actions()),
            vec![&Err(BeanError::DeviceRejectedUpdate)]
        );
    }

    #[test]
    fn writes_each_requested_block() {
        let mut upload = sending(FirmwareConfig::default(), 4);
        for index in 1..4u16 {
            upload.on_notification(OadChannel::Block, &index.to_le_bytes());
            let actions = upload.take_actions();
            assert_eq!(block_writes(&actions), vec![index]);
        }
        // Dropped block: device asks for 2 again
        upload.on_notification(OadChannel::Block, &[2, 0]);
        assert_eq!(block_writes(&upload.take_actions()), vec![2]);
    }

    #[test]
    fn final_block_then_quiet_period_completes() {
        let mut upload = sending(FirmwareConfig::default(), 2);
        upload.on_notification(OadChannel::Block, &[1, 0]);
        let first = timer_token(&upload.take_actions());

        // A re-request restarts the completion timer
        upload.on_notification(OadChannel::Block, &[1, 0]);
        let second = timer_token(&upload.take_actions());
        upload.on_timeout(first);
        assert!(upload.is_active());

        upload.on_timeout(second);
        assert_eq!(
            finished(&upload.take_actions()),
            vec![&Ok(UploadOutcome::Updated)]
        );
    }

    #[test]
    fn lookahead_keeps_window_full_and_rewinds() {
        let config = FirmwareConfig {
            pacing: BlockPacing::Lookahead { blocks_in_flight: 3 },
            ..FirmwareConfig::default()
        };
        let mut upload = FirmwareUpload::new(config);
        upload.start(bundle(8)).unwrap();
        upload.on_version(Ok("1".into()));
        upload.answer_approval(true);
        upload.on_notification(OadChannel::Identify, &header(b"BBBB"));
        upload.take_actions();

        upload.on_notification(OadChannel::Block, &[0, 0]);
        assert_eq!(block_writes(&upload.take_actions()), vec![0, 1, 2]);
        upload.on_notification(OadChannel::Block, &[1, 0]);
        assert_eq!(block_writes(&upload.take_actions()), vec![3]);
        upload.on_notification(OadChannel::Block, &[2, 0]);
        assert_eq!(block_writes(&upload.take_actions()), vec![4]);

        // Block 3 was lost: the device asks for it again after seeing 4
        upload.on_notification(OadChannel::Block, &[3, 0]);
        assert_eq!(block_writes(&upload.take_actions()), vec![5]);
        upload.on_notification(OadChannel::Block, &[3, 0]);
        assert_eq!(block_writes(&upload.take_actions()), vec![3, 4, 5]);
    }

    #[test]
    fn timeouts_name_their_state() {
        let mut upload = FirmwareUpload::new(FirmwareConfig::default());
        upload.start(bundle(4)).unwrap();
        let token = timer_token(&upload.take_actions());
        upload.on_timeout(token);
        assert_eq!(
            finished(&upload.take_actions()),
            vec![&Err(BeanError::UploadTimeout(UploadStage::CheckingVersion))]
        );

        let mut upload = sending(FirmwareConfig::default(), 4);
        upload.on_notification(OadChannel::Block, &[1, 0]);
        let token = timer_token(&upload.take_actions());
        upload.on_timeout(token);
        assert_eq!(
            finished(&upload.take_actions()),
            vec![&Err(BeanError::UploadTimeout(UploadStage::SendingBlocks))]
        );
    }

    #[test]
    fn stale_timer_is_ignored_after_state_change() {
        let mut upload = FirmwareUpload::new(FirmwareConfig::default());
        upload.start(bundle(4)).unwrap();
        let checking = timer_token(&upload.take_actions());
        upload.on_version(Ok("1".into()));
        upload.take_actions();

        upload.on_timeout(checking);
        assert_eq!(upload.state(), FirmwareState::AwaitingApproval);
        assert!(upload.take_actions().is_empty());
    }

    #[test]
    fn disconnect_mid_transfer_fails_once() {
        let mut upload = sending(FirmwareConfig::default(), 4);
        upload.on_disconnect(None);
        let actions = upload.take_actions();
        assert_eq!(finished(&actions), vec![&Err(BeanError::Disconnected)]);
        assert!(actions.contains(&FirmwareAction::CancelTimer));
        assert_eq!(upload.state(), FirmwareState::Inactive);

        upload.on_disconnect(None);
        upload.on_notification(OadChannel::Block, &[1, 0]);
        assert!(upload.take_actions().is_empty());
    }

    #[test]
    fn reboot_after_final_block_reconnects_and_verifies() {
        let mut upload = sending(FirmwareConfig::default(), 2);
        upload.on_notification(OadChannel::Block, &[1, 0]);
        upload.take_actions();

        upload.on_disconnect(None);
        assert_eq!(upload.state(), FirmwareState::Reconnecting);
        assert!(upload.take_actions().contains(&FirmwareAction::Reconnect));

        upload.on_reconnected();
        assert_eq!(upload.state(), FirmwareState::CheckingVersion);
        upload.take_actions();
        upload.on_version(Ok("200 Img-B".into()));
        assert_eq!(
            finished(&upload.take_actions()),
            vec![&Ok(UploadOutcome::Updated)]
        );
    }

    #[test]
    fn reboot_during_offer_renegotiates_without_asking_again() {
        let mut upload = FirmwareUpload::new(FirmwareConfig::default());
        upload.start(bundle(4)).unwrap();
        upload.on_version(Ok("1".into()));
        upload.answer_approval(true);
        upload.on_disconnect(None);
        assert_eq!(upload.state(), FirmwareState::Reconnecting);

        upload.on_reconnected();
        upload.on_version(Ok("OAD Img-A".into()));
        assert_eq!(upload.state(), FirmwareState::OfferingImages);
        assert!(
            upload
                .take_actions()
                .contains(&FirmwareAction::Write(OadChannel::Identify, vec![0x00]))
        );
    }

    #[test]
    fn second_start_is_refused() {
        let mut upload = FirmwareUpload::new(FirmwareConfig::default());
        upload.start(bundle(4)).unwrap();
        assert_eq!(upload.start(bundle(4)), Err(BeanError::UploadInProgress));
    }
}
