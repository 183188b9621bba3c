//! Sketch programming through the Bean bootloader
//!
//! `BL_CMD_START` announces the image, the bootloader answers with
//! `BL_STATUS` messages, and blocks are written on a fixed interval once it
//! reports ready. Like the firmware controller this only queues
//! [`SketchAction`]s for the session to carry out.

use std::time::Duration;

use bean_proto::sketch::{self, BootloaderState, SketchMetadata, Status};
use bean_proto::{Frame, MSG_BL_CMD_START, MSG_BL_FW_BLOCK};

use crate::config::{SketchConfig, millis};
use crate::error::{BeanError, UploadStage};
use crate::timer::{TimerSlot, TimerToken};
use crate::upload::{UploadEvent, UploadOutcome, UploadProgress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SketchState {
    Inactive,
    SendingStartCommand,
    SendingBlocks,
}

#[derive(Debug, PartialEq)]
pub(crate) enum SketchAction {
    Send(Frame),
    ArmTimer(TimerToken, Duration),
    CancelTimer,
    Emit(UploadEvent),
}

/// What the armed timer means when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerRole {
    /// The bootloader went quiet
    StateTimeout,
    /// Time to write the next block
    NextBlock,
}

pub(crate) struct SketchUpload {
    config: SketchConfig,
    state: SketchState,
    blocks: Vec<Vec<u8>>,
    next_block: usize,
    timer: TimerSlot,
    role: TimerRole,
    actions: Vec<SketchAction>,
}

impl SketchUpload {
    pub fn new(config: SketchConfig) -> Self {
        Self {
            config,
            state: SketchState::Inactive,
            blocks: Vec::new(),
            next_block: 0,
            timer: TimerSlot::default(),
            role: TimerRole::StateTimeout,
            actions: Vec::new(),
        }
    }

    pub fn state(&self) -> SketchState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != SketchState::Inactive
    }

    pub fn take_actions(&mut self) -> Vec<SketchAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn start(&mut self, name: &str, image: &[u8], timestamp: u32) -> Result<(), BeanError> {
        if self.is_active() {
            return Err(BeanError::UploadInProgress);
        }
        let metadata = SketchMetadata::for_image(name, image, timestamp);
        log::info!(
            "programming sketch {:?}: {} bytes, crc32 {:08x}",
            metadata.name,
            metadata.size,
            metadata.crc32
        );
        self.actions.push(SketchAction::Send(Frame::new(
            MSG_BL_CMD_START,
            metadata.to_bytes(),
        )));

        if image.is_empty() {
            // Nothing to stream; the start command alone clears the sketch
            self.finish(UploadOutcome::Updated);
            return Ok(());
        }

        self.blocks = sketch::sketch_blocks(image);
        self.next_block = 0;
        self.state = SketchState::SendingStartCommand;
        self.arm(TimerRole::StateTimeout, self.config.state_timeout_ms);
        Ok(())
    }

    pub fn on_status(&mut self, status: &Status) {
        if !self.is_active() {
            return;
        }
        log::debug!(
            "bootloader {:?}/{:?}, {} blocks {} bytes",
            status.state,
            status.substate,
            status.blocks_sent,
            status.bytes_sent
        );
        match status.state {
            BootloaderState::Ready if self.state == SketchState::SendingStartCommand => {
                self.state = SketchState::SendingBlocks;
                self.send_next_block();
            }
            BootloaderState::Ready | BootloaderState::Programming => {
                if self.timer.is_armed() && self.role == TimerRole::StateTimeout {
                    self.arm(TimerRole::StateTimeout, self.config.state_timeout_ms);
                }
            }
            BootloaderState::Complete => self.finish(UploadOutcome::Updated),
            BootloaderState::Error => self.fail(BeanError::SketchUploadFailed {
                substate: format!("{:?}", status.substate),
            }),
            _ => {}
        }
    }

    pub fn on_timeout(&mut self, token: TimerToken) {
        if !self.timer.fire(token) {
            return;
        }
        match (self.role, self.state) {
            (TimerRole::NextBlock, SketchState::SendingBlocks) => self.send_next_block(),
            (TimerRole::StateTimeout, SketchState::SendingStartCommand) => {
                self.fail(BeanError::UploadTimeout(UploadStage::SendingStartCommand))
            }
            (TimerRole::StateTimeout, SketchState::SendingBlocks) => {
                self.fail(BeanError::UploadTimeout(UploadStage::AwaitingCompletion))
            }
            _ => {}
        }
    }

    pub fn on_operation_failed(&mut self, error: BeanError) {
        if self.is_active() {
            self.fail(error);
        }
    }

    pub fn on_disconnect(&mut self, cause: Option<BeanError>) {
        if self.is_active() {
            self.fail(cause.unwrap_or(BeanError::Disconnected));
        }
    }

    pub fn cancel(&mut self) {
        if self.is_active() {
            self.fail(BeanError::Cancelled);
        }
    }

    fn send_next_block(&mut self) {
        let Some(block) = self.blocks.get(self.next_block) else {
            return;
        };
        self.actions
            .push(SketchAction::Send(Frame::new(MSG_BL_FW_BLOCK, block.clone())));
        self.next_block += 1;
        let total = self.blocks.len();
        self.actions.push(SketchAction::Emit(UploadEvent::Progress(
            UploadProgress::new(self.next_block as u32, total as u32),
        )));

        if self.next_block < total {
            self.arm(TimerRole::NextBlock, self.config.block_interval_ms);
        } else {
            log::info!("all {} sketch blocks sent, waiting for the bootloader", total);
            self.arm(TimerRole::StateTimeout, self.config.state_timeout_ms);
        }
    }

    fn arm(&mut self, role: TimerRole, timeout_ms: u64) {
        self.role = role;
        let token = self.timer.arm();
        self.actions
            .push(SketchAction::ArmTimer(token, millis(timeout_ms)));
    }

    fn finish(&mut self, outcome: UploadOutcome) {
        log::info!("sketch upload finished");
        self.end(Ok(outcome));
    }

    fn fail(&mut self, error: BeanError) {
        log::error!("sketch upload failed in {:?}: {}", self.state, error);
        self.end(Err(error));
    }

    fn end(&mut self, result: Result<UploadOutcome, BeanError>) {
        if self.timer.is_armed() {
            self.timer.cancel();
            self.actions.push(SketchAction::CancelTimer);
        }
        self.state = SketchState::Inactive;
        self.blocks.clear();
        self.next_block = 0;
        self.actions.push(SketchAction::Emit(UploadEvent::Finished(result)));
    }
}
