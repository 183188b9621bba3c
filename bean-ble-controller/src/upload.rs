//! Caller side of a running firmware or sketch upload

use tokio::sync::{mpsc, oneshot};

use crate::error::BeanError;
use crate::session::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadKind {
    Firmware,
    Sketch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct UploadProgress {
    pub blocks_sent: u32,
    pub total_blocks: u32,
}

impl UploadProgress {
    pub fn new(blocks_sent: u32, total_blocks: u32) -> Self {
        Self {
            blocks_sent,
            total_blocks,
        }
    }

    pub fn percent(&self) -> f32 {
        if self.total_blocks == 0 {
            return 100.0;
        }
        self.blocks_sent as f32 * 100.0 / self.total_blocks as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The new image was transferred and accepted
    Updated,
    /// The device already runs this firmware or newer; nothing was written
    AlreadyUpToDate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// The firmware update is waiting for [`Upload::approve`] or
    /// [`Upload::reject`]. Nothing has been written to the device yet.
    ApprovalRequired {
        device_version: String,
        bundle_version: u64,
    },
    Progress(UploadProgress),
    /// Always the last event of an upload, sent exactly once
    Finished(Result<UploadOutcome, BeanError>),
}

/// Handle to one upload in progress
pub struct Upload {
    kind: UploadKind,
    events: mpsc::UnboundedReceiver<UploadEvent>,
    commands: mpsc::Sender<Command>,
    finished: bool,
}

impl Upload {
    pub(crate) fn new(
        kind: UploadKind,
        events: mpsc::UnboundedReceiver<UploadEvent>,
        commands: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            kind,
            events,
            commands,
            finished: false,
        }
    }

    pub fn kind(&self) -> UploadKind {
        self.kind
    }

    /// Next event, or `None` once [`UploadEvent::Finished`] has been returned.
    pub async fn next_event(&mut self) -> Option<UploadEvent> {
        if self.finished {
            return None;
        }
        match self.events.recv().await {
            Some(event) => {
                self.finished = matches!(event, UploadEvent::Finished(_));
                Some(event)
            }
            None => {
                self.finished = true;
                Some(UploadEvent::Finished(Err(BeanError::SessionClosed)))
            }
        }
    }

    /// Let a pending firmware update start writing to the device.
    pub async fn approve(&self) -> Result<(), BeanError> {
        self.answer(true).await
    }

    /// Decline a pending firmware update. It finishes with
    /// [`BeanError::ClientRejected`].
    pub async fn reject(&self) -> Result<(), BeanError> {
        self.answer(false).await
    }

    async fn answer(&self, approved: bool) -> Result<(), BeanError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ApproveFirmware { approved, reply })
            .await
            .map_err(|_| BeanError::SessionClosed)?;
        rx.await.map_err(|_| BeanError::SessionClosed)?
    }

    /// Abort the upload. It finishes with [`BeanError::Cancelled`].
    pub async fn cancel(&self) -> Result<(), BeanError> {
        self.commands
            .send(Command::CancelUpload(self.kind))
            .await
            .map_err(|_| BeanError::SessionClosed)
    }

    /// Wait for the outcome, skipping progress events. Approval is never
    /// given here: an update that asks for it is rejected, so callers that
    /// want to flash firmware drive [`next_event`](Self::next_event) instead.
    pub async fn finished(mut self) -> Result<UploadOutcome, BeanError> {
        while let Some(event) = self.next_event().await {
            match event {
                UploadEvent::ApprovalRequired { .. } => self.reject().await?,
                UploadEvent::Progress(_) => {}
                UploadEvent::Finished(result) => return result,
            }
        }
        Err(BeanError::SessionClosed)
    }
}
