use std::fmt;

use bean_proto::ProtoError;

/// Failure reported by a [`GattTransport`](crate::transport::GattTransport)
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(uuid::Uuid),

    #[error("no Bluetooth adapter found")]
    NoAdapter,

    #[error("device not found")]
    DeviceNotFound,

    #[error("operation not confirmed after {attempts} attempts")]
    Timeout { attempts: u32 },

    #[error("{0}")]
    Other(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::DeviceNotFound => TransportError::DeviceNotFound,
            btleplug::Error::NotConnected => TransportError::ConnectionFailed("not connected".into()),
            other => TransportError::Other(other.to_string()),
        }
    }
}

/// The upload state a timeout fired in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    CheckingVersion,
    AwaitingApproval,
    OfferingImages,
    AwaitingTransferAccept,
    SendingBlocks,
    SendingStartCommand,
    AwaitingCompletion,
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStage::CheckingVersion => "checking firmware version",
            UploadStage::AwaitingApproval => "waiting for approval",
            UploadStage::OfferingImages => "offering image",
            UploadStage::AwaitingTransferAccept => "waiting for the device to accept the image",
            UploadStage::SendingBlocks => "waiting for a block request",
            UploadStage::SendingStartCommand => "waiting for the bootloader to get ready",
            UploadStage::AwaitingCompletion => "waiting for the bootloader to finish",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BeanError {
    #[error("not connected")]
    NotConnected,

    #[error("serial service not discovered")]
    ServicesNotDiscovered,

    #[error("device has no OAD service")]
    MissingOadService,

    #[error("device has no OAD identify characteristic")]
    MissingOadIdentify,

    #[error("device has no OAD block characteristic")]
    MissingOadBlock,

    #[error("could not enable OAD notifications: {0}")]
    EnableOadNotifyFailed(String),

    #[error("timed out {0}")]
    UploadTimeout(UploadStage),

    #[error("unparsable firmware version: {0}")]
    UnparsableVersionHeader(String),

    #[error("device rejected the firmware image")]
    DeviceRejectedUpdate,

    #[error("firmware update rejected by the client")]
    ClientRejected,

    #[error("sketch upload failed in bootloader step {substate}")]
    SketchUploadFailed { substate: String },

    #[error("an upload is already in progress")]
    UploadInProgress,

    #[error("upload cancelled")]
    Cancelled,

    #[error("unknown message id 0x{0:04x}")]
    UnknownMessageId(u16),

    #[error("disconnected")]
    Disconnected,

    #[error("session closed")]
    SessionClosed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),
}
