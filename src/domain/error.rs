//! Error types surfaced by the BLE core.

use crate::domain::models::PairingOutcome;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BleError {
    #[error("device not found")]
    NotFound,

    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    #[error("access denied: {0}")]
    Unauthorized(String),

    #[error("pairing failed: {0}")]
    PairingFailed(PairingOutcome),

    #[error("a device is already connected")]
    AlreadyConnected,

    #[error("no device is connected")]
    NotConnected,

    #[error("operation canceled")]
    Canceled,

    #[error(transparent)]
    Platform(#[from] anyhow::Error),
}

impl BleError {
    pub fn platform(message: impl std::fmt::Display) -> Self {
        BleError::Platform(anyhow::anyhow!("{}", message))
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for BleError {
    fn from(err: windows::core::Error) -> Self {
        use windows::Win32::Foundation::{E_ACCESSDENIED, E_INVALIDARG};

        let code = err.code();
        if code == E_ACCESSDENIED {
            BleError::Unauthorized(err.message())
        } else if code == E_INVALIDARG {
            BleError::InvalidAddress(err.message())
        } else {
            BleError::Platform(err.into())
        }
    }
}
