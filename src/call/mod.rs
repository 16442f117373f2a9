//! Call session state machine
//!
//! Turns user intents and signaling events into a sequenced offer/answer
//! negotiation over one peer transport at a time.
//! Features:
//! - single live call with caller and callee flows
//! - queued candidate exchange that tolerates out-of-order delivery
//! - negotiation timeout and duration clock
//! - idempotent teardown on every exit path

mod candidates;
mod config;
mod manager;
mod session;
mod timers;


pub use config::CallConfig;
pub use manager::{CallHandle, CallManager};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a call attempt ended abnormally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallErrorKind {
    PermissionDenied,
    DeviceNotFound,
    DeviceBusy,
    /// Acquisition failed for a reason the device layer could not classify
    DeviceError,
    NegotiationTimeout,
    NegotiationFailed,
    IceFailure,
    ConnectionLost,
    SignalingUnavailable,
}

impl CallErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            CallErrorKind::PermissionDenied => "permission-denied",
            CallErrorKind::DeviceNotFound => "device-not-found",
            CallErrorKind::DeviceBusy => "device-busy",
            CallErrorKind::DeviceError => "device-error",
            CallErrorKind::NegotiationTimeout => "negotiation-timeout",
            CallErrorKind::NegotiationFailed => "negotiation-failed",
            CallErrorKind::IceFailure => "ice-failure",
            CallErrorKind::ConnectionLost => "connection-lost",
            CallErrorKind::SignalingUnavailable => "signaling-unavailable",
        }
    }
}

impl std::fmt::Display for CallErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            CallErrorKind::PermissionDenied => {
                "Camera/microphone access denied. Please allow access and try again."
            }
            CallErrorKind::DeviceNotFound => "No camera/microphone found. Please check your device.",
            CallErrorKind::DeviceBusy => "Camera/microphone is already in use by another application.",
            CallErrorKind::DeviceError => "Failed to access camera/microphone.",
            CallErrorKind::NegotiationTimeout => "Connection timeout. Please try again.",
            CallErrorKind::NegotiationFailed => "Failed to establish connection. Please try again.",
            CallErrorKind::IceFailure => "Connection failed. Please try again.",
            CallErrorKind::ConnectionLost => "Connection lost. Please try again.",
            CallErrorKind::SignalingUnavailable => "Signaling server unavailable. Please try again.",
        };
        f.write_str(message)
    }
}

/// Call API errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Call manager is not running")]
    ManagerClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Call failed: {0}")]
    Failed(CallErrorKind),
}

impl From<CallErrorKind> for CallError {
    fn from(kind: CallErrorKind) -> Self {
        CallError::Failed(kind)
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn test_error_kind_codes_match_serde() {
        let kinds = [
            CallErrorKind::PermissionDenied,
            CallErrorKind::DeviceNotFound,
            CallErrorKind::DeviceBusy,
            CallErrorKind::DeviceError,
            CallErrorKind::NegotiationTimeout,
            CallErrorKind::NegotiationFailed,
            CallErrorKind::IceFailure,
            CallErrorKind::ConnectionLost,
            CallErrorKind::SignalingUnavailable,
        ];
        for kind in kinds {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.code()));
        }
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            CallError::from(CallErrorKind::NegotiationTimeout).to_string(),
            "Call failed: Connection timeout. Please try again."
        );
    }
}
