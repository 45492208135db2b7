//! Error taxonomy surfaced to callers.
//!
//! Internally everything propagates as `anyhow::Error`; these variants are attached
//! where a caller needs to distinguish outcomes (encryption state, device lookup,
//! subset naming). Only the orchestrator converts them to user-facing codes.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RimeError {
    #[error("no device filesystem found at {0}")]
    FilesystemNotFound(String),

    #[error("unrecognised device filesystem at {0}")]
    FilesystemTypeUnknown(String),

    #[error("filesystem {0} is encrypted")]
    FilesystemIsEncrypted(String),

    #[error("backup has not been decrypted yet")]
    NotDecrypted,

    #[error("no passphrase supplied")]
    NoPassphrase,

    #[error("wrong passphrase")]
    WrongPassphrase,

    #[error("device {0} is not an encrypted device")]
    NotEncryptedDeviceType(String),

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("operation not supported on this filesystem: {0}")]
    UnsupportedOperation(&'static str),

    #[error("anonymisation failed: {0}")]
    AnonymisationFailed(String),
}

/// Error codes surfaced on the `subset_complete` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SubsetErrorCode {
    None = 0,
    NameExists = 1,
    NameInvalid = 2,
    Unknown = 3,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct CreateSubsetError {
    pub code: SubsetErrorCode,
    pub message: String,
}

impl CreateSubsetError {
    pub fn name_exists(device_id: &str) -> Self {
        CreateSubsetError {
            code: SubsetErrorCode::NameExists,
            message: format!("Device with id {device_id} already exists"),
        }
    }

    pub fn name_invalid(device_id: &str) -> Self {
        CreateSubsetError {
            code: SubsetErrorCode::NameInvalid,
            message: format!("Invalid device id {device_id}"),
        }
    }
}

/// The code for an arbitrary subset failure: a `CreateSubsetError` keeps its own code,
/// anything else maps to `Unknown`.
pub fn subset_error_code(error: &anyhow::Error) -> SubsetErrorCode {
    match error.downcast_ref::<CreateSubsetError>() {
        Some(e) => e.code,
        None => SubsetErrorCode::Unknown,
    }
}
