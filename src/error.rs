//! FoilPics - Error Types

use thiserror::Error;

/// Result type for vault operations
pub type VaultResult<T> = Result<T, VaultError>;

/// Vault error types
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Crypto operation failed: {0}")]
    CryptoFailed(String),

    #[error("Wrong passphrase")]
    WrongPassphrase,

    #[error("Key file is missing")]
    KeyMissing,

    #[error("Key file is invalid: {0}")]
    KeyInvalid(String),

    #[error("Key generation failed: {0}")]
    KeyError(String),

    #[error("Image decode failed: {0}")]
    DecodeFailed(String),

    #[error("Image encode failed: {0}")]
    EncodeFailed(String),

    #[error("No free name in vault directory")]
    NameExhausted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<image::ImageError> for VaultError {
    fn from(e: image::ImageError) -> Self {
        VaultError::DecodeFailed(e.to_string())
    }
}

impl VaultError {
    /// True for failures that mean the bytes on disk cannot be trusted.
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            VaultError::CryptoFailed(_) | VaultError::WrongPassphrase
        )
    }
}
