use crate::handshake::RejectCode;
use thiserror::Error;

/// Errors produced by the ciphertalk protocol layer.
#[derive(Debug, Error)]
pub enum TalkError {
    #[error("invalid passphrase: must be a non-empty string")]
    InvalidPassphrase,

    #[error("invalid remote public key: {0}")]
    InvalidRemoteKey(String),

    #[error("remote public key already bound for this context")]
    RemoteKeyAlreadyBound,

    #[error("no remote public key bound")]
    NoRemoteKeyBound,

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("key import failed: {0}")]
    KeyImport(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("handshake rejected: {0}")]
    Handshake(RejectCode),

    #[error("identity already in use: {0}")]
    IdentityTaken(String),

    #[error("send queue full for {0}")]
    QueueFull(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TalkError {
    fn from(e: serde_json::Error) -> Self {
        TalkError::Codec(e.to_string())
    }
}

impl TalkError {
    /// The handshake rejection code carried by this error, if any.
    pub fn reject_code(&self) -> Option<RejectCode> {
        match self {
            TalkError::Handshake(code) => Some(*code),
            _ => None,
        }
    }
}

pub type TalkResult<T> = Result<T, TalkError>;
