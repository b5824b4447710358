use thiserror::Error;

/// Failures of the at-rest payload cipher and codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Magic mismatch, truncated blob, or GCM authentication failure.
    /// Decrypt never substitutes plaintext.
    #[error("ciphertext corrupt or authentication failed")]
    CorruptCiphertext,
    #[error("no key material for key version {0}")]
    UnknownKeyVersion(u16),
    /// The row's `key_version` column disagrees with the version named in
    /// the ciphertext header (`stored` is `None` when the column is NULL on
    /// an encrypted row).
    #[error("stored key version {stored:?} does not match ciphertext key version {blob}")]
    KeyVersionMismatch { stored: Option<u16>, blob: u16 },
    #[error("unsupported payload encoding `{0}`")]
    UnsupportedEncoding(String),
}

/// Failures of the audit journal itself. Callers of `record` never see these
/// (appends are best-effort and a missing entry *is* tamper evidence), but
/// `verify` and retention surface them.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit journal I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit entry serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Top-level SDK error. Admission and sync *outcomes* (rejections, transport
/// failures) are sum types, not errors; this covers the cases where the SDK
/// itself could not do its job.
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("configuration: {0}")]
    Config(String),
    #[error("queue store corrupt: {0}")]
    Corrupt(String),
    #[error("queue store I/O: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Audit(#[from] AuditError),
}
