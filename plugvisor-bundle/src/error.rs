//! Error types for the bundle crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDeserialize(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing required entry: {0}")]
    MissingEntry(String),

    #[error("unexpected entry in bundle: {0}")]
    UnexpectedEntry(String),

    #[error("bundle carries no declared checksum")]
    ChecksumMissing,

    #[error("checksum mismatch: declared {declared}, computed {computed}")]
    ChecksumMismatch { declared: String, computed: String },

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("bundle is not signed")]
    NotSigned,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("manifest validation error: {0}")]
    ManifestInvalid(String),
}
