//! Error types for session state and record protection.
//!
//! All operations return [`Result<T>`] which wraps [`SessionError`].

use thiserror::Error;

/// Error type for session state, key derivation and record protection.
///
/// # Example
///
/// ```
/// use tunnel_crypto::{SessionError, SessionState};
///
/// let state = SessionState::new(true);
/// match state.export_keying_material("EXPORTER-test", &[], 32) {
///     Err(SessionError::HandshakeNotComplete) => println!("still handshaking"),
///     Err(e) => println!("other error: {e}"),
///     Ok(km) => println!("{} bytes", km.len()),
/// }
/// ```
#[derive(Debug, Error)]
pub enum SessionError {
    /// Keying material was requested before the local epoch advanced
    #[error("handshake is still in progress")]
    HandshakeNotComplete,

    /// A non-empty context was passed to keying material export
    #[error("context is not supported for keying material export")]
    ContextUnsupported,

    /// The export label collides with a label the handshake itself uses
    #[error("export keying material label is reserved: {0}")]
    ReservedLabel(String),

    /// The session names a cipher suite this build does not implement
    #[error("unknown cipher suite: {0:#06x}")]
    UnknownCipherSuite(u16),

    /// Record protection was requested before the cipher suite was initialized
    #[error("cipher suite is not initialized")]
    CipherSuiteNotInitialized,

    /// The master secret is write-once per session
    #[error("master secret is already set")]
    MasterSecretAlreadySet,

    /// A required handshake input is missing
    #[error("missing session input: {0}")]
    MissingInput(&'static str),

    /// The 48-bit sequence space of the current epoch is used up
    #[error("sequence number space exhausted for epoch {0}")]
    SequenceExhausted(u16),

    /// The 16-bit epoch counter cannot advance further
    #[error("epoch counter exhausted")]
    EpochExhausted,

    /// Malformed or truncated record
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Record encryption failed
    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// Record decryption or authentication failed
    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// Invalid key material (wrong size, bad format)
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Binary or JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// File system I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for SessionError {
    fn from(e: base64::DecodeError) -> Self {
        SessionError::Serialization(e.to_string())
    }
}
