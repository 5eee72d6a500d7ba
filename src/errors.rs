use std::io;

use thiserror::Error;

/// Errors surfaced by every layer of the SDK.
///
/// Each variant belongs to exactly one retry class: transient errors may be
/// recovered by re-running the connect pipeline, terminal errors may not.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BtpsError {
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid hostname: {0}")]
    InvalidHostname(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The domain answered DNS but did not publish a usable BTPS record.
    #[error("missing btps dns configuration for {0}")]
    MissingDnsConfig(String),

    #[error("dns resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("connection timed out after {0} ms")]
    ConnectionTimeout(u64),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse JSON: {0}")]
    Syntax(#[from] serde_json::Error),

    #[error("line exceeds the maximum of {max} bytes")]
    LineTooLong { max: usize },

    #[error("signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Key parsing or primitive failures outside of verify/decrypt.
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("schema validation failed at `{path}`: {message}")]
    SchemaValidation { path: String, message: String },

    #[error("trust record already exists: {0}")]
    TrustStoreConflict(String),

    #[error("trust record not found: {0}")]
    TrustStoreNotFound(String),

    #[error("trust store persistence failed: {0}")]
    TrustStore(String),

    #[error("client is not connected")]
    NotConnected,

    #[error("connection destroyed")]
    Destroyed,
}

impl BtpsError {
    /// Whether a retry of the full connect pipeline may recover this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BtpsError::DnsResolutionFailed(_)
                | BtpsError::ConnectionTimeout(_)
                | BtpsError::Io(_)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_transient()
    }

    /// Short stable name of the error class, used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BtpsError::InvalidIdentity(_) => "InvalidIdentity",
            BtpsError::InvalidHostname(_) => "InvalidHostname",
            BtpsError::UnsupportedProtocol(_) => "UnsupportedProtocol",
            BtpsError::MissingDnsConfig(_) => "MissingDnsConfig",
            BtpsError::DnsResolutionFailed(_) => "DnsResolutionFailed",
            BtpsError::ConnectionTimeout(_) => "ConnectionTimeout",
            BtpsError::Io(_) => "SocketError",
            BtpsError::Syntax(_) => "SyntaxError",
            BtpsError::LineTooLong { .. } => "LineTooLong",
            BtpsError::SignatureVerificationFailed(_) => "SignatureVerificationFailed",
            BtpsError::DecryptionFailed(_) => "DecryptionFailed",
            BtpsError::Crypto(_) => "CryptoError",
            BtpsError::SchemaValidation { .. } => "SchemaValidationError",
            BtpsError::TrustStoreConflict(_) => "TrustStoreConflict",
            BtpsError::TrustStoreNotFound(_) => "TrustStoreNotFound",
            BtpsError::TrustStore(_) => "TrustStoreError",
            BtpsError::NotConnected => "NotConnected",
            BtpsError::Destroyed => "Destroyed",
        }
    }
}

pub type Result<T> = std::result::Result<T, BtpsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classes() {
        assert!(BtpsError::DnsResolutionFailed("nxdomain".into()).is_transient());
        assert!(BtpsError::ConnectionTimeout(100).is_transient());
        assert!(BtpsError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset")).is_transient());
    }

    #[test]
    fn terminal_classes() {
        assert!(BtpsError::InvalidIdentity("bad".into()).is_terminal());
        assert!(BtpsError::SignatureVerificationFailed("mismatch".into()).is_terminal());
        assert!(BtpsError::Destroyed.is_terminal());
        assert!(BtpsError::LineTooLong { max: 1024 }.is_terminal());
    }
}
