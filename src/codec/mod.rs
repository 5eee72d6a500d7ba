//! Composition of the crypto layer with the wire schema: building signed
//! (optionally encrypted) envelopes, undoing them on receipt, and the
//! newline-delimited framing both directions use.

use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::Value;

use crate::artifact::validation::{check_envelope_shape, decode_document};
use crate::artifact::{
    ArtifactDocument, ArtifactKind, BtpsEnvelope, EncryptionBlock, SignatureBlock,
};
use crate::crypto::canonical::canonical_bytes;
use crate::crypto::cipher::{
    decrypt_document, encrypt_document, EncryptionMode, ENCRYPTION_ALGORITHM,
};
use crate::crypto::{
    fingerprint, private_key_from_pem, public_key_from_pem, sign, verify, SIGNATURE_ALGORITHM,
};
use crate::errors::{BtpsError, Result};
use crate::identity::resolver::{resolve_host, resolve_key, DnsTxtResolver, KeyPart};
use crate::identity::Identity;

/// Default line-length policy: one envelope must fit in 1 MiB.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// An artifact as handed to the client by the caller, before signing.
#[derive(Debug, Clone)]
pub struct BtpsArtifact {
    pub to: Identity,
    pub kind: ArtifactKind,
    pub document: Value,
    /// Override for the generated envelope id, e.g. for redelivery.
    pub id: Option<String>,
}

impl BtpsArtifact {
    pub fn new(to: Identity, kind: ArtifactKind, document: Value) -> Self {
        Self {
            to,
            kind,
            document,
            id: None,
        }
    }
}

/// Signing half of a sender: identity, published selector, and key pair.
///
/// The private key never leaves this struct and is zeroized on drop by the
/// underlying key type.
pub struct ArtifactSigner {
    identity: Identity,
    selector: String,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    fingerprint: String,
}

impl ArtifactSigner {
    pub fn new(
        identity: Identity,
        selector: impl Into<String>,
        private_key_pem: &str,
        public_key_pem: &str,
    ) -> Result<Self> {
        let private_key = private_key_from_pem(private_key_pem)?;
        let public_key = public_key_from_pem(public_key_pem)?;
        if private_key.to_public_key() != public_key {
            return Err(BtpsError::Crypto(
                "identity certificate does not match the private key".into(),
            ));
        }
        let fingerprint = fingerprint(&public_key)?;

        Ok(Self {
            identity,
            selector: selector.into(),
            private_key,
            public_key,
            fingerprint,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// Attach `signedBy`, `selector` and the signature block. The envelope
    /// must already be in its final wire shape (encryption applied).
    fn sign_envelope(&self, envelope: &mut BtpsEnvelope) -> Result<()> {
        envelope.signed_by = Some(self.identity.clone());
        envelope.selector = Some(self.selector.clone());
        let canonical = canonical_bytes(envelope)?;
        envelope.signature = Some(SignatureBlock {
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            value: sign(&canonical, &self.private_key)?,
            fingerprint: self.fingerprint.clone(),
        });
        Ok(())
    }
}

/// Validate, encrypt (per `mode`) and sign an outgoing artifact.
///
/// Pure in inputs plus the DNS view at call time: the recipient's current
/// selector and key are resolved fresh for every encrypted send.
pub async fn sign_encrypt(
    artifact: BtpsArtifact,
    signer: &ArtifactSigner,
    resolver: &dyn DnsTxtResolver,
    mode: &EncryptionMode,
) -> Result<BtpsEnvelope> {
    decode_document(artifact.kind, &artifact.document)?;

    let mut envelope = BtpsEnvelope::build(
        signer.identity().clone(),
        artifact.to.clone(),
        artifact.kind,
        artifact.document,
    );
    if let Some(id) = artifact.id {
        envelope.id = id;
    }

    if !matches!(mode, EncryptionMode::None) {
        let host = resolve_host(resolver, artifact.to.domain()).await?;
        let pem = resolve_key(resolver, &artifact.to, &host.selector, KeyPart::Pem).await?;
        let recipient_key = public_key_from_pem(&pem)?;

        let plaintext = serde_json::to_vec(&envelope.document)?;
        let sealed = encrypt_document(&plaintext, &recipient_key, mode)?;
        envelope.document = Value::String(sealed.ciphertext);
        envelope.encryption = Some(EncryptionBlock {
            algorithm: ENCRYPTION_ALGORITHM.to_string(),
            encrypted_key: sealed.encrypted_key,
            iv: sealed.iv,
            kind: sealed.kind,
        });
    }

    signer.sign_envelope(&mut envelope)?;
    Ok(envelope)
}

/// Verify an inbound envelope and recover its typed document.
///
/// The signature covers the wire form, so verification needs no private
/// key; `private_key` is only required when an `encryption` block is
/// present. Unsigned envelopes are accepted only for the server response
/// frames.
pub async fn verify_decrypt(
    envelope: &BtpsEnvelope,
    expected_receiver: Option<&Identity>,
    private_key: Option<&RsaPrivateKey>,
    passphrase: Option<&str>,
    resolver: &dyn DnsTxtResolver,
) -> Result<ArtifactDocument> {
    check_envelope_shape(envelope)?;

    if let Some(expected) = expected_receiver {
        if envelope.to != *expected {
            return Err(BtpsError::SchemaValidation {
                path: "to".into(),
                message: format!("addressed to {}, expected {expected}", envelope.to),
            });
        }
    }

    match (&envelope.signature, &envelope.signed_by, &envelope.selector) {
        (Some(signature), Some(signed_by), Some(selector)) => {
            if signature.algorithm != SIGNATURE_ALGORITHM {
                return Err(BtpsError::SignatureVerificationFailed(format!(
                    "unsupported algorithm {}",
                    signature.algorithm
                )));
            }

            let pem = resolve_key(resolver, signed_by, selector, KeyPart::Pem).await?;
            let key = public_key_from_pem(&pem)?;
            if fingerprint(&key)? != signature.fingerprint {
                return Err(BtpsError::SignatureVerificationFailed(
                    "fingerprint does not match the published key".into(),
                ));
            }

            let canonical = canonical_bytes(envelope)?;
            verify(&canonical, &signature.value, &key)?;
        }
        (None, None, None) if envelope.kind.is_response_frame() => {}
        _ => {
            return Err(BtpsError::SignatureVerificationFailed(
                "artifact is not signed".into(),
            ));
        }
    }

    let document = match &envelope.encryption {
        Some(encryption) => {
            let key = private_key.ok_or_else(|| {
                BtpsError::DecryptionFailed("private key required for encrypted document".into())
            })?;
            let ciphertext = envelope.document.as_str().ok_or_else(|| {
                BtpsError::DecryptionFailed("encrypted document is not a string".into())
            })?;
            let plaintext = decrypt_document(
                ciphertext,
                &encryption.encrypted_key,
                &encryption.iv,
                encryption.kind,
                key,
                passphrase,
            )?;
            serde_json::from_slice(&plaintext)
                .map_err(|_| BtpsError::DecryptionFailed("decrypted payload is not JSON".into()))?
        }
        None => envelope.document.clone(),
    };

    decode_document(envelope.kind, &document)
}

/// Serialize an envelope as one newline-terminated wire line.
pub fn encode_line(envelope: &BtpsEnvelope) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(envelope)?;
    line.push(b'\n');
    Ok(line)
}

/// Incremental splitter for the newline-delimited wire.
///
/// Partial lines are buffered across reads; a line that grows past the
/// configured maximum without a terminator is terminal.
pub struct LineReader {
    buffer: Vec<u8>,
    max_line_bytes: usize,
}

impl LineReader {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes,
        }
    }

    /// Feed a chunk from the socket; returns every completed line, without
    /// the terminator.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(at) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=at).collect();
            line.pop();
            if line.len() > self.max_line_bytes {
                return Err(BtpsError::LineTooLong {
                    max: self.max_line_bytes,
                });
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if self.buffer.len() > self.max_line_bytes {
            return Err(BtpsError::LineTooLong {
                max: self.max_line_bytes,
            });
        }

        Ok(lines)
    }
}
