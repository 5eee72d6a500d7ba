//! Hybrid document encryption: AES-256-CBC for the payload, RSA-OAEP for
//! the key wrap, with an optional PBKDF2 second factor.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::artifact::EncryptionType;
use crate::errors::{BtpsError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// The only payload cipher carried on the wire.
pub const ENCRYPTION_ALGORITHM: &str = "aes-256-cbc";

/// PBKDF2-HMAC-SHA256 iteration count for the second factor.
pub const PBKDF2_ROUNDS: u32 = 100_000;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

/// Caller-selected encryption mode for an outgoing artifact.
#[derive(Debug, Clone, Default)]
pub enum EncryptionMode {
    /// Signed but not encrypted.
    #[default]
    None,
    /// Hybrid RSA+AES encryption to the recipient's published key.
    Standard,
    /// [`EncryptionMode::Standard`] plus a caller-supplied passphrase mixed
    /// into the key via PBKDF2.
    TwoFactor { passphrase: String },
}

impl EncryptionMode {
    pub fn wire_type(&self) -> EncryptionType {
        match self {
            EncryptionMode::None => EncryptionType::None,
            EncryptionMode::Standard => EncryptionType::Standard,
            EncryptionMode::TwoFactor { .. } => EncryptionType::TwoFactor,
        }
    }
}

/// An encrypted document ready to be placed into an envelope.
#[derive(Debug, Clone)]
pub struct EncryptedDocument {
    /// base64 of the AES ciphertext; becomes the envelope `document`.
    pub ciphertext: String,
    /// base64 of the RSA-OAEP-wrapped (possibly factor-mixed) AES key.
    pub encrypted_key: String,
    /// base64 of the CBC initialization vector.
    pub iv: String,
    pub kind: EncryptionType,
}

/// Encrypt serialized document bytes for `recipient_key` under `mode`.
///
/// A fresh 32-byte key and 16-byte IV are drawn per call. In two-factor mode
/// the PBKDF2 derivation is salted with the IV, so the recipient re-derives
/// from the envelope alone plus the shared passphrase.
pub fn encrypt_document(
    plaintext: &[u8],
    recipient_key: &RsaPublicKey,
    mode: &EncryptionMode,
) -> Result<EncryptedDocument> {
    if matches!(mode, EncryptionMode::None) {
        return Err(BtpsError::Crypto("encrypt called with mode none".into()));
    }

    let mut rng = rand::thread_rng();
    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; IV_LEN];
    rng.fill_bytes(&mut key);
    rng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|err| BtpsError::Crypto(format!("cipher init failed: {err}")))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let wrapped_key = match mode {
        EncryptionMode::Standard => key.to_vec(),
        EncryptionMode::TwoFactor { passphrase } => mix_second_factor(&key, &iv, passphrase),
        EncryptionMode::None => unreachable!(),
    };

    let encrypted_key = recipient_key
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &wrapped_key)
        .map_err(|err| BtpsError::Crypto(format!("key wrap failed: {err}")))?;

    Ok(EncryptedDocument {
        ciphertext: BASE64.encode(ciphertext),
        encrypted_key: BASE64.encode(encrypted_key),
        iv: BASE64.encode(iv),
        kind: mode.wire_type(),
    })
}

/// Reverse [`encrypt_document`]. Every unwrap, padding, or length failure is
/// the terminal [`BtpsError::DecryptionFailed`] class.
pub fn decrypt_document(
    ciphertext_b64: &str,
    encrypted_key_b64: &str,
    iv_b64: &str,
    kind: EncryptionType,
    private_key: &RsaPrivateKey,
    passphrase: Option<&str>,
) -> Result<Vec<u8>> {
    let ciphertext = decode_b64(ciphertext_b64, "document")?;
    let wrapped = decode_b64(encrypted_key_b64, "encryptedKey")?;
    let iv = decode_b64(iv_b64, "iv")?;

    if iv.len() != IV_LEN {
        return Err(BtpsError::DecryptionFailed("iv is not 16 bytes".into()));
    }

    let mut key = private_key
        .decrypt(Oaep::new::<Sha256>(), &wrapped)
        .map_err(|_| BtpsError::DecryptionFailed("key unwrap failed".into()))?;

    if key.len() != KEY_LEN {
        return Err(BtpsError::DecryptionFailed("unwrapped key is not 32 bytes".into()));
    }

    match kind {
        EncryptionType::TwoFactor => {
            let passphrase = passphrase.ok_or_else(|| {
                BtpsError::DecryptionFailed("second factor required".into())
            })?;
            key = mix_second_factor(&key, &iv, passphrase);
        }
        EncryptionType::Standard => {}
        EncryptionType::None => {
            return Err(BtpsError::DecryptionFailed(
                "encryption block present with type none".into(),
            ));
        }
    }

    Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|err| BtpsError::DecryptionFailed(format!("cipher init failed: {err}")))?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| BtpsError::DecryptionFailed("bad padding".into()))
}

/// XOR the PBKDF2(passphrase, salt = iv) output into the key. Applying the
/// same mix twice restores the original, so wrap and unwrap share this.
fn mix_second_factor(key: &[u8], iv: &[u8], passphrase: &str) -> Vec<u8> {
    let mut derived = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), iv, PBKDF2_ROUNDS, &mut derived);
    key.iter().zip(derived).map(|(k, d)| k ^ d).collect()
}

fn decode_b64(value: &str, field: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|_| BtpsError::DecryptionFailed(format!("{field} is not valid base64")))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::crypto::tests::{second_test_key, test_key};

    #[test]
    fn standard_round_trip() {
        let key = test_key();
        let public = key.to_public_key();
        let plaintext = br#"{"name":"Alice","reason":"invoicing"}"#;

        let sealed = encrypt_document(plaintext, &public, &EncryptionMode::Standard).unwrap();
        assert_eq!(sealed.kind, EncryptionType::Standard);

        let opened = decrypt_document(
            &sealed.ciphertext,
            &sealed.encrypted_key,
            &sealed.iv,
            sealed.kind,
            key,
            None,
        )
        .unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_private_key_fails_terminally() {
        let public = test_key().to_public_key();
        let sealed = encrypt_document(b"secret", &public, &EncryptionMode::Standard).unwrap();

        let err = decrypt_document(
            &sealed.ciphertext,
            &sealed.encrypted_key,
            &sealed.iv,
            sealed.kind,
            second_test_key(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, BtpsError::DecryptionFailed(_)));
        assert!(err.is_terminal());
    }

    #[test]
    fn two_factor_round_trip_requires_the_passphrase() {
        let key = test_key();
        let public = key.to_public_key();
        let mode = EncryptionMode::TwoFactor {
            passphrase: "correct horse".into(),
        };

        let sealed = encrypt_document(b"secret", &public, &mode).unwrap();
        assert_eq!(sealed.kind, EncryptionType::TwoFactor);

        let opened = decrypt_document(
            &sealed.ciphertext,
            &sealed.encrypted_key,
            &sealed.iv,
            sealed.kind,
            key,
            Some("correct horse"),
        )
        .unwrap();
        assert_eq!(opened, b"secret");

        let err = decrypt_document(
            &sealed.ciphertext,
            &sealed.encrypted_key,
            &sealed.iv,
            sealed.kind,
            key,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, BtpsError::DecryptionFailed(_)));

        // A wrong passphrase yields garbage: either a padding error or
        // plaintext that no longer matches.
        let wrong = decrypt_document(
            &sealed.ciphertext,
            &sealed.encrypted_key,
            &sealed.iv,
            sealed.kind,
            key,
            Some("wrong phrase"),
        );
        assert!(wrong.map(|opened| opened != b"secret").unwrap_or(true));
    }

    #[test]
    fn fresh_key_and_iv_per_call() {
        let public = test_key().to_public_key();
        let a = encrypt_document(b"same", &public, &EncryptionMode::Standard).unwrap();
        let b = encrypt_document(b"same", &public, &EncryptionMode::Standard).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
