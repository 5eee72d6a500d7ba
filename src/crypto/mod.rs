pub mod canonical;
pub mod cipher;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::errors::{BtpsError, Result};

/// The only signature algorithm carried on the wire.
pub const SIGNATURE_ALGORITHM: &str = "sha256";

/// Parse an RSA private key from PKCS#8 or PKCS#1 PEM.
///
/// The returned key zeroizes its material on drop.
pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|err| BtpsError::Crypto(format!("unreadable private key: {err}")))
}

/// Parse an RSA public key from SPKI or PKCS#1 PEM.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|err| BtpsError::Crypto(format!("unreadable public key: {err}")))
}

/// base64(SHA-256(DER-encoded SPKI)) of a public key.
///
/// Carried in every signature block so receivers can detect a key rollover
/// between signing and verification.
pub fn fingerprint(key: &RsaPublicKey) -> Result<String> {
    let der = key
        .to_public_key_der()
        .map_err(|err| BtpsError::Crypto(format!("spki encoding failed: {err}")))?;
    Ok(BASE64.encode(Sha256::digest(der.as_bytes())))
}

/// RSA-PKCS#1-v1.5 signature over the SHA-256 digest of `canonical`,
/// base64-encoded.
pub fn sign(canonical: &[u8], key: &RsaPrivateKey) -> Result<String> {
    let digest = Sha256::digest(canonical);
    let signature = key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|err| BtpsError::Crypto(format!("signing failed: {err}")))?;
    Ok(BASE64.encode(signature))
}

/// Verify a base64 signature produced by [`sign`] against `canonical`.
pub fn verify(canonical: &[u8], signature_b64: &str, key: &RsaPublicKey) -> Result<()> {
    let signature = BASE64
        .decode(signature_b64)
        .map_err(|_| BtpsError::SignatureVerificationFailed("malformed signature".into()))?;
    let digest = Sha256::digest(canonical);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        .map_err(|_| BtpsError::SignatureVerificationFailed("signature mismatch".into()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::OnceLock;

    /// 2048-bit test key, generated once per test binary.
    pub(crate) fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| {
            RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("keygen")
        })
    }

    pub(crate) fn second_test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| {
            RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("keygen")
        })
    }

    #[test]
    fn sign_verify_round_trip() {
        let key = test_key();
        let public = key.to_public_key();
        let payload = b"{\"id\":\"x\"}";

        let signature = sign(payload, key).unwrap();
        verify(payload, &signature, &public).unwrap();
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let key = test_key();
        let public = key.to_public_key();

        let signature = sign(b"payload-a", key).unwrap();
        let err = verify(b"payload-b", &signature, &public).unwrap_err();
        assert!(matches!(err, BtpsError::SignatureVerificationFailed(_)));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let signature = sign(b"payload", test_key()).unwrap();
        let other = second_test_key().to_public_key();
        assert!(verify(b"payload", &signature, &other).is_err());
    }

    #[test]
    fn fingerprint_is_stable_per_key() {
        let public = test_key().to_public_key();
        assert_eq!(fingerprint(&public).unwrap(), fingerprint(&public).unwrap());
        assert_ne!(
            fingerprint(&public).unwrap(),
            fingerprint(&second_test_key().to_public_key()).unwrap()
        );
    }

    #[test]
    fn pem_round_trip() {
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};

        let key = test_key();
        let private_pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let parsed = private_key_from_pem(&private_pem).unwrap();
        assert_eq!(parsed.to_public_key(), key.to_public_key());

        let public_pem = key.to_public_key().to_public_key_pem(LineEnding::LF).unwrap();
        let parsed = public_key_from_pem(&public_pem).unwrap();
        assert_eq!(parsed, key.to_public_key());
    }
}
