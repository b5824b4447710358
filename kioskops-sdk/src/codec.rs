//! Payload codec: turns host JSON into the stored blob and back, tagging
//! each row with the encoding that produced it.

use serde::{Deserialize, Serialize};

use crate::crypto::CryptoProvider;
use crate::error::CryptoError;

/// Interpretation of `payload_blob`. Stored as text alongside the row so a
/// decade-old row still says how to read itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadEncoding {
    PlainUtf8,
    AesgcmV1,
}

impl PayloadEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlainUtf8 => "PLAIN_UTF8",
            Self::AesgcmV1 => "AESGCM_V1",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        match s {
            "PLAIN_UTF8" => Ok(Self::PlainUtf8),
            "AESGCM_V1" => Ok(Self::AesgcmV1),
            other => Err(CryptoError::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// Encodes a payload for storage. Encrypted iff the caller asks for it *and*
/// the provider is enabled; the returned key version identifies the key used.
pub fn encode_json(
    json: &str,
    encrypt: bool,
    crypto: &CryptoProvider,
) -> Result<(Vec<u8>, PayloadEncoding, Option<u16>), CryptoError> {
    if encrypt && crypto.enabled() {
        let blob = crypto.encrypt(json.as_bytes())?;
        Ok((blob, PayloadEncoding::AesgcmV1, crypto.current_key_version()))
    } else {
        Ok((json.as_bytes().to_vec(), PayloadEncoding::PlainUtf8, None))
    }
}

/// Reverses `encode_json`. For `AESGCM_V1` the row's stored `key_version`
/// is checked against the version the ciphertext header names; divergence
/// (a corrupted or hand-edited row) is `KeyVersionMismatch`, never a silent
/// decrypt under the wrong assumption.
pub fn decode(
    blob: &[u8],
    encoding: PayloadEncoding,
    key_version: Option<u16>,
    crypto: &CryptoProvider,
) -> Result<String, CryptoError> {
    let plain = match encoding {
        PayloadEncoding::PlainUtf8 => blob.to_vec(),
        PayloadEncoding::AesgcmV1 => {
            let blob_version = CryptoProvider::blob_key_version(blob)?;
            if key_version != Some(blob_version) {
                return Err(CryptoError::KeyVersionMismatch {
                    stored: key_version,
                    blob: blob_version,
                });
            }
            crypto.decrypt(blob)?
        }
    };
    String::from_utf8(plain).map_err(|_| CryptoError::CorruptCiphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_in_both_crypto_modes() {
        let dir = tempfile::tempdir().unwrap();
        let enabled =
            CryptoProvider::load_or_init(&dir.path().join("keys.json"), 1_000).await.unwrap();
        let noop = CryptoProvider::noop();
        let payload = r#"{"scan":"12345","nested":{"qty":3}}"#;

        for (crypto, want_encoding) in
            [(&enabled, PayloadEncoding::AesgcmV1), (&noop, PayloadEncoding::PlainUtf8)]
        {
            let (blob, encoding, key_version) = encode_json(payload, true, crypto).unwrap();
            assert_eq!(encoding, want_encoding);
            assert_eq!(key_version.is_some(), crypto.enabled());
            assert_eq!(decode(&blob, encoding, key_version, crypto).unwrap(), payload);
        }
    }

    #[tokio::test]
    async fn stored_key_version_is_checked_against_the_blob() {
        let dir = tempfile::tempdir().unwrap();
        let crypto =
            CryptoProvider::load_or_init(&dir.path().join("keys.json"), 1_000).await.unwrap();
        let (blob, encoding, key_version) = encode_json("{}", true, &crypto).unwrap();
        assert_eq!(key_version, Some(1));

        // a row whose column drifted from its ciphertext header must not
        // decode silently
        assert_eq!(
            decode(&blob, encoding, Some(2), &crypto),
            Err(CryptoError::KeyVersionMismatch { stored: Some(2), blob: 1 })
        );
        // NULL column on an encrypted row is the same corruption
        assert_eq!(
            decode(&blob, encoding, None, &crypto),
            Err(CryptoError::KeyVersionMismatch { stored: None, blob: 1 })
        );
        assert_eq!(decode(&blob, encoding, key_version, &crypto).unwrap(), "{}");
    }

    #[tokio::test]
    async fn encrypt_flag_off_stores_plain_even_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let crypto =
            CryptoProvider::load_or_init(&dir.path().join("keys.json"), 1_000).await.unwrap();
        let (blob, encoding, key_version) = encode_json("{}", false, &crypto).unwrap();
        assert_eq!(encoding, PayloadEncoding::PlainUtf8);
        assert_eq!(key_version, None);
        assert_eq!(blob, b"{}");
    }

    #[test]
    fn unknown_encoding_tag_is_rejected() {
        assert_eq!(
            PayloadEncoding::parse("ROT13"),
            Err(CryptoError::UnsupportedEncoding("ROT13".into()))
        );
        assert_eq!(PayloadEncoding::parse("AESGCM_V1").unwrap(), PayloadEncoding::AesgcmV1);
    }
}
