// Segment decryption: AES-128-CBC with PKCS#7 padding, plus IV derivation.

use std::sync::Arc;

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};

use crate::config::IvDerivation;
use crate::error::DownloadError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// A block cipher able to decrypt one whole segment body.
pub trait SegmentCipher: Send + Sync {
    fn decrypt(&self, data: Bytes, key: &[u8; 16], iv: &[u8; 16]) -> Result<Bytes, DownloadError>;
}

/// AES-128 in CBC mode with PKCS#7 padding removal.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aes128Cbc;

impl SegmentCipher for Aes128Cbc {
    fn decrypt(&self, data: Bytes, key: &[u8; 16], iv: &[u8; 16]) -> Result<Bytes, DownloadError> {
        let mut buffer = data.to_vec();

        let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
            DownloadError::decryption(format!("failed to initialize AES decryptor: {e}"))
        })?;

        let decrypted_len = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|e| DownloadError::decryption(format!("decryption failed: {e}")))?
            .len();

        buffer.truncate(decrypted_len);
        Ok(Bytes::from(buffer))
    }
}

/// Decrypt on the blocking pool so large segments do not stall the runtime.
pub async fn decrypt_offloaded(
    cipher: Arc<dyn SegmentCipher>,
    data: Bytes,
    key: [u8; 16],
    iv: [u8; 16],
) -> Result<Bytes, DownloadError> {
    tokio::task::spawn_blocking(move || cipher.decrypt(data, &key, &iv))
        .await
        .map_err(|e| DownloadError::internal(format!("decryption task failed: {e}")))?
}

/// The IV for a segment: the explicit one when present, otherwise derived.
pub fn derive_iv(explicit: Option<[u8; 16]>, derivation: IvDerivation, sequence: u64) -> [u8; 16] {
    if let Some(iv) = explicit {
        return iv;
    }
    match derivation {
        IvDerivation::MediaSequence => u64_to_iv_bytes(sequence),
        IvDerivation::Zero => [0u8; 16],
    }
}

/// Big-endian sequence number in the low 8 bytes of a zeroed 16-byte block.
fn u64_to_iv_bytes(val: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&val.to_be_bytes());
    iv
}


#[cfg(test)]
mod tests {
    use super::*;

    // NIST SP 800-38A, F.2.1 CBC-AES128.Encrypt, first block
    const NIST_KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];
    const NIST_IV: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];
    const NIST_PLAIN: [u8; 16] = [
        0x6b, 0xc1, 0xbe, 0xe2, 0x2e, 0x40, 0x9f, 0x96, 0xe9, 0x3d, 0x7e, 0x11, 0x73, 0x93, 0x17,
        0x2a,
    ];
    const NIST_CIPHER: [u8; 16] = [
        0x76, 0x49, 0xab, 0xac, 0x81, 0x19, 0xb2, 0x46, 0xce, 0xe9, 0x8e, 0x9b, 0x12, 0xe9, 0x19,
        0x7d,
    ];

    #[test]
    fn matches_known_vector_and_strips_padding() {
        let encrypted = testing::encrypt(&NIST_PLAIN, &NIST_KEY, &NIST_IV);
        assert_eq!(encrypted.len(), 32);
        assert_eq!(&encrypted[..16], &NIST_CIPHER);

        let plain = Aes128Cbc
            .decrypt(Bytes::from(encrypted), &NIST_KEY, &NIST_IV)
            .unwrap();
        assert_eq!(plain.as_ref(), &NIST_PLAIN);
    }

    #[test]
    fn truncated_ciphertext_is_a_decryption_error() {
        let mut encrypted = testing::encrypt(b"some transport stream", &NIST_KEY, &NIST_IV);
        encrypted.truncate(encrypted.len() - 1);

        let err = Aes128Cbc
            .decrypt(Bytes::from(encrypted), &NIST_KEY, &NIST_IV)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Decryption);
    }

    #[test]
    fn wrong_key_does_not_yield_plaintext() {
        let plain = b"0123456789abcdef0123456789abcdef-tail";
        let encrypted = testing::encrypt(plain, &NIST_KEY, &NIST_IV);

        let result = Aes128Cbc.decrypt(Bytes::from(encrypted), &[0x11; 16], &NIST_IV);
        assert!(result.map_or(true, |bytes| bytes.as_ref() != plain));
    }

    #[test]
    fn iv_derived_from_media_sequence() {
        let iv = derive_iv(None, IvDerivation::MediaSequence, 0x0102);
        assert_eq!(iv[..14], [0u8; 14]);
        assert_eq!(iv[14..], [0x01, 0x02]);
    }

    #[test]
    fn explicit_iv_wins_over_derivation() {
        assert_eq!(derive_iv(Some([7; 16]), IvDerivation::MediaSequence, 9), [7; 16]);
        assert_eq!(derive_iv(None, IvDerivation::Zero, 9), [0; 16]);
    }

    #[tokio::test]
    async fn offloaded_decryption_matches_inline() {
        let encrypted = Bytes::from(testing::encrypt(b"offloaded", &NIST_KEY, &NIST_IV));
        let cipher: Arc<dyn SegmentCipher> = Arc::new(Aes128Cbc);

        let plain = decrypt_offloaded(cipher, encrypted, NIST_KEY, NIST_IV)
            .await
            .unwrap();
        assert_eq!(plain.as_ref(), b"offloaded");
    }
}
