//! OpenSSL "traditional" PEM encryption (`Proc-Type: 4,ENCRYPTED`).
//!
//! The key is derived with `EVP_BytesToKey` (MD5, one iteration) using the
//! first 8 bytes of the IV as salt; the body is CBC with PKCS#7 padding.

use crate::error::TlsError;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockCipher, BlockDecryptMut, KeyInit, KeyIvInit};
use md5::{Digest, Md5};

const PROC_TYPE_ENCRYPTED: &str = "4,ENCRYPTED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cipher {
    DesCbc,
    DesEde3Cbc,
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
}

impl Cipher {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "DES-CBC" => Some(Cipher::DesCbc),
            "DES-EDE3-CBC" => Some(Cipher::DesEde3Cbc),
            "AES-128-CBC" => Some(Cipher::Aes128Cbc),
            "AES-192-CBC" => Some(Cipher::Aes192Cbc),
            "AES-256-CBC" => Some(Cipher::Aes256Cbc),
            _ => None,
        }
    }

    fn key_len(self) -> usize {
        match self {
            Cipher::DesCbc => 8,
            Cipher::DesEde3Cbc => 24,
            Cipher::Aes128Cbc => 16,
            Cipher::Aes192Cbc => 24,
            Cipher::Aes256Cbc => 32,
        }
    }

    fn block_size(self) -> usize {
        match self {
            Cipher::DesCbc | Cipher::DesEde3Cbc => 8,
            _ => 16,
        }
    }

    fn decrypt(self, key: &[u8], iv: &[u8], data: &[u8]) -> Option<Vec<u8>> {
        match self {
            Cipher::DesCbc => cbc_decrypt::<des::Des>(key, iv, data),
            Cipher::DesEde3Cbc => cbc_decrypt::<des::TdesEde3>(key, iv, data),
            Cipher::Aes128Cbc => cbc_decrypt::<aes::Aes128>(key, iv, data),
            Cipher::Aes192Cbc => cbc_decrypt::<aes::Aes192>(key, iv, data),
            Cipher::Aes256Cbc => cbc_decrypt::<aes::Aes256>(key, iv, data),
        }
    }
}

fn cbc_decrypt<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Option<Vec<u8>>
where
    C: BlockDecryptMut + BlockCipher + KeyInit,
{
    cbc::Decryptor::<C>::new_from_slices(key, iv)
        .ok()?
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .ok()
}

/// Whether the block carries the legacy encryption headers.
pub(crate) fn is_encrypted(block: &pem::Pem) -> bool {
    block
        .headers()
        .get("Proc-Type")
        .is_some_and(|v| v.trim() == PROC_TYPE_ENCRYPTED)
}

/// Decrypt a legacy-encrypted PEM block.
///
/// Returns [`TlsError::IncorrectPassword`] when the padding is invalid; the
/// caller must still check the plaintext parses as a key, since a wrong
/// password yields valid padding about once in 256 attempts.
pub(crate) fn decrypt(block: &pem::Pem, password: &[u8]) -> Result<Vec<u8>, TlsError> {
    let dek_info = block
        .headers()
        .get("DEK-Info")
        .ok_or_else(|| TlsError::LegacyPem("no DEK-Info header in block".to_string()))?;

    let (name, iv_hex) = dek_info
        .split_once(',')
        .ok_or_else(|| TlsError::LegacyPem("malformed DEK-Info header".to_string()))?;

    let cipher = Cipher::from_name(name.trim())
        .ok_or_else(|| TlsError::UnsupportedCipher(name.trim().to_string()))?;

    let iv = hex::decode(iv_hex.trim())
        .map_err(|_| TlsError::LegacyPem("malformed DEK-Info IV".to_string()))?;
    if iv.len() != cipher.block_size() {
        return Err(TlsError::LegacyPem("incorrect IV size".to_string()));
    }

    let data = block.contents();
    if data.len() % cipher.block_size() != 0 {
        return Err(TlsError::LegacyPem(
            "encrypted PEM data is not a multiple of the block size".to_string(),
        ));
    }

    let key = derive_key(password, &iv[..8], cipher.key_len());

    cipher
        .decrypt(&key, &iv, data)
        .ok_or(TlsError::IncorrectPassword)
}

/// OpenSSL `EVP_BytesToKey` with MD5 and a single iteration.
fn derive_key(password: &[u8], salt: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        hasher.update(salt);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_len);
    key
}
