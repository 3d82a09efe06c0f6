//! Payload decryption for the two delivery paths.
//!
//! - **Master path** (end-to-end encrypted files): AES-256-IGE applied as a
//!   running transform. The IV evolves with every block, so chunks must be fed
//!   strictly in increasing offset order. [`DecryptionState`] owns that cursor.
//! - **CDN path**: AES-256-CTR where each chunk derives its own counter block
//!   from its offset, so chunks decrypt independently and in any order.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes256;
use bytes::{Bytes, BytesMut};
use ctr::cipher::{KeyIvInit, StreamCipher};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::CryptoError;

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Key material for an end-to-end encrypted file.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretFileEncryptionKey {
    /// AES-256 key.
    pub aes_key: [u8; 32],
    /// IGE IV: previous-ciphertext half followed by previous-plaintext half.
    pub aes_iv: [u8; 32],
}

impl std::fmt::Debug for SecretFileEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretFileEncryptionKey(..)")
    }
}

struct RunningCipher {
    cipher: Aes256,
    iv: [u8; 32],
}

/// Running decryption state for master-path chunks.
///
/// Without a key the transform is the identity and ordering does not matter.
pub struct DecryptionState {
    running: Option<RunningCipher>,
    decrypted_size: Option<u64>,
    current_size: u64,
}

impl DecryptionState {
    /// Create the state for a fetch.
    pub fn new(key: Option<&SecretFileEncryptionKey>, decrypted_size: Option<u64>) -> Self {
        let running = key.map(|key| RunningCipher {
            cipher: Aes256::new(GenericArray::from_slice(&key.aes_key)),
            iv: key.aes_iv,
        });
        Self {
            running,
            decrypted_size,
            current_size: 0,
        }
    }

    /// Returns true if released chunks are decrypted.
    pub fn is_encrypted(&self) -> bool {
        self.running.is_some()
    }

    /// Size the consumer should see once the fetch is complete, if overridden.
    pub fn decrypted_size(&self) -> Option<u64> {
        self.decrypted_size
    }

    /// Bytes released through the transform so far.
    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    /// Apply the running transform to the chunk released at `offset`.
    pub fn transform(&mut self, offset: u64, data: Bytes) -> Bytes {
        let Some(running) = self.running.as_mut() else {
            return data;
        };

        if offset != self.current_size {
            warn!(
                offset,
                expected = self.current_size,
                "Encrypted chunk released out of order"
            );
        }

        let whole_blocks = data.len() - data.len() % AES_BLOCK_SIZE;
        if whole_blocks != data.len() {
            warn!(offset, len = data.len(), "Dropping partial trailing AES block");
        }

        let mut buffer = BytesMut::from(&data[..whole_blocks]);
        ige_decrypt_in_place(&running.cipher, &mut running.iv, &mut buffer);

        if let Some(decrypted_size) = self.decrypted_size {
            let remaining = decrypted_size.saturating_sub(self.current_size);
            if (buffer.len() as u64) > remaining {
                buffer.truncate(remaining as usize);
            }
        }
        self.current_size += buffer.len() as u64;

        buffer.freeze()
    }
}

/// AES-256-IGE decryption of whole blocks, updating `iv` for the next call.
fn ige_decrypt_in_place(cipher: &Aes256, iv: &mut [u8; 32], data: &mut [u8]) {
    let mut prev_cipher = [0u8; AES_BLOCK_SIZE];
    let mut prev_plain = [0u8; AES_BLOCK_SIZE];
    prev_cipher.copy_from_slice(&iv[..AES_BLOCK_SIZE]);
    prev_plain.copy_from_slice(&iv[AES_BLOCK_SIZE..]);

    for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        let mut current_cipher = [0u8; AES_BLOCK_SIZE];
        current_cipher.copy_from_slice(chunk);

        let mut block: aes::Block = GenericArray::clone_from_slice(chunk);
        for (b, p) in block.iter_mut().zip(prev_plain.iter()) {
            *b ^= p;
        }
        cipher.decrypt_block(&mut block);
        for ((out, b), c) in chunk.iter_mut().zip(block.iter()).zip(prev_cipher.iter()) {
            *out = b ^ c;
        }

        prev_cipher = current_cipher;
        prev_plain.copy_from_slice(chunk);
    }

    iv[..AES_BLOCK_SIZE].copy_from_slice(&prev_cipher);
    iv[AES_BLOCK_SIZE..].copy_from_slice(&prev_plain);
}

/// Decrypt a CDN chunk received for `offset`.
///
/// The low four bytes of `iv` are replaced by `offset / 16` in big-endian
/// order before the keystream is applied.
pub fn cdn_decrypt(key: &[u8], iv: &[u8], offset: u64, data: &[u8]) -> Result<Bytes, CryptoError> {
    if key.len() != 32 {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }
    if iv.len() != AES_BLOCK_SIZE {
        return Err(CryptoError::InvalidIvLength(iv.len()));
    }

    let mut part_iv = [0u8; AES_BLOCK_SIZE];
    part_iv.copy_from_slice(iv);
    let counter = (offset / AES_BLOCK_SIZE as u64) as u32;
    part_iv[AES_BLOCK_SIZE - 4..].copy_from_slice(&counter.to_be_bytes());

    let mut cipher = Aes256Ctr::new_from_slices(key, &part_iv)
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    let mut buffer = BytesMut::from(data);
    cipher.apply_keystream(&mut buffer);
    Ok(buffer.freeze())
}

/// SHA-256 of a hash segment.
pub fn segment_hash(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
