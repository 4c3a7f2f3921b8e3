//! AES-128 in counter mode, position aware.
//!
//! Key material is 32 bytes, hex encoded: a 16-byte AES key followed by the
//! 16-byte initial counter block. The counter block is incremented as a
//! 128-bit big-endian integer, one step per 16-byte block of data.

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};

use crate::error::StoreError;

const BLOCK_SIZE: usize = 16;

/// Length of the raw key material (AES key + initial counter block).
pub const KEY_MATERIAL_LEN: usize = 32;

/// Generate fresh random key material, hex encoded.
pub fn generate_key() -> String {
    let material: [u8; KEY_MATERIAL_LEN] = rand::random();
    hex::encode(material)
}

/// Keystream generator that can start at any byte offset.
pub struct CtrCipher {
    cipher: Aes128,
    initial: u128,
    position: u64,
    block: [u8; BLOCK_SIZE],
    block_index: Option<u64>,
}

impl CtrCipher {
    /// Build a cipher from hex key material.
    pub fn new(key_hex: &str) -> Result<Self, StoreError> {
        let material = hex::decode(key_hex.trim())
            .map_err(|e| StoreError::crypto(format!("key is not hex: {e}")))?;
        if material.len() != KEY_MATERIAL_LEN {
            return Err(StoreError::crypto(format!(
                "key material must be {KEY_MATERIAL_LEN} bytes, got {}",
                material.len()
            )));
        }

        let (key, counter) = material.split_at(BLOCK_SIZE);
        let cipher = Aes128::new_from_slice(key)
            .map_err(|e| StoreError::crypto(format!("invalid AES key: {e}")))?;
        let mut initial = [0u8; BLOCK_SIZE];
        initial.copy_from_slice(counter);

        Ok(Self {
            cipher,
            initial: u128::from_be_bytes(initial),
            position: 0,
            block: [0u8; BLOCK_SIZE],
            block_index: None,
        })
    }

    /// XOR the keystream into `data` in place and advance the position.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            let index = self.position / BLOCK_SIZE as u64;
            if self.block_index != Some(index) {
                self.fill_block(index);
            }
            *byte ^= self.block[(self.position % BLOCK_SIZE as u64) as usize];
            self.position += 1;
        }
    }

    /// Move the keystream to an absolute byte offset.
    pub fn seek(&mut self, offset: u64) {
        self.position = offset;
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn fill_block(&mut self, index: u64) {
        let counter = self.initial.wrapping_add(u128::from(index));
        let mut block = GenericArray::from(counter.to_be_bytes());
        self.cipher.encrypt_block(&mut block);
        self.block.copy_from_slice(&block);
        self.block_index = Some(index);
    }
}
