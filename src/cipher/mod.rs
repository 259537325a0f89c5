//! Whole-buffer encryption of vault records.
//!
//! Encrypted buffers are framed as:
//!
//! ```text
//! [method: u16 BE][payload length: u32 BE][nonce: 24 bytes][ciphertext + tag]
//! ```
//!
//! where the payload is the plaintext (`Flat`) or its zlib stream
//! (`Compressed`). The method and length fields are authenticated as
//! associated data. An empty buffer stands for an empty record in both
//! directions.

pub mod stream;

pub use stream::{ChunkedReader, ChunkedWriter, DEFAULT_BLOCK_SIZE};

use crate::{Error, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::{Read, Write};

/// Size of every vault key, in bytes
pub const KEY_SIZE: usize = 32;

const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;
const AAD_SIZE: usize = 2 + 4;
const FRAME_HEADER: usize = AAD_SIZE + NONCE_SIZE;

/// How a record is transformed before encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMethod {
    /// zlib, then encrypt
    Compressed = 1,
    /// encrypt only
    Flat = 2,
}

impl CipherMethod {
    pub fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(Self::Compressed),
            2 => Some(Self::Flat),
            _ => None,
        }
    }
}

/// Whole-buffer encrypt/decrypt primitive the pipeline and credentials are built on
pub trait VaultCipher {
    fn encrypt(&self, data: &[u8], method: CipherMethod, key: &[u8]) -> Result<Vec<u8>>;

    /// Fails with `InvalidFormat` when `data` is not a valid frame for `key`
    fn decrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>>;
}

/// XChaCha20-Poly1305 with optional zlib compression
#[derive(Debug, Clone, Copy, Default)]
pub struct XChaChaCipher;

impl XChaChaCipher {
    fn aead(key: &[u8]) -> Result<XChaCha20Poly1305> {
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| Error::InvalidKey {
            reason: format!("expected a {} byte key, got {}", KEY_SIZE, key.len()),
        })
    }
}

impl VaultCipher for XChaChaCipher {
    fn encrypt(&self, data: &[u8], method: CipherMethod, key: &[u8]) -> Result<Vec<u8>> {
        let aead = Self::aead(key)?;
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let payload = match method {
            CipherMethod::Compressed => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()?
            }
            CipherMethod::Flat => data.to_vec(),
        };

        let length = u32::try_from(payload.len())
            .map_err(|_| Error::invalid_format("record too large to encrypt"))?;

        let mut aad = [0u8; AAD_SIZE];
        aad[..2].copy_from_slice(&method.tag().to_be_bytes());
        aad[2..].copy_from_slice(&length.to_be_bytes());

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = aead
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: payload.as_slice(),
                    aad: &aad,
                },
            )
            .map_err(|_| Error::invalid_format("encryption failed"))?;

        let mut out = Vec::with_capacity(FRAME_HEADER + ciphertext.len());
        out.extend_from_slice(&aad);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let aead = Self::aead(key)?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if data.len() < FRAME_HEADER + TAG_SIZE {
            return Err(Error::invalid_format("encrypted buffer is too short"));
        }

        let method = CipherMethod::from_tag(u16::from_be_bytes([data[0], data[1]]))
            .ok_or_else(|| Error::invalid_format("unknown encryption method"))?;
        let length = u32::from_be_bytes([data[2], data[3], data[4], data[5]]) as usize;
        let nonce = XNonce::from_slice(&data[AAD_SIZE..FRAME_HEADER]);

        let payload = aead
            .decrypt(
                nonce,
                Payload {
                    msg: &data[FRAME_HEADER..],
                    aad: &data[..AAD_SIZE],
                },
            )
            .map_err(|_| Error::invalid_format("authentication failed, wrong key or corrupted data"))?;

        if payload.len() != length {
            return Err(Error::invalid_format("payload length mismatch"));
        }

        match method {
            CipherMethod::Flat => Ok(payload),
            CipherMethod::Compressed => {
                let mut plain = Vec::new();
                ZlibDecoder::new(payload.as_slice())
                    .read_to_end(&mut plain)
                    .map_err(|e| Error::invalid_format(format!("decompression failed: {}", e)))?;
                Ok(plain)
            }
        }
    }
}

/// Generate a random 256-bit key
pub fn random_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}
