//! Chunked encryption for large assets.
//!
//! Layout (integers big-endian):
//!
//! ```text
//! [plaintext size: u64][block size: u64]
//! [block table: N x (offset: u64, length: u64)]
//! [encrypted blocks]
//! ```
//!
//! `N = ceil(size / block size)`. Each block is encrypted on its own with
//! [`CipherMethod::Compressed`], so neither side ever holds more than one
//! block of the asset in memory.

use super::{CipherMethod, VaultCipher};
use crate::error::IoContext;
use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Default plaintext block size (5 MiB)
pub const DEFAULT_BLOCK_SIZE: u64 = 5 * 1024 * 1024;
/// Largest block size either side accepts
pub const MAX_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

const HEADER_SIZE: u64 = 16;
const ENTRY_SIZE: u64 = 16;

fn block_count(size: u64, block_size: u64) -> u64 {
    size / block_size + u64::from(size % block_size != 0)
}

/// Offset of the first encrypted block
fn body_start(blocks: u64) -> Option<u64> {
    blocks.checked_mul(ENTRY_SIZE)?.checked_add(HEADER_SIZE)
}

struct WriteState {
    key: Zeroizing<Vec<u8>>,
    plaintext_size: u64,
    block_count: u64,
    next_block: u64,
    cursor: u64,
    accepted: u64,
}

/// Encrypting writer. `initialize` must run once before any `write`.
pub struct ChunkedWriter<'a> {
    file: File,
    path: PathBuf,
    cipher: &'a dyn VaultCipher,
    block_size: u64,
    buf: Vec<u8>,
    state: Option<WriteState>,
}

impl<'a> ChunkedWriter<'a> {
    pub fn create(path: &Path, cipher: &'a dyn VaultCipher) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .at(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            cipher,
            block_size: DEFAULT_BLOCK_SIZE,
            buf: Vec::new(),
            state: None,
        })
    }

    /// Override the plaintext block size; only meaningful before `initialize`
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn initialize(&mut self, plaintext_size: u64, key: &[u8]) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::invalid_format("chunked stream initialized twice"));
        }
        if self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::invalid_format(format!(
                "block size {} exceeds {}",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }

        let blocks = block_count(plaintext_size, self.block_size);
        let body_start = body_start(blocks).ok_or_else(|| Error::invalid_format("asset too large"))?;

        self.file.set_len(body_start).at(&self.path)?;
        self.file.seek(SeekFrom::Start(0)).at(&self.path)?;
        let mut header = [0u8; HEADER_SIZE as usize];
        header[..8].copy_from_slice(&plaintext_size.to_be_bytes());
        header[8..].copy_from_slice(&self.block_size.to_be_bytes());
        self.file.write_all(&header).at(&self.path)?;

        self.state = Some(WriteState {
            key: Zeroizing::new(key.to_vec()),
            plaintext_size,
            block_count: blocks,
            next_block: 0,
            cursor: body_start,
            accepted: 0,
        });
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Error::invalid_format("chunked stream written before initialize"))?;

        if state.accepted + data.len() as u64 > state.plaintext_size {
            return Err(Error::invalid_format("write exceeds the declared asset size"));
        }
        state.accepted += data.len() as u64;
        self.buf.extend_from_slice(data);

        let block_size = self.block_size as usize;
        while self.buf.len() >= block_size {
            let rest = self.buf.split_off(block_size);
            let block = std::mem::replace(&mut self.buf, rest);
            self.put_block(&block)?;
        }
        Ok(())
    }

    /// Flush the trailing partial block and sync
    pub fn finish(mut self) -> Result<()> {
        if !self.buf.is_empty() {
            let block = std::mem::take(&mut self.buf);
            self.put_block(&block)?;
        }

        let state = self
            .state
            .as_ref()
            .ok_or_else(|| Error::invalid_format("chunked stream closed before initialize"))?;
        if state.next_block != state.block_count {
            return Err(Error::invalid_format(format!(
                "asset declared {} bytes but only {} were written",
                state.plaintext_size, state.accepted
            )));
        }

        self.file.sync_all().at(&self.path)
    }

    fn put_block(&mut self, block: &[u8]) -> Result<()> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Error::invalid_format("chunked stream written before initialize"))?;
        if state.next_block >= state.block_count {
            return Err(Error::invalid_format("write exceeds the declared asset size"));
        }

        let sealed = self
            .cipher
            .encrypt(block, CipherMethod::Compressed, &state.key)?;

        let mut entry = [0u8; ENTRY_SIZE as usize];
        entry[..8].copy_from_slice(&state.cursor.to_be_bytes());
        entry[8..].copy_from_slice(&(sealed.len() as u64).to_be_bytes());

        self.file
            .seek(SeekFrom::Start(HEADER_SIZE + state.next_block * ENTRY_SIZE))
            .at(&self.path)?;
        self.file.write_all(&entry).at(&self.path)?;
        self.file.seek(SeekFrom::Start(state.cursor)).at(&self.path)?;
        self.file.write_all(&sealed).at(&self.path)?;

        state.next_block += 1;
        state.cursor += sealed.len() as u64;
        Ok(())
    }
}

/// Decrypting reader bound to one key
pub struct ChunkedReader<'a> {
    file: File,
    path: PathBuf,
    cipher: &'a dyn VaultCipher,
    key: Zeroizing<Vec<u8>>,
    plaintext_size: u64,
    block_size: u64,
    block_count: u64,
    body_start: u64,
    file_len: u64,
    position: u64,
    current: Option<(u64, Zeroizing<Vec<u8>>)>,
}

impl<'a> ChunkedReader<'a> {
    pub fn open(path: &Path, key: &[u8], cipher: &'a dyn VaultCipher) -> Result<Self> {
        let mut file = File::open(path).at(path)?;
        let file_len = file.metadata().at(path)?.len();

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header).at(path)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&header[..8]);
        let plaintext_size = u64::from_be_bytes(word);
        word.copy_from_slice(&header[8..]);
        let block_size = u64::from_be_bytes(word);

        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            return Err(Error::invalid_format(format!(
                "{} has an invalid block size {}",
                path.display(),
                block_size
            )));
        }

        let blocks = block_count(plaintext_size, block_size);
        let body_start = match body_start(blocks) {
            Some(start) if start <= file_len => start,
            _ => {
                return Err(Error::invalid_format(format!(
                    "{} block table exceeds the file size",
                    path.display()
                )))
            }
        };

        Ok(Self {
            file,
            path: path.to_path_buf(),
            cipher,
            key: Zeroizing::new(key.to_vec()),
            plaintext_size,
            block_size,
            block_count: blocks,
            body_start,
            file_len,
            position: 0,
            current: None,
        })
    }

    pub fn plaintext_size(&self) -> u64 {
        self.plaintext_size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Fill `buf` with plaintext. Returns 0 at the end of the asset.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;

        while filled < buf.len() && self.position < self.plaintext_size {
            let index = self.position / self.block_size;
            let offset = (self.position % self.block_size) as usize;

            let loaded = matches!(&self.current, Some((i, _)) if *i == index);
            if !loaded {
                let block = self.fetch_block(index)?;
                self.current = Some((index, block));
            }
            let block = match &self.current {
                Some((_, block)) => block,
                None => return Err(Error::invalid_format("block cache empty after fetch")),
            };

            if offset >= block.len() {
                return Err(Error::invalid_format(format!(
                    "{} block {} is shorter than declared",
                    self.path.display(),
                    index
                )));
            }

            let count = (block.len() - offset).min(buf.len() - filled);
            buf[filled..filled + count].copy_from_slice(&block[offset..offset + count]);
            filled += count;
            self.position += count as u64;
        }

        Ok(filled)
    }

    fn fetch_block(&mut self, index: u64) -> Result<Zeroizing<Vec<u8>>> {
        if index >= self.block_count {
            return Err(Error::invalid_format("block index out of bounds"));
        }

        let mut entry = [0u8; ENTRY_SIZE as usize];
        self.file
            .seek(SeekFrom::Start(HEADER_SIZE + index * ENTRY_SIZE))
            .at(&self.path)?;
        self.file.read_exact(&mut entry).at(&self.path)?;

        let mut word = [0u8; 8];
        word.copy_from_slice(&entry[..8]);
        let offset = u64::from_be_bytes(word);
        word.copy_from_slice(&entry[8..]);
        let length = u64::from_be_bytes(word);

        let in_body = offset >= self.body_start
            && offset.checked_add(length).map_or(false, |end| end <= self.file_len);
        if !in_body || length > self.block_size.saturating_mul(2).saturating_add(1024) {
            return Err(Error::invalid_format(format!(
                "{} block {} lies outside the file or has an implausible length",
                self.path.display(),
                index
            )));
        }

        let mut sealed = vec![0u8; length as usize];
        self.file.seek(SeekFrom::Start(offset)).at(&self.path)?;
        self.file.read_exact(&mut sealed).at(&self.path)?;

        Ok(Zeroizing::new(self.cipher.decrypt(&sealed, &self.key)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{random_key, XChaChaCipher};
    use std::fs;
    use tempfile::TempDir;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn write_asset(path: &Path, data: &[u8], key: &[u8], block_size: u64) -> Result<()> {
        let mut writer = ChunkedWriter::create(path, &XChaChaCipher)?.with_block_size(block_size);
        writer.initialize(data.len() as u64, key)?;
        for piece in data.chunks(7) {
            writer.write(piece)?;
        }
        writer.finish()
    }

    fn read_all(reader: &mut ChunkedReader<'_>, step: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; step];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn test_multi_block_round_trip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("s_video.pma");
        let key = random_key();
        let data = sample(1000);

        write_asset(&path, &data, &key, 64)?;

        let mut reader = ChunkedReader::open(&path, &key, &XChaChaCipher)?;
        assert_eq!(reader.plaintext_size(), 1000);
        assert_eq!(read_all(&mut reader, 100)?, data);
        assert_eq!(reader.position(), 1000);
        Ok(())
    }

    #[test]
    fn test_empty_asset() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("empty.pma");
        let key = random_key();
        write_asset(&path, &[], &key, 64)?;

        assert_eq!(fs::metadata(&path)?.len(), 16);
        let mut reader = ChunkedReader::open(&path, &key, &XChaChaCipher)?;
        assert!(read_all(&mut reader, 8)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_write_before_initialize_fails() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut writer = ChunkedWriter::create(&temp_dir.path().join("a.pma"), &XChaChaCipher)?;
        assert!(writer.write(b"data").is_err());
        Ok(())
    }

    #[test]
    fn test_overflow_and_underflow_are_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let key = random_key();

        let mut writer = ChunkedWriter::create(&temp_dir.path().join("a.pma"), &XChaChaCipher)?;
        writer.initialize(4, &key)?;
        assert!(writer.write(b"12345").is_err());

        let mut writer = ChunkedWriter::create(&temp_dir.path().join("b.pma"), &XChaChaCipher)?;
        writer.initialize(10, &key)?;
        writer.write(b"123")?;
        assert!(writer.finish().is_err());
        Ok(())
    }

    #[test]
    fn test_wrong_key_fails_on_first_block() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("a.pma");
        write_asset(&path, &sample(200), &random_key(), 64)?;

        let mut reader = ChunkedReader::open(&path, &random_key(), &XChaChaCipher)?;
        let mut buf = [0u8; 32];
        assert!(matches!(reader.read(&mut buf), Err(Error::InvalidFormat { .. })));
        Ok(())
    }

    fn forged_asset(path: &Path, plaintext_size: u64, block_size: u64, entries: &[(u64, u64)], body: usize) -> Result<()> {
        let mut raw = plaintext_size.to_be_bytes().to_vec();
        raw.extend_from_slice(&block_size.to_be_bytes());
        for (offset, length) in entries {
            raw.extend_from_slice(&offset.to_be_bytes());
            raw.extend_from_slice(&length.to_be_bytes());
        }
        raw.resize(raw.len() + body, 0);
        fs::write(path, raw)?;
        Ok(())
    }

    #[test]
    fn test_forged_header_is_rejected_on_open() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("forged.pma");
        let key = random_key();

        forged_asset(&path, 1 << 62, 1 << 62, &[(32, 1 << 62)], 0)?;
        assert!(matches!(
            ChunkedReader::open(&path, &key, &XChaChaCipher),
            Err(Error::InvalidFormat { .. })
        ));

        // a table of 2^34 entries cannot fit in a 48-byte file
        forged_asset(&path, 1 << 40, 64, &[(32, 16)], 16)?;
        assert!(matches!(
            ChunkedReader::open(&path, &key, &XChaChaCipher),
            Err(Error::InvalidFormat { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_forged_block_entry_is_rejected() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("forged.pma");
        let key = random_key();
        let mut buf = [0u8; 16];

        for entry in [(32, 1u64 << 62), (32, 100), (u64::MAX - 4, 64), (0, 16)] {
            forged_asset(&path, 64, 64, &[entry], 40)?;
            let mut reader = ChunkedReader::open(&path, &key, &XChaChaCipher)?;
            assert!(
                matches!(reader.read(&mut buf), Err(Error::InvalidFormat { .. })),
                "entry {:?} was accepted",
                entry
            );
        }
        Ok(())
    }

    #[test]
    fn test_oversized_block_size_is_refused_by_writer() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut writer = ChunkedWriter::create(&temp_dir.path().join("a.pma"), &XChaChaCipher)?
            .with_block_size(MAX_BLOCK_SIZE + 1);
        assert!(writer.initialize(10, &random_key()).is_err());
        Ok(())
    }
}
