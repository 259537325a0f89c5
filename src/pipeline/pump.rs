//! One read → transform → write loop shared by every transfer strategy.
//!
//! A [`ChunkSource`] yields chunks together with the progress units they
//! account for (bytes for streams, entries for pack containers). The
//! [`Transform`] is applied to each chunk and the result handed to a
//! [`ChunkSink`]. Sinks are consumed by [`pump`], which finalizes them.

use crate::cipher::{ChunkedReader, ChunkedWriter, CipherMethod, VaultCipher};
use crate::credentials::MasterKey;
use crate::error::IoContext;
use crate::pack::{PackReader, PackWriter};
use crate::Result;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub trait ChunkSource {
    /// Units the whole source accounts for
    fn total_units(&self) -> u64;

    /// Next chunk and its units, `None` once exhausted
    fn next_chunk(&mut self) -> Result<Option<(Vec<u8>, u64)>>;
}

pub trait ChunkSink {
    /// Called once, before the first chunk, with the source's total units
    fn begin(&mut self, total_units: u64) -> Result<()>;

    fn put(&mut self, chunk: &[u8]) -> Result<()>;

    fn finish(self) -> Result<()>;
}

/// What happens to each chunk in flight
pub enum Transform<'k> {
    Identity,
    /// Decrypt with `from`, encrypt with `to` using `method`
    Reencrypt {
        cipher: &'k dyn VaultCipher,
        from: &'k MasterKey,
        to: &'k MasterKey,
        method: CipherMethod,
    },
}

impl Transform<'_> {
    pub fn apply(&self, chunk: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Self::Identity => Ok(chunk),
            Self::Reencrypt {
                cipher,
                from,
                to,
                method,
            } => {
                let plain = Zeroizing::new(cipher.decrypt(&chunk, from.as_bytes())?);
                cipher.encrypt(&plain, *method, to.as_bytes())
            }
        }
    }
}

/// Move every chunk of `source` through `transform` into `sink`.
///
/// `on_progress(done, total)` runs after each chunk. Returns the units moved.
pub fn pump<S, K>(
    mut source: S,
    transform: &Transform<'_>,
    mut sink: K,
    on_progress: &mut dyn FnMut(u64, u64),
) -> Result<u64>
where
    S: ChunkSource,
    K: ChunkSink,
{
    let total = source.total_units();
    sink.begin(total)?;

    let mut done = 0u64;
    while let Some((chunk, units)) = source.next_chunk()? {
        let out = transform.apply(chunk)?;
        sink.put(&out)?;
        done += units;
        on_progress(done, total);
    }

    sink.finish()?;
    Ok(done)
}

/// Plain file read in fixed-size chunks
pub struct FileChunks {
    file: File,
    path: PathBuf,
    buffer_size: usize,
    len: u64,
}

impl FileChunks {
    pub fn open(path: &Path, buffer_size: usize) -> Result<Self> {
        let file = File::open(path).at(path)?;
        let len = file.metadata().at(path)?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            buffer_size: buffer_size.max(1),
            len,
        })
    }
}

impl ChunkSource for FileChunks {
    fn total_units(&self) -> u64 {
        self.len
    }

    fn next_chunk(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        let mut buf = vec![0u8; self.buffer_size];
        let n = loop {
            match self.file.read(&mut buf) {
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                other => break other.at(&self.path)?,
            }
        };
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some((buf, n as u64)))
    }
}

/// A whole file as a single chunk
pub struct WholeFile {
    content: Option<Vec<u8>>,
    len: u64,
}

impl WholeFile {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read(path).at(path)?;
        Ok(Self {
            len: content.len() as u64,
            content: Some(content),
        })
    }
}

impl ChunkSource for WholeFile {
    fn total_units(&self) -> u64 {
        self.len
    }

    fn next_chunk(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        Ok(self.content.take().map(|c| {
            let units = c.len() as u64;
            (c, units)
        }))
    }
}

/// Embedded files of a pack container, one per chunk
pub struct PackEntries {
    reader: PackReader,
    next: u64,
}

impl PackEntries {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            reader: PackReader::open(path)?,
            next: 0,
        })
    }
}

impl ChunkSource for PackEntries {
    fn total_units(&self) -> u64 {
        self.reader.file_count()
    }

    fn next_chunk(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        if self.next >= self.reader.file_count() {
            return Ok(None);
        }
        let content = self.reader.get_file(self.next)?;
        self.next += 1;
        Ok(Some((content, 1)))
    }
}

/// Decrypted plaintext of a chunked asset
pub struct ChunkedPlaintext<'a> {
    reader: ChunkedReader<'a>,
    buffer_size: usize,
}

impl<'a> ChunkedPlaintext<'a> {
    pub fn open(path: &Path, key: &MasterKey, cipher: &'a dyn VaultCipher, buffer_size: usize) -> Result<Self> {
        Ok(Self {
            reader: ChunkedReader::open(path, key.as_bytes(), cipher)?,
            buffer_size: buffer_size.max(1),
        })
    }
}

impl ChunkSource for ChunkedPlaintext<'_> {
    fn total_units(&self) -> u64 {
        self.reader.plaintext_size()
    }

    fn next_chunk(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        let mut buf = vec![0u8; self.buffer_size];
        let n = self.reader.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some((buf, n as u64)))
    }
}

/// Plain file written chunk after chunk
pub struct FileSink {
    file: File,
    path: PathBuf,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            file: File::create(path).at(path)?,
            path: path.to_path_buf(),
        })
    }
}

impl ChunkSink for FileSink {
    fn begin(&mut self, _total_units: u64) -> Result<()> {
        Ok(())
    }

    fn put(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).at(&self.path)
    }

    fn finish(self) -> Result<()> {
        self.file.sync_all().at(&self.path)
    }
}

/// New pack container with one entry per chunk
pub struct PackSink {
    writer: PackWriter,
}

impl PackSink {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(Self {
            writer: PackWriter::create(path)?,
        })
    }
}

impl ChunkSink for PackSink {
    fn begin(&mut self, total_units: u64) -> Result<()> {
        self.writer.initialize(total_units)
    }

    fn put(&mut self, chunk: &[u8]) -> Result<()> {
        self.writer.put_file(chunk)
    }

    fn finish(self) -> Result<()> {
        self.writer.finish()
    }
}

/// Chunked asset encrypted under `key`
pub struct ChunkedSink<'a> {
    writer: ChunkedWriter<'a>,
    key: &'a MasterKey,
}

impl<'a> ChunkedSink<'a> {
    pub fn create(path: &Path, key: &'a MasterKey, cipher: &'a dyn VaultCipher) -> Result<Self> {
        Ok(Self {
            writer: ChunkedWriter::create(path, cipher)?,
            key,
        })
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.writer = self.writer.with_block_size(block_size);
        self
    }
}

impl ChunkSink for ChunkedSink<'_> {
    fn begin(&mut self, total_units: u64) -> Result<()> {
        self.writer.initialize(total_units, self.key.as_bytes())
    }

    fn put(&mut self, chunk: &[u8]) -> Result<()> {
        self.writer.write(chunk)
    }

    fn finish(self) -> Result<()> {
        self.writer.finish()
    }
}
