//! Multi-file pack container.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! [file count N: u64]
//! [directory: N x (offset: u64, length: u64)]
//! [body: file contents, concatenated in write order]
//! ```
//!
//! Directory entry `i` exactly bounds embedded file `i`. Files are appended
//! sequentially, so the total size is `8 + 16 * N + sum(lengths)`.

use crate::error::IoContext;
use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_SIZE: u64 = 8;
const ENTRY_SIZE: u64 = 16;

/// Size of header plus directory for `count` files
pub fn directory_end(count: u64) -> Result<u64> {
    count
        .checked_mul(ENTRY_SIZE)
        .and_then(|d| d.checked_add(HEADER_SIZE))
        .ok_or_else(|| Error::invalid_format(format!("pack file count {} is too large", count)))
}

/// Sequential writer. `initialize` once, then `put_file` exactly N times in order.
#[derive(Debug)]
pub struct PackWriter {
    file: File,
    path: PathBuf,
    file_count: u64,
    next_index: u64,
    cursor: u64,
}

impl PackWriter {
    /// Create (or truncate) a pack file
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .at(path)?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            file_count: 0,
            next_index: 0,
            cursor: 0,
        })
    }

    /// Size the file for `file_count` entries with a zeroed directory
    pub fn initialize(&mut self, file_count: u64) -> Result<()> {
        let body_start = directory_end(file_count)?;

        self.file.set_len(body_start).at(&self.path)?;
        self.file.seek(SeekFrom::Start(0)).at(&self.path)?;
        self.file.write_all(&file_count.to_be_bytes()).at(&self.path)?;

        self.file_count = file_count;
        self.next_index = 0;
        self.cursor = body_start;
        Ok(())
    }

    /// Record the next directory entry and append `content` to the body
    pub fn put_file(&mut self, content: &[u8]) -> Result<()> {
        if self.next_index >= self.file_count {
            return Err(Error::invalid_format(format!(
                "pack {} already holds its {} declared files",
                self.path.display(),
                self.file_count
            )));
        }

        let length = content.len() as u64;
        let mut entry = [0u8; ENTRY_SIZE as usize];
        entry[..8].copy_from_slice(&self.cursor.to_be_bytes());
        entry[8..].copy_from_slice(&length.to_be_bytes());

        self.file
            .seek(SeekFrom::Start(HEADER_SIZE + self.next_index * ENTRY_SIZE))
            .at(&self.path)?;
        self.file.write_all(&entry).at(&self.path)?;

        self.file.seek(SeekFrom::Start(self.cursor)).at(&self.path)?;
        self.file.write_all(content).at(&self.path)?;

        self.next_index += 1;
        self.cursor += length;
        Ok(())
    }

    pub fn file_count(&self) -> u64 {
        self.file_count
    }

    /// Flush to stable storage and close
    pub fn finish(self) -> Result<()> {
        if self.next_index != self.file_count {
            return Err(Error::invalid_format(format!(
                "pack {} declared {} files but {} were written",
                self.path.display(),
                self.file_count,
                self.next_index
            )));
        }
        self.file.sync_all().at(&self.path)
    }
}

/// Random-access reader
#[derive(Debug)]
pub struct PackReader {
    file: File,
    path: PathBuf,
    file_count: u64,
    file_len: u64,
}

impl PackReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).at(path)?;
        let file_len = file.metadata().at(path)?.len();

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header).at(path)?;
        let file_count = u64::from_be_bytes(header);

        if directory_end(file_count)? > file_len {
            return Err(Error::invalid_format(format!(
                "pack {} directory exceeds the file size",
                path.display()
            )));
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
            file_count,
            file_len,
        })
    }

    pub fn file_count(&self) -> u64 {
        self.file_count
    }

    /// Read embedded file `index` (0-based)
    pub fn get_file(&mut self, index: u64) -> Result<Vec<u8>> {
        if index >= self.file_count {
            return Err(Error::invalid_format(format!(
                "pack index {} out of bounds ({} files)",
                index, self.file_count
            )));
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

        match offset.checked_add(length) {
            Some(end) if end <= self.file_len => {}
            _ => {
                return Err(Error::invalid_format(format!(
                    "pack {} entry {} points outside the file",
                    self.path.display(),
                    index
                )))
            }
        }

        let mut data = vec![0u8; length as usize];
        self.file.seek(SeekFrom::Start(offset)).at(&self.path)?;
        self.file.read_exact(&mut data).at(&self.path)?;
        Ok(data)
    }
}
