//! Copy and re-encrypt pipeline.
//!
//! Every planned copy is written to a private temp file first and published
//! with an atomic rename. The transfer strategy is picked from the source
//! file name:
//!
//! | Source name              | Strategy                               |
//! |--------------------------|----------------------------------------|
//! | `*.pmv`                  | whole record, decrypt then encrypt     |
//! | `m_*.pma`                | pack container, entry by entry         |
//! | other `*.pma`            | chunked asset, streamed block by block |
//! | anything else            | verbatim byte copy                     |
//!
//! Plain backups always copy verbatim.

pub mod progress;
pub mod pump;

pub use progress::CopyProgress;
pub use pump::{pump, ChunkSink, ChunkSource, Transform};

use crate::atomic::{modified_millis, probe, write_atomically, FileState};
use crate::cipher::{CipherMethod, VaultCipher};
use crate::credentials::MasterKey;
use crate::error::IoContext;
use crate::planner::{BackupEntry, BackupWork, PlannedCopy};
use crate::{Error, Result};
use pump::{ChunkedPlaintext, ChunkedSink, FileChunks, FileSink, PackEntries, PackSink, WholeFile};
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use tracing::{debug, info, span, Level};

/// Extension of whole-buffer encrypted records
pub const FLAT_RECORD_EXTENSION: &str = ".pmv";
/// Extension of packed assets
pub const PACKED_ASSET_EXTENSION: &str = ".pma";
/// Name prefix marking a packed asset as a multi-file container
pub const MULTI_FILE_PREFIX: &str = "m_";

/// Source and destination keys of a re-encrypting run
#[derive(Clone, Copy)]
pub struct KeyPair<'k> {
    pub source: &'k MasterKey,
    pub destination: &'k MasterKey,
    pub cipher: &'k dyn VaultCipher,
}

#[derive(Clone, Copy)]
pub enum Mode<'k> {
    Plain,
    ReEncrypt(KeyPair<'k>),
}

impl Mode<'_> {
    pub fn is_re_encrypt(&self) -> bool {
        matches!(self, Self::ReEncrypt(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Verbatim,
    FlatRecord,
    PackContainer,
    ChunkedAsset,
}

impl Strategy {
    pub fn for_file_name(name: &str, re_encrypt: bool) -> Self {
        if !re_encrypt {
            Self::Verbatim
        } else if name.ends_with(FLAT_RECORD_EXTENSION) {
            Self::FlatRecord
        } else if name.ends_with(PACKED_ASSET_EXTENSION) {
            if name.starts_with(MULTI_FILE_PREFIX) {
                Self::PackContainer
            } else {
                Self::ChunkedAsset
            }
        } else {
            Self::Verbatim
        }
    }

    pub fn for_path(path: &Path, re_encrypt: bool) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        Self::for_file_name(&name, re_encrypt)
    }
}

/// What happened to one planned copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Copied,
    /// The source disappeared after planning
    Vanished,
    /// Re-encrypting run found a backup copy at least as recent as the source
    UpToDate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files_copied: usize,
    /// Planned size of the copied files
    pub bytes_copied: u64,
}

/// Sequential copier bound to one run's mode and temp file
pub struct Pipeline<'k> {
    mode: Mode<'k>,
    temp_file: PathBuf,
    buffer_size: usize,
    block_size: Option<u64>,
}

impl<'k> Pipeline<'k> {
    pub fn new(mode: Mode<'k>, temp_file: PathBuf, buffer_size: usize) -> Self {
        Self {
            mode,
            temp_file,
            buffer_size,
            block_size: None,
        }
    }

    /// Override the block size of re-encrypted chunked assets
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = Some(block_size);
        self
    }

    /// Copy every planned entry in order. Stops at the first failure.
    pub fn copy_all(&self, work: &BackupWork, progress: &mut CopyProgress<'_>) -> Result<CopyStats> {
        let mut stats = CopyStats::default();

        for (index, planned) in work.entries.iter().enumerate() {
            progress.start_file(index, planned.entry.display_name(), planned.size);
            if self.transfer(planned, progress)? == TransferOutcome::Copied {
                stats.files_copied += 1;
                stats.bytes_copied += planned.size;
            }
            progress.finish_file();
        }

        info!(
            "Copied {} files ({} bytes)",
            stats.files_copied, stats.bytes_copied
        );
        Ok(stats)
    }

    /// Materialize one planned copy at its destination
    pub fn transfer(&self, planned: &PlannedCopy, progress: &mut CopyProgress<'_>) -> Result<TransferOutcome> {
        let entry = &planned.entry;
        let span = span!(Level::DEBUG, "transfer", file = %entry.display_name());
        let _enter = span.enter();

        let original = match probe(&entry.original)? {
            FileState::Absent => {
                debug!("Source vanished since planning: {}", entry.original.display());
                return Ok(TransferOutcome::Vanished);
            }
            FileState::Present(metadata) if !metadata.is_file() => {
                return Err(Error::invalid_format(format!(
                    "{} is not a regular file",
                    entry.original.display()
                )));
            }
            FileState::Present(metadata) => metadata,
        };

        // a re-encrypted copy can differ in size from its source; only mtime decides
        if self.mode.is_re_encrypt() && backup_is_current(entry, &original)? {
            debug!("Backup already current: {}", entry.backup_file.display());
            return Ok(TransferOutcome::UpToDate);
        }

        fs::create_dir_all(&entry.backup_dir).at(&entry.backup_dir)?;

        let strategy = Strategy::for_path(&entry.original, self.mode.is_re_encrypt());
        debug!("Using {:?} for {}", strategy, entry.original.display());

        self.copy_to_backup(entry, strategy, progress)
    }

    fn copy_to_backup(
        &self,
        entry: &BackupEntry,
        strategy: Strategy,
        progress: &mut CopyProgress<'_>,
    ) -> Result<TransferOutcome> {
        let result = write_atomically(&self.temp_file, &entry.backup_file, |temp| {
            self.run_strategy(strategy, &entry.original, temp, &mut |done, total| {
                progress.file_progress(done, total)
            })
        });

        match result {
            Ok(()) => Ok(TransferOutcome::Copied),
            Err(e) if e.is_not_found() && !entry.original.exists() => {
                debug!("Source vanished while copying: {}", entry.original.display());
                Ok(TransferOutcome::Vanished)
            }
            Err(e) => Err(e),
        }
    }

    fn run_strategy(
        &self,
        strategy: Strategy,
        src: &Path,
        temp: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()> {
        let keys = match (strategy, self.mode) {
            (Strategy::Verbatim, _) => {
                pump(
                    FileChunks::open(src, self.buffer_size)?,
                    &Transform::Identity,
                    FileSink::create(temp)?,
                    on_progress,
                )?;
                return Ok(());
            }
            (_, Mode::ReEncrypt(keys)) => keys,
            (_, Mode::Plain) => {
                return Err(Error::invalid_format("re-encryption requested without keys"));
            }
        };

        let reencrypt = Transform::Reencrypt {
            cipher: keys.cipher,
            from: keys.source,
            to: keys.destination,
            method: CipherMethod::Compressed,
        };

        match strategy {
            Strategy::FlatRecord => {
                pump(WholeFile::read(src)?, &reencrypt, FileSink::create(temp)?, on_progress)?;
            }
            Strategy::PackContainer => {
                pump(PackEntries::open(src)?, &reencrypt, PackSink::create(temp)?, on_progress)?;
            }
            Strategy::ChunkedAsset => {
                let mut sink = ChunkedSink::create(temp, keys.destination, keys.cipher)?;
                if let Some(block_size) = self.block_size {
                    sink = sink.with_block_size(block_size);
                }
                pump(
                    ChunkedPlaintext::open(src, keys.source, keys.cipher, self.buffer_size)?,
                    &Transform::Identity,
                    sink,
                    on_progress,
                )?;
            }
            Strategy::Verbatim => {}
        }
        Ok(())
    }
}

/// True when the backup copy exists and the source is not newer than it
fn backup_is_current(entry: &BackupEntry, original: &Metadata) -> Result<bool> {
    match probe(&entry.backup_file)? {
        FileState::Absent => Ok(false),
        FileState::Present(backup) => {
            let source_ms = modified_millis(original, &entry.original)?;
            let backup_ms = modified_millis(&backup, &entry.backup_file)?;
            Ok(source_ms <= backup_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{ChunkedReader, ChunkedWriter, XChaChaCipher};
    use crate::pack::{PackReader, PackWriter};
    use crate::planner::BackupEntry;
    use crate::status::NullStatus;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        source_key: MasterKey,
        destination_key: MasterKey,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let dir = TempDir::new()?;
            fs::create_dir_all(dir.path().join("vault/media/01/1"))?;
            fs::create_dir_all(dir.path().join("backup/temp"))?;
            Ok(Self {
                dir,
                source_key: MasterKey::generate(),
                destination_key: MasterKey::generate(),
            })
        }

        fn vault(&self) -> PathBuf {
            self.dir.path().join("vault")
        }

        fn backup(&self) -> PathBuf {
            self.dir.path().join("backup")
        }

        fn temp_file(&self) -> PathBuf {
            self.backup().join("temp/backup_0.tmp")
        }

        fn keys(&self) -> KeyPair<'_> {
            KeyPair {
                source: &self.source_key,
                destination: &self.destination_key,
                cipher: &XChaChaCipher,
            }
        }

        fn planned(&self, relative: &str) -> Result<PlannedCopy> {
            let entry = BackupEntry::new(&self.vault(), &self.backup(), Path::new(relative));
            let size = fs::metadata(&entry.original).map(|m| m.len()).unwrap_or(0);
            Ok(PlannedCopy { entry, size })
        }

        fn transfer(&self, mode: Mode<'_>, relative: &str) -> Result<TransferOutcome> {
            let planned = self.planned(relative)?;
            let mut sink = NullStatus;
            let mut progress = CopyProgress::new(&mut sink, planned.size, 1);
            Pipeline::new(mode, self.temp_file(), 16)
                .with_block_size(32)
                .transfer(&planned, &mut progress)
        }

        fn seal(&self, data: &[u8]) -> Result<Vec<u8>> {
            XChaChaCipher.encrypt(data, CipherMethod::Compressed, self.source_key.as_bytes())
        }

        /// Push the source's mtime a minute past any backup written so far
        fn touch_source(&self, relative: &str) -> Result<()> {
            let file = fs::OpenOptions::new().write(true).open(self.vault().join(relative))?;
            file.set_modified(SystemTime::now() + Duration::from_secs(60))?;
            Ok(())
        }
    }

    /// Passes `allowed` chunks to the inner sink, then fails
    struct FailAfter<K> {
        inner: K,
        allowed: usize,
    }

    impl<K: ChunkSink> ChunkSink for FailAfter<K> {
        fn begin(&mut self, total_units: u64) -> Result<()> {
            self.inner.begin(total_units)
        }

        fn put(&mut self, chunk: &[u8]) -> Result<()> {
            if self.allowed == 0 {
                return Err(Error::PartialWrite {
                    path: PathBuf::from("sink"),
                });
            }
            self.allowed -= 1;
            self.inner.put(chunk)
        }

        fn finish(self) -> Result<()> {
            self.inner.finish()
        }
    }

    #[test]
    fn test_dispatch_by_file_name() {
        assert_eq!(Strategy::for_file_name("meta.pmv", true), Strategy::FlatRecord);
        assert_eq!(Strategy::for_file_name("m_thumbs.pma", true), Strategy::PackContainer);
        assert_eq!(Strategy::for_file_name("s_video.pma", true), Strategy::ChunkedAsset);
        assert_eq!(Strategy::for_file_name("main.index", true), Strategy::Verbatim);
        assert_eq!(Strategy::for_file_name("m_notes.txt", true), Strategy::Verbatim);
        for name in ["meta.pmv", "m_thumbs.pma", "s_video.pma", "main.index"] {
            assert_eq!(Strategy::for_file_name(name, false), Strategy::Verbatim);
        }
        assert_eq!(
            Strategy::for_path(Path::new("/v/media/01/1/m_x.pma"), true),
            Strategy::PackContainer
        );
    }

    #[test]
    fn test_flat_record_is_reencrypted() -> Result<()> {
        let f = Fixture::new()?;
        let rel = "media/01/1/meta.pmv";
        fs::write(f.vault().join(rel), f.seal(b"{\"id\":1}")?)?;

        assert_eq!(f.transfer(Mode::ReEncrypt(f.keys()), rel)?, TransferOutcome::Copied);

        let out = fs::read(f.backup().join(rel))?;
        assert_eq!(XChaChaCipher.decrypt(&out, f.destination_key.as_bytes())?, b"{\"id\":1}");
        assert!(!f.temp_file().exists());
        Ok(())
    }

    #[test]
    fn test_pack_container_is_reencrypted_entry_by_entry() -> Result<()> {
        let f = Fixture::new()?;
        let rel = "media/01/1/m_thumbs.pma";
        let entries: Vec<&[u8]> = vec![b"one", b"", b"three"];

        let mut writer = PackWriter::create(&f.vault().join(rel))?;
        writer.initialize(entries.len() as u64)?;
        for e in &entries {
            writer.put_file(&f.seal(e)?)?;
        }
        writer.finish()?;

        f.transfer(Mode::ReEncrypt(f.keys()), rel)?;

        let mut reader = PackReader::open(&f.backup().join(rel))?;
        assert_eq!(reader.file_count(), 3);
        for (i, expected) in entries.iter().enumerate() {
            let sealed = reader.get_file(i as u64)?;
            assert_eq!(XChaChaCipher.decrypt(&sealed, f.destination_key.as_bytes())?, *expected);
        }
        Ok(())
    }

    #[test]
    fn test_chunked_asset_is_reencrypted() -> Result<()> {
        let f = Fixture::new()?;
        let rel = "media/01/1/s_video.pma";
        let data: Vec<u8> = (0..200u32).map(|i| (i * 7 % 256) as u8).collect();

        let mut writer = ChunkedWriter::create(&f.vault().join(rel), &XChaChaCipher)?.with_block_size(48);
        writer.initialize(data.len() as u64, f.source_key.as_bytes())?;
        writer.write(&data)?;
        writer.finish()?;

        f.transfer(Mode::ReEncrypt(f.keys()), rel)?;

        let mut reader = ChunkedReader::open(&f.backup().join(rel), f.destination_key.as_bytes(), &XChaChaCipher)?;
        assert_eq!(reader.plaintext_size(), 200);
        let mut out = vec![0u8; 256];
        let mut filled = 0;
        loop {
            let n = reader.read(&mut out[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        assert_eq!(out[..filled].to_vec(), data);
        Ok(())
    }

    #[test]
    fn test_plain_mode_copies_encrypted_files_verbatim() -> Result<()> {
        let f = Fixture::new()?;
        let rel = "media/01/1/meta.pmv";
        let sealed = f.seal(b"payload")?;
        fs::write(f.vault().join(rel), &sealed)?;

        f.transfer(Mode::Plain, rel)?;

        assert_eq!(fs::read(f.backup().join(rel))?, sealed);
        Ok(())
    }

    #[test]
    fn test_vanished_source_is_a_no_op() -> Result<()> {
        let f = Fixture::new()?;
        assert_eq!(f.transfer(Mode::Plain, "media/01/1/gone.bin")?, TransferOutcome::Vanished);
        assert!(!f.backup().join("media/01/1/gone.bin").exists());
        Ok(())
    }

    #[test]
    fn test_failures_leave_destination_untouched() -> Result<()> {
        let f = Fixture::new()?;
        let dest_dir = f.backup().join("media/01/1");
        fs::create_dir_all(&dest_dir)?;

        // each source is corrupt for its strategy
        let wrong_key = MasterKey::generate();
        let cases: Vec<(&str, Vec<u8>)> = vec![
            (
                "meta.pmv",
                XChaChaCipher.encrypt(b"x", CipherMethod::Flat, wrong_key.as_bytes())?,
            ),
            ("m_thumbs.pma", {
                let mut raw = 1u64.to_be_bytes().to_vec();
                raw.extend_from_slice(&24u64.to_be_bytes());
                raw.extend_from_slice(&999u64.to_be_bytes());
                raw
            }),
            ("s_video.pma", {
                let mut raw = 100u64.to_be_bytes().to_vec();
                raw.extend_from_slice(&64u64.to_be_bytes());
                raw
            }),
        ];

        for (name, content) in cases {
            let rel = format!("media/01/1/{}", name);
            fs::write(f.vault().join(&rel), content)?;
            fs::write(dest_dir.join(name), b"previous backup")?;
            f.touch_source(&rel)?;

            let result = f.transfer(Mode::ReEncrypt(f.keys()), &rel);

            assert!(result.is_err(), "{} should fail", name);
            assert_eq!(fs::read(dest_dir.join(name))?, b"previous backup");
            assert!(!f.temp_file().exists(), "{} left a temp file", name);
        }
        Ok(())
    }

    #[test]
    fn test_verbatim_temp_failure_leaves_destination_untouched() -> Result<()> {
        let f = Fixture::new()?;
        let rel = "media/01/1/main.bin";
        fs::write(f.vault().join(rel), b"new")?;
        fs::create_dir_all(f.backup().join("media/01/1"))?;
        fs::write(f.backup().join(rel), b"old")?;
        // temp directory missing: the temp file cannot be created
        fs::remove_dir_all(f.backup().join("temp"))?;

        assert!(f.transfer(Mode::Plain, rel).is_err());
        assert_eq!(fs::read(f.backup().join(rel))?, b"old");
        Ok(())
    }

    #[test]
    fn test_reencrypt_skips_backup_that_is_not_older() -> Result<()> {
        let f = Fixture::new()?;
        let rel = "media/01/1/meta.pmv";
        // sealed without compression, so the re-encrypted copy has another size
        let sealed = XChaChaCipher.encrypt(&[b'a'; 64], CipherMethod::Flat, f.source_key.as_bytes())?;
        fs::write(f.vault().join(rel), &sealed)?;

        assert_eq!(f.transfer(Mode::ReEncrypt(f.keys()), rel)?, TransferOutcome::Copied);
        let first = fs::read(f.backup().join(rel))?;
        assert_ne!(first.len(), sealed.len());

        assert_eq!(f.transfer(Mode::ReEncrypt(f.keys()), rel)?, TransferOutcome::UpToDate);
        assert_eq!(fs::read(f.backup().join(rel))?, first);

        f.touch_source(rel)?;
        assert_eq!(f.transfer(Mode::ReEncrypt(f.keys()), rel)?, TransferOutcome::Copied);
        Ok(())
    }

    #[test]
    fn test_plain_mode_copies_even_when_backup_is_newer() -> Result<()> {
        let f = Fixture::new()?;
        let rel = "media/01/1/main.bin";
        fs::write(f.vault().join(rel), b"new content")?;
        fs::create_dir_all(f.backup().join("media/01/1"))?;
        fs::write(f.backup().join(rel), b"old")?;

        assert_eq!(f.transfer(Mode::Plain, rel)?, TransferOutcome::Copied);
        assert_eq!(fs::read(f.backup().join(rel))?, b"new content");
        Ok(())
    }

    #[test]
    fn test_verbatim_mid_write_failure_leaves_destination_untouched() -> Result<()> {
        let f = Fixture::new()?;
        let src = f.vault().join("media/01/1/main.bin");
        let dest = f.backup().join("media/01/1/main.bin");
        fs::write(&src, [7u8; 100])?;
        fs::create_dir_all(f.backup().join("media/01/1"))?;
        fs::write(&dest, b"old")?;

        let result = write_atomically(&f.temp_file(), &dest, |temp| {
            let sink = FailAfter {
                inner: FileSink::create(temp)?,
                allowed: 1,
            };
            pump(FileChunks::open(&src, 16)?, &Transform::Identity, sink, &mut |_, _| {})
        });

        assert!(matches!(result, Err(Error::PartialWrite { .. })));
        assert_eq!(fs::read(&dest)?, b"old");
        assert!(!f.temp_file().exists());
        Ok(())
    }

    #[test]
    fn test_source_removed_before_copy_is_a_no_op() -> Result<()> {
        let f = Fixture::new()?;
        let keys = f.keys();
        let cases = [
            ("media/01/1/main.bin", Mode::Plain, Strategy::Verbatim),
            ("media/01/1/meta.pmv", Mode::ReEncrypt(keys), Strategy::FlatRecord),
            ("media/01/1/m_thumbs.pma", Mode::ReEncrypt(keys), Strategy::PackContainer),
            ("media/01/1/s_video.pma", Mode::ReEncrypt(keys), Strategy::ChunkedAsset),
        ];

        for (rel, mode, strategy) in cases {
            fs::write(f.vault().join(rel), b"short lived")?;
            let planned = f.planned(rel)?;
            fs::create_dir_all(&planned.entry.backup_dir)?;
            fs::remove_file(&planned.entry.original)?;

            let mut status = NullStatus;
            let mut progress = CopyProgress::new(&mut status, planned.size, 1);
            let pipeline = Pipeline::new(mode, f.temp_file(), 16);
            let outcome = pipeline.copy_to_backup(&planned.entry, strategy, &mut progress)?;

            assert_eq!(outcome, TransferOutcome::Vanished, "{}", rel);
            assert!(!planned.entry.backup_file.exists(), "{}", rel);
            assert!(!f.temp_file().exists(), "{}", rel);
        }
        Ok(())
    }
}
