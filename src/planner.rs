//! Entry discovery and the incremental diff planner.

use crate::atomic::{modified_millis, probe, FileState};
use crate::config::VaultLayout;
use crate::status::{percent_of, MessageKey, Phase, ProgressUpdate, Severity, StatusSink};
use crate::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One vault file and where its backup copy lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub original: PathBuf,
    /// Directory holding the backup copy
    pub backup_dir: PathBuf,
    pub backup_file: PathBuf,
    /// Path relative to the vault root
    pub relative: PathBuf,
}

impl BackupEntry {
    pub fn new(vault: &Path, backup: &Path, relative: &Path) -> Self {
        let backup_file = backup.join(relative);
        let backup_dir = backup_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| backup.to_path_buf());

        Self {
            original: vault.join(relative),
            backup_dir,
            backup_file,
            relative: relative.to_path_buf(),
        }
    }

    /// Name used in progress output
    pub fn display_name(&self) -> String {
        self.relative.to_string_lossy().replace('\\', "/")
    }
}

/// An entry that needs copying, with its size at planning time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCopy {
    pub entry: BackupEntry,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupWork {
    pub entries: Vec<PlannedCopy>,
    pub total_size: u64,
}

impl BackupWork {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// List the candidate files of a vault.
///
/// Top-level files come first in layout order, then each subtree in file
/// name order. The credentials file is left out when `skip_credentials` is
/// set. Unreadable directories are reported through `sink` and skipped.
pub fn find_entries(
    vault: &Path,
    backup: &Path,
    layout: &VaultLayout,
    skip_credentials: bool,
    sink: &mut dyn StatusSink,
) -> Vec<BackupEntry> {
    let mut entries = Vec::new();

    for name in &layout.top_level_files {
        if skip_credentials && *name == layout.credentials_file {
            continue;
        }
        entries.push(BackupEntry::new(vault, backup, Path::new(name)));
    }

    for subtree in &layout.subtrees {
        let root = vault.join(subtree);
        if !root.exists() {
            debug!("Subtree {} not present, skipping", root.display());
            continue;
        }

        for item in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| root.display().to_string());
                    warn!("Error reading path {}: {}", path, e);
                    sink.message(
                        Severity::Warning,
                        MessageKey::ErrorReadPath,
                        &[("Path", path), ("Message", e.to_string())],
                    );
                    continue;
                }
            };

            if !item.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = item.path().strip_prefix(vault) {
                entries.push(BackupEntry::new(vault, backup, relative));
            }
        }
    }

    debug!("Found {} candidate entries", entries.len());
    entries
}

/// Decide which entries differ from their backup copy.
///
/// A copy is planned when the backup is missing, the original is newer at
/// millisecond precision, or the sizes differ. Originals that do not exist
/// are skipped. Any other stat failure aborts planning.
pub fn plan(entries: Vec<BackupEntry>, sink: &mut dyn StatusSink) -> Result<BackupWork> {
    let mut work = BackupWork::default();
    let total = entries.len();
    let mut last_percent = None;

    for (i, entry) in entries.into_iter().enumerate() {
        if let Some(planned) = plan_entry(entry)? {
            work.total_size += planned.size;
            work.entries.push(planned);
        }

        let percent = percent_of(i as u64 + 1, total as u64);
        if last_percent != Some(percent) {
            last_percent = Some(percent);
            sink.progress(&ProgressUpdate {
                phase: Phase::Scanning,
                percent,
                current: i + 1,
                total,
                file: String::new(),
                file_percent: 0,
            });
        }
    }

    info!(
        "Planned {} of {} files ({} bytes)",
        work.entries.len(),
        total,
        work.total_size
    );
    Ok(work)
}

fn plan_entry(entry: BackupEntry) -> Result<Option<PlannedCopy>> {
    let original = match probe(&entry.original)? {
        FileState::Present(metadata) => metadata,
        FileState::Absent => return Ok(None),
    };
    let size = original.len();

    let changed = match probe(&entry.backup_file)? {
        FileState::Absent => true,
        FileState::Present(backup) => {
            modified_millis(&original, &entry.original)? > modified_millis(&backup, &entry.backup_file)?
                || size != backup.len()
        }
    };

    Ok(changed.then(|| PlannedCopy { entry, size }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::NullStatus;
    use pretty_assertions::assert_eq;
    use std::fs::{self, File};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Trees {
        _dir: TempDir,
        vault: PathBuf,
        backup: PathBuf,
    }

    fn trees() -> Result<Trees> {
        let dir = TempDir::new()?;
        let vault = dir.path().join("vault");
        let backup = dir.path().join("backup");
        fs::create_dir_all(&vault)?;
        fs::create_dir_all(&backup)?;
        Ok(Trees { _dir: dir, vault, backup })
    }

    fn write_with_mtime(path: &Path, content: &[u8], mtime: SystemTime) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        File::options().write(true).open(path)?.set_modified(mtime)?;
        Ok(())
    }

    fn planned_names(work: &BackupWork) -> Vec<String> {
        work.entries.iter().map(|p| p.entry.display_name()).collect()
    }

    #[test]
    fn test_find_entries_order_and_filters() -> Result<()> {
        let t = trees()?;
        fs::create_dir_all(t.vault.join("media/0a/10"))?;
        fs::write(t.vault.join("media/0a/10/meta.pmv"), b"m")?;
        fs::write(t.vault.join("media/0a/10/s_video.pma"), b"v")?;
        fs::create_dir_all(t.vault.join("tags"))?;
        fs::write(t.vault.join("tags/tag_1.index"), b"t")?;

        let layout = VaultLayout::default();
        let entries = find_entries(&t.vault, &t.backup, &layout, false, &mut NullStatus);
        let names: Vec<String> = entries.iter().map(BackupEntry::display_name).collect();

        let split = layout.top_level_files.len();
        assert_eq!(names[..split].to_vec(), layout.top_level_files);
        assert_eq!(
            names[split..].to_vec(),
            vec!["tags/tag_1.index", "media/0a/10/meta.pmv", "media/0a/10/s_video.pma"]
        );
        assert_eq!(entries.last().map(|e| e.backup_dir.clone()), Some(t.backup.join("media/0a/10")));

        let without = find_entries(&t.vault, &t.backup, &layout, true, &mut NullStatus);
        assert!(!without.iter().any(|e| e.relative == Path::new("credentials.json")));
        assert_eq!(without.len(), entries.len() - 1);
        Ok(())
    }

    #[test]
    fn test_plan_detects_changes() -> Result<()> {
        let t = trees()?;
        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let t2 = t1 + Duration::from_secs(60);

        // no backup copy
        write_with_mtime(&t.vault.join("tags/absent.bin"), b"aaaa", t1)?;
        // newer original, same size
        write_with_mtime(&t.vault.join("tags/newer.bin"), b"bbbb", t2)?;
        write_with_mtime(&t.backup.join("tags/newer.bin"), b"BBBB", t1)?;
        // same mtime, different size
        write_with_mtime(&t.vault.join("tags/resized.bin"), b"cccccc", t1)?;
        write_with_mtime(&t.backup.join("tags/resized.bin"), b"cc", t1)?;
        // identical
        write_with_mtime(&t.vault.join("tags/same.bin"), b"dddd", t1)?;
        write_with_mtime(&t.backup.join("tags/same.bin"), b"dddd", t1)?;
        // backup newer than original with the same size
        write_with_mtime(&t.vault.join("tags/stale.bin"), b"eeee", t1)?;
        write_with_mtime(&t.backup.join("tags/stale.bin"), b"eeee", t2)?;

        let layout = VaultLayout::default();
        let entries = find_entries(&t.vault, &t.backup, &layout, false, &mut NullStatus);
        let work = plan(entries, &mut NullStatus)?;

        assert_eq!(
            planned_names(&work),
            vec!["tags/absent.bin", "tags/newer.bin", "tags/resized.bin"]
        );
        assert_eq!(work.total_size, 4 + 4 + 6);
        Ok(())
    }

    #[test]
    fn test_missing_originals_are_skipped() -> Result<()> {
        let t = trees()?;
        let entries = vec![BackupEntry::new(&t.vault, &t.backup, Path::new("tasks.json"))];
        let work = plan(entries, &mut NullStatus)?;
        assert!(work.is_empty());
        assert_eq!(work.total_size, 0);
        Ok(())
    }

    #[test]
    fn test_scanning_progress_reaches_100() -> Result<()> {
        struct Percents(Vec<u32>);
        impl StatusSink for Percents {
            fn progress(&mut self, update: &ProgressUpdate) {
                self.0.push(update.percent);
            }
            fn message(&mut self, _: Severity, _: MessageKey, _: &[(&str, String)]) {}
        }

        let t = trees()?;
        let entries: Vec<BackupEntry> = (0..3)
            .map(|i| BackupEntry::new(&t.vault, &t.backup, Path::new(&format!("f{}", i))))
            .collect();
        let mut sink = Percents(Vec::new());
        plan(entries, &mut sink)?;

        assert_eq!(sink.0, vec![33, 66, 100]);
        Ok(())
    }
}
