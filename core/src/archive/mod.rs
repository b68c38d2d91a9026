//! Change detection and archive packaging.

mod container;

pub use container::{EntryHeader, EntryKind, ExtractOptions, ExtractReport, MAGIC, extract, read_manifest};

use crate::types::{Info, ItemInfo, ItemStatus};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Number of offending paths carried by a threshold error.
pub const SAMPLE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChangeStats {
    pub new: usize,
    pub modified: usize,
    pub unmodified: usize,
    pub deleted: usize,
    pub has_baseline: bool,
}

impl ChangeStats {
    pub fn changed(&self) -> usize {
        self.new + self.modified + self.deleted
    }

    /// Files seen now plus files that were present last time and are gone.
    pub fn total(&self) -> usize {
        self.new + self.modified + self.unmodified + self.deleted
    }

    /// Changed files as a percentage of the total.
    pub fn ratio(&self) -> f64 {
        self.changed() as f64 * 100.0 / self.total().max(1) as f64
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ScannedEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub mode: u32,
    pub mtime: Option<DateTime<Utc>>,
}

/// Result of walking the configured paths without writing anything.
#[derive(Debug)]
pub struct Scan {
    pub info: Info,
    pub stats: ChangeStats,
    entries: Vec<ScannedEntry>,
}

impl Scan {
    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|e| e.kind == EntryKind::File).count()
    }
}

pub struct BuiltArchive {
    pub file: NamedTempFile,
    pub info: Info,
    pub stats: ChangeStats,
}

impl BuiltArchive {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

pub struct ArchiveBuilder {
    ignore: Vec<Regex>,
    tolerance: f64,
}

impl ArchiveBuilder {
    pub fn new(ignore: Vec<Regex>) -> Self {
        Self {
            ignore,
            tolerance: 100.0,
        }
    }

    /// Maximum percentage of changed files accepted against a baseline.
    pub fn with_tolerance(mut self, percent: f64) -> Self {
        self.tolerance = percent.clamp(0.0, 100.0);
        self
    }

    fn is_ignored(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        self.ignore.iter().any(|pattern| pattern.is_match(&path))
    }

    pub fn scan(&self, paths: &[PathBuf], previous: Option<&Info>) -> Result<Scan> {
        let empty = Info::new();
        let previous = previous.unwrap_or(&empty);

        let mut info = Info::new();
        let mut entries = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stats = ChangeStats {
            has_baseline: !previous.is_empty(),
            ..Default::default()
        };

        for root in paths {
            if root.as_os_str().is_empty() {
                info!("Skipping empty backup path");
                continue;
            }
            fs::symlink_metadata(root).map_err(|e| Error::path(root, e))?;

            let walker = WalkDir::new(root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| !self.is_ignored(entry.path()));

            for entry in walker {
                let entry = entry.map_err(|e| {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    Error::path(path, e.into())
                })?;

                let file_type = entry.file_type();
                let kind = if file_type.is_dir() {
                    EntryKind::Directory
                } else if file_type.is_file() {
                    EntryKind::File
                } else {
                    debug!(path = %entry.path().display(), "Skipping special file");
                    continue;
                };

                if !seen.insert(entry.path().to_path_buf()) {
                    continue;
                }

                let metadata = entry.metadata().map_err(|e| {
                    Error::path(entry.path(), std::io::Error::from(e))
                })?;
                let mtime = metadata.modified().ok().map(DateTime::<Utc>::from);

                if kind == EntryKind::File {
                    let key = entry.path().to_string_lossy().into_owned();
                    let checksum = file_checksum(entry.path())?;
                    let status = match previous.get(&key) {
                        Some(prior) if prior.status.is_useful() => {
                            if prior.checksum == checksum {
                                ItemStatus::Unmodified
                            } else {
                                ItemStatus::Modified
                            }
                        }
                        _ => ItemStatus::New,
                    };

                    match status {
                        ItemStatus::New => stats.new += 1,
                        ItemStatus::Modified => stats.modified += 1,
                        _ => stats.unmodified += 1,
                    }
                    info.insert(key, ItemInfo::new(status, mtime, checksum));
                }

                entries.push(ScannedEntry {
                    path: entry.into_path(),
                    kind,
                    mode: file_mode(&metadata),
                    mtime,
                });
            }
        }

        for (path, prior) in previous {
            if prior.status.is_useful() && !info.contains_key(path) {
                stats.deleted += 1;
                info.insert(
                    path.clone(),
                    ItemInfo::new(ItemStatus::Deleted, prior.last_modified, prior.checksum.clone()),
                );
            }
        }

        let ratio = stats.ratio();
        debug!(
            new = stats.new,
            modified = stats.modified,
            unmodified = stats.unmodified,
            deleted = stats.deleted,
            ratio,
            "Scanned backup paths"
        );

        if stats.has_baseline && ratio > self.tolerance {
            let sample: Vec<String> = info
                .iter()
                .filter(|(_, item)| item.status != ItemStatus::Unmodified)
                .map(|(path, _)| path.clone())
                .take(SAMPLE_SIZE)
                .collect();

            warn!(ratio, tolerance = self.tolerance, "Change threshold exceeded");
            return Err(Error::ChangeThresholdExceeded {
                ratio,
                tolerance: self.tolerance,
                sample,
            });
        }

        Ok(Scan { info, stats, entries })
    }

    /// Scans and packages everything into a compressed container in a
    /// temporary file. The manifest is written last.
    pub fn build(&self, paths: &[PathBuf], previous: Option<&Info>) -> Result<BuiltArchive> {
        let scan = self.scan(paths, previous)?;
        let file = NamedTempFile::new()?;

        {
            let mut writer = container::Writer::new(BufWriter::new(file.as_file()))?;
            for entry in &scan.entries {
                writer.append(entry)?;
            }
            writer.append_manifest(&scan.info)?;
            writer.finish()?.flush()?;
        }

        info!(
            files = scan.file_count(),
            size = file.as_file().metadata()?.len(),
            "Built archive"
        );

        Ok(BuiltArchive {
            file,
            info: scan.info,
            stats: scan.stats,
        })
    }
}

/// Hex BLAKE3 digest of a file's content.
pub fn file_checksum(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| Error::path(path, e))?;
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut BufReader::new(file), &mut hasher).map_err(|e| Error::path(path, e))?;
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() { 0o755 } else { 0o644 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn key(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_first_scan_marks_everything_new() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", "a");
        write(dir.path(), "nested/b.txt", "b");

        let builder = ArchiveBuilder::new(vec![]).with_tolerance(0.0);
        let scan = builder.scan(&[dir.path().to_path_buf()], None).unwrap();

        assert_eq!(scan.info.len(), 2);
        assert!(scan.info.values().all(|item| item.status == ItemStatus::New));
        assert!(!scan.stats.has_baseline);
        assert_eq!(scan.stats.ratio(), 100.0);
    }

    #[test]
    fn test_classifies_against_previous() {
        let dir = TempDir::new().unwrap();
        let kept = write(dir.path(), "kept.txt", "same");
        let changed = write(dir.path(), "changed.txt", "before");
        let removed = write(dir.path(), "removed.txt", "gone soon");

        let builder = ArchiveBuilder::new(vec![]);
        let first = builder.scan(&[dir.path().to_path_buf()], None).unwrap();

        fs::write(&changed, "after").unwrap();
        fs::remove_file(&removed).unwrap();
        let added = write(dir.path(), "added.txt", "new");

        let second = builder.scan(&[dir.path().to_path_buf()], Some(&first.info)).unwrap();
        assert_eq!(second.info[&key(&kept)].status, ItemStatus::Unmodified);
        assert_eq!(second.info[&key(&changed)].status, ItemStatus::Modified);
        assert_eq!(second.info[&key(&removed)].status, ItemStatus::Deleted);
        assert_eq!(second.info[&key(&added)].status, ItemStatus::New);
        assert_eq!(second.stats.changed(), 3);
        assert_eq!(second.stats.total(), 4);

        // A deleted file that stays absent is not carried forward.
        let third = builder.scan(&[dir.path().to_path_buf()], Some(&second.info)).unwrap();
        assert!(!third.info.contains_key(&key(&removed)));
    }

    #[test]
    fn test_two_unchanged_one_new_within_half_tolerance() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "one", "1");
        write(dir.path(), "two", "2");

        let builder = ArchiveBuilder::new(vec![]).with_tolerance(50.0);
        let first = builder.scan(&[dir.path().to_path_buf()], None).unwrap();

        let third = write(dir.path(), "three", "3");
        let scan = builder.scan(&[dir.path().to_path_buf()], Some(&first.info)).unwrap();

        assert!((scan.stats.ratio() - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(scan.info[&key(&third)].status, ItemStatus::New);
        assert_eq!(scan.stats.unmodified, 2);
    }

    #[test]
    fn test_tolerance_boundary_is_inclusive() {
        let dir = TempDir::new().unwrap();
        let files: Vec<PathBuf> = (0..100)
            .map(|i| write(dir.path(), &format!("file-{:03}", i), "original"))
            .collect();

        let builder = ArchiveBuilder::new(vec![]).with_tolerance(10.0);
        let roots = [dir.path().to_path_buf()];
        let baseline = builder.scan(&roots, None).unwrap();

        for file in &files[..10] {
            fs::write(file, "changed").unwrap();
        }
        let scan = builder.scan(&roots, Some(&baseline.info)).unwrap();
        assert_eq!(scan.stats.modified, 10);

        fs::write(&files[10], "changed").unwrap();
        let err = builder.scan(&roots, Some(&baseline.info)).unwrap_err();
        match err {
            Error::ChangeThresholdExceeded { ratio, tolerance, sample } => {
                assert!((ratio - 11.0).abs() < 1e-9);
                assert_eq!(tolerance, 10.0);
                assert_eq!(sample.len(), SAMPLE_SIZE);
                let mut sorted = sample.clone();
                sorted.sort();
                assert_eq!(sample, sorted);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_ignore_patterns_prune_subtrees() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "keep.txt", "k");
        write(dir.path(), "cache/blob.bin", "c");
        write(dir.path(), "notes.tmp", "t");

        let ignore = vec![Regex::new(r"/cache$").unwrap(), Regex::new(r"\.tmp$").unwrap()];
        let scan = ArchiveBuilder::new(ignore)
            .scan(&[dir.path().to_path_buf()], None)
            .unwrap();

        let paths: Vec<&String> = scan.info.keys().collect();
        assert_eq!(paths, vec![&key(&dir.path().join("keep.txt"))]);
    }

    #[test]
    fn test_empty_paths_skipped_and_missing_root_fails() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a", "a");
        let builder = ArchiveBuilder::new(vec![]);

        let scan = builder
            .scan(&[PathBuf::new(), dir.path().to_path_buf()], None)
            .unwrap();
        assert_eq!(scan.info.len(), 1);

        let missing = dir.path().join("missing");
        let err = builder.scan(&[missing.clone()], None).unwrap_err();
        assert!(err.to_string().contains(&missing.display().to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped() {
        let dir = TempDir::new().unwrap();
        let target = write(dir.path(), "target", "t");
        std::os::unix::fs::symlink(&target, dir.path().join("link")).unwrap();

        let scan = ArchiveBuilder::new(vec![])
            .scan(&[dir.path().to_path_buf()], None)
            .unwrap();
        assert_eq!(scan.info.len(), 1);
    }

    #[test]
    fn test_threshold_failure_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let file = write(dir.path(), "a", "a");
        let builder = ArchiveBuilder::new(vec![]).with_tolerance(0.0);
        let baseline = builder.scan(&[dir.path().to_path_buf()], None).unwrap();

        fs::write(&file, "b").unwrap();
        let result = builder.build(&[dir.path().to_path_buf()], Some(&baseline.info));
        assert!(matches!(result, Err(Error::ChangeThresholdExceeded { .. })));
    }
}
