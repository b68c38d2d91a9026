//! On-disk container: a gzip stream holding a magic marker followed by
//! frames of `[u32 LE header length][bincode header][payload]`.

use super::{ScannedEntry, file_checksum};
use crate::types::Info;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

pub const MAGIC: &[u8] = b"COLDSTASH1";

const MAX_HEADER_LEN: u32 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Directory,
    File,
    Manifest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryHeader {
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub mtime: Option<DateTime<Utc>>,
    pub size: u64,
}

pub(super) struct Writer<W: Write> {
    encoder: GzEncoder<W>,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Result<Self> {
        let mut encoder = GzEncoder::new(inner, Compression::default());
        encoder.write_all(MAGIC)?;
        Ok(Self { encoder })
    }

    fn write_header(&mut self, header: &EntryHeader) -> Result<()> {
        let data = bincode::serialize(header).map_err(|e| Error::Format(e.to_string()))?;
        self.encoder.write_all(&(data.len() as u32).to_le_bytes())?;
        self.encoder.write_all(&data)?;
        Ok(())
    }

    pub fn append(&mut self, entry: &ScannedEntry) -> Result<()> {
        let path = entry.path.to_string_lossy().into_owned();

        match entry.kind {
            EntryKind::File => {
                let file = File::open(&entry.path).map_err(|e| Error::path(&entry.path, e))?;
                let size = file.metadata().map_err(|e| Error::path(&entry.path, e))?.len();

                self.write_header(&EntryHeader {
                    path,
                    kind: EntryKind::File,
                    mode: entry.mode,
                    mtime: entry.mtime,
                    size,
                })?;

                let copied = io::copy(&mut BufReader::new(file).take(size), &mut self.encoder)
                    .map_err(|e| Error::path(&entry.path, e))?;
                if copied != size {
                    return Err(Error::Format(format!(
                        "{} shrank while being archived",
                        entry.path.display()
                    )));
                }
            }
            kind => self.write_header(&EntryHeader {
                path,
                kind,
                mode: entry.mode,
                mtime: entry.mtime,
                size: 0,
            })?,
        }
        Ok(())
    }

    pub fn append_manifest(&mut self, info: &Info) -> Result<()> {
        let data = serde_json::to_vec(info)?;
        self.write_header(&EntryHeader {
            path: String::new(),
            kind: EntryKind::Manifest,
            mode: 0,
            mtime: None,
            size: data.len() as u64,
        })?;
        self.encoder.write_all(&data)?;
        Ok(())
    }

    pub fn finish(self) -> Result<W> {
        Ok(self.encoder.finish()?)
    }
}

struct Reader<R: Read> {
    decoder: GzDecoder<R>,
}

impl<R: Read> Reader<R> {
    fn new(inner: R) -> Result<Self> {
        let mut decoder = GzDecoder::new(inner);
        let mut magic = [0u8; MAGIC.len()];
        decoder
            .read_exact(&mut magic)
            .map_err(|_| Error::Format("Missing container marker".to_string()))?;
        if &magic[..] != MAGIC {
            return Err(Error::Format("Not a coldstash archive".to_string()));
        }
        Ok(Self { decoder })
    }

    /// Next header, or `None` at a clean end of stream.
    fn next_header(&mut self) -> Result<Option<EntryHeader>> {
        let mut len = [0u8; 4];
        let mut filled = 0;
        while filled < len.len() {
            let read = self.decoder.read(&mut len[filled..])?;
            if read == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(Error::Format("Truncated frame header".to_string()));
            }
            filled += read;
        }

        let len = u32::from_le_bytes(len);
        if len > MAX_HEADER_LEN {
            return Err(Error::Format(format!("Frame header too large: {} bytes", len)));
        }

        let mut data = vec![0u8; len as usize];
        self.decoder
            .read_exact(&mut data)
            .map_err(|_| Error::Format("Truncated frame header".to_string()))?;
        let header = bincode::deserialize(&data).map_err(|e| Error::Format(e.to_string()))?;
        Ok(Some(header))
    }

    fn copy_payload<W: Write>(&mut self, header: &EntryHeader, writer: &mut W) -> Result<()> {
        let copied = io::copy(&mut (&mut self.decoder).take(header.size), writer)?;
        if copied != header.size {
            return Err(Error::Format(format!("Truncated payload for {}", header.path)));
        }
        Ok(())
    }

    fn skip_payload(&mut self, header: &EntryHeader) -> Result<()> {
        self.copy_payload(header, &mut io::sink())
    }

    fn read_manifest_payload(&mut self, header: &EntryHeader) -> Result<Info> {
        let mut data = Vec::with_capacity(header.size as usize);
        self.copy_payload(header, &mut data)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

fn open(container: &Path) -> Result<Reader<BufReader<File>>> {
    let file = File::open(container).map_err(|e| Error::path(container, e))?;
    Reader::new(BufReader::new(file))
}

/// Reads the change information stored at the end of a container.
pub fn read_manifest(container: &Path) -> Result<Info> {
    let mut reader = open(container)?;
    while let Some(header) = reader.next_header()? {
        if header.kind == EntryKind::Manifest {
            return reader.read_manifest_payload(&header);
        }
        reader.skip_payload(&header)?;
    }
    Err(Error::Format("Archive has no manifest".to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Re-root every recorded absolute path under this directory.
    pub restore_root: Option<PathBuf>,
    pub skip_unmodified: bool,
    /// Change information used to decide which files can be skipped.
    pub recorded: Info,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub restored: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub directories: usize,
    pub bytes: u64,
}

fn target_path(restore_root: Option<&Path>, recorded: &str) -> Result<PathBuf> {
    let recorded = Path::new(recorded);
    if recorded.components().any(|c| c == Component::ParentDir) {
        return Err(Error::Format(format!(
            "Refusing to extract path with parent references: {}",
            recorded.display()
        )));
    }

    match restore_root {
        Some(root) => {
            let relative: PathBuf = recorded
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect();
            Ok(root.join(relative))
        }
        None => Ok(recorded.to_path_buf()),
    }
}

/// Restores every directory and file of a container.
pub fn extract(container: &Path, options: &ExtractOptions) -> Result<ExtractReport> {
    let mut reader = open(container)?;
    let mut report = ExtractReport::default();
    let mut directory_modes = Vec::new();
    let mut saw_manifest = false;

    while let Some(header) = reader.next_header()? {
        match header.kind {
            EntryKind::Manifest => {
                reader.skip_payload(&header)?;
                saw_manifest = true;
            }
            EntryKind::Directory => {
                let target = target_path(options.restore_root.as_deref(), &header.path)?;
                fs::create_dir_all(&target).map_err(|e| Error::path(&target, e))?;
                directory_modes.push((target, header.mode));
                report.directories += 1;
            }
            EntryKind::File => {
                let target = target_path(options.restore_root.as_deref(), &header.path)?;

                if options.skip_unmodified && is_unmodified(&target, &header.path, &options.recorded) {
                    debug!(path = %target.display(), "Skipping unmodified file");
                    reader.skip_payload(&header)?;
                    report.skipped.push(target);
                    continue;
                }

                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| Error::path(parent, e))?;
                }
                let mut file = File::create(&target).map_err(|e| Error::path(&target, e))?;
                reader.copy_payload(&header, &mut file)?;

                if let Some(mtime) = header.mtime {
                    file.set_modified(mtime.into())
                        .map_err(|e| Error::path(&target, e))?;
                }
                drop(file);
                set_mode(&target, header.mode)?;

                report.bytes += header.size;
                report.restored.push(target);
            }
        }
    }

    if !saw_manifest {
        return Err(Error::Format("Archive has no manifest".to_string()));
    }

    // Deepest first so a read-only parent does not block its children.
    for (path, mode) in directory_modes.into_iter().rev() {
        set_mode(&path, mode)?;
    }

    info!(
        restored = report.restored.len(),
        skipped = report.skipped.len(),
        bytes = report.bytes,
        "Extracted archive"
    );
    Ok(report)
}

fn is_unmodified(target: &Path, recorded_path: &str, recorded: &Info) -> bool {
    let Some(item) = recorded.get(recorded_path) else {
        return false;
    };
    if !target.is_file() {
        return false;
    }
    file_checksum(target).map(|sum| sum == item.checksum).unwrap_or(false)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| Error::path(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
