//! Job workspace staging and packing.
//!
//! Blob payloads land in the sandbox workspace before it starts: zip
//! archives are unpacked (a lone top-level directory is flattened away),
//! plain files and directories are copied. When a sandbox exits, its
//! workspace is packed into a zip artifact whose digest is reported back to
//! the requester.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::error::{SandboxError, SandboxResult};

/// Installed with pip before the job command when present.
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// Packed workspace of a finished sandbox, kept on the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    /// Hex sha256 of the zip file.
    pub sha256: String,
    pub size_bytes: u64,
}

impl Artifact {
    pub fn output_ref(&self) -> String {
        format!("sha256:{}", self.sha256)
    }
}

/// Zip by extension or by magic bytes.
pub fn is_zip(path: &Path) -> bool {
    let by_name = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
    if by_name {
        return true;
    }
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .is_ok_and(|()| magic == ZIP_MAGIC)
}

/// Put a payload into `workspace`. Fails when nothing usable was staged.
pub fn stage_payload(src: &Path, workspace: &Path) -> SandboxResult<()> {
    if !src.exists() {
        return Err(SandboxError::Payload(format!(
            "payload not found: {}",
            src.display()
        )));
    }
    if src.is_file() && is_zip(src) {
        extract_zip(src, workspace)?;
        flatten_single_root(workspace)?;
    } else {
        copy_into(src, workspace)?;
    }
    if std::fs::read_dir(workspace)?.next().is_none() {
        return Err(SandboxError::Payload(format!(
            "workspace empty after staging {}",
            src.display()
        )));
    }
    Ok(())
}

/// Unpack `archive` into `dest`, refusing entries that would escape it.
/// Returns the number of files written.
pub fn extract_zip(archive: &Path, dest: &Path) -> SandboxResult<usize> {
    let bad = |e: zip::result::ZipError| {
        SandboxError::Payload(format!("unreadable zip {}: {e}", archive.display()))
    };
    let mut zip = ZipArchive::new(File::open(archive)?).map_err(bad)?;
    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(bad)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(SandboxError::Payload(format!(
                "zip entry {} escapes the workspace",
                entry.name()
            )));
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        files += 1;
    }
    Ok(files)
}

/// Archives that wrap everything in one folder run from inside it.
pub fn flatten_single_root(dir: &Path) -> io::Result<()> {
    let entries: Vec<_> = std::fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    let [only] = entries.as_slice() else {
        return Ok(());
    };
    if !only.file_type()?.is_dir() {
        return Ok(());
    }
    // moved aside first so a child sharing its name can take its place
    let top = dir.join(".gpulend-unpack");
    std::fs::rename(only.path(), &top)?;
    for child in std::fs::read_dir(&top)? {
        let child = child?;
        std::fs::rename(child.path(), dir.join(child.file_name()))?;
    }
    std::fs::remove_dir(&top)
}

/// Copy a file, or a directory's contents, into `dest`.
pub fn copy_into(src: &Path, dest: &Path) -> SandboxResult<()> {
    if src.is_file() {
        let name = src
            .file_name()
            .ok_or_else(|| SandboxError::Payload(format!("bad payload path {}", src.display())))?;
        std::fs::copy(src, dest.join(name))?;
        return Ok(());
    }
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_into(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Zip the contents of `workspace` into `dest` and digest the result.
pub fn pack_workspace(workspace: &Path, dest: &Path) -> SandboxResult<Artifact> {
    let archive_err = |e: zip::result::ZipError| SandboxError::Archive(e.to_string());
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = ZipWriter::new(File::create(dest)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut pending = vec![workspace.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries: Vec<_> = std::fs::read_dir(&dir)?.collect::<io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            let name = zip_name(workspace, &path)?;
            let kind = entry.file_type()?;
            if kind.is_dir() {
                writer.add_directory(name, options).map_err(archive_err)?;
                pending.push(path);
            } else if kind.is_file() {
                writer.start_file(name, options).map_err(archive_err)?;
                io::copy(&mut File::open(&path)?, &mut writer)?;
            }
        }
    }
    writer.finish().map_err(archive_err)?.flush()?;

    let mut hasher = Sha256::new();
    let size_bytes = io::copy(&mut File::open(dest)?, &mut hasher)?;
    Ok(Artifact {
        path: dest.to_path_buf(),
        sha256: hex::encode(hasher.finalize()),
        size_bytes,
    })
}

/// Forward-slash path of `path` relative to `root`.
fn zip_name(root: &Path, path: &Path) -> SandboxResult<String> {
    let relative = path
        .strip_prefix(root)
        .map_err(|e| SandboxError::Archive(e.to_string()))?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}
