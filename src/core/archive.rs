/// Snapshot archiving (tar + gzip)
///
/// Archives are built and unpacked as streams through buffered files, so a
/// multi-gigabyte file store never has to fit in memory.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tracing::{debug, info};

use crate::core::error::BackupError;
use crate::core::snapshot::{missing_artifacts, SnapshotName};
use crate::utils::{sha256_file, ARCHIVE_SUFFIX, PARTIAL_SUFFIX};

/// Compress a snapshot directory into `<parent>/<name>.tar.gz`.
///
/// The archive holds a single top-level `<name>/` directory. An existing
/// archive with the same name is replaced atomically.
pub fn compress(snapshot_dir: &Path) -> Result<PathBuf, BackupError> {
    let name = snapshot_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if name.is_empty() || !snapshot_dir.is_dir() {
        return Err(BackupError::archive(
            display_name(&name, snapshot_dir),
            format!("source directory {} does not exist", snapshot_dir.display()),
        ));
    }

    let is_empty = fs::read_dir(snapshot_dir)
        .map(|mut entries| entries.next().is_none())
        .map_err(|e| BackupError::archive(&name, e))?;
    if is_empty {
        return Err(BackupError::archive(
            &name,
            format!("source directory {} is empty", snapshot_dir.display()),
        ));
    }

    let parent = snapshot_dir.parent().unwrap_or_else(|| Path::new("."));
    let archive_path = parent.join(format!("{}{}", name, ARCHIVE_SUFFIX));
    let temp_path = parent.join(format!(".{}{}{}", name, ARCHIVE_SUFFIX, PARTIAL_SUFFIX));

    info!(snapshot = %name, archive = %archive_path.display(), "compressing snapshot");

    let written = pack_tree(snapshot_dir, Path::new(&name), &temp_path)
        .and_then(|_| fs::rename(&temp_path, &archive_path));

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(BackupError::archive(&name, e));
    }

    Ok(archive_path)
}

/// Extract `<name>.tar.gz` next to itself, yielding `<name>/`.
///
/// The archive is unpacked into a hidden staging directory first and only
/// renamed into place once it is known to contain a complete snapshot.
pub fn extract(archive_path: &Path) -> Result<PathBuf, BackupError> {
    let file_name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let Some(name) = file_name.strip_suffix(ARCHIVE_SUFFIX).map(str::to_string) else {
        return Err(BackupError::archive(
            display_name(&file_name, archive_path),
            format!("{} does not end in {}", archive_path.display(), ARCHIVE_SUFFIX),
        ));
    };

    if !archive_path.is_file() {
        return Err(BackupError::archive(
            &name,
            format!("archive {} does not exist", archive_path.display()),
        ));
    }

    let snapshot_name = SnapshotName::parse(&name).ok_or_else(|| {
        BackupError::archive(&name, format!("'{}' is not a snapshot name", name))
    })?;

    let parent = archive_path.parent().unwrap_or_else(|| Path::new("."));
    let target = parent.join(&name);
    if target.exists() {
        return Err(BackupError::archive(
            &name,
            format!(
                "{} already exists; remove it or restore from the directory instead",
                target.display()
            ),
        ));
    }

    let staging = parent.join(format!(".{}.extracting", name));
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|e| BackupError::archive(&name, e))?;
    }
    fs::create_dir(&staging).map_err(|e| BackupError::archive(&name, e))?;

    info!(snapshot = %name, archive = %archive_path.display(), "extracting archive");

    let result = unpack_into(archive_path, &staging)
        .map_err(|e| BackupError::archive(&name, format!("archive is unreadable: {}", e)))
        .and_then(|_| verify_layout(&staging, &snapshot_name))
        .and_then(|extracted| {
            fs::rename(&extracted, &target).map_err(|e| BackupError::archive(&name, e))
        });

    let _ = fs::remove_dir_all(&staging);
    result.map(|_| target)
}

/// The staging directory must hold exactly `<name>/` with a complete layout
fn verify_layout(staging: &Path, name: &SnapshotName) -> Result<PathBuf, BackupError> {
    let identity = name.to_string();

    let entries: Vec<String> = fs::read_dir(staging)
        .map_err(|e| BackupError::archive(&identity, e))?
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();

    if entries != [identity.clone()] {
        return Err(BackupError::archive(
            &identity,
            format!(
                "expected a single top-level directory '{}', found [{}]",
                identity,
                entries.join(", ")
            ),
        ));
    }

    let extracted = staging.join(&identity);
    if !extracted.is_dir() {
        return Err(BackupError::archive(&identity, "top-level entry is not a directory"));
    }

    let missing = missing_artifacts(name.kind(), &extracted);
    if !missing.is_empty() {
        return Err(BackupError::archive(
            &identity,
            format!("extracted snapshot is missing {}", missing.join(", ")),
        ));
    }

    Ok(extracted)
}

/// Write `src` as a gzip tarball at `out`, entries named under `prefix`.
/// An empty prefix puts the directory's contents at the archive root.
pub fn pack_tree(src: &Path, prefix: &Path, out: &Path) -> io::Result<()> {
    let file = File::create(out)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    if !prefix.as_os_str().is_empty() {
        builder.append_dir(prefix, src)?;
    }
    append_tree(&mut builder, src, prefix)?;

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Recursively add a directory's entries in sorted order
fn append_tree<W: Write>(builder: &mut Builder<W>, dir: &Path, prefix: &Path) -> io::Result<()> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = prefix.join(entry.file_name());

        if entry.file_type()?.is_dir() {
            builder.append_dir(&name, &path)?;
            append_tree(builder, &path, &name)?;
        } else {
            debug!(entry = %name.display(), "adding to archive");
            builder.append_path_with_name(&path, &name)?;
        }
    }

    Ok(())
}

/// Unpack a gzip tarball into `dest`. Entries escaping `dest` are rejected by tar.
pub fn unpack_into(archive_path: &Path, dest: &Path) -> io::Result<()> {
    let file = File::open(archive_path)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let mut archive = Archive::new(decoder);
    archive.set_preserve_mtime(true);
    archive.unpack(dest)
}

/// Check that `archive_path` holds every file of `snapshot_dir` with identical content.
/// Returns the number of files compared.
pub fn verify(archive_path: &Path, snapshot_dir: &Path) -> Result<usize, BackupError> {
    let name = snapshot_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let fail = |e: io::Error| BackupError::archive(&name, e);

    let mut expected = BTreeMap::new();
    collect_hashes(snapshot_dir, Path::new(&name), &mut expected).map_err(fail)?;

    let file = File::open(archive_path).map_err(fail)?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut found = BTreeMap::new();

    for entry in archive.entries().map_err(fail)? {
        let mut entry = entry.map_err(fail)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(fail)?.into_owned();
        let mut hasher = Sha256::new();
        io::copy(&mut entry, &mut hasher).map_err(fail)?;
        found.insert(path, format!("{:x}", hasher.finalize()));
    }

    if let Some((path, _)) = expected.iter().find(|(path, hash)| found.get(*path) != Some(*hash)) {
        return Err(BackupError::archive(
            &name,
            format!("{} is missing or differs in {}", path.display(), archive_path.display()),
        ));
    }
    if found.len() != expected.len() {
        return Err(BackupError::archive(
            &name,
            format!(
                "{} holds {} files, source has {}",
                archive_path.display(),
                found.len(),
                expected.len()
            ),
        ));
    }

    debug!(snapshot = %name, files = expected.len(), "archive verified");
    Ok(expected.len())
}

fn collect_hashes(dir: &Path, prefix: &Path, out: &mut BTreeMap<PathBuf, String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = prefix.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_hashes(&entry.path(), &name, out)?;
        } else if file_type.is_file() {
            out.insert(name, sha256_file(entry.path())?);
        }
    }
    Ok(())
}

fn display_name(name: &str, path: &Path) -> String {
    if name.is_empty() {
        path.display().to_string()
    } else {
        name.to_string()
    }
}
