/// Snapshot catalog: the backup root as a repository
///
/// Every function takes the backup root explicitly. Nothing is cached; each
/// call reads the directory again, so results always reflect what is on disk.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::error::BackupError;
use crate::core::snapshot::{missing_artifacts, SnapshotKind, SnapshotName};
use crate::utils::{path_size, ARCHIVE_SUFFIX, PARTIAL_SUFFIX, SQL_SUFFIX};

/// How a backup-root entry is classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Full,
    DbOnly,
    Production,
    /// Compressed form of a snapshot directory
    Archive(SnapshotKind),
    /// Directory lacking its manifest or a required artifact
    Incomplete(SnapshotKind),
}

impl EntryKind {
    fn complete(kind: SnapshotKind) -> Self {
        match kind {
            SnapshotKind::Full => EntryKind::Full,
            SnapshotKind::DbOnly => EntryKind::DbOnly,
            SnapshotKind::Production => EntryKind::Production,
        }
    }

    /// Whether the local restore sequencer can replay this entry
    pub fn is_restorable(&self) -> bool {
        matches!(
            self,
            EntryKind::Full
                | EntryKind::DbOnly
                | EntryKind::Archive(SnapshotKind::Full)
                | EntryKind::Archive(SnapshotKind::DbOnly)
        )
    }

    pub fn label(&self) -> String {
        match self {
            EntryKind::Full => "full".to_string(),
            EntryKind::DbOnly => "db-only".to_string(),
            EntryKind::Production => "production".to_string(),
            EntryKind::Archive(kind) => format!("archive ({})", kind),
            EntryKind::Incomplete(kind) => format!("incomplete ({})", kind),
        }
    }

    /// Lower sorts first when several entries share an identity
    fn resolve_rank(&self) -> u8 {
        match self {
            EntryKind::Full | EntryKind::Production | EntryKind::Incomplete(_) => 0,
            EntryKind::DbOnly => 1,
            EntryKind::Archive(_) => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotDescriptor {
    pub name: SnapshotName,
    pub kind: EntryKind,
    pub path: PathBuf,
    /// Artifacts an incomplete directory lacks
    pub missing: Vec<&'static str>,
    /// Hidden staging entry left behind by a capture that never committed
    pub staged: bool,
}

impl SnapshotDescriptor {
    pub fn identity(&self) -> String {
        self.name.to_string()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.identity())
    }

    pub fn is_dir(&self) -> bool {
        self.path.is_dir()
    }

    pub fn size_bytes(&self) -> u64 {
        path_size(&self.path)
    }
}

/// Classify a single path; `None` for anything that is not a snapshot
pub fn inspect(path: &Path) -> Option<SnapshotDescriptor> {
    let file_name = path.file_name()?.to_str()?;

    if let Some(hidden) = file_name.strip_prefix('.') {
        return inspect_staged(path, hidden);
    }

    let metadata = fs::metadata(path).ok()?;

    if metadata.is_dir() {
        let name = SnapshotName::parse(file_name)?;
        let missing = missing_artifacts(name.kind(), path);
        let kind = if missing.is_empty() {
            EntryKind::complete(name.kind())
        } else {
            EntryKind::Incomplete(name.kind())
        };
        return Some(SnapshotDescriptor {
            name,
            kind,
            path: path.to_path_buf(),
            missing,
            staged: false,
        });
    }

    if let Some(stem) = file_name.strip_suffix(ARCHIVE_SUFFIX) {
        let name = SnapshotName::parse(stem)?;
        return Some(SnapshotDescriptor {
            kind: EntryKind::Archive(name.kind()),
            name,
            path: path.to_path_buf(),
            missing: Vec::new(),
            staged: false,
        });
    }

    if let Some(stem) = file_name.strip_suffix(SQL_SUFFIX) {
        let name = SnapshotName::parse(stem)?;
        if name.kind() == SnapshotKind::DbOnly {
            return Some(SnapshotDescriptor {
                name,
                kind: EntryKind::DbOnly,
                path: path.to_path_buf(),
                missing: Vec::new(),
                staged: false,
            });
        }
    }

    None
}

/// `.<name>.partial` directories and `.<db_only>.sql.partial` dumps are what
/// an interrupted capture leaves behind; they are always incomplete. Other
/// hidden entries (archive temp files, extraction scratch) are ignored.
fn inspect_staged(path: &Path, hidden: &str) -> Option<SnapshotDescriptor> {
    let identity = hidden.strip_suffix(PARTIAL_SUFFIX)?;
    let metadata = fs::metadata(path).ok()?;

    let (name, missing) = if metadata.is_dir() {
        let name = SnapshotName::parse(identity)?;
        let missing = missing_artifacts(name.kind(), path);
        (name, missing)
    } else {
        let name = SnapshotName::parse(identity.strip_suffix(SQL_SUFFIX)?)?;
        if name.kind() != SnapshotKind::DbOnly {
            return None;
        }
        (name, Vec::new())
    };

    Some(SnapshotDescriptor {
        kind: EntryKind::Incomplete(name.kind()),
        name,
        path: path.to_path_buf(),
        missing,
        staged: true,
    })
}

/// Lazy enumeration of a backup root. Iteration order follows the filesystem.
pub struct Snapshots {
    entries: Option<fs::ReadDir>,
}

impl Iterator for Snapshots {
    type Item = SnapshotDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.entries.as_mut()?.next()?;
            let Ok(entry) = entry else {
                continue;
            };
            if let Some(descriptor) = inspect(&entry.path()) {
                return Some(descriptor);
            }
        }
    }
}

/// Enumerate snapshots under `backup_root`. A missing root is simply empty.
pub fn list(backup_root: &Path) -> Snapshots {
    Snapshots {
        entries: fs::read_dir(backup_root).ok(),
    }
}

/// `list`, collected and sorted by identity then file name
pub fn list_sorted(backup_root: &Path) -> Vec<SnapshotDescriptor> {
    let mut snapshots: Vec<_> = list(backup_root).collect();
    snapshots.sort_by(|a, b| {
        a.name
            .timestamp()
            .cmp(&b.name.timestamp())
            .then_with(|| a.file_name().cmp(&b.file_name()))
    });
    snapshots
}

/// Locate an operator-supplied snapshot identifier.
///
/// Accepts an exact entry name (`full_20250101_000000.tar.gz`), a bare identity
/// (`full_20250101_000000`) or a path whose last component is one of those.
/// When an identity matches several entries, the directory wins over the flat
/// dump, and both win over the archive. Staging leftovers come last.
pub fn resolve(backup_root: &Path, requested: &str) -> Result<SnapshotDescriptor, BackupError> {
    let wanted = Path::new(requested.trim())
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut candidates: Vec<SnapshotDescriptor> = list(backup_root)
        .filter(|d| !wanted.is_empty() && (d.file_name() == wanted || d.identity() == wanted))
        .collect();

    candidates.sort_by_key(|d| (d.file_name() != wanted, d.staged, d.kind.resolve_rank()));

    if let Some(found) = candidates.into_iter().next() {
        debug!(snapshot = %found.identity(), kind = %found.kind.label(), "resolved snapshot");
        return Ok(found);
    }

    // Offer restorable snapshots of the same kind, or everything restorable
    let wanted_kind = [SnapshotKind::Full, SnapshotKind::DbOnly, SnapshotKind::Production]
        .into_iter()
        .find(|k| wanted.starts_with(&format!("{}_", k.prefix())));

    let available = list_sorted(backup_root)
        .into_iter()
        .filter(|d| d.kind.is_restorable())
        .filter(|d| wanted_kind.map_or(true, |k| d.name.kind() == k))
        .map(|d| d.file_name())
        .collect();

    Err(BackupError::NotFound {
        requested: requested.to_string(),
        root: backup_root.to_path_buf(),
        available,
    })
}

/// `resolve`, restricted to compressed snapshots. A bare identity picks the
/// archive even when the directory it was made from is still present.
pub fn resolve_archive(backup_root: &Path, requested: &str) -> Result<SnapshotDescriptor, BackupError> {
    let trimmed = requested.trim();
    if !trimmed.ends_with(ARCHIVE_SUFFIX) {
        if let Ok(found) = resolve(backup_root, &format!("{}{}", trimmed, ARCHIVE_SUFFIX)) {
            return Ok(found);
        }
    }

    let found = resolve(backup_root, requested)?;
    match found.kind {
        EntryKind::Archive(_) => Ok(found),
        other => Err(BackupError::archive(
            found.identity(),
            format!("{} is a {} entry, not an archive", found.file_name(), other.label()),
        )),
    }
}

/// A snapshot directory under construction.
///
/// Artifacts are written into a hidden staging directory. `commit` renames it
/// into place; dropping an uncommitted snapshot removes the staging directory
/// and everything in it. A process killed mid-capture never drops it, so the
/// catalog lists a leftover staging directory as incomplete.
#[derive(Debug)]
pub struct StagedSnapshot {
    name: SnapshotName,
    staging: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedSnapshot {
    /// Allocate staging space for `name`. Fails closed if the name is taken.
    pub fn begin(backup_root: &Path, name: &SnapshotName) -> Result<Self, BackupError> {
        let identity = name.to_string();
        let target = backup_root.join(&identity);
        let staging = backup_root.join(format!(".{}{}", identity, PARTIAL_SUFFIX));

        ensure_name_free(backup_root, name)?;

        fs::create_dir_all(backup_root)
            .map_err(|e| BackupError::extraction(&identity, "prepare", e))?;

        // create_dir (not create_dir_all) so a concurrent run with the same name fails
        fs::create_dir(&staging).map_err(|e| {
            BackupError::extraction(
                &identity,
                "prepare",
                format!("cannot create staging directory {}: {}", staging.display(), e),
            )
        })?;

        Ok(Self {
            name: name.clone(),
            staging,
            target,
            committed: false,
        })
    }

    pub fn name(&self) -> &SnapshotName {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.staging
    }

    /// Move the finished snapshot into place and return its final path
    pub fn commit(mut self) -> Result<PathBuf, BackupError> {
        let identity = self.name.to_string();

        if self.target.exists() {
            return Err(BackupError::extraction(
                &identity,
                "commit",
                format!("{} appeared while the backup was running", self.target.display()),
            ));
        }

        fs::rename(&self.staging, &self.target)
            .map_err(|e| BackupError::extraction(&identity, "commit", e))?;
        self.committed = true;

        info!(snapshot = %identity, path = %self.target.display(), "snapshot committed");
        Ok(self.target.clone())
    }
}

impl Drop for StagedSnapshot {
    fn drop(&mut self) {
        if !self.committed && self.staging.exists() {
            debug!(path = %self.staging.display(), "removing abandoned staging directory");
            let _ = fs::remove_dir_all(&self.staging);
        }
    }
}

/// Fail if any entry (directory, dump or archive) already uses this identity
pub fn ensure_name_free(backup_root: &Path, name: &SnapshotName) -> Result<(), BackupError> {
    let identity = name.to_string();
    let taken = [
        backup_root.join(&identity),
        backup_root.join(format!("{}{}", identity, SQL_SUFFIX)),
        backup_root.join(format!("{}{}", identity, ARCHIVE_SUFFIX)),
    ]
    .into_iter()
    .find(|p| p.exists());

    match taken {
        Some(path) => Err(BackupError::extraction(
            &identity,
            "prepare",
            format!("{} already exists; refusing to overwrite", path.display()),
        )),
        None => Ok(()),
    }
}

/// Remove a snapshot entry. Only entries directly inside `backup_root` are accepted.
pub fn delete(backup_root: &Path, snapshot: &SnapshotDescriptor) -> std::io::Result<()> {
    if snapshot.path.parent() != Some(backup_root) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "{} is not inside backup root {}",
                snapshot.path.display(),
                backup_root.display()
            ),
        ));
    }

    if snapshot.path.is_dir() {
        fs::remove_dir_all(&snapshot.path)?;
    } else {
        fs::remove_file(&snapshot.path)?;
    }

    info!(snapshot = %snapshot.identity(), path = %snapshot.path.display(), "snapshot deleted");
    Ok(())
}
