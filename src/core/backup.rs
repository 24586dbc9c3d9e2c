/// Backup creation for the local stack
///
/// Each capture writes one artifact into a staged snapshot directory. The
/// manifest goes in last and the directory is only renamed into the backup
/// root once everything succeeded; any failure discards the staging area.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::archive::pack_tree;
use crate::core::catalog::{ensure_name_free, StagedSnapshot};
use crate::core::error::BackupError;
use crate::core::snapshot::{Manifest, Provenance, SnapshotKind, SnapshotName};
use crate::core::stack::{DatabaseDumper, StackTarget};
use crate::utils::{
    copy_dir_all, CONFIG_DIR, DATABASE_FILE, ENV_EXAMPLE_FILE, ENV_FILE, FILESTORE_FILE,
    PARTIAL_SUFFIX, SQL_SUFFIX,
};

/// Manifest key recording that the env template stood in for `.env`
pub const ENV_SOURCE_KEY: &str = "Env Source";

/// One file produced by a capture step
#[derive(Debug, Clone)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Result of copying the stack configuration
#[derive(Debug, Clone)]
pub struct ConfigArtifact {
    /// Entry names as listed in the manifest (`config/`, `.env` or `.env.example`)
    pub names: Vec<String>,
    /// `.env` was absent and the template was copied instead
    pub used_env_example: bool,
}

/// Removes a half-written dump on drop unless it was renamed into place.
/// Also covers a capture future dropped mid-dump on Ctrl-C.
struct PartialFile<'p> {
    path: &'p Path,
    persisted: bool,
}

impl<'p> PartialFile<'p> {
    fn new(path: &'p Path) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn persisted(&mut self) {
        self.persisted = true;
    }
}

impl Drop for PartialFile<'_> {
    fn drop(&mut self) {
        if !self.persisted && self.path.exists() {
            let _ = fs::remove_file(self.path);
        }
    }
}

pub struct BackupManager<'a> {
    target: StackTarget,
    dumper: &'a dyn DatabaseDumper,
    provenance: Provenance,
}

impl<'a> BackupManager<'a> {
    pub fn new(target: StackTarget, dumper: &'a dyn DatabaseDumper, provenance: Provenance) -> Self {
        Self {
            target,
            dumper,
            provenance,
        }
    }

    /// Dump the live database to `dest`.
    ///
    /// The dump streams into a hidden temp file next to `dest` and is renamed
    /// only after the dump tool reports success.
    pub async fn capture_database(
        &self,
        snapshot: &SnapshotName,
        dest: &Path,
    ) -> Result<Artifact, BackupError> {
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| DATABASE_FILE.to_string());
        let partial = dest.with_file_name(format!(".{}{}", file_name, PARTIAL_SUFFIX));

        info!(snapshot = %snapshot, database = %self.target.database, "dumping database");

        let mut guard = PartialFile::new(&partial);
        let outcome = match self.dumper.dump(&partial).await {
            Ok(()) => match fs::metadata(&partial) {
                Ok(meta) if meta.len() > 0 => fs::rename(&partial, dest)
                    .map(|_| meta.len())
                    .map_err(anyhow::Error::from),
                Ok(_) => Err(anyhow::anyhow!("dump produced no output")),
                Err(e) => Err(anyhow::Error::from(e).context("dump file was not written")),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(size) => {
                guard.persisted();
                Ok(Artifact {
                    name: file_name,
                    path: dest.to_path_buf(),
                    size,
                })
            }
            Err(e) => Err(BackupError::extraction(snapshot, "database", e)),
        }
    }

    /// Archive the file store root into `<dir>/filestore.tar.gz`
    pub fn capture_filestore(
        &self,
        snapshot: &SnapshotName,
        dir: &Path,
    ) -> Result<Artifact, BackupError> {
        let root = &self.target.filestore_root;
        if !root.is_dir() {
            return Err(BackupError::extraction(
                snapshot,
                "filestore",
                format!("file store root {} does not exist", root.display()),
            ));
        }

        info!(snapshot = %snapshot, root = %root.display(), "archiving file store");

        let dest = dir.join(FILESTORE_FILE);
        let partial = dir.join(format!(".{}{}", FILESTORE_FILE, PARTIAL_SUFFIX));

        let written = pack_tree(root, Path::new(""), &partial)
            .and_then(|_| fs::rename(&partial, &dest))
            .and_then(|_| fs::metadata(&dest));

        match written {
            Ok(meta) => Ok(Artifact {
                name: FILESTORE_FILE.to_string(),
                path: dest,
                size: meta.len(),
            }),
            Err(e) => {
                let _ = fs::remove_file(&partial);
                Err(BackupError::extraction(snapshot, "filestore", e))
            }
        }
    }

    /// Copy the configuration directory and env file verbatim
    pub fn capture_config(
        &self,
        snapshot: &SnapshotName,
        dir: &Path,
    ) -> Result<ConfigArtifact, BackupError> {
        let fail = |e: std::io::Error| BackupError::extraction(snapshot, "config", e);
        let config_dest = dir.join(CONFIG_DIR);

        if self.target.config_dir.is_dir() {
            let copied = copy_dir_all(&self.target.config_dir, &config_dest).map_err(fail)?;
            info!(snapshot = %snapshot, files = copied, "copied configuration directory");
        } else {
            warn!(
                snapshot = %snapshot,
                path = %self.target.config_dir.display(),
                "configuration directory missing, snapshot will carry an empty config/"
            );
            fs::create_dir_all(&config_dest).map_err(fail)?;
        }

        let mut names = vec![format!("{}/", CONFIG_DIR)];
        let example = self.target.env_example_file();

        let used_env_example = if self.target.env_file.is_file() {
            fs::copy(&self.target.env_file, dir.join(ENV_FILE)).map_err(fail)?;
            names.push(ENV_FILE.to_string());
            false
        } else if example.is_file() {
            warn!(
                snapshot = %snapshot,
                "{} not found, backing up {} instead",
                self.target.env_file.display(),
                ENV_EXAMPLE_FILE
            );
            fs::copy(&example, dir.join(ENV_EXAMPLE_FILE)).map_err(fail)?;
            names.push(ENV_EXAMPLE_FILE.to_string());
            true
        } else {
            return Err(BackupError::extraction(
                snapshot,
                "config",
                format!(
                    "neither {} nor {} exists",
                    self.target.env_file.display(),
                    example.display()
                ),
            ));
        };

        Ok(ConfigArtifact {
            names,
            used_env_example,
        })
    }

    /// Write BACKUP_INFO.txt. Must be the last write into a snapshot directory.
    pub fn write_manifest(
        &self,
        snapshot: &SnapshotName,
        dir: &Path,
        contents: Vec<String>,
        extra: Vec<(&str, String)>,
    ) -> Result<Manifest, BackupError> {
        let manifest = extra.into_iter().fold(
            Manifest::new(snapshot.kind(), contents, &self.provenance)
                .with_extra("Database", &self.target.database),
            |manifest, (key, value)| manifest.with_extra(key, value),
        );
        manifest
            .write(dir)
            .map_err(|e| BackupError::extraction(snapshot, "manifest", e))?;
        Ok(manifest)
    }

    /// Database + file store + configuration into `full_<timestamp>/`
    pub async fn create_full_backup(&self, backup_root: &Path) -> Result<PathBuf, BackupError> {
        let name = SnapshotName::now(SnapshotKind::Full);
        let staged = StagedSnapshot::begin(backup_root, &name)?;

        info!(snapshot = %name, root = %backup_root.display(), "creating full backup");

        let database = self
            .capture_database(&name, &staged.path().join(DATABASE_FILE))
            .await?;
        let filestore = self.capture_filestore(&name, staged.path())?;
        let config = self.capture_config(&name, staged.path())?;

        let mut contents = vec![database.name, filestore.name];
        contents.extend(config.names);

        let mut extra = Vec::new();
        if config.used_env_example {
            extra.push((
                ENV_SOURCE_KEY,
                format!("{} (no {} at capture time)", ENV_EXAMPLE_FILE, ENV_FILE),
            ));
        }
        self.write_manifest(&name, staged.path(), contents, extra)?;

        staged.commit()
    }

    /// Database only, as a flat `db_only_<timestamp>.sql`
    pub async fn create_db_backup(&self, backup_root: &Path) -> Result<PathBuf, BackupError> {
        let name = SnapshotName::now(SnapshotKind::DbOnly);
        ensure_name_free(backup_root, &name)?;

        fs::create_dir_all(backup_root)
            .map_err(|e| BackupError::extraction(&name, "prepare", e))?;

        info!(snapshot = %name, root = %backup_root.display(), "creating database-only backup");

        let dest = backup_root.join(format!("{}{}", name, SQL_SUFFIX));
        let artifact = self.capture_database(&name, &dest).await?;
        Ok(artifact.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::{self, EntryKind};
    use crate::core::stack::MockDatabaseDumper;
    use crate::utils::MANIFEST_FILE;
    use tempfile::TempDir;

    struct Fixture {
        _project: TempDir,
        backups: TempDir,
        target: StackTarget,
    }

    fn fixture() -> Fixture {
        let project = TempDir::new().unwrap();
        let root = project.path();
        fs::create_dir_all(root.join("data/filestore/main_db/3f")).unwrap();
        fs::write(root.join("data/filestore/main_db/3f/report.pdf"), b"%PDF-1.4 report").unwrap();
        fs::create_dir_all(root.join("config")).unwrap();
        fs::write(root.join("config/odoo.conf"), "[options]\nadmin_passwd = x\n").unwrap();
        fs::write(root.join(".env"), "POSTGRES_USER=odoo\n").unwrap();

        let target = StackTarget {
            project_root: root.to_path_buf(),
            db_service: "db".to_string(),
            app_service: "odoo".to_string(),
            db_user: "odoo".to_string(),
            database: "odoo".to_string(),
            filestore_root: root.join("data/filestore"),
            config_dir: root.join("config"),
            env_file: root.join(".env"),
            access_url: "http://localhost:8069".to_string(),
        };

        Fixture {
            _project: project,
            backups: TempDir::new().unwrap(),
            target,
        }
    }

    fn writing_dumper() -> MockDatabaseDumper {
        let mut dumper = MockDatabaseDumper::new();
        dumper.expect_dump().returning(|out| {
            fs::write(out, "CREATE TABLE patients (id int);\n")?;
            Ok(())
        });
        dumper
    }

    #[tokio::test]
    async fn test_full_backup_layout() {
        let fx = fixture();
        let dumper = writing_dumper();
        let manager = BackupManager::new(fx.target.clone(), &dumper, Provenance::unknown());

        let path = manager.create_full_backup(fx.backups.path()).await.unwrap();

        assert!(path.join(DATABASE_FILE).is_file());
        assert!(path.join(FILESTORE_FILE).is_file());
        assert!(path.join("config/odoo.conf").is_file());
        assert!(path.join(ENV_FILE).is_file());

        let manifest = Manifest::read(&path).unwrap();
        assert_eq!(manifest.kind, SnapshotKind::Full);
        assert_eq!(manifest.get_extra(ENV_SOURCE_KEY), None);
        assert_eq!(
            manifest.contents,
            vec!["database.sql", "filestore.tar.gz", "config/", ".env"]
        );

        let listed: Vec<_> = catalog::list(fx.backups.path()).collect();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, EntryKind::Full);
    }

    #[tokio::test]
    async fn test_failed_dump_leaves_nothing_behind() {
        let fx = fixture();
        let mut dumper = MockDatabaseDumper::new();
        dumper.expect_dump().returning(|out| {
            // partial output, then the tool dies
            fs::write(out, "CREATE TABLE pat")?;
            Err(anyhow::anyhow!("pg_dump exited with status 1"))
        });
        let manager = BackupManager::new(fx.target.clone(), &dumper, Provenance::unknown());

        let err = manager.create_full_backup(fx.backups.path()).await.unwrap_err();

        match &err {
            BackupError::Extraction { step, reason, .. } => {
                assert_eq!(*step, "database");
                assert!(reason.contains("status 1"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read_dir(fx.backups.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_dump_is_an_error() {
        let fx = fixture();
        let mut dumper = MockDatabaseDumper::new();
        dumper.expect_dump().returning(|out| {
            fs::write(out, "")?;
            Ok(())
        });
        let manager = BackupManager::new(fx.target.clone(), &dumper, Provenance::unknown());

        let err = manager.create_db_backup(fx.backups.path()).await.unwrap_err();
        assert!(err.to_string().contains("no output"));
        assert_eq!(fs::read_dir(fx.backups.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_filestore_aborts_backup() {
        let fx = fixture();
        fs::remove_dir_all(&fx.target.filestore_root).unwrap();
        let dumper = writing_dumper();
        let manager = BackupManager::new(fx.target.clone(), &dumper, Provenance::unknown());

        let err = manager.create_full_backup(fx.backups.path()).await.unwrap_err();
        assert!(matches!(err, BackupError::Extraction { step: "filestore", .. }));
        assert_eq!(catalog::list(fx.backups.path()).count(), 0);
    }

    #[tokio::test]
    async fn test_env_example_substitution() {
        let fx = fixture();
        fs::remove_file(&fx.target.env_file).unwrap();
        fs::write(fx.target.env_example_file(), "POSTGRES_USER=changeme\n").unwrap();
        let dumper = writing_dumper();
        let manager = BackupManager::new(fx.target.clone(), &dumper, Provenance::unknown());

        let path = manager.create_full_backup(fx.backups.path()).await.unwrap();

        assert!(!path.join(ENV_FILE).exists());
        assert!(path.join(ENV_EXAMPLE_FILE).is_file());

        let manifest = Manifest::read(&path).unwrap();
        assert!(manifest.contents.contains(&ENV_EXAMPLE_FILE.to_string()));
        assert_eq!(
            manifest.get_extra(ENV_SOURCE_KEY),
            Some(".env.example (no .env at capture time)")
        );
    }

    /// Dumper that writes some output and then never finishes
    struct HangingDumper;

    #[async_trait::async_trait]
    impl DatabaseDumper for HangingDumper {
        async fn dump(&self, out: &Path) -> anyhow::Result<()> {
            fs::write(out, "CREATE TABLE patients (id int);\n")?;
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_abandoned_capture_cleans_up() {
        let fx = fixture();
        let manager = BackupManager::new(fx.target.clone(), &HangingDumper, Provenance::unknown());
        let limit = std::time::Duration::from_millis(50);

        let full = tokio::time::timeout(limit, manager.create_full_backup(fx.backups.path())).await;
        assert!(full.is_err());
        let db_only = tokio::time::timeout(limit, manager.create_db_backup(fx.backups.path())).await;
        assert!(db_only.is_err());

        assert_eq!(fs::read_dir(fx.backups.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_db_only_backup_is_flat_file() {
        let fx = fixture();
        let dumper = writing_dumper();
        let manager = BackupManager::new(fx.target.clone(), &dumper, Provenance::unknown());

        let path = manager.create_db_backup(fx.backups.path()).await.unwrap();

        assert_eq!(path.parent(), Some(fx.backups.path()));
        assert!(path.to_string_lossy().ends_with(".sql"));
        let listed: Vec<_> = catalog::list(fx.backups.path()).collect();
        assert_eq!(listed[0].kind, EntryKind::DbOnly);
    }
}
