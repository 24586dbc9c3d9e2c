/// Production snapshots from Google Cloud
///
/// Production runs on Cloud Run with Cloud SQL and Secret Manager. The
/// database never leaves Cloud Storage: the snapshot records where the
/// export went, alongside the secrets and the provisioning state.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::catalog::StagedSnapshot;
use crate::core::error::BackupError;
use crate::core::snapshot::{Manifest, Provenance, SnapshotKind, SnapshotName};
use crate::utils::{DATABASE_EXPORT_FILE, REQUIRED_SECRETS, SECRETS_DIR, TERRAFORM_DIR};

/// Resolved Google Cloud settings for the production deployment
#[derive(Debug, Clone)]
pub struct GcpConfig {
    pub project_id: String,
    pub region: String,
    pub db_instance: String,
    pub database: String,
    pub export_bucket: String,
    pub service_name: String,
    pub terraform_dir: Option<PathBuf>,
}

impl GcpConfig {
    /// Where the Cloud SQL export for `snapshot` is written
    pub fn export_uri(&self, snapshot: &SnapshotName) -> String {
        format!(
            "gs://{}/{}/database.sql.gz",
            self.export_bucket.trim_start_matches("gs://").trim_end_matches('/'),
            snapshot
        )
    }
}

/// Reads the latest version of a named secret
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretReader: Send + Sync {
    async fn read_secret(&self, name: &str) -> Result<String>;
}

/// Exports the managed database to object storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseExporter: Send + Sync {
    async fn export_database(&self, uri: &str) -> Result<()>;
}

/// `gcloud` CLI wrapper
pub struct GcloudClient {
    config: GcpConfig,
}

impl GcloudClient {
    pub fn new(config: GcpConfig) -> Self {
        Self { config }
    }

    async fn gcloud(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "gcloud");

        let output = Command::new("gcloud")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run gcloud. Is the Google Cloud SDK installed?")?;

        if !output.status.success() {
            return Err(anyhow!(
                "gcloud {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Fail fast when there is no active gcloud login
    pub async fn check_authentication(&self) -> Result<()> {
        let token = self
            .gcloud(&["auth", "print-access-token"])
            .await
            .context("Not authenticated with Google Cloud; run `gcloud auth login`")?;

        if token.trim().is_empty() {
            return Err(anyhow!(
                "gcloud returned an empty access token; run `gcloud auth login`"
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl SecretReader for GcloudClient {
    async fn read_secret(&self, name: &str) -> Result<String> {
        let secret = format!("--secret={}", name);
        let project = format!("--project={}", self.config.project_id);
        self.gcloud(&["secrets", "versions", "access", "latest", &secret, &project])
            .await
    }
}

#[async_trait]
impl DatabaseExporter for GcloudClient {
    async fn export_database(&self, uri: &str) -> Result<()> {
        let database = format!("--database={}", self.config.database);
        let project = format!("--project={}", self.config.project_id);
        self.gcloud(&[
            "sql",
            "export",
            "sql",
            &self.config.db_instance,
            uri,
            &database,
            &project,
            "--quiet",
        ])
        .await?;
        Ok(())
    }
}

pub struct CloudSnapshotBridge<'a> {
    config: &'a GcpConfig,
    secrets: &'a dyn SecretReader,
    exporter: &'a dyn DatabaseExporter,
    provenance: Provenance,
}

impl<'a> CloudSnapshotBridge<'a> {
    pub fn new(
        config: &'a GcpConfig,
        secrets: &'a dyn SecretReader,
        exporter: &'a dyn DatabaseExporter,
        provenance: Provenance,
    ) -> Self {
        Self {
            config,
            secrets,
            exporter,
            provenance,
        }
    }

    /// Secrets, database export reference and provisioning state into `qitlalli_prod_<timestamp>/`
    pub async fn create_production_backup(&self, backup_root: &Path) -> Result<PathBuf, BackupError> {
        let name = SnapshotName::now(SnapshotKind::Production);
        let staged = StagedSnapshot::begin(backup_root, &name)?;

        info!(snapshot = %name, project = %self.config.project_id, "creating production backup");

        let secrets = self.capture_secrets(&name, staged.path()).await?;
        let uri = self.capture_database_export(&name, staged.path()).await?;
        let terraform = self.capture_terraform(&name, staged.path())?;

        let mut contents = vec![format!("{}/", SECRETS_DIR), DATABASE_EXPORT_FILE.to_string()];
        if !terraform.is_empty() {
            contents.push(format!("{}/", TERRAFORM_DIR));
        }

        let manifest = Manifest::new(SnapshotKind::Production, contents, &self.provenance)
            .with_extra("GCP Project", &self.config.project_id)
            .with_extra("Region", &self.config.region)
            .with_extra("Cloud SQL Instance", &self.config.db_instance)
            .with_extra("Cloud Run Service", &self.config.service_name)
            .with_extra("Database Export", &uri)
            .with_extra("Secrets", secrets.join(", "));
        manifest
            .write(staged.path())
            .map_err(|e| BackupError::extraction(&name, "manifest", e))?;

        staged.commit()
    }

    /// Read every required secret into `secrets/<name>.txt`.
    ///
    /// All secrets are attempted so the error can say exactly which ones failed.
    pub async fn capture_secrets(
        &self,
        snapshot: &SnapshotName,
        dir: &Path,
    ) -> Result<Vec<String>, BackupError> {
        let secrets_dir = dir.join(SECRETS_DIR);
        fs::create_dir_all(&secrets_dir).map_err(|e| BackupError::extraction(snapshot, "secrets", e))?;

        let mut saved = Vec::new();
        let mut failed = Vec::new();

        for name in REQUIRED_SECRETS {
            let result = match self.secrets.read_secret(name).await {
                Ok(value) => write_private(&secrets_dir.join(format!("{}.txt", name)), value.as_bytes()),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    debug!(snapshot = %snapshot, secret = *name, "secret saved");
                    saved.push(name.to_string());
                }
                Err(e) => {
                    warn!(snapshot = %snapshot, secret = *name, error = %e, "secret could not be read");
                    failed.push(format!("{} ({:#})", name, e));
                }
            }
        }

        if !failed.is_empty() {
            let succeeded = if saved.is_empty() {
                "none".to_string()
            } else {
                saved.join(", ")
            };
            return Err(BackupError::extraction(
                snapshot,
                "secrets",
                format!("failed: {}; succeeded: {}", failed.join(", "), succeeded),
            ));
        }

        info!(snapshot = %snapshot, count = saved.len(), "secrets saved");
        Ok(saved)
    }

    /// Start the Cloud SQL export and record its URI
    pub async fn capture_database_export(
        &self,
        snapshot: &SnapshotName,
        dir: &Path,
    ) -> Result<String, BackupError> {
        let uri = self.config.export_uri(snapshot);
        info!(snapshot = %snapshot, instance = %self.config.db_instance, uri = %uri, "exporting Cloud SQL database");

        self.exporter
            .export_database(&uri)
            .await
            .map_err(|e| BackupError::extraction(snapshot, "database export", e))?;

        fs::write(dir.join(DATABASE_EXPORT_FILE), format!("{}\n", uri))
            .map_err(|e| BackupError::extraction(snapshot, "database export", e))?;

        Ok(uri)
    }

    /// Copy `*.tf`, `*.tfvars` and `*.tfstate*` when a terraform directory is configured
    pub fn capture_terraform(
        &self,
        snapshot: &SnapshotName,
        dir: &Path,
    ) -> Result<Vec<String>, BackupError> {
        let Some(source) = self.config.terraform_dir.as_deref() else {
            return Ok(Vec::new());
        };
        if !source.is_dir() {
            warn!(snapshot = %snapshot, path = %source.display(), "terraform directory not found, skipping");
            return Ok(Vec::new());
        }

        let fail = |e: std::io::Error| BackupError::extraction(snapshot, "terraform", e);
        let dest = dir.join(TERRAFORM_DIR);
        let mut copied = Vec::new();

        let mut entries = fs::read_dir(source)
            .map_err(fail)?
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(fail)?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !entry.file_type().map_err(fail)?.is_file() || !is_provisioning_file(&file_name) {
                continue;
            }
            fs::create_dir_all(&dest).map_err(fail)?;
            fs::copy(entry.path(), dest.join(&file_name)).map_err(fail)?;
            copied.push(file_name);
        }

        info!(snapshot = %snapshot, files = copied.len(), "terraform state copied");
        Ok(copied)
    }
}

fn is_provisioning_file(name: &str) -> bool {
    name.ends_with(".tf") || name.ends_with(".tfvars") || name.contains(".tfstate")
}

/// Write a file readable only by the owner
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
