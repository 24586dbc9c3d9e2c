/// Snapshot identity, layout and manifest
///
/// A snapshot is named `<prefix>_<YYYYMMDD_HHMMSS>` and lives under the
/// backup root either as a directory, a flat `.sql` dump (database-only),
/// or a `.tar.gz` archive of a directory.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, Timelike};
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use crate::utils::{
    CONFIG_DIR, DATABASE_EXPORT_FILE, DATABASE_FILE, DB_ONLY_PREFIX, ENV_EXAMPLE_FILE, ENV_FILE,
    FILESTORE_FILE, FULL_PREFIX, MANIFEST_FILE, PRODUCTION_PREFIX, SECRETS_DIR, TIMESTAMP_FORMAT,
    VERSION_WITH_BUILD,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    /// Database, file store and configuration of the local stack
    Full,
    /// Database dump only
    DbOnly,
    /// Cloud SQL export reference, secrets and provisioning state
    Production,
}

impl SnapshotKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            SnapshotKind::Full => FULL_PREFIX,
            SnapshotKind::DbOnly => DB_ONLY_PREFIX,
            SnapshotKind::Production => PRODUCTION_PREFIX,
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            FULL_PREFIX => Some(SnapshotKind::Full),
            DB_ONLY_PREFIX => Some(SnapshotKind::DbOnly),
            PRODUCTION_PREFIX => Some(SnapshotKind::Production),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SnapshotKind::Full => "full",
            SnapshotKind::DbOnly => "db-only",
            SnapshotKind::Production => "production",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "full" => Some(SnapshotKind::Full),
            "db-only" => Some(SnapshotKind::DbOnly),
            "production" => Some(SnapshotKind::Production),
            _ => None,
        }
    }
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot identity: kind prefix plus a second-resolution local timestamp
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotName {
    kind: SnapshotKind,
    timestamp: NaiveDateTime,
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(full|db_only|qitlalli_prod)_(\d{8}_\d{6})$")
            .expect("snapshot name pattern is a valid regex")
    })
}

impl SnapshotName {
    pub fn new(kind: SnapshotKind, timestamp: NaiveDateTime) -> Self {
        // Names only carry whole seconds
        let timestamp = timestamp.with_nanosecond(0).unwrap_or(timestamp);
        Self { kind, timestamp }
    }

    /// Name for a snapshot created right now
    pub fn now(kind: SnapshotKind) -> Self {
        Self::new(kind, Local::now().naive_local())
    }

    /// Parse an identity such as `full_20250101_000000`
    pub fn parse(name: &str) -> Option<Self> {
        let caps = name_pattern().captures(name)?;
        let kind = SnapshotKind::from_prefix(&caps[1])?;
        let timestamp = NaiveDateTime::parse_from_str(&caps[2], TIMESTAMP_FORMAT).ok()?;
        Some(Self { kind, timestamp })
    }

    pub fn kind(&self) -> SnapshotKind {
        self.kind
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind.prefix(), self.timestamp.format(TIMESTAMP_FORMAT))
    }
}

/// Artifacts a snapshot directory of `kind` lacks. Empty means complete.
pub fn missing_artifacts(kind: SnapshotKind, dir: &Path) -> Vec<&'static str> {
    let mut missing = Vec::new();

    match kind {
        SnapshotKind::Full => {
            if !dir.join(DATABASE_FILE).is_file() {
                missing.push(DATABASE_FILE);
            }
            if !dir.join(FILESTORE_FILE).is_file() {
                missing.push(FILESTORE_FILE);
            }
            if !dir.join(CONFIG_DIR).is_dir() {
                missing.push(CONFIG_DIR);
            }
            if !dir.join(ENV_FILE).is_file() && !dir.join(ENV_EXAMPLE_FILE).is_file() {
                missing.push(ENV_FILE);
            }
        }
        SnapshotKind::DbOnly => {
            if !dir.join(DATABASE_FILE).is_file() {
                missing.push(DATABASE_FILE);
            }
        }
        SnapshotKind::Production => {
            if !dir.join(SECRETS_DIR).is_dir() {
                missing.push(SECRETS_DIR);
            }
            if !dir.join(DATABASE_EXPORT_FILE).is_file() {
                missing.push(DATABASE_EXPORT_FILE);
            }
        }
    }

    // The manifest is written last, so its absence marks an interrupted capture
    if !dir.join(MANIFEST_FILE).is_file() {
        missing.push(MANIFEST_FILE);
    }

    missing
}

/// Where a snapshot came from: tool build and deployed codebase revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub tool_version: String,
    pub revision: String,
    pub compose_version: Option<String>,
}

impl Provenance {
    pub fn unknown() -> Self {
        Self {
            tool_version: VERSION_WITH_BUILD.to_string(),
            revision: "unknown".to_string(),
            compose_version: None,
        }
    }

    /// Ask git and docker compose about the project; failures fall back to "unknown"
    pub async fn detect(project_root: &Path) -> Self {
        let revision = command_output("git", &["rev-parse", "HEAD"], project_root)
            .await
            .unwrap_or_else(|| "unknown".to_string());
        let compose_version =
            command_output("docker", &["compose", "version", "--short"], project_root).await;

        Self {
            tool_version: VERSION_WITH_BUILD.to_string(),
            revision,
            compose_version,
        }
    }
}

async fn command_output(program: &str, args: &[&str], dir: &Path) -> Option<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Descriptive record stored as BACKUP_INFO.txt
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub created: DateTime<FixedOffset>,
    pub kind: SnapshotKind,
    pub contents: Vec<String>,
    pub tool_version: String,
    pub revision: String,
    /// Additional provenance lines (compose version, cloud project, export URI)
    pub extra: Vec<(String, String)>,
}

const MANIFEST_TITLE: &str = "QiTlalli Backup Information";

impl Manifest {
    pub fn new(kind: SnapshotKind, contents: Vec<String>, provenance: &Provenance) -> Self {
        let mut extra = Vec::new();
        if let Some(version) = &provenance.compose_version {
            extra.push(("Compose version".to_string(), version.clone()));
        }

        Self {
            created: Local::now().fixed_offset(),
            kind,
            contents,
            tool_version: provenance.tool_version.clone(),
            revision: provenance.revision.clone(),
            extra,
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(MANIFEST_TITLE);
        out.push('\n');
        out.push_str(&"=".repeat(MANIFEST_TITLE.len()));
        out.push('\n');
        out.push_str(&format!("Created: {}\n", self.created.to_rfc3339()));
        out.push_str(&format!("Kind: {}\n", self.kind));
        out.push_str(&format!("Contents: {}\n", self.contents.join(", ")));
        out.push_str(&format!("Tool version: {}\n", self.tool_version));
        out.push_str(&format!("Revision: {}\n", self.revision));
        for (key, value) in &self.extra {
            out.push_str(&format!("{}: {}\n", key, value));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut created = None;
        let mut kind = None;
        let mut contents = Vec::new();
        let mut tool_version = String::new();
        let mut revision = String::new();
        let mut extra = Vec::new();

        for line in text.lines() {
            let Some((key, value)) = line.split_once(": ") else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "Created" => {
                    created = Some(
                        DateTime::parse_from_rfc3339(value)
                            .with_context(|| format!("Invalid creation time '{}'", value))?,
                    );
                }
                "Kind" => kind = SnapshotKind::from_label(value),
                "Contents" => {
                    contents = value
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect();
                }
                "Tool version" => tool_version = value.to_string(),
                "Revision" => revision = value.to_string(),
                other => extra.push((other.to_string(), value.to_string())),
            }
        }

        Ok(Self {
            created: created.ok_or_else(|| anyhow!("Manifest has no creation time"))?,
            kind: kind.ok_or_else(|| anyhow!("Manifest has no valid kind"))?,
            contents,
            tool_version,
            revision,
            extra,
        })
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        fs::write(&path, self.render())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn get_extra(&self, key: &str) -> Option<&str> {
        self.extra
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_snapshot_name_format_and_parse() {
        let name = SnapshotName::new(SnapshotKind::Full, ts(2025, 1, 2, 3, 4, 5));
        assert_eq!(name.to_string(), "full_20250102_030405");

        let parsed = SnapshotName::parse("full_20250102_030405").unwrap();
        assert_eq!(parsed, name);

        let prod = SnapshotName::parse("qitlalli_prod_20251231_235959").unwrap();
        assert_eq!(prod.kind(), SnapshotKind::Production);

        let db = SnapshotName::parse("db_only_20250601_120000").unwrap();
        assert_eq!(db.kind(), SnapshotKind::DbOnly);
    }

    #[test]
    fn test_snapshot_name_rejects_garbage() {
        assert!(SnapshotName::parse("full_2025").is_none());
        assert!(SnapshotName::parse("weekly_20250102_030405").is_none());
        assert!(SnapshotName::parse("full_20251340_000000").is_none());
        assert!(SnapshotName::parse("full_20250102_030405.tar.gz").is_none());
    }

    #[test]
    fn test_missing_artifacts_full() {
        let dir = TempDir::new().unwrap();
        let missing = missing_artifacts(SnapshotKind::Full, dir.path());
        assert_eq!(
            missing,
            vec![DATABASE_FILE, FILESTORE_FILE, CONFIG_DIR, ENV_FILE, MANIFEST_FILE]
        );

        fs::write(dir.path().join(DATABASE_FILE), "--").unwrap();
        fs::write(dir.path().join(FILESTORE_FILE), "").unwrap();
        fs::create_dir(dir.path().join(CONFIG_DIR)).unwrap();
        fs::write(dir.path().join(ENV_EXAMPLE_FILE), "").unwrap();
        assert_eq!(missing_artifacts(SnapshotKind::Full, dir.path()), vec![MANIFEST_FILE]);

        fs::write(dir.path().join(MANIFEST_FILE), "").unwrap();
        assert!(missing_artifacts(SnapshotKind::Full, dir.path()).is_empty());
    }

    #[test]
    fn test_manifest_render_parse() {
        let provenance = Provenance {
            tool_version: "0.4.0 (built: now)".to_string(),
            revision: "8f3a2c1".to_string(),
            compose_version: Some("2.29.1".to_string()),
        };
        let manifest = Manifest::new(
            SnapshotKind::Full,
            vec![DATABASE_FILE.to_string(), FILESTORE_FILE.to_string()],
            &provenance,
        )
        .with_extra("Note", "nightly");

        let text = manifest.render();
        assert!(text.starts_with(MANIFEST_TITLE));
        assert!(text.contains("Contents: database.sql, filestore.tar.gz"));

        let parsed = Manifest::parse(&text).unwrap();
        assert_eq!(parsed.kind, SnapshotKind::Full);
        assert_eq!(parsed.contents, manifest.contents);
        assert_eq!(parsed.revision, "8f3a2c1");
        assert_eq!(parsed.get_extra("Compose version"), Some("2.29.1"));
        assert_eq!(parsed.get_extra("Note"), Some("nightly"));
        assert_eq!(parsed.created, manifest.created);
    }

    #[test]
    fn test_manifest_requires_created_and_kind() {
        assert!(Manifest::parse("Kind: full\n").is_err());
        assert!(Manifest::parse("Created: 2025-01-01T00:00:00+00:00\n").is_err());
    }
}
