/// Settings resolution
///
/// Combines the user config file, environment, the project's `.env` and
/// command-line overrides into one resolved view of the stack.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::cloud::GcpConfig;
use crate::core::stack::StackTarget;
use crate::utils::{
    get_project_root, AppConfig, DEFAULT_ACCESS_URL, DEFAULT_APP_SERVICE, DEFAULT_BACKUP_DIR,
    DEFAULT_CONFIG_DIR, DEFAULT_DATABASE, DEFAULT_DB_SERVICE, DEFAULT_DB_USER,
    DEFAULT_FILESTORE_DIR, DEFAULT_GCP_DB_INSTANCE, DEFAULT_GCP_REGION, DEFAULT_GCP_SERVICE,
    DEFAULT_SETTLE, ENV_FILE,
};

/// Read-only view of a project's `.env`
pub struct ConfigManager {
    env_file: PathBuf,
    values: HashMap<String, String>,
}

impl ConfigManager {
    /// Parse `env_file`; a missing file is an empty configuration
    pub fn load<P: AsRef<Path>>(env_file: P) -> Result<Self> {
        let env_file = env_file.as_ref().to_path_buf();
        let mut values = HashMap::new();

        if env_file.is_file() {
            let iter = dotenv::from_path_iter(&env_file)
                .with_context(|| format!("Failed to read {}", env_file.display()))?;
            for item in iter {
                let (key, value) =
                    item.with_context(|| format!("Failed to parse {}", env_file.display()))?;
                values.insert(key, value);
            }
        } else {
            debug!(path = %env_file.display(), "no env file, using defaults");
        }

        Ok(Self { env_file, values })
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }

    /// Get a configuration value; empty values count as unset
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }
}

/// Fully resolved settings for one invocation
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_root: PathBuf,
    pub backup_root: PathBuf,
    pub target: StackTarget,
    pub settle: Duration,
    /// Present when a GCP project is configured
    pub gcp: Option<GcpConfig>,
}

impl Settings {
    /// Resolve settings for this process: flags, then environment, then config file
    pub fn load(project_root: Option<PathBuf>, backup_root: Option<PathBuf>) -> Result<Self> {
        let app = AppConfig::load()?;
        let project_root = match project_root {
            Some(root) => root,
            None => get_project_root()?,
        };
        let backup_env = std::env::var("QITLALLI_BACKUP_ROOT").ok();

        Self::resolve(project_root, backup_root, backup_env, &app)
    }

    /// Backup root precedence: flag, `QITLALLI_BACKUP_ROOT`, config file, `<project>/backups`.
    /// Stack fields: config file `[stack]`, then project `.env`, then defaults.
    pub fn resolve(
        project_root: PathBuf,
        backup_root: Option<PathBuf>,
        backup_env: Option<String>,
        app: &AppConfig,
    ) -> Result<Self> {
        let stack = &app.stack;
        let within = |configured: Option<&String>, default: &str| -> PathBuf {
            let path = PathBuf::from(configured.map(String::as_str).unwrap_or(default));
            if path.is_absolute() {
                path
            } else {
                project_root.join(path)
            }
        };

        let env_file = within(stack.env_file.as_ref(), ENV_FILE);
        let env = ConfigManager::load(&env_file)?;

        let backup_root = backup_root
            .or_else(|| backup_env.filter(|v| !v.trim().is_empty()).map(PathBuf::from))
            .or_else(|| app.backup_root.as_ref().map(PathBuf::from))
            .map(|p| if p.is_absolute() { p } else { project_root.join(p) })
            .unwrap_or_else(|| project_root.join(DEFAULT_BACKUP_DIR));

        let pick = |configured: &Option<String>, env_key: &str, default: &str| -> String {
            configured
                .clone()
                .or_else(|| env.get(env_key).map(str::to_string))
                .unwrap_or_else(|| default.to_string())
        };

        let target = StackTarget {
            project_root: project_root.clone(),
            db_service: pick(&stack.db_service, "QITLALLI_DB_SERVICE", DEFAULT_DB_SERVICE),
            app_service: pick(&stack.app_service, "QITLALLI_APP_SERVICE", DEFAULT_APP_SERVICE),
            db_user: pick(&stack.db_user, "POSTGRES_USER", DEFAULT_DB_USER),
            database: pick(&stack.database, "POSTGRES_DB", DEFAULT_DATABASE),
            filestore_root: within(stack.filestore_path.as_ref(), DEFAULT_FILESTORE_DIR),
            config_dir: within(stack.config_dir.as_ref(), DEFAULT_CONFIG_DIR),
            env_file: env_file.clone(),
            access_url: pick(&stack.access_url, "QITLALLI_ACCESS_URL", DEFAULT_ACCESS_URL),
        };

        let settle = stack
            .settle_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SETTLE);

        let gcp = resolve_gcp(app, &env, &target, &project_root);

        debug!(
            project = %project_root.display(),
            env = %env.env_file().display(),
            backups = %backup_root.display(),
            gcp = gcp.is_some(),
            "settings resolved"
        );

        Ok(Self {
            project_root,
            backup_root,
            target,
            settle,
            gcp,
        })
    }
}

fn resolve_gcp(
    app: &AppConfig,
    env: &ConfigManager,
    target: &StackTarget,
    project_root: &Path,
) -> Option<GcpConfig> {
    let settings = app.gcp.clone().unwrap_or_default();
    let project_id = settings
        .project_id
        .clone()
        .or_else(|| env.get("GCP_PROJECT_ID").map(str::to_string))?;

    let terraform_dir = settings.terraform_dir.as_ref().map(|dir| {
        let dir = PathBuf::from(dir);
        if dir.is_absolute() {
            dir
        } else {
            project_root.join(dir)
        }
    });

    Some(GcpConfig {
        region: settings
            .region
            .or_else(|| env.get("GCP_REGION").map(str::to_string))
            .unwrap_or_else(|| DEFAULT_GCP_REGION.to_string()),
        db_instance: settings
            .db_instance
            .unwrap_or_else(|| DEFAULT_GCP_DB_INSTANCE.to_string()),
        database: settings.database.unwrap_or_else(|| target.database.clone()),
        export_bucket: settings
            .export_bucket
            .unwrap_or_else(|| format!("{}-backups", project_id)),
        service_name: settings
            .service_name
            .unwrap_or_else(|| DEFAULT_GCP_SERVICE.to_string()),
        terraform_dir,
        project_id,
    })
}
