/// The live stack and the narrow capabilities the orchestrator needs from it
///
/// Each external tool is a trait with one job so tests can swap in doubles
/// and inject failures at any step.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::utils::ENV_EXAMPLE_FILE;

/// The running system being backed up or restored into
#[derive(Debug, Clone)]
pub struct StackTarget {
    pub project_root: PathBuf,
    pub db_service: String,
    pub app_service: String,
    pub db_user: String,
    pub database: String,
    /// Host path of the application file store (bind-mounted into the app container)
    pub filestore_root: PathBuf,
    pub config_dir: PathBuf,
    pub env_file: PathBuf,
    pub access_url: String,
}

impl StackTarget {
    /// Template shipped next to the env file; used when the env file is absent
    pub fn env_example_file(&self) -> PathBuf {
        self.env_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(ENV_EXAMPLE_FILE)
    }
}

/// Produces a logical dump of the live database
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseDumper: Send + Sync {
    /// Stream the dump into `out`. Non-zero exit status is an error.
    async fn dump(&self, out: &Path) -> Result<()>;
}

/// Replays a logical dump into the live database
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseRestorer: Send + Sync {
    async fn restore(&self, dump: &Path) -> Result<()>;
}

/// Container lifecycle manager for the stack
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StackController: Send + Sync {
    /// Stop and remove every service
    async fn stop_all(&self) -> Result<()>;

    /// Bring up a single service (and nothing else)
    async fn start_service(&self, service: &str) -> Result<()>;

    /// Block until the database accepts connections
    async fn wait_for_database(&self) -> Result<()>;

    /// Bring up the whole stack
    async fn start_all(&self) -> Result<()>;
}
