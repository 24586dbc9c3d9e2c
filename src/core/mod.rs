pub mod archive;
pub mod backup;
pub mod catalog;
pub mod cloud;
pub mod config;
pub mod docker;
pub mod error;
pub mod health;
pub mod restore;
pub mod snapshot;
pub mod stack;

pub use backup::BackupManager;
pub use cloud::{CloudSnapshotBridge, GcloudClient, GcpConfig};
pub use config::{ConfigManager, Settings};
pub use docker::DockerManager;
pub use error::BackupError;
pub use health::HealthChecker;
pub use restore::{RestoreMode, RestoreOutcome, RestoreSequencer};
