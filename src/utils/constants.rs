/// QiTlalli backup layout and stack defaults
///
/// File names here are part of the on-disk backup format; changing them
/// makes existing snapshots unreadable by the catalog.

use std::time::Duration;

/// Crate version plus build timestamp, recorded in every manifest
pub const VERSION_WITH_BUILD: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (built: ",
    env!("BUILD_TIMESTAMP"),
    ")"
);

// Snapshot identities: <prefix>_<YYYYMMDD_HHMMSS>
pub const FULL_PREFIX: &str = "full";
pub const DB_ONLY_PREFIX: &str = "db_only";
pub const PRODUCTION_PREFIX: &str = "qitlalli_prod";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub const ARCHIVE_SUFFIX: &str = ".tar.gz";
pub const SQL_SUFFIX: &str = ".sql";
pub const PARTIAL_SUFFIX: &str = ".partial";

// Snapshot contents
pub const DATABASE_FILE: &str = "database.sql";
pub const FILESTORE_FILE: &str = "filestore.tar.gz";
pub const CONFIG_DIR: &str = "config";
pub const ENV_FILE: &str = ".env";
pub const ENV_EXAMPLE_FILE: &str = ".env.example";
pub const MANIFEST_FILE: &str = "BACKUP_INFO.txt";
pub const SECRETS_DIR: &str = "secrets";
pub const TERRAFORM_DIR: &str = "terraform";
pub const DATABASE_EXPORT_FILE: &str = "database_export.txt";

/// Secrets a production snapshot must carry
pub const REQUIRED_SECRETS: &[&str] = &[
    "qitlalli-db-password",
    "qitlalli-admin-password",
    "qitlalli-jwt-secret",
    "qitlalli-email-password",
    "qitlalli-whatsapp-token",
];

// Local stack defaults (docker-compose.yml service names)
pub const COMPOSE_FILE: &str = "docker-compose.yml";
pub const DEFAULT_DB_SERVICE: &str = "db";
pub const DEFAULT_APP_SERVICE: &str = "odoo";
pub const DEFAULT_DB_USER: &str = "odoo";
pub const DEFAULT_DATABASE: &str = "odoo";
pub const DEFAULT_BACKUP_DIR: &str = "backups";
pub const DEFAULT_FILESTORE_DIR: &str = "data/filestore";
pub const DEFAULT_CONFIG_DIR: &str = "config";
pub const DEFAULT_ACCESS_URL: &str = "http://localhost:8069";
pub const HEALTH_PATH: &str = "/web/health";

// Google Cloud defaults
pub const DEFAULT_GCP_REGION: &str = "us-central1";
pub const DEFAULT_GCP_DB_INSTANCE: &str = "qitlalli-db";
pub const DEFAULT_GCP_SERVICE: &str = "qitlalli-odoo";

// Timing
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(10);
pub const DB_READY_ATTEMPTS: u32 = 30;
pub const DB_READY_INTERVAL: Duration = Duration::from_secs(2);
pub const FILESTORE_CLEAR_ATTEMPTS: u32 = 5;
pub const FILESTORE_CLEAR_DELAY: Duration = Duration::from_secs(3);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Warn before capture when the backup root has less free space than this
pub const LOW_SPACE_WARNING_BYTES: u64 = 2 * 1024 * 1024 * 1024;
