/// CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use qitlalli_backup::utils::VERSION_WITH_BUILD;

#[derive(Parser)]
#[command(name = "qitlalli-backup")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Project directory containing docker-compose.yml
    #[arg(long, global = true)]
    pub project_root: Option<PathBuf>,

    /// Directory holding snapshots (default: <project>/backups)
    #[arg(long, global = true)]
    pub backup_root: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show service status
    Status,

    /// Backup operations
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Full backup: database, file store and configuration
    Create,

    /// Database-only backup
    CreateDb,

    /// Production backup from Google Cloud (secrets, Cloud SQL export, terraform state)
    CreateProd,

    /// List snapshots in the backup root
    List,

    /// Restore a full snapshot (DESTRUCTIVE)
    Restore {
        /// Snapshot directory name, e.g. full_20250301_120000
        snapshot: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Restore the database only (DESTRUCTIVE)
    RestoreDb {
        /// Database-only dump, e.g. db_only_20250301_120000.sql, or a full snapshot
        snapshot: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Compress a snapshot directory into <name>.tar.gz
    Archive {
        /// Snapshot directory name
        snapshot: String,

        /// Delete the directory once the archive is written and checked
        #[arg(long)]
        remove_source: bool,
    },

    /// Extract an archive and restore it (DESTRUCTIVE)
    RestoreArchive {
        /// Archive file name, e.g. full_20250301_120000.tar.gz
        archive: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete a snapshot directory, dump or archive
    Delete {
        /// Snapshot name
        snapshot: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },

    /// Show a snapshot's manifest and artifact checksums
    Verify {
        /// Snapshot name
        snapshot: String,
    },
}
