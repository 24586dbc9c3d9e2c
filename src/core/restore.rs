/// Restore sequencer
///
/// Replays a snapshot onto the stack as an explicit state machine:
///
/// ```text
/// Idle -> Validated -> Stopped -> DbRestored -> FilesRestored -> ConfigRestored -> Restarted -> Done
/// ```
///
/// Database-only restores skip from `DbRestored` straight to `Restarted`.
/// A failing step stops the run and reports the last completed state; there
/// is no rollback and no retry across step boundaries.

use anyhow::{anyhow, Context, Result};
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::future::Future;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::core::archive;
use crate::core::catalog::{self, EntryKind, SnapshotDescriptor};
use crate::core::error::BackupError;
use crate::core::snapshot::SnapshotName;
use crate::core::stack::{DatabaseRestorer, StackController, StackTarget};
use crate::utils::{
    clear_dir_contents, copy_dir_all, CONFIG_DIR, DATABASE_FILE, ENV_EXAMPLE_FILE, ENV_FILE,
    FILESTORE_CLEAR_ATTEMPTS, FILESTORE_CLEAR_DELAY, FILESTORE_FILE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Idle,
    Validated,
    Stopped,
    DbRestored,
    FilesRestored,
    ConfigRestored,
    Restarted,
    Done,
    Failed,
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RestoreState::Idle => "idle",
            RestoreState::Validated => "validated",
            RestoreState::Stopped => "stopped",
            RestoreState::DbRestored => "database restored",
            RestoreState::FilesRestored => "files restored",
            RestoreState::ConfigRestored => "config restored",
            RestoreState::Restarted => "restarted",
            RestoreState::Done => "done",
            RestoreState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// The individual operation that was running when a restore failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStep {
    Resolve,
    ExtractArchive,
    Confirm,
    StopStack,
    StartDatabase,
    WaitForDatabase,
    ReplayDatabase,
    StartApplication,
    ClearFilestore,
    UnpackFilestore,
    CopyConfig,
    RestartStack,
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RestoreStep::Resolve => "resolve snapshot",
            RestoreStep::ExtractArchive => "extract archive",
            RestoreStep::Confirm => "confirm",
            RestoreStep::StopStack => "stop stack",
            RestoreStep::StartDatabase => "start database",
            RestoreStep::WaitForDatabase => "wait for database",
            RestoreStep::ReplayDatabase => "replay database",
            RestoreStep::StartApplication => "start application",
            RestoreStep::ClearFilestore => "clear file store",
            RestoreStep::UnpackFilestore => "unpack file store",
            RestoreStep::CopyConfig => "copy configuration",
            RestoreStep::RestartStack => "restart stack",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    /// Database, file store and configuration
    Full,
    /// Database only; file store and configuration are left alone
    DatabaseOnly,
}

/// Operator confirmation before destructive work
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Asks on stdin; only a literal "yes" counts
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        println!("{}", prompt);
        print!("Type 'yes' to continue: ");
        io::stdout().flush()?;

        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("Failed to read confirmation")?;

        Ok(answer.trim().eq_ignore_ascii_case("yes"))
    }
}

/// Confirmation given up front with `--yes`
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        println!("{}", prompt);
        info!("destructive action confirmed on the command line");
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Pause after the final restart before reporting success
    pub settle: Duration,
    pub clear_attempts: u32,
    pub clear_retry_delay: Duration,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            settle: crate::utils::DEFAULT_SETTLE,
            clear_attempts: FILESTORE_CLEAR_ATTEMPTS,
            clear_retry_delay: FILESTORE_CLEAR_DELAY,
        }
    }
}

/// Everything a validated restore will replay
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub snapshot: SnapshotName,
    pub source: PathBuf,
    pub mode: RestoreMode,
    pub database: PathBuf,
    pub filestore: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    /// `.env`, or `.env.example` when the snapshot carried only the template
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub snapshot: String,
    pub mode: RestoreMode,
    pub access_url: String,
    /// States entered, in order
    pub history: Vec<RestoreState>,
    /// Set when the snapshot was extracted from an archive first
    pub extracted_from: Option<PathBuf>,
}

#[derive(Debug)]
pub enum RestoreOutcome {
    Completed(RestoreReport),
    /// Operator declined; nothing was stopped or changed
    Declined { snapshot: String },
}

enum Transition {
    Next(RestoreState),
    Declined,
}

struct RestoreRun {
    requested: String,
    mode: RestoreMode,
    plan: Option<RestorePlan>,
    extracted_from: Option<PathBuf>,
    history: Vec<RestoreState>,
}

impl RestoreRun {
    fn identity(&self) -> String {
        self.plan
            .as_ref()
            .map(|p| p.snapshot.to_string())
            .unwrap_or_else(|| self.requested.clone())
    }
}

pub struct RestoreSequencer<'a> {
    backup_root: PathBuf,
    target: &'a StackTarget,
    stack: &'a dyn StackController,
    database: &'a dyn DatabaseRestorer,
    confirm: &'a dyn Confirm,
    options: RestoreOptions,
}

impl<'a> RestoreSequencer<'a> {
    pub fn new(
        backup_root: &Path,
        target: &'a StackTarget,
        stack: &'a dyn StackController,
        database: &'a dyn DatabaseRestorer,
        confirm: &'a dyn Confirm,
    ) -> Self {
        Self {
            backup_root: backup_root.to_path_buf(),
            target,
            stack,
            database,
            confirm,
            options: RestoreOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RestoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Drive a restore of `requested` from `Idle` to `Done`
    pub async fn run(&self, requested: &str, mode: RestoreMode) -> Result<RestoreOutcome, BackupError> {
        let mut run = RestoreRun {
            requested: requested.to_string(),
            mode,
            plan: None,
            extracted_from: None,
            history: vec![RestoreState::Idle],
        };
        let mut state = RestoreState::Idle;

        while state != RestoreState::Done {
            match self.advance(state, &mut run).await {
                Ok(Transition::Next(next)) => {
                    info!(snapshot = %run.identity(), from = %state, to = %next, "restore transition");
                    run.history.push(next);
                    state = next;
                }
                Ok(Transition::Declined) => {
                    info!(snapshot = %run.identity(), "restore declined by operator");
                    return Ok(RestoreOutcome::Declined {
                        snapshot: run.identity(),
                    });
                }
                Err(err) => {
                    error!(
                        snapshot = %run.identity(),
                        from = %state,
                        to = %RestoreState::Failed,
                        error = %err,
                        "restore halted"
                    );
                    run.history.push(RestoreState::Failed);
                    return Err(err.with_history(run.history));
                }
            }
        }

        Ok(RestoreOutcome::Completed(RestoreReport {
            snapshot: run.identity(),
            mode: run.mode,
            access_url: self.target.access_url.clone(),
            history: run.history,
            extracted_from: run.extracted_from,
        }))
    }

    /// Transition function: perform the work that leaves `state`
    async fn advance(&self, state: RestoreState, run: &mut RestoreRun) -> Result<Transition, BackupError> {
        if state == RestoreState::Idle {
            return self.validate(run).await;
        }

        let plan = run.plan.clone().ok_or_else(|| {
            BackupError::restore(&run.requested, state, RestoreStep::Resolve, "no validated plan")
        })?;
        let run = &*run;

        match state {
            RestoreState::Validated => {
                self.perform(run, state, RestoreStep::StopStack, self.stack.stop_all())
                    .await?;
                Ok(Transition::Next(RestoreState::Stopped))
            }
            RestoreState::Stopped => {
                self.perform(
                    run,
                    state,
                    RestoreStep::StartDatabase,
                    self.stack.start_service(&self.target.db_service),
                )
                .await?;
                self.perform(run, state, RestoreStep::WaitForDatabase, self.stack.wait_for_database())
                    .await?;
                self.perform(
                    run,
                    state,
                    RestoreStep::ReplayDatabase,
                    self.database.restore(&plan.database),
                )
                .await?;
                Ok(Transition::Next(RestoreState::DbRestored))
            }
            RestoreState::DbRestored => match plan.mode {
                RestoreMode::DatabaseOnly => {
                    self.restart(run, state).await?;
                    Ok(Transition::Next(RestoreState::Restarted))
                }
                RestoreMode::Full => {
                    self.restore_filestore(run, state, &plan).await?;
                    Ok(Transition::Next(RestoreState::FilesRestored))
                }
            },
            RestoreState::FilesRestored => {
                info!(snapshot = %run.identity(), step = %RestoreStep::CopyConfig, "restore step");
                self.restore_config(&plan)
                    .map_err(|e| self.fail(run, state, RestoreStep::CopyConfig, e))?;
                Ok(Transition::Next(RestoreState::ConfigRestored))
            }
            RestoreState::ConfigRestored => {
                self.restart(run, state).await?;
                Ok(Transition::Next(RestoreState::Restarted))
            }
            RestoreState::Restarted => Ok(Transition::Next(RestoreState::Done)),
            RestoreState::Idle | RestoreState::Done | RestoreState::Failed => Err(self.fail(
                run,
                state,
                RestoreStep::Resolve,
                format!("no transition out of state '{}'", state),
            )),
        }
    }

    /// Idle -> Validated: resolve, extract archives, build the plan, confirm
    async fn validate(&self, run: &mut RestoreRun) -> Result<Transition, BackupError> {
        let mut descriptor = catalog::resolve(&self.backup_root, &run.requested)?;

        if let EntryKind::Archive(kind) = descriptor.kind {
            if !descriptor.kind.is_restorable() {
                return Err(BackupError::restore(
                    descriptor.identity(),
                    RestoreState::Idle,
                    RestoreStep::Resolve,
                    format!("{} archives cannot be restored onto the local stack", kind),
                ));
            }

            let dir = archive::extract(&descriptor.path)?;
            run.extracted_from = Some(descriptor.path.clone());
            descriptor = catalog::inspect(&dir).ok_or_else(|| {
                BackupError::restore(
                    descriptor.identity(),
                    RestoreState::Idle,
                    RestoreStep::ExtractArchive,
                    format!("{} is not a snapshot directory", dir.display()),
                )
            })?;
        }

        let plan = plan_for(&descriptor, run.mode).map_err(|reason| {
            BackupError::restore(descriptor.identity(), RestoreState::Idle, RestoreStep::Resolve, reason)
        })?;

        let prompt = self.confirmation_prompt(&plan);
        run.plan = Some(plan);

        let confirmed = self
            .confirm
            .confirm(&prompt)
            .map_err(|e| self.fail(run, RestoreState::Idle, RestoreStep::Confirm, e))?;

        if confirmed {
            Ok(Transition::Next(RestoreState::Validated))
        } else {
            Ok(Transition::Declined)
        }
    }

    fn confirmation_prompt(&self, plan: &RestorePlan) -> String {
        let created = plan.snapshot.timestamp().format("%Y-%m-%d %H:%M:%S");
        let mut lines = vec![
            format!(
                "DESTRUCTIVE RESTORE from {} ({}, created {})",
                plan.snapshot,
                plan.snapshot.kind(),
                created
            ),
            format!("Source: {}", plan.source.display()),
            "This will:".to_string(),
            format!(
                "  - stop every service of the stack in {}",
                self.target.project_root.display()
            ),
            format!(
                "  - drop and recreate database '{}' from {}",
                self.target.database,
                plan.database.display()
            ),
        ];

        if plan.mode == RestoreMode::Full {
            lines.push(format!(
                "  - delete everything under {} and replace it with the snapshot's file store",
                self.target.filestore_root.display()
            ));
            lines.push(format!(
                "  - overwrite configuration in {} and {}",
                self.target.config_dir.display(),
                self.target.env_file.display()
            ));
        }

        lines.push(format!(
            "Anything written to the stack after {} will be lost. This cannot be undone.",
            created
        ));
        lines.join("\n")
    }

    async fn perform<F>(
        &self,
        run: &RestoreRun,
        last_completed: RestoreState,
        step: RestoreStep,
        work: F,
    ) -> Result<(), BackupError>
    where
        F: Future<Output = Result<()>>,
    {
        info!(snapshot = %run.identity(), step = %step, "restore step");
        work.await
            .map_err(|e| self.fail(run, last_completed, step, e))
    }

    fn fail(
        &self,
        run: &RestoreRun,
        last_completed: RestoreState,
        step: RestoreStep,
        reason: impl fmt::Display,
    ) -> BackupError {
        BackupError::restore(run.identity(), last_completed, step, reason)
    }

    async fn restore_filestore(
        &self,
        run: &RestoreRun,
        state: RestoreState,
        plan: &RestorePlan,
    ) -> Result<(), BackupError> {
        let Some(filestore) = &plan.filestore else {
            return Err(self.fail(run, state, RestoreStep::UnpackFilestore, "snapshot has no file store"));
        };
        let root = &self.target.filestore_root;

        self.perform(
            run,
            state,
            RestoreStep::StartApplication,
            self.stack.start_service(&self.target.app_service),
        )
        .await?;

        self.perform(run, state, RestoreStep::ClearFilestore, self.clear_filestore(root))
            .await?;

        info!(snapshot = %run.identity(), step = %RestoreStep::UnpackFilestore, "restore step");
        archive::unpack_into(filestore, root)
            .with_context(|| format!("Failed to unpack {} into {}", filestore.display(), root.display()))
            .map_err(|e| self.fail(run, state, RestoreStep::UnpackFilestore, e))
    }

    /// Clearing may race the application container fixing up permissions, so retry a few times
    async fn clear_filestore(&self, root: &Path) -> Result<()> {
        let attempts = self.options.clear_attempts.max(1);
        let mut attempt = 1;

        loop {
            match clear_dir_contents(root) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        attempt,
                        attempts,
                        error = %e,
                        root = %root.display(),
                        "file store not writable yet, retrying"
                    );
                    tokio::time::sleep(self.options.clear_retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(anyhow!(e).context(format!(
                        "could not clear {} after {} attempts",
                        root.display(),
                        attempts
                    )));
                }
            }
        }
    }

    /// Merge by presence: snapshot files overwrite, live-only files stay
    fn restore_config(&self, plan: &RestorePlan) -> Result<()> {
        if let Some(config) = &plan.config_dir {
            let copied = copy_dir_all(config, &self.target.config_dir).with_context(|| {
                format!("Failed to copy {} to {}", config.display(), self.target.config_dir.display())
            })?;
            info!(files = copied, "configuration restored");
        }

        if let Some(env) = &plan.env_file {
            if env.file_name() == Some(OsStr::new(ENV_EXAMPLE_FILE)) {
                let dest = self.target.env_example_file();
                fs::copy(env, &dest)
                    .with_context(|| format!("Failed to copy {} to {}", env.display(), dest.display()))?;
                if self.target.env_file.exists() {
                    warn!(
                        env = %self.target.env_file.display(),
                        "snapshot carries only {}, keeping the live env file", ENV_EXAMPLE_FILE
                    );
                }
            } else {
                fs::copy(env, &self.target.env_file).with_context(|| {
                    format!("Failed to copy {} to {}", env.display(), self.target.env_file.display())
                })?;
            }
        }

        Ok(())
    }

    async fn restart(&self, run: &RestoreRun, state: RestoreState) -> Result<(), BackupError> {
        self.perform(run, state, RestoreStep::RestartStack, self.stack.start_all())
            .await?;

        if !self.options.settle.is_zero() {
            info!(
                settle = %humantime::format_duration(self.options.settle),
                "waiting for services to settle"
            );
            tokio::time::sleep(self.options.settle).await;
        }

        Ok(())
    }
}

/// Work out what to replay from a resolved snapshot, or why it cannot be replayed
fn plan_for(descriptor: &SnapshotDescriptor, mode: RestoreMode) -> Result<RestorePlan, String> {
    let dir = &descriptor.path;
    let snapshot = descriptor.name.clone();

    match (descriptor.kind, mode) {
        (EntryKind::Full, RestoreMode::Full) => {
            let env = [ENV_FILE, ENV_EXAMPLE_FILE]
                .iter()
                .map(|name| dir.join(name))
                .find(|path| path.is_file());

            Ok(RestorePlan {
                snapshot,
                source: dir.clone(),
                mode,
                database: dir.join(DATABASE_FILE),
                filestore: Some(dir.join(FILESTORE_FILE)),
                config_dir: Some(dir.join(CONFIG_DIR)),
                env_file: env,
            })
        }
        (EntryKind::Full, RestoreMode::DatabaseOnly) | (EntryKind::DbOnly, RestoreMode::DatabaseOnly) => {
            let database = if dir.is_dir() {
                dir.join(DATABASE_FILE)
            } else {
                dir.clone()
            };

            Ok(RestorePlan {
                snapshot,
                source: dir.clone(),
                mode,
                database,
                filestore: None,
                config_dir: None,
                env_file: None,
            })
        }
        (EntryKind::DbOnly, RestoreMode::Full) => Err(format!(
            "{} is a database-only snapshot; use restore-db instead",
            descriptor.file_name()
        )),
        (EntryKind::Incomplete(_), _) if descriptor.staged => Err(format!(
            "{} was left behind by an interrupted capture and cannot be restored",
            descriptor.file_name()
        )),
        (EntryKind::Incomplete(_), _) => Err(format!(
            "{} is incomplete (missing {}) and cannot be restored",
            descriptor.file_name(),
            descriptor.missing.join(", ")
        )),
        (EntryKind::Production, _) => Err(format!(
            "{} is a production snapshot; restore it through Cloud SQL import, not the local stack",
            descriptor.file_name()
        )),
        (EntryKind::Archive(_), _) => Err(format!(
            "{} is still archived",
            descriptor.file_name()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archive::pack_tree;
    use crate::core::snapshot::{Manifest, Provenance, SnapshotKind};
    use crate::core::stack::MockStackController;
    use crate::utils::{sha256_file, MANIFEST_FILE};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    type Events = Arc<Mutex<Vec<String>>>;

    struct FakeStack {
        events: Events,
        fail_on: Option<&'static str>,
    }

    impl FakeStack {
        fn record(&self, event: String) -> Result<()> {
            let failing = self.fail_on.map_or(false, |f| event == f);
            self.events.lock().unwrap().push(event.clone());
            if failing {
                return Err(anyhow!("{} failed", event));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StackController for FakeStack {
        async fn stop_all(&self) -> Result<()> {
            self.record("stop_all".to_string())
        }

        async fn start_service(&self, service: &str) -> Result<()> {
            self.record(format!("start:{}", service))
        }

        async fn wait_for_database(&self) -> Result<()> {
            self.record("wait_db".to_string())
        }

        async fn start_all(&self) -> Result<()> {
            self.record("start_all".to_string())
        }
    }

    /// "Database" is a single file whose content is the last replayed dump
    struct FakeDatabase {
        events: Events,
        state: PathBuf,
        fail: bool,
    }

    #[async_trait]
    impl DatabaseRestorer for FakeDatabase {
        async fn restore(&self, dump: &Path) -> Result<()> {
            self.events.lock().unwrap().push("replay".to_string());
            if self.fail {
                return Err(anyhow!("psql exited with status 3"));
            }
            fs::copy(dump, &self.state)?;
            Ok(())
        }
    }

    struct Answer(bool, Arc<Mutex<u32>>);

    impl Confirm for Answer {
        fn confirm(&self, _prompt: &str) -> Result<bool> {
            *self.1.lock().unwrap() += 1;
            Ok(self.0)
        }
    }

    struct Fixture {
        _tmp: TempDir,
        backups: PathBuf,
        target: StackTarget,
        db_state: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let project = tmp.path().join("project");
        let backups = tmp.path().join("backups");
        fs::create_dir_all(project.join("data/filestore/main_db")).unwrap();
        fs::write(project.join("data/filestore/main_db/new-upload.bin"), b"after snapshot").unwrap();
        fs::create_dir_all(project.join("config")).unwrap();
        fs::write(project.join("config/odoo.conf"), "live config").unwrap();
        fs::write(project.join("config/local-only.conf"), "operator file").unwrap();
        fs::write(project.join(".env"), "POSTGRES_PASSWORD=live\n").unwrap();
        fs::create_dir_all(&backups).unwrap();

        let db_state = tmp.path().join("db-state.sql");
        fs::write(&db_state, "live database").unwrap();

        let target = StackTarget {
            project_root: project.clone(),
            db_service: "db".to_string(),
            app_service: "odoo".to_string(),
            db_user: "odoo".to_string(),
            database: "odoo".to_string(),
            filestore_root: project.join("data/filestore"),
            config_dir: project.join("config"),
            env_file: project.join(".env"),
            access_url: "http://localhost:8069".to_string(),
        };

        Fixture {
            _tmp: tmp,
            backups,
            target,
            db_state,
        }
    }

    fn write_full_snapshot(backups: &Path, identity: &str) -> PathBuf {
        let dir = backups.join(identity);
        let filestore_src = TempDir::new().unwrap();
        fs::create_dir_all(filestore_src.path().join("main_db/3f")).unwrap();
        fs::write(filestore_src.path().join("main_db/3f/report.pdf"), b"%PDF-1.4 report").unwrap();

        fs::create_dir_all(dir.join(CONFIG_DIR)).unwrap();
        fs::write(dir.join(DATABASE_FILE), "snapshot database").unwrap();
        pack_tree(filestore_src.path(), Path::new(""), &dir.join(FILESTORE_FILE)).unwrap();
        fs::write(dir.join(CONFIG_DIR).join("odoo.conf"), "snapshot config").unwrap();
        fs::write(dir.join(ENV_FILE), "POSTGRES_PASSWORD=snapshot\n").unwrap();
        Manifest::new(SnapshotKind::Full, vec![], &Provenance::unknown())
            .write(&dir)
            .unwrap();
        dir
    }

    fn fast() -> RestoreOptions {
        RestoreOptions {
            settle: Duration::ZERO,
            clear_attempts: 2,
            clear_retry_delay: Duration::ZERO,
        }
    }

    fn hash_tree(dir: &Path) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in fs::read_dir(&current).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let rel = path.strip_prefix(dir).unwrap().to_string_lossy().to_string();
                    out.push((rel, sha256_file(&path).unwrap()));
                }
            }
        }
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_full_restore_sequence() {
        let fx = fixture();
        write_full_snapshot(&fx.backups, "full_20250301_120000");
        let events: Events = Arc::default();
        let stack = FakeStack { events: events.clone(), fail_on: None };
        let db = FakeDatabase { events: events.clone(), state: fx.db_state.clone(), fail: false };
        let asked = Arc::new(Mutex::new(0));
        let confirm = Answer(true, asked.clone());

        let sequencer = RestoreSequencer::new(&fx.backups, &fx.target, &stack, &db, &confirm)
            .with_options(fast());
        let outcome = sequencer.run("full_20250301_120000", RestoreMode::Full).await.unwrap();

        let RestoreOutcome::Completed(report) = outcome else {
            panic!("restore did not complete");
        };
        assert_eq!(
            report.history,
            vec![
                RestoreState::Idle,
                RestoreState::Validated,
                RestoreState::Stopped,
                RestoreState::DbRestored,
                RestoreState::FilesRestored,
                RestoreState::ConfigRestored,
                RestoreState::Restarted,
                RestoreState::Done,
            ]
        );
        assert_eq!(report.snapshot, "full_20250301_120000");
        assert_eq!(*asked.lock().unwrap(), 1);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["stop_all", "start:db", "wait_db", "replay", "start:odoo", "start_all"]
        );

        // database replaced
        assert_eq!(fs::read_to_string(&fx.db_state).unwrap(), "snapshot database");

        // file store replaced wholesale
        let filestore = &fx.target.filestore_root;
        assert!(!filestore.join("main_db/new-upload.bin").exists());
        assert_eq!(
            fs::read(filestore.join("main_db/3f/report.pdf")).unwrap(),
            b"%PDF-1.4 report"
        );

        // config merged by presence
        let config = &fx.target.config_dir;
        assert_eq!(fs::read_to_string(config.join("odoo.conf")).unwrap(), "snapshot config");
        assert_eq!(fs::read_to_string(config.join("local-only.conf")).unwrap(), "operator file");
        assert_eq!(
            fs::read_to_string(&fx.target.env_file).unwrap(),
            "POSTGRES_PASSWORD=snapshot\n"
        );
    }

    #[tokio::test]
    async fn test_unknown_snapshot_never_stops_anything() {
        let fx = fixture();
        write_full_snapshot(&fx.backups, "full_20250301_120000");
        let mut stack = MockStackController::new();
        stack.expect_stop_all().never();
        stack.expect_start_service().never();
        let db = FakeDatabase { events: Arc::default(), state: fx.db_state.clone(), fail: false };
        let asked = Arc::new(Mutex::new(0));
        let confirm = Answer(true, asked.clone());

        let sequencer = RestoreSequencer::new(&fx.backups, &fx.target, &stack, &db, &confirm)
            .with_options(fast());
        let err = sequencer
            .run("full_20250101_000000", RestoreMode::Full)
            .await
            .unwrap_err();

        match err {
            BackupError::NotFound { available, .. } => {
                assert_eq!(available, vec!["full_20250301_120000".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*asked.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_declined_restore_has_no_side_effects() {
        let fx = fixture();
        write_full_snapshot(&fx.backups, "full_20250301_120000");
        let events: Events = Arc::default();
        let stack = FakeStack { events: events.clone(), fail_on: None };
        let db = FakeDatabase { events: events.clone(), state: fx.db_state.clone(), fail: false };
        let confirm = Answer(false, Arc::default());

        let sequencer = RestoreSequencer::new(&fx.backups, &fx.target, &stack, &db, &confirm)
            .with_options(fast());
        let outcome = sequencer.run("full_20250301_120000", RestoreMode::Full).await.unwrap();

        assert!(matches!(outcome, RestoreOutcome::Declined { .. }));
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(fs::read_to_string(&fx.db_state).unwrap(), "live database");
    }

    #[tokio::test]
    async fn test_database_failure_leaves_files_and_config_untouched() {
        let fx = fixture();
        write_full_snapshot(&fx.backups, "full_20250301_120000");
        let filestore_before = hash_tree(&fx.target.filestore_root);
        let config_before = hash_tree(&fx.target.config_dir);
        let env_before = sha256_file(&fx.target.env_file).unwrap();

        let events: Events = Arc::default();
        let stack = FakeStack { events: events.clone(), fail_on: None };
        let db = FakeDatabase { events: events.clone(), state: fx.db_state.clone(), fail: true };
        let confirm = Answer(true, Arc::default());

        let sequencer = RestoreSequencer::new(&fx.backups, &fx.target, &stack, &db, &confirm)
            .with_options(fast());
        let err = sequencer
            .run("full_20250301_120000", RestoreMode::Full)
            .await
            .unwrap_err();

        match &err {
            BackupError::Restore { last_completed, failed_step, snapshot, .. } => {
                assert_eq!(*last_completed, RestoreState::Stopped);
                assert_eq!(*failed_step, RestoreStep::ReplayDatabase);
                assert_eq!(snapshot, "full_20250301_120000");
            }
            other => panic!("unexpected error: {other}"),
        }

        if let BackupError::Restore { history, .. } = &err {
            assert_eq!(
                *history,
                vec![
                    RestoreState::Idle,
                    RestoreState::Validated,
                    RestoreState::Stopped,
                    RestoreState::Failed,
                ]
            );
        }
        assert_eq!(*events.lock().unwrap(), vec!["stop_all", "start:db", "wait_db", "replay"]);
        assert_eq!(hash_tree(&fx.target.filestore_root), filestore_before);
        assert_eq!(hash_tree(&fx.target.config_dir), config_before);
        assert_eq!(sha256_file(&fx.target.env_file).unwrap(), env_before);
    }

    #[tokio::test]
    async fn test_stop_failure_reports_validated() {
        let fx = fixture();
        write_full_snapshot(&fx.backups, "full_20250301_120000");
        let mut stack = MockStackController::new();
        stack
            .expect_stop_all()
            .times(1)
            .returning(|| Err(anyhow!("Cannot connect to the Docker daemon")));
        stack.expect_start_service().never();
        let db = FakeDatabase { events: Arc::default(), state: fx.db_state.clone(), fail: false };
        let confirm = Answer(true, Arc::default());

        let sequencer = RestoreSequencer::new(&fx.backups, &fx.target, &stack, &db, &confirm)
            .with_options(fast());
        let err = sequencer
            .run("full_20250301_120000", RestoreMode::Full)
            .await
            .unwrap_err();

        match err {
            BackupError::Restore { last_completed, failed_step, history, .. } => {
                assert_eq!(last_completed, RestoreState::Validated);
                assert_eq!(failed_step, RestoreStep::StopStack);
                assert_eq!(
                    history,
                    vec![RestoreState::Idle, RestoreState::Validated, RestoreState::Failed]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Snapshot taken from a project that only had the env template
    fn write_template_only_snapshot(backups: &Path, identity: &str) -> PathBuf {
        let dir = write_full_snapshot(backups, identity);
        fs::remove_file(dir.join(ENV_FILE)).unwrap();
        fs::write(dir.join(ENV_EXAMPLE_FILE), "POSTGRES_PASSWORD=changeme\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_template_only_snapshot_keeps_live_env() {
        let fx = fixture();
        write_template_only_snapshot(&fx.backups, "full_20250301_120000");
        let live_env = fs::read(&fx.target.env_file).unwrap();

        let events: Events = Arc::default();
        let stack = FakeStack { events: events.clone(), fail_on: None };
        let db = FakeDatabase { events: events.clone(), state: fx.db_state.clone(), fail: false };
        let confirm = Answer(true, Arc::default());

        let sequencer = RestoreSequencer::new(&fx.backups, &fx.target, &stack, &db, &confirm)
            .with_options(fast());
        let outcome = sequencer.run("full_20250301_120000", RestoreMode::Full).await.unwrap();

        assert!(matches!(outcome, RestoreOutcome::Completed(_)));
        assert_eq!(fs::read(&fx.target.env_file).unwrap(), live_env);
        assert_eq!(
            fs::read_to_string(fx.target.env_example_file()).unwrap(),
            "POSTGRES_PASSWORD=changeme\n"
        );
        assert_eq!(
            fs::read_to_string(fx.target.config_dir.join("odoo.conf")).unwrap(),
            "snapshot config"
        );
    }

    #[tokio::test]
    async fn test_template_only_snapshot_without_live_env() {
        let fx = fixture();
        write_template_only_snapshot(&fx.backups, "full_20250301_120000");
        fs::remove_file(&fx.target.env_file).unwrap();

        let events: Events = Arc::default();
        let stack = FakeStack { events: events.clone(), fail_on: None };
        let db = FakeDatabase { events: events.clone(), state: fx.db_state.clone(), fail: false };
        let confirm = Answer(true, Arc::default());

        let sequencer = RestoreSequencer::new(&fx.backups, &fx.target, &stack, &db, &confirm)
            .with_options(fast());
        let outcome = sequencer.run("full_20250301_120000", RestoreMode::Full).await.unwrap();

        let RestoreOutcome::Completed(report) = outcome else {
            panic!("restore did not complete");
        };
        assert_eq!(report.history.last(), Some(&RestoreState::Done));
        // the template is never promoted to the live env file
        assert!(!fx.target.env_file.exists());
        assert_eq!(
            fs::read_to_string(fx.target.env_example_file()).unwrap(),
            "POSTGRES_PASSWORD=changeme\n"
        );
    }

    #[tokio::test]
    async fn test_interrupted_capture_is_refused() {
        let fx = fixture();
        let staging = fx.backups.join(".full_20250301_120000.partial");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join(DATABASE_FILE), "half a dump").unwrap();

        let mut stack = MockStackController::new();
        stack.expect_stop_all().never();
        let db = FakeDatabase { events: Arc::default(), state: fx.db_state.clone(), fail: false };
        let confirm = Answer(true, Arc::default());

        let sequencer = RestoreSequencer::new(&fx.backups, &fx.target, &stack, &db, &confirm)
            .with_options(fast());
        let err = sequencer
            .run("full_20250301_120000", RestoreMode::Full)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("interrupted capture"));
        assert_eq!(fs::read_to_string(&fx.db_state).unwrap(), "live database");
    }

    #[tokio::test]
    async fn test_filestore_clear_gives_up_after_retries() {
        let mut fx = fixture();
        write_full_snapshot(&fx.backups, "full_20250301_120000");
        // a regular file where the file store directory should be can never be cleared
        let bogus = fx.target.project_root.join("not-a-directory");
        fs::write(&bogus, "x").unwrap();
        fx.target.filestore_root = bogus;

        let events: Events = Arc::default();
        let stack = FakeStack { events: events.clone(), fail_on: None };
        let db = FakeDatabase { events: events.clone(), state: fx.db_state.clone(), fail: false };
        let confirm = Answer(true, Arc::default());

        let sequencer = RestoreSequencer::new(&fx.backups, &fx.target, &stack, &db, &confirm)
            .with_options(fast());
        let err = sequencer
            .run("full_20250301_120000", RestoreMode::Full)
            .await
            .unwrap_err();

        match &err {
            BackupError::Restore { last_completed, failed_step, reason, .. } => {
                assert_eq!(*last_completed, RestoreState::DbRestored);
                assert_eq!(*failed_step, RestoreStep::ClearFilestore);
                assert!(reason.contains("after 2 attempts"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read_to_string(&fx.target.config_dir.join("odoo.conf")).unwrap(), "live config");
    }

    #[tokio::test]
    async fn test_database_only_restore_skips_files_and_config() {
        let fx = fixture();
        fs::write(fx.backups.join("db_only_20250303_120000.sql"), "db only dump").unwrap();
        let filestore_before = hash_tree(&fx.target.filestore_root);

        let events: Events = Arc::default();
        let stack = FakeStack { events: events.clone(), fail_on: None };
        let db = FakeDatabase { events: events.clone(), state: fx.db_state.clone(), fail: false };
        let confirm = Answer(true, Arc::default());

        let sequencer = RestoreSequencer::new(&fx.backups, &fx.target, &stack, &db, &confirm)
            .with_options(fast());
        let outcome = sequencer
            .run("db_only_20250303_120000.sql", RestoreMode::DatabaseOnly)
            .await
            .unwrap();

        let RestoreOutcome::Completed(report) = outcome else {
            panic!("restore did not complete");
        };
        assert_eq!(
            report.history,
            vec![
                RestoreState::Idle,
                RestoreState::Validated,
                RestoreState::Stopped,
                RestoreState::DbRestored,
                RestoreState::Restarted,
                RestoreState::Done,
            ]
        );
        assert_eq!(
            *events.lock().unwrap(),
            vec!["stop_all", "start:db", "wait_db", "replay", "start_all"]
        );
        assert_eq!(fs::read_to_string(&fx.db_state).unwrap(), "db only dump");
        assert_eq!(hash_tree(&fx.target.filestore_root), filestore_before);
    }

    #[tokio::test]
    async fn test_incomplete_and_mismatched_snapshots_are_refused() {
        let fx = fixture();
        let dir = write_full_snapshot(&fx.backups, "full_20250301_120000");
        fs::remove_file(dir.join(MANIFEST_FILE)).unwrap();
        fs::write(fx.backups.join("db_only_20250303_120000.sql"), "db only dump").unwrap();

        let events: Events = Arc::default();
        let stack = FakeStack { events: events.clone(), fail_on: None };
        let db = FakeDatabase { events: events.clone(), state: fx.db_state.clone(), fail: false };
        let confirm = Answer(true, Arc::default());
        let sequencer = RestoreSequencer::new(&fx.backups, &fx.target, &stack, &db, &confirm)
            .with_options(fast());

        let incomplete = sequencer
            .run("full_20250301_120000", RestoreMode::Full)
            .await
            .unwrap_err();
        assert!(incomplete.to_string().contains("incomplete"));

        let mismatched = sequencer
            .run("db_only_20250303_120000", RestoreMode::Full)
            .await
            .unwrap_err();
        assert!(matches!(
            mismatched,
            BackupError::Restore { last_completed: RestoreState::Idle, .. }
        ));

        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_failure_reports_config_restored() {
        let fx = fixture();
        write_full_snapshot(&fx.backups, "full_20250301_120000");
        let events: Events = Arc::default();
        let stack = FakeStack { events: events.clone(), fail_on: Some("start_all") };
        let db = FakeDatabase { events: events.clone(), state: fx.db_state.clone(), fail: false };
        let confirm = Answer(true, Arc::default());

        let sequencer = RestoreSequencer::new(&fx.backups, &fx.target, &stack, &db, &confirm)
            .with_options(fast());
        let err = sequencer
            .run("full_20250301_120000", RestoreMode::Full)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BackupError::Restore {
                last_completed: RestoreState::ConfigRestored,
                failed_step: RestoreStep::RestartStack,
                ..
            }
        ));
    }
}
