/// Docker and Docker Compose integration
///
/// Lifecycle requests (stop/start) go through `docker compose`; database
/// dump and replay run the PostgreSQL client tools inside the database
/// service via `docker compose exec -T`, streaming to and from files.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::Docker;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::stack::{DatabaseDumper, DatabaseRestorer, StackController, StackTarget};
use crate::utils::{ContainerState, COMPOSE_FILE, DB_READY_ATTEMPTS, DB_READY_INTERVAL};

#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub name: String,
    pub service: String,
    pub state: ContainerState,
    pub status: String,
    pub health: Option<String>,
}

#[derive(Clone)]
pub struct DockerManager {
    docker: Docker,
    project_root: PathBuf,
    compose_file: PathBuf,
    target: StackTarget,
}

impl DockerManager {
    pub fn new(target: &StackTarget) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon. Is Docker running?")?;

        let project_root = target.project_root.clone();
        let compose_file = project_root.join(COMPOSE_FILE);

        if !compose_file.exists() {
            return Err(anyhow!(
                "{} not found at {}",
                COMPOSE_FILE,
                compose_file.display()
            ));
        }

        Ok(Self {
            docker,
            project_root,
            compose_file,
            target: target.clone(),
        })
    }

    /// Get project root directory
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Check if Docker daemon is accessible
    pub async fn check_docker(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    fn compose(&self) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("-f")
            .arg(&self.compose_file)
            .current_dir(&self.project_root);
        cmd
    }

    /// Execute docker compose command
    pub async fn compose_command(&self, args: &[&str]) -> Result<String> {
        debug!(args = ?args, "docker compose");

        let output = self
            .compose()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to execute docker compose command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "docker compose {} failed: {}",
                args.join(" "),
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Service names declared in docker-compose.yml
    pub fn compose_services(&self) -> Result<Vec<String>> {
        use serde_yaml::Value;

        let compose_content = std::fs::read_to_string(&self.compose_file)
            .with_context(|| format!("Failed to read {}", self.compose_file.display()))?;

        let yaml: Value = serde_yaml::from_str(&compose_content)
            .with_context(|| format!("Failed to parse {}", self.compose_file.display()))?;

        let services = yaml
            .get("services")
            .and_then(|s| s.as_mapping())
            .map(|map| {
                map.keys()
                    .filter_map(|k| k.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(services)
    }

    /// Fail early if the configured database or application service is not in the compose file
    pub fn ensure_services_defined(&self) -> Result<()> {
        let services = self.compose_services()?;
        for wanted in [&self.target.db_service, &self.target.app_service] {
            if !services.iter().any(|s| s == wanted) {
                bail!(
                    "Service '{}' is not defined in {} (found: {})",
                    wanted,
                    self.compose_file.display(),
                    services.join(", ")
                );
            }
        }
        Ok(())
    }

    /// Containers belonging to this compose project
    pub async fn list_services(&self) -> Result<Vec<ServiceStatus>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!(
                "com.docker.compose.project.working_dir={}",
                self.project_root.display()
            )],
        );

        let options = Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        });

        let containers = self.docker.list_containers(options).await?;

        let services = containers
            .into_iter()
            .map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| "unknown".to_string());

                let service = c
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get("com.docker.compose.service"))
                    .cloned()
                    .unwrap_or_else(|| name.clone());

                let status = c.status.clone().unwrap_or_else(|| "unknown".to_string());
                let state = c.state.as_deref().unwrap_or("unknown").into();

                // Check unhealthy BEFORE healthy (unhealthy contains "healthy" as substring)
                let health = c.status.as_ref().and_then(|s| {
                    if s.contains("unhealthy") {
                        Some("unhealthy".to_string())
                    } else if s.contains("starting") {
                        Some("starting".to_string())
                    } else if s.contains("healthy") {
                        Some("healthy".to_string())
                    } else {
                        None
                    }
                });

                ServiceStatus {
                    name,
                    service,
                    state,
                    status,
                    health,
                }
            })
            .collect();

        Ok(services)
    }

    async fn pg_isready(&self) -> bool {
        self.compose_command(&[
            "exec",
            "-T",
            self.target.db_service.as_str(),
            "pg_isready",
            "-U",
            self.target.db_user.as_str(),
        ])
        .await
        .is_ok()
    }
}

#[async_trait]
impl StackController for DockerManager {
    async fn stop_all(&self) -> Result<()> {
        info!("stopping all services");
        self.compose_command(&["down"]).await?;
        Ok(())
    }

    async fn start_service(&self, service: &str) -> Result<()> {
        info!(service, "starting service");
        // `up --no-deps` rather than `start`: containers are gone after `down`
        self.compose_command(&["up", "-d", "--no-deps", service]).await?;
        Ok(())
    }

    async fn wait_for_database(&self) -> Result<()> {
        for attempt in 1..=DB_READY_ATTEMPTS {
            if self.pg_isready().await {
                info!(attempt, "database is accepting connections");
                return Ok(());
            }
            debug!(attempt, "database not ready yet");
            tokio::time::sleep(DB_READY_INTERVAL).await;
        }

        bail!(
            "database service '{}' did not accept connections after {} attempts",
            self.target.db_service,
            DB_READY_ATTEMPTS
        )
    }

    async fn start_all(&self) -> Result<()> {
        info!("starting all services");
        self.compose_command(&["up", "-d"]).await?;
        Ok(())
    }
}

#[async_trait]
impl DatabaseDumper for DockerManager {
    async fn dump(&self, out: &Path) -> Result<()> {
        let file = std::fs::File::create(out)
            .with_context(|| format!("Failed to create {}", out.display()))?;

        // --create so the dump can rebuild the database on an empty server
        let output = self
            .compose()
            .args([
                "exec",
                "-T",
                self.target.db_service.as_str(),
                "pg_dump",
                "-U",
                self.target.db_user.as_str(),
                "--clean",
                "--if-exists",
                "--create",
                self.target.database.as_str(),
            ])
            .stdout(Stdio::from(file))
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to run pg_dump")?;

        if !output.status.success() {
            bail!(
                "pg_dump exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!(stderr = %stderr.trim(), "pg_dump reported warnings");
        }

        Ok(())
    }
}

#[async_trait]
impl DatabaseRestorer for DockerManager {
    async fn restore(&self, dump: &Path) -> Result<()> {
        let file = std::fs::File::open(dump)
            .with_context(|| format!("Failed to open {}", dump.display()))?;

        // The dump carries its own CREATE DATABASE, so connect to the maintenance db
        let output = self
            .compose()
            .args([
                "exec",
                "-T",
                self.target.db_service.as_str(),
                "psql",
                "-v",
                "ON_ERROR_STOP=1",
                "--quiet",
                "-U",
                self.target.db_user.as_str(),
                "-d",
                "postgres",
            ])
            .stdin(Stdio::from(file))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run psql")?;

        if !output.status.success() {
            bail!(
                "psql exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(())
    }
}
