// Daemon core - Binds the descriptor, the supervisor and IPC commands together

use crate::config::{AppSpec, Descriptor};
use crate::error::{Result, TetherError};
use crate::ipc::{Command, RejectedEntry, ResponseData};
use crate::process::Supervisor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Serves CLI commands against one descriptor file
#[derive(Clone)]
pub struct Daemon {
    supervisor: Supervisor,
    descriptor_path: PathBuf,
    descriptor: Arc<RwLock<Descriptor>>,
}

impl Daemon {
    /// Load the descriptor; fails only when the file itself is unusable
    pub fn new(supervisor: Supervisor, descriptor_path: impl AsRef<Path>) -> Result<Self> {
        let descriptor_path = descriptor_path.as_ref().to_path_buf();
        let descriptor = Descriptor::load(&descriptor_path)?;
        log_rejected(&descriptor);

        Ok(Self {
            supervisor,
            descriptor_path,
            descriptor: Arc::new(RwLock::new(descriptor)),
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Start every valid app of the descriptor
    ///
    /// A failing app is logged and does not keep the others from starting.
    /// Returns the number of apps that started.
    pub async fn start_all(&self) -> usize {
        let descriptor = self.descriptor.read().await;
        let mut started = 0;

        for spec in &descriptor.apps {
            match self.supervisor.start(spec.clone()).await {
                Ok(_) => started += 1,
                Err(e) => error!(app = %spec.name, "Failed to start: {}", e),
            }
        }

        info!("Started {} of {} app(s)", started, descriptor.apps.len());
        started
    }

    /// Execute one CLI command
    pub async fn handle(&self, command: Command) -> Result<ResponseData> {
        match command {
            Command::Start { name } => {
                let spec = self.lookup(&name).await?;
                let instances = self.supervisor.start(spec).await?;
                Ok(ResponseData::Started { name, instances })
            }
            Command::Stop { name } => {
                let instances = self.supervisor.stop(&name).await?;
                Ok(ResponseData::Stopped { name, instances })
            }
            Command::Restart { name } => {
                let instances = self.supervisor.restart(&name).await?;
                Ok(ResponseData::Restarted { name, instances })
            }
            Command::Status { name: Some(name) } => {
                Ok(ResponseData::Status(self.supervisor.status(&name).await?))
            }
            Command::Status { name: None } => {
                Ok(ResponseData::Status(self.supervisor.status_all().await))
            }
            Command::Reload => self.reload().await,
        }
    }

    /// Re-read the descriptor and reload every app in it
    ///
    /// Apps that disappeared from the descriptor are stopped. When the file
    /// cannot be read the running apps are left untouched.
    pub async fn reload(&self) -> Result<ResponseData> {
        let fresh = Descriptor::load(&self.descriptor_path)?;
        log_rejected(&fresh);

        let mut descriptor = self.descriptor.write().await;

        for name in self.supervisor.app_names().await {
            if fresh.get(&name).is_none() {
                info!(app = %name, "Removed from descriptor, stopping");
                if let Err(e) = self.supervisor.stop(&name).await {
                    error!(app = %name, "Failed to stop: {}", e);
                }
            }
        }

        let mut apps = Vec::new();
        let mut rejected: Vec<RejectedEntry> = fresh
            .rejected
            .iter()
            .map(|r| RejectedEntry {
                name: r.name.clone(),
                error: r.error.to_string(),
            })
            .collect();

        for spec in &fresh.apps {
            match self.supervisor.reload(spec.clone()).await {
                Ok(_) => apps.push(spec.name.clone()),
                Err(e) => {
                    error!(app = %spec.name, "Failed to reload: {}", e);
                    rejected.push(RejectedEntry {
                        name: spec.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        *descriptor = fresh;
        Ok(ResponseData::Reloaded { apps, rejected })
    }

    async fn lookup(&self, name: &str) -> Result<AppSpec> {
        let descriptor = self.descriptor.read().await;

        if let Some(spec) = descriptor.get(name) {
            return Ok(spec.clone());
        }

        match descriptor.rejected.iter().find(|r| r.name == name) {
            Some(rejected) => Err(TetherError::InvalidConfig(format!(
                "app '{}' was rejected: {}",
                name, rejected.error
            ))),
            None => Err(TetherError::AppNotFound(name.to_string())),
        }
    }
}

fn log_rejected(descriptor: &Descriptor) {
    for rejected in &descriptor.rejected {
        warn!(app = %rejected.name, "Skipping app: {}", rejected.error);
    }
}
