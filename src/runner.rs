//! Runs a local command behind a stable hostname.
//!
//! The hostname comes from the workspace file (`.svcd.toml` or `.svcd.json`
//! in the command's working directory). The runner picks a free local port,
//! registers `hostname -> :<port>` on the exposed port (80 unless the file
//! says otherwise), starts the command with `PORT=<port>` in its environment
//! and removes the mapping once the command is gone.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use figment::{
    providers::{Format, Json, Toml},
    Figment,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::addr::Address;
use crate::proxy::http::DEFAULT_HTTP_PORT;
use crate::registry::MappingRegistry;
use crate::types::Mapping;

pub const WORKSPACE_TOML: &str = ".svcd.toml";
pub const WORKSPACE_JSON: &str = ".svcd.json";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkspaceConfig {
    pub hostname: String,
    /// Exposed port the command is reachable on.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_HTTP_PORT
}

impl WorkspaceConfig {
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(dir.join(WORKSPACE_TOML)))
            .merge(Json::file(dir.join(WORKSPACE_JSON)))
            .extract()
            .map_err(|e| {
                anyhow!(
                    "Failed to load workspace config in {}: {}",
                    dir.display(),
                    e
                )
            })?;

        if config.hostname.trim().is_empty() {
            bail!("workspace hostname must not be empty");
        }
        if config.port == 0 {
            bail!("workspace port must not be 0");
        }
        Ok(config)
    }
}

pub struct CommandRunner {
    registry: Arc<MappingRegistry>,
    workspace: WorkspaceConfig,
    dir: PathBuf,
}

impl CommandRunner {
    pub fn new(registry: Arc<MappingRegistry>, workspace: WorkspaceConfig, dir: PathBuf) -> Self {
        Self {
            registry,
            workspace,
            dir,
        }
    }

    /// Loads the workspace file from `dir` and runs commands there.
    pub fn from_dir(registry: Arc<MappingRegistry>, dir: PathBuf) -> anyhow::Result<Self> {
        let workspace = WorkspaceConfig::load(&dir)?;
        Ok(Self::new(registry, workspace, dir))
    }

    /// Runs `program` until it exits or `token` is canceled, in which case
    /// it is killed.
    ///
    /// A registry error (e.g. the hostname is already taken) is returned
    /// before anything is started. Once registered, the mapping is removed
    /// however the command ends.
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        token: CancellationToken,
    ) -> anyhow::Result<ExitStatus> {
        let port = free_port().await?;
        let mapping = Mapping::new(self.workspace.hostname.as_str())
            .with_port(self.workspace.port, Address::local(port));
        self.registry.create(mapping).await?;
        info!(
            "{} reachable on port {} via local port {}",
            self.workspace.hostname, self.workspace.port, port
        );

        let result = self.supervise(program, args, port, token).await;

        if self.registry.delete_by_host(&self.workspace.hostname).await.is_none() {
            warn!("mapping {} was already gone", self.workspace.hostname);
        }
        result
    }

    async fn supervise(
        &self,
        program: &str,
        args: &[String],
        port: u16,
        token: CancellationToken,
    ) -> anyhow::Result<ExitStatus> {
        debug!("execute command {} {:?} with PORT={}", program, args, port);
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.dir)
            .env("PORT", port.to_string())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", program))?;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = token.cancelled() => {
                info!("stopping {}", program);
                child.kill().await?;
                child.wait().await?
            }
        };
        debug!("{} exited with {}", program, status);
        Ok(status)
    }
}

async fn free_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("failed to find a free port")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use figment::Jail;
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::error::RegistryError;

    fn runner(registry: &Arc<MappingRegistry>) -> CommandRunner {
        CommandRunner::new(
            Arc::clone(registry),
            WorkspaceConfig {
                hostname: "app.services.local".into(),
                port: 80,
            },
            std::env::temp_dir(),
        )
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".into(), script.into()]
    }

    #[tokio::test]
    async fn mapping_lives_while_the_command_runs() {
        let registry = Arc::new(MappingRegistry::new());
        let token = CancellationToken::new();
        let task = {
            let runner = runner(&registry);
            let token = token.clone();
            tokio::spawn(async move { runner.run("sh", &sh("sleep 5"), token).await })
        };

        let mut backend = None;
        for _ in 0..400 {
            backend = registry.map_addr("app.services.local", 80).await;
            if backend.is_some() {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        let backend = backend.expect("command should be registered");
        assert!(backend.is_local());
        assert_ne!(backend.port, 0);

        token.cancel();
        let status = timeout(Duration::from_secs(2), task)
            .await
            .expect("canceled command should stop")
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(!registry.has_host("app.services.local").await);
    }

    #[tokio::test]
    async fn mapping_is_removed_after_exit() {
        let registry = Arc::new(MappingRegistry::new());
        let status = runner(&registry)
            .run("sh", &sh("test -n \"$PORT\" && exit 3"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status.code(), Some(3));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn mapping_is_removed_when_the_command_cannot_start() {
        let registry = Arc::new(MappingRegistry::new());
        let err = runner(&registry)
            .run("/nonexistent/svcd-command", &[], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn taken_hostname_is_reported() {
        let registry = Arc::new(MappingRegistry::new());
        let owner = Mapping::new("app.services.local").with_port(80, Address::local(9000));
        registry.create(owner.clone()).await.unwrap();

        let err = runner(&registry)
            .run("sh", &sh("exit 0"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RegistryError>(),
            Some(RegistryError::AlreadyRegistered { .. })
        ));
        assert_eq!(registry.list().await, vec![owner]);
    }

    #[test]
    fn loads_workspace_file() {
        Jail::expect_with(|jail| {
            jail.create_file(WORKSPACE_TOML, r#"hostname = "api.myproject.local""#)?;
            let config = WorkspaceConfig::load(jail.directory()).map_err(|e| e.to_string())?;
            assert_eq!(config.hostname, "api.myproject.local");
            assert_eq!(config.port, 80);

            jail.create_file(WORKSPACE_JSON, r#"{"port": 3000}"#)?;
            let config = WorkspaceConfig::load(jail.directory()).map_err(|e| e.to_string())?;
            assert_eq!(config.port, 3000);
            Ok(())
        });
    }

    #[test]
    fn workspace_file_needs_a_hostname() {
        Jail::expect_with(|jail| {
            assert!(WorkspaceConfig::load(jail.directory()).is_err());
            jail.create_file(WORKSPACE_TOML, r#"hostname = "  ""#)?;
            assert!(WorkspaceConfig::load(jail.directory()).is_err());
            Ok(())
        });
    }
}
