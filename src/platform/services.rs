use std::path::PathBuf;
use std::process::Command;

use crate::util::process::{self, CommandError};

/// Stopping and starting the platform's services.
///
/// Both operations are best-effort: failures are logged, never propagated.
pub trait ServiceControl {
    /// External commands needed to control the services.
    fn required_tools(&self) -> Vec<&str>;

    fn stop(&self, dry_run: bool);

    fn start(&self, dry_run: bool);
}

/// Services managed by `docker compose` (or a compatible command).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ComposeServices {
    /// Command prefix, e.g. `["docker", "compose"]` or `["tutor", "local"]`.
    pub command: Vec<String>,

    /// Project directory passed as `--project-directory`.
    pub project_dir: Option<PathBuf>,

    /// Names of the services to stop during a backup.
    pub names: Vec<String>,
}

impl Default for ComposeServices {
    fn default() -> Self {
        Self {
            command: vec!["docker".into(), "compose".into()],
            project_dir: None,
            names: ["lms", "cms", "lms-worker", "cms-worker"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl ComposeServices {
    fn command(&self, action: &str) -> Option<Command> {
        let (program, args) = self.command.split_first()?;
        let mut command = Command::new(program);
        command.args(args);
        if let Some(project_dir) = &self.project_dir {
            command.arg("--project-directory").arg(project_dir);
        }
        command.arg(action).args(&self.names);
        Some(command)
    }

    fn execute_command(&self, action: &str, dry_run: bool) -> Result<(), CommandError> {
        let Some(mut command) = self.command(action) else {
            log::warn!(
                target: "platform::services",
                "No service command configured, skipping {action}"
            );
            return Ok(());
        };

        if dry_run {
            process::print_dry_run(&command);
            return Ok(());
        }

        process::output(&mut command, "platform::services")?;
        Ok(())
    }
}

impl ServiceControl for ComposeServices {
    fn required_tools(&self) -> Vec<&str> {
        self.command.first().map(String::as_str).into_iter().collect()
    }

    fn stop(&self, dry_run: bool) {
        log::info!(target: "platform::services", "Stopping services: {}", self.names.join(", "));
        if let Err(e) = self.execute_command("stop", dry_run) {
            log::warn!(target: "platform::services", "Stopping services failed: {e}");
        }
    }

    fn start(&self, dry_run: bool) {
        log::info!(target: "platform::services", "Starting services: {}", self.names.join(", "));
        if let Err(e) = self.execute_command("start", dry_run) {
            log::warn!(target: "platform::services", "Starting services failed: {e}");
        }
    }
}

/// Stopped services which are started again once the guard is dropped.
pub struct ServiceGuard<'a> {
    services: &'a dyn ServiceControl,
    dry_run: bool,
}

impl<'a> ServiceGuard<'a> {
    /// Stops `services` until the returned guard is dropped.
    pub fn stop(services: &'a dyn ServiceControl, dry_run: bool) -> Self {
        services.stop(dry_run);
        Self { services, dry_run }
    }
}

impl Drop for ServiceGuard<'_> {
    fn drop(&mut self) {
        self.services.start(self.dry_run)
    }
}
