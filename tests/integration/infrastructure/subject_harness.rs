use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

use delivery_oracle::{ControllerConfig, DaemonController, RunContext};

use super::IntoAnyhow;

/// Shell script run as the subject's configuration
///
/// `/bin/sh -f test.conf ...` executes the configuration text as a script, so
/// the controller's fixed flag set launches a daemon-like process that keeps
/// a PID file, records every reload and exits cleanly on termination.
pub const SHELL_SUBJECT: &str = r#"
echo $$ > subject.pid
trap 'echo reload >> reload.marker' HUP
trap 'exit 0' TERM
while :; do sleep 0.05; done
"#;

/// Settle time used before every flush in tests
pub const TEST_SETTLE: Duration = Duration::from_millis(200);

/// Owns a working directory, a controller and the run context for one test
pub struct SubjectHarness {
    temp_dir: TempDir,
    pub controller: DaemonController,
    pub ctx: RunContext,
}

impl SubjectHarness {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        let controller = DaemonController::new(Self::config_for(temp_dir.path()));
        Ok(Self {
            temp_dir,
            controller,
            ctx: RunContext::new(),
        })
    }

    /// Controller configuration with short settle intervals
    pub fn config_for(dir: &Path) -> ControllerConfig {
        ControllerConfig {
            binary: PathBuf::from("/bin/sh"),
            working_directory: dir.to_path_buf(),
            start_settle: Duration::from_millis(300),
            reload_settle: Duration::from_millis(200),
            ..Default::default()
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    pub async fn start(&mut self) -> Result<()> {
        self.controller
            .start(SHELL_SUBJECT)
            .await
            .anyhow()
            .context("Failed to start shell subject")
    }

    /// Number of reload signals the subject has handled
    pub fn reloads(&self) -> usize {
        std::fs::read_to_string(self.path("reload.marker"))
            .map(|text| text.lines().count())
            .unwrap_or(0)
    }
}
