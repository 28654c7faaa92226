use super::Result;
use async_trait::async_trait;
use eyre::{eyre, WrapErr};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::context::RunContext;

/// Environment variable naming the subject executable
pub const BINARY_ENV: &str = "SUBJECT_BINARY";

/// Executable used when `SUBJECT_BINARY` is not set
pub const DEFAULT_BINARY: &str = "syslog-ng";

/// Configuration file written into the working directory
pub const CONFIG_FILE: &str = "test.conf";

/// PID file the subject maintains
pub const PID_FILE: &str = "subject.pid";

/// Persisted-state file the subject maintains between runs
pub const PERSIST_FILE: &str = "subject.persist";

/// Resolves the subject executable from the environment
pub fn locate_binary() -> PathBuf {
    std::env::var_os(BINARY_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY))
}

/// Configuration for launching and driving the subject process
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Subject executable
    pub binary: PathBuf,
    /// Directory holding the config, PID and persist files
    pub working_directory: PathBuf,
    /// Module search path passed to the subject
    pub module_path: Option<String>,
    /// File descriptor limit passed to the subject
    pub fd_limit: u32,
    /// Ask the subject for debug and verbose output
    pub verbose: bool,
    /// Keep the persist file from the previous run
    pub keep_persist: bool,
    /// Wait after launch before the subject is considered ready
    pub start_settle: Duration,
    /// Wait after a reload signal for the subject to flush its outputs
    pub reload_settle: Duration,
    /// Files (relative to the working directory) removed before every start
    pub stale_artifacts: Vec<PathBuf>,
    /// Extra environment variables for the subject
    pub environment: HashMap<String, String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            binary: locate_binary(),
            working_directory: PathBuf::from("."),
            module_path: None,
            fd_limit: 1024,
            verbose: false,
            keep_persist: false,
            start_settle: Duration::from_secs(5),
            reload_settle: Duration::from_secs(2),
            stale_artifacts: Vec::new(),
            environment: HashMap::new(),
        }
    }
}

impl ControllerConfig {
    /// Fixed command line the subject is launched with
    pub fn subject_args(&self) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            CONFIG_FILE.to_string(),
            "--fd-limit".to_string(),
            self.fd_limit.to_string(),
            "-F".to_string(),
            if self.verbose { "-edv" } else { "-e" }.to_string(),
            "-p".to_string(),
            PID_FILE.to_string(),
            "-R".to_string(),
            PERSIST_FILE.to_string(),
            "--no-caps".to_string(),
            "--enable-core".to_string(),
            "--seed".to_string(),
        ];
        if let Some(ref module_path) = self.module_path {
            args.push("--module-path".to_string());
            args.push(module_path.clone());
        }
        args
    }
}

/// Signals the controller delivers to the subject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectSignal {
    /// Reload configuration and flush outputs
    Reload,
    /// Shut down gracefully
    Terminate,
}

impl SubjectSignal {
    pub fn as_nix(self) -> Signal {
        match self {
            SubjectSignal::Reload => Signal::SIGHUP,
            SubjectSignal::Terminate => Signal::SIGTERM,
        }
    }
}

/// A launched subject the controller can signal and reap
#[async_trait]
pub trait SubjectProcess: Send {
    fn pid(&self) -> Pid;

    /// Delivers a signal; a vanished process yields `nix::Error::ESRCH`
    fn signal(&self, signal: SubjectSignal) -> Result<()>;

    /// Returns the exit status if the process has already exited
    fn try_wait(&mut self) -> Result<Option<ExitStatus>>;

    /// Blocks until the process exits
    async fn wait(&mut self) -> Result<ExitStatus>;
}

/// POSIX child process implementation of `SubjectProcess`
pub struct ChildProcess {
    child: Child,
    pid: Pid,
}

impl ChildProcess {
    /// Spawns the command; the child is killed if the handle is dropped
    pub fn spawn(command: &mut Command) -> Result<Self> {
        command.kill_on_drop(true);
        let child = command.spawn()?;
        let pid = match child.id() {
            Some(pid) => Pid::from_raw(pid.try_into()?),
            None => return Err(eyre!("Failed to get process ID")),
        };
        Ok(Self { child, pid })
    }
}

#[async_trait]
impl SubjectProcess for ChildProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn signal(&self, signal: SubjectSignal) -> Result<()> {
        debug!("Sending signal {:?} to process {}", signal.as_nix(), self.pid);
        kill(self.pid, signal.as_nix())?;
        Ok(())
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }
}

/// Lifecycle state of the subject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectState {
    /// Launched, waiting for the start settle interval
    Starting,
    /// Accepting messages
    Running,
    /// Termination signal sent, waiting for exit
    Stopping,
    /// No subject process
    Stopped,
}

/// Owns the lifecycle of one subject process instance
///
/// `Stopped -> Running` on `start`, `Running -> Running` on `flush`,
/// `Running -> Stopped` on `stop`.
pub struct DaemonController {
    config: ControllerConfig,
    state: SubjectState,
    subject: Option<Box<dyn SubjectProcess>>,
    /// Configuration text of the most recent start
    config_text: Option<String>,
    /// Exit status of the last stopped subject
    exit_status: Option<ExitStatus>,
}

impl DaemonController {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            state: SubjectState::Stopped,
            subject: None,
            config_text: None,
            exit_status: None,
        }
    }

    /// Writes `config_text` and launches the subject with the fixed flag set
    ///
    /// Blocks for the start settle interval. Launch failures are returned,
    /// never retried.
    ///
    /// # Arguments
    /// * `config_text` - Complete subject configuration
    ///
    /// # Returns
    /// * `Result<()>` - Success or error
    pub async fn start(&mut self, config_text: &str) -> Result<()> {
        if self.subject.is_some() {
            return Err(eyre!("subject is already running"));
        }

        let workdir = self.config.working_directory.clone();
        self.remove_stale_artifacts(&workdir).await?;
        tokio::fs::write(workdir.join(CONFIG_FILE), config_text)
            .await
            .wrap_err_with(|| format!("failed to write {}", workdir.join(CONFIG_FILE).display()))?;

        let mut command = Command::new(&self.config.binary);
        command.args(self.config.subject_args());
        command.current_dir(&workdir);
        command.env("RANDFILE", "rnd");
        for (key, value) in &self.config.environment {
            command.env(key, value);
        }
        command.stdin(Stdio::null());

        info!("Spawning subject: {} {:?}", self.config.binary.display(), self.config.subject_args());
        self.state = SubjectState::Starting;
        let subject = match ChildProcess::spawn(&mut command) {
            Ok(subject) => subject,
            Err(e) => {
                self.state = SubjectState::Stopped;
                error!("failed to launch {}: {}", self.config.binary.display(), e);
                return Err(e.wrap_err(format!("failed to launch subject {}", self.config.binary.display())));
            }
        };

        self.attach(Box::new(subject), config_text);
        self.state = SubjectState::Starting;
        sleep(self.config.start_settle).await;

        if let Some(subject) = self.subject.as_mut() {
            if let Some(status) = subject.try_wait()? {
                self.subject = None;
                self.state = SubjectState::Stopped;
                self.exit_status = Some(status);
                return Err(eyre!("subject exited during startup with {}", status));
            }
        }

        self.state = SubjectState::Running;
        info!("Subject started with PID: {:?}", self.pid());
        Ok(())
    }

    /// Takes control of an already launched subject
    pub fn attach(&mut self, subject: Box<dyn SubjectProcess>, config_text: &str) {
        self.subject = Some(subject);
        self.config_text = Some(config_text.to_string());
        self.exit_status = None;
        self.state = SubjectState::Running;
    }

    async fn remove_stale_artifacts(&self, workdir: &Path) -> Result<()> {
        let mut stale = self.config.stale_artifacts.clone();
        if !self.config.keep_persist {
            stale.push(PathBuf::from(PERSIST_FILE));
        }
        for artifact in stale {
            let path = workdir.join(artifact);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("removed stale {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).wrap_err_with(|| format!("failed to remove {}", path.display())),
            }
        }
        Ok(())
    }

    /// Terminates the subject and reaps it
    ///
    /// A controller without a subject treats this as success. A subject that
    /// is already gone when the signal is sent counts as stopped.
    ///
    /// # Returns
    /// * `Result<bool>` - True only if the subject exited with status zero
    pub async fn stop(&mut self) -> Result<bool> {
        let Some(mut subject) = self.subject.take() else {
            return Ok(true);
        };

        self.state = SubjectState::Stopping;
        info!("Stopping subject {}", subject.pid());
        if let Err(e) = subject.signal(SubjectSignal::Terminate) {
            match e.downcast_ref::<nix::Error>() {
                Some(nix::Error::ESRCH) => debug!("subject {} already gone", subject.pid()),
                _ => {
                    self.subject = Some(subject);
                    self.state = SubjectState::Running;
                    return Err(e.wrap_err("failed to send termination signal"));
                }
            }
        }

        let status = subject.wait().await;
        self.state = SubjectState::Stopped;
        let status = status.wrap_err("failed to reap subject")?;
        self.exit_status = Some(status);

        if status.success() {
            info!("subject stopped");
            Ok(true)
        } else {
            warn!("subject exited with a non-zero status ({})", status);
            Ok(false)
        }
    }

    /// Makes the subject flush everything sent so far to its sinks
    ///
    /// Does nothing if nothing was sent since the last flush or no subject is
    /// running. Otherwise waits `settle_time`, sends the reload signal and
    /// waits for the reload to finish. A failed signal is returned as an
    /// error since the sinks cannot be trusted afterwards.
    pub async fn flush(&mut self, ctx: &mut RunContext, settle_time: Duration) -> Result<()> {
        if !ctx.needs_flush() {
            return Ok(());
        }
        let Some(subject) = self.subject.as_ref() else {
            return Ok(());
        };

        info!("waiting for subject to settle down before SIGHUP ({:?})", settle_time);
        sleep(settle_time).await;

        info!("Sending the subject the HUP signal (pid: {})", subject.pid());
        if let Err(e) = subject.signal(SubjectSignal::Reload) {
            error!("Error sending HUP signal to subject: {}", e);
            return Err(e.wrap_err("failed to deliver reload signal"));
        }

        info!("waiting for subject to process SIGHUP ({:?})", self.config.reload_settle);
        sleep(self.config.reload_settle).await;
        ctx.clear_flush();
        Ok(())
    }

    /// Delivers an arbitrary signal to the running subject
    pub fn signal(&self, signal: SubjectSignal) -> Result<()> {
        match self.subject {
            Some(ref subject) => subject.signal(signal),
            None => Err(eyre!("No subject to send signal to")),
        }
    }

    /// Reads the PID the subject wrote to its PID file
    pub async fn read_pid_file(&self) -> Result<Pid> {
        let path = self.config.working_directory.join(PID_FILE);
        let text = tokio::fs::read_to_string(&path)
            .await
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let raw: i32 = text
            .trim()
            .parse()
            .wrap_err_with(|| format!("invalid PID in {}: '{}'", path.display(), text.trim()))?;
        Ok(Pid::from_raw(raw))
    }

    pub fn pid(&self) -> Option<Pid> {
        self.subject.as_ref().map(|subject| subject.pid())
    }

    pub fn state(&self) -> SubjectState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SubjectState::Running
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn config_text(&self) -> Option<&str> {
        self.config_text.as_deref()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }
}

impl Drop for DaemonController {
    fn drop(&mut self) {
        // The child handle kills the process on drop
        if let Some(ref subject) = self.subject {
            warn!("controller dropped with running subject (PID: {}), killing it", subject.pid());
        }
    }
}
