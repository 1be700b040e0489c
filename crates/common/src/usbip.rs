//! External `usbip` tool invocation
//!
//! All kernel-level USB/IP work (binding to `usbip-host`, attaching through
//! `vhci_hcd`, listing ports) is delegated to the `usbip` command-line tool.
//! Every invocation is a synchronous external call with a hard deadline;
//! a non-zero exit is always surfaced with the captured stderr.
//!
//! The process launcher sits behind [`CommandRunner`] so the server registry
//! and client dispatcher can be exercised without root or real hardware.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};

/// Captured result of an external command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Process exited with status zero
    pub success: bool,
    /// Exit code, if the process was not killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    fn status_text(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Launches external processes
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program args...`, killing it if it outlives `timeout`
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands as real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let command_line = command_line(program, args);
        debug!("Running command: {}", command_line);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                command: command_line.clone(),
                source,
            })?;

        // Dropping the wait future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                error!("Command '{}' timed out after {:?}", command_line, timeout);
                return Err(Error::Timeout {
                    command: command_line,
                    timeout,
                });
            }
        };

        debug!(
            "Command completed with exit code {:?}",
            output.status.code()
        );

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// How to invoke the `usbip` tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbipSettings {
    /// Program name or path of the usbip tool
    #[serde(default = "UsbipSettings::default_program")]
    pub program: String,
    /// Prefix privileged operations (bind/unbind/attach/detach) with sudo
    #[serde(default = "UsbipSettings::default_use_sudo")]
    pub use_sudo: bool,
    /// Hard deadline for a single invocation
    #[serde(default = "UsbipSettings::default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for UsbipSettings {
    fn default() -> Self {
        Self {
            program: Self::default_program(),
            use_sudo: Self::default_use_sudo(),
            command_timeout_secs: Self::default_command_timeout(),
        }
    }
}

impl UsbipSettings {
    fn default_program() -> String {
        "usbip".to_string()
    }

    fn default_use_sudo() -> bool {
        true
    }

    fn default_command_timeout() -> u64 {
        10
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Typed front-end to the `usbip` command-line tool
#[derive(Clone)]
pub struct UsbipTool {
    settings: UsbipSettings,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for UsbipTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbipTool")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl UsbipTool {
    pub fn new(settings: UsbipSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self { settings, runner }
    }

    /// Tool that launches real processes
    pub fn system(settings: UsbipSettings) -> Self {
        Self::new(settings, Arc::new(SystemRunner))
    }

    pub fn settings(&self) -> &UsbipSettings {
        &self.settings
    }

    /// `usbip list -l`: locally attached devices, human-readable form
    pub async fn list_local(&self) -> Result<String> {
        let output = self.invoke(false, &["list", "-l"]).await?;
        Ok(output.stdout)
    }

    /// `usbip bind -b BUS`: make a device exportable
    pub async fn bind(&self, bus_id: &str) -> Result<()> {
        self.invoke(true, &["bind", "-b", bus_id]).await?;
        Ok(())
    }

    /// `usbip unbind -b BUS`: return a device to its normal driver
    pub async fn unbind(&self, bus_id: &str) -> Result<()> {
        self.invoke(true, &["unbind", "-b", bus_id]).await?;
        Ok(())
    }

    /// `usbip attach -r HOST -b BUS`: import a remote device
    pub async fn attach(&self, host: &str, bus_id: &str) -> Result<()> {
        self.invoke(true, &["attach", "-r", host, "-b", bus_id]).await?;
        Ok(())
    }

    /// `usbip detach -p PORT`: release an imported device
    pub async fn detach(&self, port: u16) -> Result<()> {
        let port = port.to_string();
        self.invoke(true, &["detach", "-p", port.as_str()]).await?;
        Ok(())
    }

    /// `usbip port`: table of locally imported devices
    pub async fn port(&self) -> Result<String> {
        let output = self.invoke(false, &["port"]).await?;
        Ok(output.stdout)
    }

    async fn invoke(&self, privileged: bool, args: &[&str]) -> Result<CommandOutput> {
        let (program, full_args) = if privileged && self.settings.use_sudo {
            let mut full: Vec<String> = vec![self.settings.program.clone()];
            full.extend(args.iter().map(|a| a.to_string()));
            ("sudo", full)
        } else {
            (
                self.settings.program.as_str(),
                args.iter().map(|a| a.to_string()).collect(),
            )
        };

        let output = self
            .runner
            .run(program, &full_args, self.settings.command_timeout())
            .await?;

        if !output.success {
            let command = command_line(program, &full_args);
            error!(
                "Command '{}' failed with {}",
                command,
                output.status_text()
            );
            error!("Stderr: {}", output.stderr.trim());
            return Err(Error::ExternalTool {
                command,
                status: output.status_text(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(output)
    }
}

/// Render a command for logs and error messages
pub fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockRunner;

    fn tool(use_sudo: bool) -> (UsbipTool, Arc<MockRunner>) {
        let runner = Arc::new(MockRunner::new());
        let settings = UsbipSettings {
            use_sudo,
            ..UsbipSettings::default()
        };
        (UsbipTool::new(settings, runner.clone()), runner)
    }

    #[tokio::test]
    async fn test_privileged_commands_use_sudo() {
        let (tool, runner) = tool(true);
        tool.bind("1-1.1").await.unwrap();
        tool.port().await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0], vec!["sudo", "usbip", "bind", "-b", "1-1.1"]);
        assert_eq!(calls[1], vec!["usbip", "port"]);
    }

    #[tokio::test]
    async fn test_sudo_can_be_disabled() {
        let (tool, runner) = tool(false);
        tool.attach("192.168.1.30", "1-1.1").await.unwrap();
        assert_eq!(
            runner.calls()[0],
            vec!["usbip", "attach", "-r", "192.168.1.30", "-b", "1-1.1"]
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_stderr() {
        let (tool, runner) = tool(false);
        runner.push_output(
            "unbind",
            CommandOutput::failed(1, "usbip: error: device is not bound\n"),
        );

        let err = tool.unbind("1-1.1").await.unwrap_err();
        match err {
            Error::ExternalTool {
                command,
                status,
                stderr,
            } => {
                assert_eq!(command, "usbip unbind -b 1-1.1");
                assert_eq!(status, "exit code 1");
                assert_eq!(stderr, "usbip: error: device is not bound");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_detach_passes_port_number() {
        let (tool, runner) = tool(false);
        tool.detach(3).await.unwrap();
        assert_eq!(runner.calls()[0], vec!["usbip", "detach", "-p", "3"]);
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let args = vec!["-c".to_string(), "echo hello; echo oops >&2; exit 3".to_string()];
        let output = SystemRunner
            .run("sh", &args, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_system_runner_enforces_deadline() {
        let args = vec!["5".to_string()];
        let err = SystemRunner
            .run("sleep", &args, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_system_runner_missing_program() {
        let err = SystemRunner
            .run("definitely-not-a-real-usbip-binary", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[test]
    fn test_settings_defaults_from_empty_toml() {
        let settings: UsbipSettings = toml::from_str("").unwrap();
        assert_eq!(settings, UsbipSettings::default());
        assert!(settings.use_sudo);
        assert_eq!(settings.command_timeout(), Duration::from_secs(10));
    }
}
