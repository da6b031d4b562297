use crate::network::error::{NetworkError, NetworkResult};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandResult {
    /// Build a result for a command that exited with `code`
    pub fn from_exit(code: i32, stdout: &str, stderr: &str) -> Self {
        Self {
            success: code == 0,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(code),
        }
    }
}

/// Runs host tools (modprobe, dnsmasq, iptables, pkill, ss...).
///
/// Every OS interaction of the reconciler that is not netlink goes through this
/// seam so that it is awaited, bounded by a timeout, and replaceable in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> NetworkResult<CommandResult>;
}

/// Executes commands with tokio::process and a hard timeout.
pub struct CommandExecutor {
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Check if a command is available in the system PATH
    pub async fn is_command_available(command: &str) -> bool {
        tokio::process::Command::new("which")
            .arg(command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl CommandRunner for CommandExecutor {
    async fn run(&self, program: &str, args: &[&str]) -> NetworkResult<CommandResult> {
        let rendered = render(program, args);
        tracing::debug!("exec: {}", rendered);

        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(NetworkError::Io)?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(NetworkError::Io)?,
            Err(_) => {
                return Err(NetworkError::Timeout(format!(
                    "'{}' did not finish within {}s",
                    rendered,
                    self.timeout.as_secs()
                )))
            }
        };

        Ok(CommandResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }
}

/// Render a command line for logs and error messages
pub fn render(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

/// Run a command and turn a non-zero exit into `NetworkError::Command`
pub async fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
) -> NetworkResult<CommandResult> {
    let result = runner.run(program, args).await?;
    if !result.success {
        return Err(NetworkError::Command {
            cmd: render(program, args),
            stderr: result.stderr.trim().to_string(),
        });
    }
    Ok(result)
}
