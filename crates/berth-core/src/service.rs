//! External process manager.
//!
//! The engine only ever asks for state transitions (restart, stop) and reads
//! back whatever the manager printed; it never owns the serving process.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

/// Result of one process-manager command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceOutput {
    pub success: bool,
    /// stdout followed by stderr.
    pub output: String,
}

impl ServiceOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn restart(&self) -> ServiceOutput;
    async fn stop(&self) -> ServiceOutput;
    async fn status(&self) -> ServiceOutput;
}

/// `systemctl`-driven [`ServiceManager`].
#[derive(Debug, Clone)]
pub struct SystemdServiceManager {
    service_name: String,
    use_sudo: bool,
}

impl SystemdServiceManager {
    pub fn new(service_name: impl Into<String>, use_sudo: bool) -> Self {
        Self {
            service_name: service_name.into(),
            use_sudo,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Argument vector for `program args...`, prefixed with `sudo -n` when
    /// configured.
    fn command_line(&self, program: &str, args: &[&str]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 3);
        if self.use_sudo {
            argv.push("sudo".to_string());
            argv.push("-n".to_string());
        }
        argv.push(program.to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    async fn run(&self, argv: Vec<String>) -> ServiceOutput {
        debug!(command = %argv.join(" "), "running service command");
        let Some((exe, args)) = argv.split_first() else {
            return ServiceOutput::failed("empty command");
        };
        let output = Command::new(exe)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match output {
            Ok(out) => {
                let mut text = String::from_utf8_lossy(&out.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                ServiceOutput {
                    success: out.status.success(),
                    output: text,
                }
            }
            Err(e) => ServiceOutput::failed(format!("failed to run {}: {}", exe, e)),
        }
    }

    /// Last `lines` journal lines of the service.
    pub async fn journal(&self, lines: u32) -> ServiceOutput {
        let lines = lines.to_string();
        let argv = self.command_line(
            "journalctl",
            &["-u", &self.service_name, "-n", &lines, "--no-pager"],
        );
        self.run(argv).await
    }
}

#[async_trait]
impl ServiceManager for SystemdServiceManager {
    async fn restart(&self) -> ServiceOutput {
        let argv = self.command_line("systemctl", &["restart", &self.service_name]);
        self.run(argv).await
    }

    async fn stop(&self) -> ServiceOutput {
        let argv = self.command_line("systemctl", &["stop", &self.service_name]);
        self.run(argv).await
    }

    async fn status(&self) -> ServiceOutput {
        let argv = self.command_line("systemctl", &["status", &self.service_name, "--no-pager"]);
        self.run(argv).await
    }
}
