/// Command execution utilities shared by the limactl, vcluster and kubectl clients
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ClusterError, Result};

/// Result from command execution with captured output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl CommandOutput {
    /// Create from tokio Command output
    fn from_output(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }

    /// What the tool reported: stderr when it wrote any, stdout otherwise
    pub fn message(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }

    /// Return stdout if successful, otherwise a `CommandFailed` error
    pub fn into_result(self, step: String, remediation: Option<String>) -> Result<String> {
        if self.success {
            return Ok(self.stdout);
        }
        Err(ClusterError::CommandFailed {
            step,
            output: strip_ansi(self.message().trim()),
            remediation: remediation
                .map(|r| format!("\n\n{}", r))
                .unwrap_or_default(),
        })
    }
}

/// A fully described external process call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// Hand the terminal to the process instead of capturing its output
    pub stream: bool,
}

impl Invocation {
    /// Human readable command line, used in logs and error messages
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runs invocations. `SystemExecutor` spawns real processes.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, invocation: &Invocation) -> std::io::Result<CommandOutput>;
}

/// Executes commands on the local machine with tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

#[async_trait]
impl Executor for SystemExecutor {
    async fn execute(&self, invocation: &Invocation) -> std::io::Result<CommandOutput> {
        debug!("Running command: {}", invocation.command_line());

        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        for (key, val) in &invocation.envs {
            command.env(key, val);
        }

        if invocation.stream {
            warn!("[BEGIN - output of {}]------------------------------", invocation.program);
            warn!("Instructions printed by the underlying tool may not apply to fieldctl");
            let status = command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .await?;
            warn!("[END - output of {}]--------------------------------", invocation.program);
            debug!("Exit status: {}", status);
            return Ok(CommandOutput {
                success: status.success(),
                ..CommandOutput::default()
            });
        }

        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        let output = CommandOutput::from_output(output);
        debug!(
            "Exit success: {}\nSTDOUT:\n{}\nSTDERR:\n{}",
            output.success,
            strip_ansi(&output.stdout),
            strip_ansi(&output.stderr)
        );
        Ok(output)
    }
}

/// Builder for executing external commands with common patterns
pub struct CommandBuilder {
    invocation: Invocation,
    context_msg: Option<String>,
    remediation: Option<String>,
}

impl CommandBuilder {
    /// Create a new command builder
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            invocation: Invocation {
                program: program.as_ref().to_string_lossy().into_owned(),
                args: Vec::new(),
                envs: Vec::new(),
                stream: false,
            },
            context_msg: None,
            remediation: None,
        }
    }

    /// Add a single argument
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.invocation
            .args
            .push(arg.as_ref().to_string_lossy().into_owned());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.invocation
            .args
            .extend(args.into_iter().map(|a| a.as_ref().to_string_lossy().into_owned()));
        self
    }

    /// Set an environment variable
    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.invocation.envs.push((
            key.as_ref().to_string_lossy().into_owned(),
            val.as_ref().to_string_lossy().into_owned(),
        ));
        self
    }

    /// Set KUBECONFIG environment variable
    pub fn kubeconfig(self, path: &Path) -> Self {
        self.env("KUBECONFIG", path)
    }

    /// Set context message for error reporting
    pub fn context<S: Into<String>>(mut self, msg: S) -> Self {
        self.context_msg = Some(msg.into());
        self
    }

    /// Recovery hint appended to the error when the command fails
    pub fn remediation<S: Into<String>>(mut self, msg: S) -> Self {
        self.remediation = Some(msg.into());
        self
    }

    /// Stream output to the terminal instead of capturing it
    pub fn stream(mut self) -> Self {
        self.invocation.stream = true;
        self
    }

    fn step(&self) -> String {
        self.context_msg
            .clone()
            .unwrap_or_else(|| self.invocation.command_line())
    }

    /// Execute and return raw output
    pub async fn output(self, executor: &dyn Executor) -> Result<CommandOutput> {
        executor
            .execute(&self.invocation)
            .await
            .map_err(|source| ClusterError::Spawn {
                program: self.invocation.program.clone(),
                source,
            })
    }

    /// Execute and return stdout on success, error on failure
    pub async fn run(self, executor: &dyn Executor) -> Result<String> {
        let step = self.step();
        let remediation = self.remediation.clone();
        self.output(executor).await?.into_result(step, remediation)
    }

    /// Execute and ignore output (just check success)
    pub async fn run_silent(self, executor: &dyn Executor) -> Result<()> {
        self.run(executor).await.map(|_| ())
    }
}

/// Check if a command-line tool is installed
pub async fn check_tool_installed(
    executor: &dyn Executor,
    tool_name: &str,
    version_args: &[&str],
    install_url: &str,
) -> Result<()> {
    let output = CommandBuilder::new(tool_name)
        .args(version_args)
        .output(executor)
        .await;

    match output {
        Ok(out) if out.success => Ok(()),
        _ => Err(ClusterError::ToolMissing {
            tool: tool_name.to_string(),
            install_url: install_url.to_string(),
        }),
    }
}

/// Parse "JSON lines" output: one JSON object per line, no enclosing array.
///
/// `limactl ls --json` prints its VMs this way. A regular JSON array is
/// accepted too so a tool switching formats does not break listing.
pub fn parse_json_lines<T: DeserializeOwned>(text: &str) -> serde_json::Result<Vec<T>> {
    let trimmed = text.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed);
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(serde_json::from_str)
        .collect()
}

/// Remove ANSI escape sequences (colors, cursor moves) from tool output
pub fn strip_ansi(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            // Parameters and intermediates run until the final byte in @..~
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&Invocation) -> CommandOutput + Send + Sync>;

    /// Executor answering from a closure and recording every call
    pub struct ScriptedExecutor {
        responder: Responder,
        calls: Mutex<Vec<Invocation>>,
    }

    impl ScriptedExecutor {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&Invocation) -> CommandOutput + Send + Sync + 'static,
        {
            Self {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }

        /// Calls whose program matches and whose arguments contain `needle`
        pub fn calls_with(&self, program: &str, needle: &str) -> Vec<Invocation> {
            self.calls()
                .into_iter()
                .filter(|c| c.program == program && c.args.iter().any(|a| a == needle))
                .collect()
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(&self, invocation: &Invocation) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            Ok((self.responder)(invocation))
        }
    }

    pub fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            success: true,
        }
    }

    pub fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            success: false,
        }
    }
}
