//! Process execution boundary
//!
//! Every invocation of easy-rsa, openvpn and wg goes through [`CommandRunner`]
//! so the provisioning code can be driven by a scripted fake in tests.

use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// A fully described external invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Run through a privilege wrapper such as `sudo`, keeping the original
    /// program visible as the first argument.
    pub fn with_prefix(mut self, prefix: &[String]) -> Self {
        let Some((wrapper, wrapper_args)) = prefix.split_first() else {
            return self;
        };
        let mut args: Vec<String> = wrapper_args.to_vec();
        // sudo drops the caller's environment unless told to keep it
        if wrapper == "sudo" && !self.env.is_empty() {
            args.push(format!(
                "--preserve-env={}",
                self.env.keys().cloned().collect::<Vec<_>>().join(",")
            ));
        }
        args.push(std::mem::take(&mut self.program));
        args.append(&mut self.args);
        self.program = wrapper.clone();
        self.args = args;
        self
    }

    /// The tool actually being run, looking through a privilege wrapper.
    pub fn tool(&self) -> &str {
        if self.program == "sudo" {
            if let Some(tool) = self.args.iter().find(|a| !a.starts_with('-')) {
                return tool;
            }
        }
        &self.program
    }

    /// Arguments passed to [`CommandSpec::tool`].
    pub fn tool_args(&self) -> &[String] {
        if self.program == "sudo" {
            if let Some(pos) = self.args.iter().position(|a| !a.starts_with('-')) {
                return &self.args[pos + 1..];
            }
        }
        &self.args
    }

    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            status: "exit status: 0".to_string(),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            status: "exit status: 1".to_string(),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Turn a nonzero exit into `ProcessFailure`.
    pub fn into_result(self, program: &str) -> Result<CommandOutput> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::ProcessFailure {
                program: program.to_string(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Injected capability for running external tools
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion or until `spec.timeout` elapses.
    ///
    /// A nonzero exit is reported in the output, not as an error; spawn
    /// failures map to `NotInstalled` and an elapsed timeout to `Timeout`.
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Like [`CommandRunner::execute`] but nonzero exits become `ProcessFailure`.
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.execute(spec).await?;
        output.into_result(spec.tool())
    }
}

/// Runs commands as child processes of the tokio runtime
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(
            "Running {} (timeout {}s)",
            spec.display(),
            spec.timeout.as_secs()
        );
        let started = Instant::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotInstalled {
                    program: spec.program.clone(),
                }
            } else {
                Error::Io(e)
            }
        })?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin.as_ref(), child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            // Closing stdin lets tools like `wg pubkey` see EOF
            drop(stdin);
        }

        let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(Error::Timeout {
                    program: spec.tool().to_string(),
                    seconds: spec.timeout.as_secs(),
                })
            }
        };

        debug!(
            "{} finished with {} in {:?}",
            spec.tool(),
            output.status,
            started.elapsed()
        );

        Ok(CommandOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
