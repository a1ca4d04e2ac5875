// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote command execution.
//!
//! Every change made to a deploy host goes through a [`RemoteExecutor`]. An
//! executor issues shell commands on exactly one host, either as the login
//! user, as root, or as some other named user. Each call blocks until the
//! host answers.
//!
//! Two executors are provided. [`SshExecutor`] reaches hosts through the
//! system's `ssh` and `scp` binaries, so it honors the user's ssh
//! configuration and agent. [`LocalExecutor`] runs commands through `sh` on
//! this machine, which serves stages that deploy to the local host.

use crate::{config::Transport, stage::DeploymentContext};

use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};
use tracing::{debug, instrument};

/// User that a command runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Privilege {
    /// Login user.
    User,

    /// Root through sudo.
    Root,

    /// Named user through sudo.
    As(String),
}

/// Exit status and combined output of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Issue shell commands on one host.
pub trait RemoteExecutor: Send + Sync {
    /// Host that commands are issued on.
    fn host(&self) -> &str;

    /// Run command, and report its exit status and output.
    ///
    /// A command that runs but fails is not an error here. Only failing to
    /// issue the command at all is.
    fn execute(&self, command: &str, privilege: &Privilege) -> Result<CommandOutput>;

    /// Copy local file to host.
    fn upload_file(&self, local: &Path, remote: &Path) -> Result<()>;

    /// Check if path exists on host.
    fn file_exists(&self, remote: &Path) -> Result<bool> {
        let output = self.execute(&format!("test -e {}", quote_path(remote)), &Privilege::User)?;
        Ok(output.success())
    }

    /// Append line to file on host unless file already has that exact line.
    fn append_line_if_absent(&self, line: &str, remote: &Path) -> Result<()> {
        let (line, remote) = (quote(line), quote_path(remote));
        self.run(&format!(
            "touch {remote} && (grep -qxF -- {line} {remote} || echo {line} >> {remote})"
        ))?;
        Ok(())
    }

    /// Resolve target of symlink on host, if path is a symlink.
    fn read_link(&self, remote: &Path) -> Result<Option<PathBuf>> {
        let output = self.execute(&format!("readlink {}", quote_path(remote)), &Privilege::User)?;
        if !output.success() || output.output.is_empty() {
            return Ok(None);
        }

        Ok(Some(PathBuf::from(output.output)))
    }

    /// Run command with given privilege, failing on non-zero exit status.
    fn run_checked(&self, command: &str, privilege: &Privilege) -> Result<String> {
        let output = self.execute(command, privilege)?;
        if !output.success() {
            return Err(ExecError::Failed {
                host: self.host().into(),
                command: command.into(),
                status: output.status,
                output: output.output,
            });
        }

        Ok(output.output)
    }

    /// Run command as login user, failing on non-zero exit status.
    fn run(&self, command: &str) -> Result<String> {
        self.run_checked(command, &Privilege::User)
    }

    /// Run command as root, failing on non-zero exit status.
    fn sudo(&self, command: &str) -> Result<String> {
        self.run_checked(command, &Privilege::Root)
    }
}

/// Construct executor for host based on stage transport.
pub fn connect(ctx: &DeploymentContext, host: &str) -> Arc<dyn RemoteExecutor> {
    match ctx.transport() {
        Transport::Ssh => Arc::new(SshExecutor::new(host, ctx.user())),
        Transport::Local => Arc::new(LocalExecutor::new(host)),
    }
}

/// Executor reaching host through ssh.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    host: String,
    destination: String,
}

impl SshExecutor {
    /// Construct new ssh executor.
    ///
    /// Logs in as `user` when given, otherwise leaves user selection to the
    /// ssh configuration.
    pub fn new(host: impl Into<String>, user: Option<&str>) -> Self {
        let host = host.into();
        let destination = match user {
            Some(user) => format!("{user}@{host}"),
            None => host.clone(),
        };

        Self { host, destination }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

impl RemoteExecutor for SshExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    #[instrument(skip(self, command), fields(host = %self.host), level = "debug")]
    fn execute(&self, command: &str, privilege: &Privilege) -> Result<CommandOutput> {
        let command = with_privilege(command, privilege);
        debug!("ssh {}: {command}", self.destination);
        syscall(&self.host, "ssh", [self.destination.as_str(), command.as_str()])
    }

    #[instrument(skip(self), fields(host = %self.host), level = "debug")]
    fn upload_file(&self, local: &Path, remote: &Path) -> Result<()> {
        let target = format!("{}:{}", self.destination, remote.display());
        let output = syscall(
            &self.host,
            "scp",
            [local.as_os_str(), OsStr::new(target.as_str())],
        )?;

        if !output.success() {
            return Err(ExecError::Upload {
                host: self.host.clone(),
                local: local.to_path_buf(),
                remote: remote.to_path_buf(),
                reason: output.output,
            });
        }

        Ok(())
    }
}

/// Executor running commands on this machine.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    host: String,
    use_sudo: bool,
}

impl LocalExecutor {
    /// Construct new local executor acting as `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            use_sudo: true,
        }
    }

    /// Run privileged commands as the current user instead of through sudo.
    pub fn without_sudo(mut self) -> Self {
        self.use_sudo = false;
        self
    }
}

impl RemoteExecutor for LocalExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    #[instrument(skip(self, command), fields(host = %self.host), level = "debug")]
    fn execute(&self, command: &str, privilege: &Privilege) -> Result<CommandOutput> {
        let command = if self.use_sudo {
            with_privilege(command, privilege)
        } else {
            command.to_string()
        };
        debug!("sh: {command}");
        syscall(&self.host, "sh", ["-c", command.as_str()])
    }

    fn upload_file(&self, local: &Path, remote: &Path) -> Result<()> {
        fs::copy(local, remote).map_err(|err| ExecError::Upload {
            host: self.host.clone(),
            local: local.to_path_buf(),
            remote: remote.to_path_buf(),
            reason: err.to_string(),
        })?;

        Ok(())
    }
}

/// Quote string for safe use as one shell word.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Quote path for safe use as one shell word.
pub fn quote_path(path: &Path) -> String {
    quote(path.to_string_lossy().as_ref())
}

/// Prefix command with a change of working directory.
pub fn in_dir(dir: &Path, command: &str) -> String {
    format!("cd {} && {command}", quote_path(dir))
}

fn with_privilege(command: &str, privilege: &Privilege) -> String {
    match privilege {
        Privilege::User => command.to_string(),
        Privilege::Root => format!("sudo sh -c {}", quote(command)),
        Privilege::As(user) => format!("sudo -u {} sh -c {}", quote(user), quote(command)),
    }
}

fn syscall(
    host: &str,
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<CommandOutput> {
    let output = Command::new(cmd.as_ref())
        .args(args)
        .output()
        .map_err(|err| ExecError::Spawn {
            host: host.into(),
            program: cmd.as_ref().to_string_lossy().into_owned(),
            source: err,
        })?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();
    let mut message = stdout;
    message.push_str(&stderr);

    // INVARIANT: Chomp trailing newlines.
    let message = message.trim_end_matches(['\r', '\n']).to_string();

    Ok(CommandOutput {
        status: output.status.code().unwrap_or(-1),
        output: message,
    })
}

/// Remote execution error types.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Program issuing the command cannot be started.
    #[error("failed to start {program:?} for host {host}")]
    Spawn {
        host: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Command exited with non-zero status.
    #[error("command on {host} exited with status {status}: {command}\n{output}")]
    Failed {
        host: String,
        command: String,
        status: i32,
        output: String,
    },

    /// File cannot be copied to host.
    #[error("failed to upload {local:?} to {host}:{remote:?}: {reason}")]
    Upload {
        host: String,
        local: PathBuf,
        remote: PathBuf,
        reason: String,
    },
}

/// Friendly result alias :3
pub type Result<T, E = ExecError> = std::result::Result<T, E>;
