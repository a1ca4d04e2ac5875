// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local repository access.
//!
//! Deploys are driven from a local clone of the application repository. The
//! version deployed is the commit that the deploy branch points to locally,
//! and the branch can be pushed to its remote first so that deploy hosts can
//! actually clone that commit.

use auth_git2::{GitAuthenticator, Prompter};
use git2::{Config, PushOptions, RemoteCallbacks, Repository};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{path::Path, time};
use tracing::{debug, info, instrument};

/// Resolve revision to full commit hash.
///
/// Searches for the repository from `repo_path` upwards.
///
/// # Errors
///
/// - Return [`GitError::Git2`] if no repository is found, or revision does
///   not name a commit.
#[instrument(skip(repo_path), level = "debug")]
pub fn resolve_commit(repo_path: impl AsRef<Path>, revision: &str) -> Result<String> {
    let repository = Repository::discover(repo_path.as_ref())?;
    let commit = repository.revparse_single(revision)?.peel_to_commit()?;
    debug!("{revision} resolves to {}", commit.id());

    Ok(commit.id().to_string())
}

/// Push local branch to remote.
///
/// Progress of the push is displayed through a progress bar. If credentials
/// are required, the user is prompted for them, blocking the progress bar
/// for input.
///
/// # Errors
///
/// - Return [`GitError::Git2`] if libgit2 operations fail.
/// - Return [`GitError::IndicatifStyleTemplate`] if progress bar style
///   cannot be set.
#[instrument(skip(repo_path), level = "debug")]
pub fn push_branch(repo_path: impl AsRef<Path>, remote: &str, branch: &str) -> Result<()> {
    let repository = Repository::discover(repo_path.as_ref())?;
    let mut remote = repository.find_remote(remote)?;
    info!("push {branch} to {}", remote.url().unwrap_or("<unknown>"));

    let bar = ProgressBar::new(0);
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_message(format!("push {branch}"));
    bar.enable_steady_tick(time::Duration::from_millis(100));

    let prompter = IndicatifPrompter::new(bar.clone());
    let authenticator = GitAuthenticator::default().set_prompter(prompter);
    let config = Config::open_default()?;

    let mut throttle = time::Instant::now();
    let mut rc = RemoteCallbacks::new();
    rc.credentials(authenticator.credentials(&config));
    rc.push_transfer_progress(|current, total, _bytes| {
        if throttle.elapsed() > time::Duration::from_millis(10) {
            throttle = time::Instant::now();
            bar.set_length(total as u64);
            bar.set_position(current as u64);
        }
    });

    let mut po = PushOptions::new();
    po.remote_callbacks(rc);
    let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
    remote.push(&[refspec.as_str()], Some(&mut po))?;
    bar.finish_and_clear();

    Ok(())
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    pub(crate) bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| -> Option<String> {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| -> Option<String> {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

/// Local repository error types.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = GitError> = std::result::Result<T, E>;
