// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Release activation.
//!
//! Activation makes a prepared release live by pointing the `current`
//! symlink at its directory. The swap happens in two moves: a uniquely named
//! temporary symlink to the new release is created next to `current`, then
//! renamed over it. Rename either fully happens or does not happen at all,
//! so anybody reading `current` at any moment sees the old release or the new
//! one, never a missing link. No locking is involved.
//!
//! Rolling back is the very same operation applied to an older release that
//! is still on disk. Old releases therefore stay around until they are
//! explicitly removed as stale.
//!
//! # See Also
//!
//! - [Changing symlinks atomically](http://blog.moertel.com/articles/2005/08/22/how-to-change-symlinks-atomically)

use crate::{
    gate::{Gated, RoleGate},
    release::{InvalidVersion, Release, ReleaseStatus},
    remote::{quote_path, ExecError, RemoteExecutor},
    role::{Role, RoleError},
    stage::DeploymentContext,
};

use std::{
    path::PathBuf,
    process,
    sync::atomic::{AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{info, instrument, warn};

/// Release listed on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseEntry {
    pub version: String,
    pub status: ReleaseStatus,
}

/// Switch current pointer between releases.
#[derive(Debug, Clone, Copy)]
pub struct ActivationController<'a> {
    ctx: &'a DeploymentContext,
}

impl<'a> ActivationController<'a> {
    pub fn new(ctx: &'a DeploymentContext) -> Self {
        Self { ctx }
    }

    /// Version that current pointer targets on host.
    pub fn current_release(&self, executor: &dyn RemoteExecutor) -> Result<Option<String>> {
        let target = executor
            .read_link(&self.ctx.layout().current_link())
            .map_err(|source| remote(executor, source))?;

        Ok(target.and_then(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        }))
    }

    /// Atomically point current pointer at prepared release.
    ///
    /// # Errors
    ///
    /// - Return [`ActivationError::NotPrepared`] if release is missing its
    ///   prepared marker. Current pointer is left untouched.
    /// - Return [`ActivationError::Swap`] if symlink swap fails. Current
    ///   pointer is left untouched.
    #[instrument(skip(self, release, executor), fields(host = %executor.host(), version = release.version()), level = "debug")]
    pub fn activate(&self, release: &mut Release, executor: &dyn RemoteExecutor) -> Result<()> {
        let layout = self.ctx.layout();
        let marker = layout.prepared_marker(release.version());
        if !executor
            .file_exists(&marker)
            .map_err(|source| remote(executor, source))?
        {
            return Err(ActivationError::NotPrepared {
                host: executor.host().into(),
                version: release.version().into(),
            });
        }

        let temporary = layout.root().join(temporary_link_name(release.version()));
        let command = format!(
            "ln -s {target} {temporary} && mv -Tf {temporary} {current}",
            target = quote_path(release.dir()),
            temporary = quote_path(&temporary),
            current = quote_path(&layout.current_link()),
        );

        if let Err(source) = executor.run(&command) {
            // INVARIANT: Current pointer is untouched, only the temporary link
            // may be left behind.
            if let Err(error) = executor.run(&format!("rm -f {}", quote_path(&temporary))) {
                warn!("failed to remove temporary link: {error}");
            }

            return Err(ActivationError::Swap {
                host: executor.host().into(),
                version: release.version().into(),
                source,
            });
        }

        release.set_status(ReleaseStatus::Active);
        info!("activated release {} on {}", release.version(), executor.host());

        Ok(())
    }

    /// Re-activate retained release without fetching it again.
    ///
    /// # Errors
    ///
    /// - Return [`ActivationError::NotPrepared`] if release is gone, or was
    ///   never prepared.
    pub fn rollback_to(&self, version: &str, executor: &dyn RemoteExecutor) -> Result<Release> {
        let mut release = Release::new(&self.ctx.layout(), version)?;
        self.activate(&mut release, executor)?;

        Ok(release)
    }

    /// Restart application server after a deploy.
    ///
    /// Only application hosts restart. The reverse proxy keeps no state about
    /// releases, so nginx hosts keep serving without interruption.
    pub fn restart_after_deploy(&self, executor: &dyn RemoteExecutor) -> Result<Gated<()>> {
        let command = &self.ctx.services().restart_application;
        let gated = RoleGate::new(&[Role::Application]).run(
            self.ctx,
            executor.host(),
            "restart_after_deploy",
            || executor.sudo(command).map(|_| ()),
        )?;

        match gated {
            Gated::Ran(result) => {
                result.map_err(|source| ActivationError::Restart {
                    host: executor.host().into(),
                    source,
                })?;
                Ok(Gated::Ran(()))
            }
            Gated::Skipped => Ok(Gated::Skipped),
        }
    }

    /// List releases on host, newest first.
    ///
    /// Prepared releases newer than the active one are waiting for
    /// activation, while prepared releases older than it are stale. A host
    /// that was never deployed to has no releases.
    pub fn list_releases(&self, executor: &dyn RemoteExecutor, limit: usize) -> Result<Vec<ReleaseEntry>> {
        let layout = self.ctx.layout();
        let script = format!(
            "[ -d {dir} ] || exit 0; cd {dir} && for d in $(ls -1t); do if [ -e \"$d/{marker}\" ]; then echo \"1 $d\"; else echo \"0 $d\"; fi; done",
            dir = quote_path(&layout.releases_dir()),
            marker = crate::path::PREPARED_MARKER,
        );
        let listing = executor.run(&script).map_err(|source| remote(executor, source))?;
        let current = self.current_release(executor)?;

        let mut seen_active = false;
        let mut entries = Vec::new();
        for line in listing.lines() {
            let Some((flag, version)) = line.split_once(' ') else {
                continue;
            };

            let status = if current.as_deref() == Some(version) {
                seen_active = true;
                ReleaseStatus::Active
            } else if flag != "1" {
                ReleaseStatus::Unprepared
            } else if seen_active {
                ReleaseStatus::Stale
            } else {
                ReleaseStatus::Prepared
            };

            entries.push(ReleaseEntry {
                version: version.into(),
                status,
            });
        }
        entries.truncate(limit);

        Ok(entries)
    }

    /// Delete superseded release from host.
    ///
    /// Returns whether a directory was removed.
    ///
    /// # Errors
    ///
    /// - Return [`ActivationError::StillActive`] if current pointer targets
    ///   the release.
    #[instrument(skip(self, executor), fields(host = %executor.host()), level = "debug")]
    pub fn remove_stale(&self, version: &str, executor: &dyn RemoteExecutor) -> Result<bool> {
        let layout = self.ctx.layout();
        let release = Release::new(&layout, version)?;
        if !layout.is_release_dir(release.dir()) {
            return Err(ActivationError::UnsafeRemoval(release.dir().to_path_buf()));
        }

        if self.current_release(executor)?.as_deref() == Some(version) {
            return Err(ActivationError::StillActive {
                host: executor.host().into(),
                version: version.into(),
            });
        }

        if !executor
            .file_exists(release.dir())
            .map_err(|source| remote(executor, source))?
        {
            warn!("release {version} not found on {}", executor.host());
            return Ok(false);
        }

        executor
            .run(&format!("rm -rf {}", quote_path(release.dir())))
            .map_err(|source| remote(executor, source))?;
        info!("removed stale release {version} on {}", executor.host());

        Ok(true)
    }
}

static SWAP_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn temporary_link_name(version: &str) -> String {
    let sequence = SWAP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!(".current-{version}-{}-{nanos}-{sequence}", process::id())
}

fn remote(executor: &dyn RemoteExecutor, source: ExecError) -> ActivationError {
    ActivationError::Remote {
        host: executor.host().into(),
        source,
    }
}

/// Release activation error types.
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error(transparent)]
    InvalidVersion(#[from] InvalidVersion),

    /// Release was never prepared, or no longer exists.
    #[error("release {version} is not prepared on {host}")]
    NotPrepared { host: String, version: String },

    /// Current pointer targets the release.
    #[error("release {version} is still active on {host}")]
    StillActive { host: String, version: String },

    /// Removal target is not a release directory.
    #[error("refusing to remove {0:?}, it is not a release directory")]
    UnsafeRemoval(PathBuf),

    /// Symlink swap failed, current pointer is unchanged.
    #[error("failed to switch current release to {version} on {host}")]
    Swap {
        host: String,
        version: String,
        #[source]
        source: ExecError,
    },

    /// Application server failed to restart.
    #[error("failed to restart application on {host}")]
    Restart {
        host: String,
        #[source]
        source: ExecError,
    },

    /// Host could not be queried.
    #[error("failed to inspect releases on {host}")]
    Remote {
        host: String,
        #[source]
        source: ExecError,
    },

    #[error(transparent)]
    Role(#[from] RoleError),
}

/// Friendly result alias :3
pub type Result<T, E = ActivationError> = std::result::Result<T, E>;
