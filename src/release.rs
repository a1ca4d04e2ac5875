// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Release management.
//!
//! A __release__ is one copy of the application's source tree at an exact
//! commit, living in its own directory on a deploy host. Releases move
//! through a small lifecycle:
//!
//! 1. __Fetch__: clone the application repository into a fresh release
//!    directory, and hard reset it to the requested commit. Leftovers from a
//!    previous failed attempt are removed first, never reused.
//! 2. __Prepare__: link environment specific settings into the release, and
//!    on application hosts run schema migrations and load fixtures. Once every
//!    step succeeds the release is marked as prepared.
//! 3. __Activate__: see [`activate`](crate::activate).
//!
//! # Applied Migration Tracking
//!
//! Migrations and fixture loads run at most once per release directory. The
//! prepared marker records that they succeeded, so preparing an already
//! prepared release is a no-op. A failed preparation leaves no marker, and
//! the directory stays in place for inspection.

use crate::{
    path::ReleaseLayout,
    remote::{in_dir, quote, quote_path, ExecError, RemoteExecutor},
    role::{Role, RoleError},
    stage::DeploymentContext,
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// Lifecycle state of a release on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// Fetched, but not fully prepared.
    Unprepared,

    /// Prepared, and ready to become current.
    Prepared,

    /// Current pointer targets this release.
    Active,

    /// Prepared, but superseded by the active release.
    Stale,
}

impl Display for ReleaseStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Unprepared => "unprepared",
            Self::Prepared => "prepared",
            Self::Active => "active",
            Self::Stale => "stale",
        })
    }
}

/// Release of the application on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    version: String,
    dir: PathBuf,
    status: ReleaseStatus,
}

impl Release {
    /// Construct release handle for version inside layout.
    ///
    /// # Errors
    ///
    /// - Return [`InvalidVersion`] if version cannot name a single
    ///   directory.
    pub fn new(layout: &ReleaseLayout, version: impl Into<String>) -> Result<Self, InvalidVersion> {
        let version = version.into();
        let valid = !version.is_empty()
            && version != "."
            && version != ".."
            && !version.starts_with('-')
            && version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(InvalidVersion(version));
        }

        Ok(Self {
            dir: layout.release_dir(&version),
            version,
            status: ReleaseStatus::Unprepared,
        })
    }

    /// Identifier of the release.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Directory of the release on a host.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status(&self) -> ReleaseStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: ReleaseStatus) {
        self.status = status;
    }
}

/// Step of release preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareStep {
    LinkSettings,
    Migrate,
    LoadFixtures,
    MarkPrepared,
}

impl Display for PrepareStep {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::LinkSettings => "settings linking",
            Self::Migrate => "schema migration",
            Self::LoadFixtures => "fixture loading",
            Self::MarkPrepared => "prepared marking",
        })
    }
}

/// Fetch, prepare, and clean up releases.
#[derive(Debug, Clone, Copy)]
pub struct ReleaseManager<'a> {
    ctx: &'a DeploymentContext,
}

impl<'a> ReleaseManager<'a> {
    pub fn new(ctx: &'a DeploymentContext) -> Self {
        Self { ctx }
    }

    /// Handle to release of given version.
    pub fn release(&self, version: &str) -> Result<Release, InvalidVersion> {
        Release::new(&self.ctx.layout(), version)
    }

    /// Fetch release of version onto host.
    ///
    /// Removes any directory left over for the same version, then clones the
    /// application repository fresh, and resets it to exactly `version`. The
    /// release that current pointer targets is never fetched again, and is
    /// returned as is.
    ///
    /// # Errors
    ///
    /// - Return [`FetchError::InvalidVersion`] if version is malformed.
    /// - Return [`FetchError::UnsafeRemoval`] if release directory escapes
    ///   the releases directory.
    /// - Return [`FetchError::Remote`] if repository cannot be cloned, or
    ///   version cannot be resolved.
    #[instrument(skip(self, executor), fields(host = %executor.host()), level = "debug")]
    pub fn fetch_release(
        &self,
        version: &str,
        executor: &dyn RemoteExecutor,
    ) -> Result<Release, FetchError> {
        let layout = self.ctx.layout();
        let mut release = Release::new(&layout, version)?;
        let remote = |source| FetchError::Remote {
            host: executor.host().into(),
            version: version.into(),
            source,
        };

        // INVARIANT: Never remove anything outside of the releases directory.
        if !layout.is_release_dir(release.dir()) {
            return Err(FetchError::UnsafeRemoval(release.dir().to_path_buf()));
        }

        // INVARIANT: Never remove the release that current pointer targets.
        let current = executor
            .read_link(&layout.current_link())
            .map_err(remote)?;
        if current.as_deref() == Some(release.dir()) {
            info!("release {version} is already active on {}", executor.host());
            release.set_status(ReleaseStatus::Active);
            return Ok(release);
        }

        if executor.file_exists(release.dir()).map_err(remote)? {
            info!(
                "remove leftover release directory {:?} on {}",
                release.dir().display(),
                executor.host()
            );
            executor
                .run(&format!("rm -rf {}", quote_path(release.dir())))
                .map_err(remote)?;
        }

        info!("fetch release {version} on {}", executor.host());
        executor
            .run(&format!("mkdir -p {}", quote_path(&layout.releases_dir())))
            .map_err(remote)?;
        executor
            .run(&format!(
                "git clone {} {}",
                quote(&self.ctx.project().repository),
                quote_path(release.dir())
            ))
            .map_err(remote)?;
        executor
            .run(&in_dir(
                release.dir(),
                &format!("git reset --hard {}", quote(version)),
            ))
            .map_err(remote)?;

        Ok(release)
    }

    /// Prepare fetched release on host.
    ///
    /// Links each environment settings file from the project root into the
    /// release's application package. Symlinks are used so that settings
    /// changes reach every release that has not been activated yet. On
    /// application hosts, migrations and fixture loads then run in order.
    ///
    /// # Errors
    ///
    /// - Return [`PrepareError::Missing`] if release was never fetched.
    /// - Return [`PrepareError::Step`] if any step fails. The release
    ///   directory is kept for inspection.
    #[instrument(skip(self, release, executor), fields(host = %executor.host(), version = release.version()), level = "debug")]
    pub fn prepare_release(
        &self,
        release: &mut Release,
        executor: &dyn RemoteExecutor,
    ) -> Result<(), PrepareError> {
        let host = executor.host().to_string();
        let version = release.version().to_string();
        let failed = |step| {
            let (host, version) = (host.clone(), version.clone());
            move |source| PrepareError::Step {
                host,
                version,
                step,
                source,
            }
        };

        let layout = self.ctx.layout();
        if !executor
            .file_exists(release.dir())
            .map_err(failed(PrepareStep::LinkSettings))?
        {
            return Err(PrepareError::Missing {
                host: host.clone(),
                version: version.clone(),
            });
        }

        let marker = layout.prepared_marker(&version);
        if executor
            .file_exists(&marker)
            .map_err(failed(PrepareStep::MarkPrepared))?
        {
            info!("release {version} already prepared on {host}");
            release.set_status(ReleaseStatus::Prepared);
            return Ok(());
        }

        let project = self.ctx.project();
        let app_dir = release.dir().join(&project.app_subdir);
        for file in &project.settings_files {
            let source = layout.root().join(file);
            executor
                .run(&in_dir(&app_dir, &format!("ln -nfs {} .", quote_path(&source))))
                .map_err(failed(PrepareStep::LinkSettings))?;
        }

        if self.ctx.role_matches(&host, &[Role::Application])? {
            info!("run application release steps for {version} on {host}");
            let services = self.ctx.services();
            for command in &services.migrate {
                debug!("migrate: {command}");
                executor
                    .run(&in_dir(&app_dir, &in_virtualenv(&project.virtualenv, command)))
                    .map_err(failed(PrepareStep::Migrate))?;
            }

            for command in &services.fixtures {
                debug!("load fixtures: {command}");
                executor
                    .run(&in_dir(&app_dir, &in_virtualenv(&project.virtualenv, command)))
                    .map_err(failed(PrepareStep::LoadFixtures))?;
            }
        }

        executor
            .run(&format!("touch {}", quote_path(&marker)))
            .map_err(failed(PrepareStep::MarkPrepared))?;
        release.set_status(ReleaseStatus::Prepared);
        info!("prepared release {version} on {host}");

        Ok(())
    }

    /// Remove local packaged archive of release.
    ///
    /// Returns whether an archive was removed. The release directory on the
    /// host is left alone.
    ///
    /// # Errors
    ///
    /// - Return [`CleanupError`] if archive exists but cannot be removed.
    pub fn cleanup_release(&self, release: &Release) -> Result<bool, CleanupError> {
        let package = self
            .ctx
            .project()
            .package_dir
            .join(format!("{}.tar.gz", release.version()));
        if !package.exists() {
            return Ok(false);
        }

        debug!("remove package {:?}", package.display());
        fs::remove_file(&package).map_err(|source| CleanupError {
            path: package.clone(),
            source,
        })?;

        Ok(true)
    }
}

/// Prefix command with activation of virtual environment, if any.
fn in_virtualenv(virtualenv: &Path, command: &str) -> String {
    if virtualenv.as_os_str().is_empty() {
        return command.to_string();
    }

    format!(
        ". {} && {command}",
        quote_path(&virtualenv.join("bin").join("activate"))
    )
}

/// Release version cannot name a release directory.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid release version {0:?}")]
pub struct InvalidVersion(pub String);

/// Release fetching error types.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    InvalidVersion(#[from] InvalidVersion),

    /// Removal target is not a release directory.
    #[error("refusing to remove {0:?}, it is not a release directory")]
    UnsafeRemoval(PathBuf),

    /// Remote source is unreachable, or version cannot be resolved.
    #[error("failed to fetch release {version} on {host}")]
    Remote {
        host: String,
        version: String,
        #[source]
        source: ExecError,
    },
}

/// Release preparation error types.
#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    /// Release directory does not exist.
    #[error("release {version} was never fetched on {host}")]
    Missing { host: String, version: String },

    /// Preparation step failed.
    #[error("failed to prepare release {version} on {host} during {step}")]
    Step {
        host: String,
        version: String,
        step: PrepareStep,
        #[source]
        source: ExecError,
    },

    #[error(transparent)]
    Role(#[from] RoleError),
}

/// Local release package cannot be removed.
#[derive(Debug, thiserror::Error)]
#[error("failed to remove release package {:?}", path.display())]
pub struct CleanupError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("abc123"; "short hash")]
    #[test_case("4f1d2c9a8e7b6f5e4d3c2b1a0f9e8d7c6b5a4f3e"; "full hash")]
    #[test_case("v1.2-rc_1"; "tag")]
    #[test]
    fn valid_versions(version: &str) {
        use pretty_assertions::assert_eq;
        let layout = ReleaseLayout::new("/project/fixjam");
        let release = Release::new(&layout, version).unwrap();
        assert_eq!(release.version(), version);
        assert_eq!(release.dir(), layout.release_dir(version));
        assert_eq!(release.status(), ReleaseStatus::Unprepared);
    }

    #[test]
    fn commands_run_inside_virtualenv() {
        assert_eq!(
            in_virtualenv(Path::new("/envs/fixjam"), "python manage.py migrate"),
            ". '/envs/fixjam/bin/activate' && python manage.py migrate"
        );
        assert_eq!(
            in_virtualenv(Path::new(""), "python manage.py migrate"),
            "python manage.py migrate"
        );
    }

    #[test_case(""; "empty")]
    #[test_case(".."; "parent")]
    #[test_case("a/b"; "nested")]
    #[test_case("--upload-pack=x"; "option")]
    #[test_case("abc 123"; "whitespace")]
    #[test]
    fn invalid_versions(version: &str) {
        use pretty_assertions::assert_eq;
        let layout = ReleaseLayout::new("/project/fixjam");
        assert_eq!(
            Release::new(&layout, version),
            Err(InvalidVersion(version.into()))
        );
    }
}
