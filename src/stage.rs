// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Stage selection.
//!
//! A __stage__ is a named deployment environment. Selecting a stage is the
//! first thing any invocation does: it validates the stage's role
//! definitions, and freezes everything a deployment needs into a
//! [`DeploymentContext`]. The context is then handed explicitly to every
//! component that needs it. Nothing reads stage information from anywhere
//! else.

use crate::{
    config::{DeployConfig, ProjectSettings, ServiceCommands, StageSettings, Transport},
    path::ReleaseLayout,
    role::{HostPair, Role, RoleDefs, RoleError},
};

use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};
use tracing::{debug, instrument};

/// Roles that templated configuration assumes live on exactly one host.
pub const SINGLE_HOST_ROLES: [Role; 3] = [Role::Database, Role::Mail, Role::Application];

/// Fixed set of deployment stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageName {
    Dev,
    Staging,
    Production,
}

impl StageName {
    pub const ALL: [StageName; 3] = [StageName::Dev, StageName::Staging, StageName::Production];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl Display for StageName {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = StageError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == name)
            .ok_or_else(|| StageError::Unknown(name.into()))
    }
}

/// Everything a deployment run needs to know about its stage.
///
/// Constructed once through [`DeploymentContext::select`], and immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct DeploymentContext {
    stage: StageName,
    settings: StageSettings,
    roledefs: RoleDefs,
    project: ProjectSettings,
    services: ServiceCommands,
}

impl DeploymentContext {
    /// Select a stage from configuration.
    ///
    /// All role invariants are checked here, before any host is contacted.
    ///
    /// # Errors
    ///
    /// - Return [`StageError::NotConfigured`] if stage has no settings.
    /// - Return [`StageError::NoWorkers`] if stage has a worker count of 0.
    /// - Return [`StageError::MissingHostname`] if neither hostname nor
    ///   roles are given.
    /// - Return [`StageError::Role`] if a role name is unknown, a role has
    ///   no host, or a single host role resolves to many hosts.
    #[instrument(skip(config), level = "debug")]
    pub fn select(stage: StageName, config: &DeployConfig) -> Result<Self> {
        let settings = config
            .stage(stage)
            .cloned()
            .ok_or(StageError::NotConfigured(stage))?;

        if settings.workers == 0 {
            return Err(StageError::NoWorkers(stage));
        }

        let roledefs = if settings.roles.is_empty() {
            if settings.hostname.is_empty() {
                return Err(StageError::MissingHostname(stage));
            }

            RoleDefs::single_host(HostPair::new(settings.hostname.clone(), "127.0.0.1"))
        } else {
            let mut roledefs = RoleDefs::new();
            for (name, pairs) in &settings.roles {
                roledefs.insert(name.parse::<Role>()?, pairs.iter().cloned());
            }
            roledefs
        };

        roledefs.ensure_complete()?;
        if settings.single_host_roles {
            roledefs.ensure_single(&SINGLE_HOST_ROLES)?;
        }

        debug!("selected stage {stage} with hosts {:?}", roledefs.all_hosts());

        Ok(Self {
            stage,
            settings,
            roledefs,
            project: config.project.clone(),
            services: config.services.clone(),
        })
    }

    pub fn stage(&self) -> StageName {
        self.stage
    }

    /// Public hostname of the stage.
    pub fn hostname(&self) -> &str {
        &self.settings.hostname
    }

    /// Login user for hosts of the stage.
    pub fn user(&self) -> Option<&str> {
        self.settings.user.as_deref()
    }

    /// Size of the worker pool deploying to hosts.
    pub fn workers(&self) -> usize {
        self.settings.workers
    }

    pub fn transport(&self) -> Transport {
        self.settings.transport
    }

    pub fn roledefs(&self) -> &RoleDefs {
        &self.roledefs
    }

    pub fn project(&self) -> &ProjectSettings {
        &self.project
    }

    pub fn services(&self) -> &ServiceCommands {
        &self.services
    }

    /// Release directory layout shared by every host.
    pub fn layout(&self) -> ReleaseLayout {
        ReleaseLayout::new(&self.project.root)
    }

    /// Every host of the stage.
    pub fn hosts(&self) -> Vec<String> {
        self.roledefs.all_hosts()
    }

    /// Roles played by a host.
    pub fn roles_for_host(&self, host: &str) -> Result<BTreeSet<Role>, RoleError> {
        self.roledefs.roles_for_host(host)
    }

    /// Check if host plays any of the candidate roles.
    pub fn role_matches(&self, host: &str, candidates: &[Role]) -> Result<bool, RoleError> {
        self.roledefs.role_matches(host, candidates)
    }
}

/// Stage selection error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// Stage name is outside the fixed set.
    #[error("unknown stage {0:?}, expected one of dev, staging, production")]
    Unknown(String),

    /// Stage has no configuration.
    #[error("stage {0} is not configured")]
    NotConfigured(StageName),

    /// Stage would deploy with no workers.
    #[error("stage {0} needs at least one worker")]
    NoWorkers(StageName),

    /// Stage has neither a hostname nor role definitions.
    #[error("stage {0} needs a hostname or explicit roles")]
    MissingHostname(StageName),

    /// Role definitions violate an invariant.
    #[error(transparent)]
    Role(#[from] RoleError),
}

/// Friendly result alias :3
pub type Result<T, E = StageError> = std::result::Result<T, E>;
