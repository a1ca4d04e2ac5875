// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the deployment configuration file to simplify the
//! process of serialization and deserialization. File I/O is left to the
//! caller to figure out.
//!
//! # General Layout
//!
//! A deployment configuration is composed of three parts. The `[project]`
//! table describes the application being deployed and where it lives on each
//! host. The `[services]` table holds the shell commands used to restart or
//! reload services, and to migrate the database. Finally, each
//! `[stage.<name>]` table describes one deployment environment.
//!
//! Every field has a default, so an empty file is a valid configuration that
//! deploys fixjam the same way it has always been deployed.

use crate::{role::HostPair, stage::StageName};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::PathBuf,
    str::FromStr,
};

/// Deployment configuration layout.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Application settings.
    pub project: ProjectSettings,

    /// Service control commands.
    pub services: ServiceCommands,

    /// Stage definitions keyed by stage name.
    #[serde(rename = "stage")]
    pub stages: BTreeMap<String, StageSettings>,
}

impl DeployConfig {
    /// Settings of a stage, if configured.
    pub fn stage(&self, name: StageName) -> Option<&StageSettings> {
        self.stages.get(name.as_str())
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        let mut stages = BTreeMap::new();
        stages.insert(
            StageName::Dev.to_string(),
            StageSettings {
                hostname: "dev.fixjam.com".into(),
                ..Default::default()
            },
        );
        stages.insert(
            StageName::Staging.to_string(),
            StageSettings {
                hostname: "staging.fixjam.com".into(),
                user: Some("ubuntu".into()),
                ..Default::default()
            },
        );
        stages.insert(
            StageName::Production.to_string(),
            StageSettings {
                hostname: "www.fixjam.com".into(),
                user: Some("andrew".into()),
                workers: 4,
                single_host_roles: true,
                ..Default::default()
            },
        );

        Self {
            project: ProjectSettings::default(),
            services: ServiceCommands::default(),
            stages,
        }
    }
}

impl FromStr for DeployConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: DeployConfig =
            toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Only the fixed set of stages may be configured.
        for name in config.stages.keys() {
            name.parse::<StageName>()
                .map_err(|_| ConfigError::UnknownStage(name.clone()))?;
        }

        // INVARIANT: Perform shell expansion on path fields.
        let project = &mut config.project;
        project.root = expand_path(&project.root)?;
        project.package_dir = expand_path(&project.package_dir)?;
        project.virtualenv = expand_path(&project.virtualenv)?;

        Ok(config)
    }
}

impl Display for DeployConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand_path(path: &std::path::Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Application settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProjectSettings {
    /// Name of the application.
    pub name: String,

    /// Directory holding releases and the current pointer on every host.
    pub root: PathBuf,

    /// Remote repository releases are cloned from.
    pub repository: String,

    /// Branch whose head gets deployed by default.
    pub branch: String,

    /// Directory inside a release containing the application package.
    pub app_subdir: String,

    /// Environment specific settings files, linked from the project root
    /// into every release.
    pub settings_files: Vec<String>,

    /// Local directory holding packaged release archives.
    pub package_dir: PathBuf,

    /// Virtual environment activated before every migration and fixture
    /// command. An empty path runs them without activation.
    pub virtualenv: PathBuf,

    /// Directory inside a release holding static pages.
    pub static_subdir: String,

    /// Page served while the site is down for maintenance.
    pub maintenance_page: String,

    /// Page served before launch.
    pub coming_soon_page: String,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            name: "fixjam".into(),
            root: PathBuf::from("/project/fixjam"),
            repository: "git@github.com:reverie/fixjam.git".into(),
            branch: "master".into(),
            app_subdir: "fixjam".into(),
            settings_files: vec!["stagesettings.py".into(), "localsettings.py".into()],
            package_dir: PathBuf::from("."),
            virtualenv: PathBuf::from("/envs/default"),
            static_subdir: "static".into(),
            maintenance_page: "down.html".into(),
            coming_soon_page: "comingsoon.html".into(),
        }
    }
}

/// Service control commands.
///
/// Restart and reload commands run with root privileges. Migration and
/// fixture commands run as the login user from inside the application
/// package directory of a release.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceCommands {
    pub restart_nginx: String,
    pub reload_nginx: String,
    pub restart_application: String,
    pub reload_application: String,
    pub restart_database: String,
    pub reload_database: String,

    /// Schema migration steps, run in order inside the virtual environment.
    pub migrate: Vec<String>,

    /// Fixture loading steps, run in order after migrations.
    pub fixtures: Vec<String>,
}

impl Default for ServiceCommands {
    fn default() -> Self {
        Self {
            restart_nginx: "/etc/init.d/nginx restart".into(),
            reload_nginx: "initctl reload nginx".into(),
            restart_application: "apache2ctl graceful || apache2ctl start".into(),
            reload_application: "apache2ctl graceful".into(),
            restart_database:
                "/etc/init.d/postgresql-8.4 restart || /etc/init.d/postgresql-8.4 start".into(),
            reload_database: "/etc/init.d/postgresql-8.4 reload".into(),
            migrate: vec![
                "python manage.py syncdb --noinput".into(),
                "python manage.py migrate".into(),
            ],
            fixtures: vec!["python manage.py loaddata initial_data".into()],
        }
    }
}

/// Stage settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StageSettings {
    /// Public hostname of the stage.
    pub hostname: String,

    /// Login user on every host of the stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Number of hosts deployed to at once.
    pub workers: usize,

    /// How commands reach hosts of the stage.
    pub transport: Transport,

    /// Require database, mail, and application roles to live on one host
    /// each.
    pub single_host_roles: bool,

    /// Role name to host pairs. Empty means every role lives on the public
    /// hostname.
    pub roles: BTreeMap<String, Vec<HostPair>>,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            user: None,
            workers: 1,
            transport: Transport::default(),
            single_host_roles: false,
            roles: BTreeMap::new(),
        }
    }
}

/// Transport used to issue commands on hosts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Commands go through ssh, files through scp.
    #[default]
    Ssh,

    /// Commands run on this machine.
    Local,
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Stage table names a stage outside the fixed set.
    #[error("unknown stage {0:?}, expected one of dev, staging, production")]
    UnknownStage(String),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
