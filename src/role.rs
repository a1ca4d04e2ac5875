// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Role registry.
//!
//! Every host in a stage plays one or more __roles__. A role is a function
//! that a host performs for fixjam, e.g., serving as the reverse proxy, or
//! running the application server. The __role definitions__ of a stage map
//! each role to an ordered listing of host pairs, where each pair holds the
//! external hostname used to reach the host, and the internal address other
//! hosts use to talk to it.
//!
//! Because one physical host can serve multiple roles at once, role
//! resolution for a host always produces a _set_ of roles. Small stages put
//! every role on one machine.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Function a host performs for the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Reverse proxy serving static content.
    Nginx,

    /// Application server.
    Application,

    /// Database server.
    Database,

    /// Mail relay.
    Mail,
}

impl Role {
    /// Every role, in canonical order.
    pub const ALL: [Role; 4] = [Role::Nginx, Role::Application, Role::Database, Role::Mail];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nginx => "nginx",
            Self::Application => "application",
            Self::Database => "database",
            Self::Mail => "mail",
        }
    }
}

impl Display for Role {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = RoleError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == name)
            .ok_or_else(|| RoleError::Unknown(name.into()))
    }
}

/// External hostname paired with internal address of a host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct HostPair {
    pub external: String,
    pub internal: String,
}

impl HostPair {
    pub fn new(external: impl Into<String>, internal: impl Into<String>) -> Self {
        Self {
            external: external.into(),
            internal: internal.into(),
        }
    }
}

impl From<(String, String)> for HostPair {
    fn from((external, internal): (String, String)) -> Self {
        Self { external, internal }
    }
}

impl From<HostPair> for (String, String) {
    fn from(pair: HostPair) -> Self {
        (pair.external, pair.internal)
    }
}

/// Role definitions of a stage.
///
/// # Invariant
///
/// - Host pairs keep the order they were declared in.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoleDefs {
    pairs: BTreeMap<Role, Vec<HostPair>>,
}

impl RoleDefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign every role to one host.
    pub fn single_host(pair: HostPair) -> Self {
        let mut roledefs = Self::new();
        for role in Role::ALL {
            roledefs.insert(role, [pair.clone()]);
        }

        roledefs
    }

    /// Append host pairs to a role.
    pub fn insert(&mut self, role: Role, pairs: impl IntoIterator<Item = HostPair>) {
        self.pairs.entry(role).or_default().extend(pairs);
    }

    /// Host pairs assigned to a role.
    pub fn pairs(&self, role: Role) -> &[HostPair] {
        self.pairs.get(&role).map(Vec::as_slice).unwrap_or_default()
    }

    /// External hostnames of every host playing a role.
    pub fn external_hostnames(&self, role: Role) -> Vec<String> {
        self.pairs(role)
            .iter()
            .map(|pair| pair.external.clone())
            .collect()
    }

    /// Hosts playing a role, by external hostname.
    pub fn hosts_in_role(&self, role: Role) -> Vec<String> {
        self.external_hostnames(role)
    }

    /// Internal addresses of every host playing a role.
    pub fn internal_ips(&self, role: Role) -> Vec<String> {
        self.pairs(role)
            .iter()
            .map(|pair| pair.internal.clone())
            .collect()
    }

    /// Internal address of the only host playing a role.
    ///
    /// # Errors
    ///
    /// - Return [`RoleError::MultipleHosts`] if role has more than one host.
    /// - Return [`RoleError::NoHostForRole`] if role has no host at all.
    pub fn internal_ip(&self, role: Role) -> Result<&str> {
        match self.pairs(role) {
            [pair] => Ok(pair.internal.as_str()),
            [] => Err(RoleError::NoHostForRole { role }),
            pairs => Err(RoleError::MultipleHosts {
                role,
                count: pairs.len(),
            }),
        }
    }

    /// Set of roles that a host plays.
    ///
    /// # Errors
    ///
    /// - Return [`RoleError::NoRoleForHost`] if host plays no role. A host
    ///   without a role is a configuration mistake, not something to skip.
    pub fn roles_for_host(&self, host: &str) -> Result<BTreeSet<Role>> {
        let roles = self
            .pairs
            .iter()
            .filter(|(_, pairs)| pairs.iter().any(|pair| pair.external == host))
            .map(|(role, _)| *role)
            .collect::<BTreeSet<_>>();

        if roles.is_empty() {
            return Err(RoleError::NoRoleForHost { host: host.into() });
        }

        Ok(roles)
    }

    /// Check if host plays any of the candidate roles.
    ///
    /// # Errors
    ///
    /// - Return [`RoleError::NoRoleForHost`] if host plays no role.
    pub fn role_matches(&self, host: &str, candidates: &[Role]) -> Result<bool> {
        let roles = self.roles_for_host(host)?;
        Ok(candidates.iter().any(|role| roles.contains(role)))
    }

    /// Every external hostname in the stage, without duplicates.
    ///
    /// Hosts are listed in the order they are first seen when walking roles
    /// in canonical order.
    pub fn all_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for role in Role::ALL {
            for pair in self.pairs(role) {
                if !hosts.contains(&pair.external) {
                    hosts.push(pair.external.clone());
                }
            }
        }

        hosts
    }

    /// Ensure that every role has at least one host.
    pub fn ensure_complete(&self) -> Result<()> {
        for role in Role::ALL {
            if self.pairs(role).is_empty() {
                return Err(RoleError::NoHostForRole { role });
            }
        }

        Ok(())
    }

    /// Ensure that each given role resolves to exactly one host.
    pub fn ensure_single(&self, roles: &[Role]) -> Result<()> {
        for role in roles {
            self.internal_ip(*role)?;
        }

        Ok(())
    }
}

/// Role resolution error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoleError {
    /// Role that must live on one host resolves to several.
    #[error("role {role} resolves to {count} hosts, but exactly one is required")]
    MultipleHosts { role: Role, count: usize },

    /// Host does not play any role in the stage.
    #[error("host {host:?} does not play any role in this stage")]
    NoRoleForHost { host: String },

    /// Role has no host assigned to it.
    #[error("no host plays role {role} in this stage")]
    NoHostForRole { role: Role },

    /// Role name is not recognized.
    #[error("unknown role {0:?}")]
    Unknown(String),
}

/// Friendly result alias :3
pub type Result<T, E = RoleError> = std::result::Result<T, E>;
