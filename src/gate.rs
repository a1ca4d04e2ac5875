// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Role gated operations.
//!
//! Most deployment steps only make sense on some hosts. A [`RoleGate`] wraps
//! an operation with the roles it requires. On a host whose role set shares
//! no role with the gate, the operation does not run, and a skip notice
//! naming the host and operation is logged instead.

use crate::{
    role::{Role, RoleError},
    stage::DeploymentContext,
};

use tracing::info;

/// Roles that take part in release deployment.
pub const DEPLOY_ROLES: [Role; 2] = [Role::Nginx, Role::Application];

/// Outcome of a gated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gated<T> {
    /// Operation ran, and produced a value.
    Ran(T),

    /// Host plays none of the required roles.
    Skipped,
}

impl<T> Gated<T> {
    pub fn ran(self) -> Option<T> {
        match self {
            Self::Ran(value) => Some(value),
            Self::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Run operations only on hosts playing a required role.
#[derive(Debug, Clone, Copy)]
pub struct RoleGate<'r> {
    roles: &'r [Role],
}

impl<'r> RoleGate<'r> {
    pub fn new(roles: &'r [Role]) -> Self {
        Self { roles }
    }

    pub fn roles(&self) -> &[Role] {
        self.roles
    }

    /// Run operation if host plays any required role.
    ///
    /// # Errors
    ///
    /// - Return [`RoleError::NoRoleForHost`] if host plays no role in the
    ///   stage at all.
    pub fn run<T>(
        &self,
        ctx: &DeploymentContext,
        host: &str,
        name: &str,
        operation: impl FnOnce() -> T,
    ) -> Result<Gated<T>, RoleError> {
        if !ctx.role_matches(host, self.roles)? {
            info!("skipping {name} on {host}");
            return Ok(Gated::Skipped);
        }

        Ok(Gated::Ran(operation()))
    }
}

impl RoleGate<'static> {
    /// Gate for release deployment steps.
    pub fn deploy() -> Self {
        Self::new(&DEPLOY_ROLES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DeployConfig, StageSettings},
        role::HostPair,
        stage::StageName,
    };

    use pretty_assertions::assert_eq;
    use std::{
        cell::Cell,
        io::{Result as IoResult, Write},
        sync::{Arc, Mutex},
    };

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, bytes: &[u8]) -> IoResult<usize> {
            self.0.lock().unwrap().extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn flush(&mut self) -> IoResult<()> {
            Ok(())
        }
    }

    fn context() -> DeploymentContext {
        let mut settings = StageSettings::default();
        let web = vec![HostPair::new("web", "10.0.0.1")];
        let both = vec![HostPair::new("both", "10.0.0.2")];
        settings.roles.insert("nginx".into(), [web, both.clone()].concat());
        settings.roles.insert("application".into(), both);
        settings
            .roles
            .insert("database".into(), vec![HostPair::new("db", "10.0.0.3")]);
        settings
            .roles
            .insert("mail".into(), vec![HostPair::new("db", "10.0.0.3")]);

        let mut config = DeployConfig::default();
        config.stages.insert("dev".into(), settings);
        DeploymentContext::select(StageName::Dev, &config).unwrap()
    }

    #[test]
    fn skip_host_without_required_role() {
        let ctx = context();
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let capture = capture.clone();
                move || capture.clone()
            })
            .with_ansi(false)
            .finish();

        let invoked = Cell::new(false);
        let result = tracing::subscriber::with_default(subscriber, || {
            RoleGate::new(&[Role::Application])
                .run(&ctx, "web", "restart_after_deploy", || invoked.set(true))
                .unwrap()
        });

        assert_eq!(result, Gated::Skipped);
        assert!(!invoked.get());
        let logs = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("skipping restart_after_deploy on web"));
    }

    #[test]
    fn run_on_host_with_any_required_role() {
        let ctx = context();
        let result = RoleGate::new(&[Role::Application])
            .run(&ctx, "both", "restart_after_deploy", || 42)
            .unwrap();
        assert_eq!(result, Gated::Ran(42));

        let result = RoleGate::deploy()
            .run(&ctx, "web", "fetch_release", || "fetched")
            .unwrap();
        assert_eq!(result.ran(), Some("fetched"));

        let result = RoleGate::deploy()
            .run(&ctx, "db", "fetch_release", || "fetched")
            .unwrap();
        assert!(result.is_skipped());
    }

    #[test]
    fn unknown_host_is_an_error() {
        let ctx = context();
        let result = RoleGate::deploy().run(&ctx, "elsewhere", "fetch_release", || ());
        assert_eq!(
            result,
            Err(RoleError::NoRoleForHost {
                host: "elsewhere".into()
            })
        );
    }
}
