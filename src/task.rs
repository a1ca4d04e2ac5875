// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Named service tasks.
//!
//! Besides deploying, operators need a handful of one-off operations on
//! hosts: restarting services, putting up a maintenance page, or listing
//! releases. Each task is registered under a fixed name together with the
//! roles it requires and a typed handler. Task names given on the command
//! line are resolved against the registry before any host is contacted, so
//! a typo fails the whole invocation up front.

use crate::{
    activate::{ActivationController, ActivationError},
    gate::{Gated, RoleGate, DEPLOY_ROLES},
    remote::{in_dir, quote, ExecError, RemoteExecutor},
    role::{Role, RoleError},
    stage::DeploymentContext,
};

use std::{
    collections::BTreeMap,
    fmt::{Debug, Formatter, Result as FmtResult},
};
use tracing::{info, instrument};

/// Number of releases shown by the release listing task.
pub const RELEASE_LISTING_LIMIT: usize = 10;

/// Handler performing a task on one host.
pub type TaskHandler = fn(&DeploymentContext, &dyn RemoteExecutor) -> Result<()>;

/// Registered task.
#[derive(Clone, Copy)]
pub struct Task {
    pub name: &'static str,
    pub summary: &'static str,
    pub roles: &'static [Role],
    handler: TaskHandler,
}

impl Debug for Task {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("Task")
            .field("name", &self.name)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Run task on host if host plays a required role.
    #[instrument(skip(self, ctx, executor), fields(task = self.name, host = %executor.host()), level = "debug")]
    pub fn run(&self, ctx: &DeploymentContext, executor: &dyn RemoteExecutor) -> Result<Gated<()>> {
        match RoleGate::new(self.roles).run(ctx, executor.host(), self.name, || {
            (self.handler)(ctx, executor)
        })? {
            Gated::Ran(result) => result.map(Gated::Ran),
            Gated::Skipped => Ok(Gated::Skipped),
        }
    }
}

/// Registry of every task, keyed by name.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: BTreeMap<&'static str, Task>,
}

impl TaskRegistry {
    /// Registry of built-in tasks.
    pub fn builtin() -> Self {
        let tasks = [
            task("restart-nginx", "Restart nginx", &[Role::Nginx], |ctx, executor| {
                service(executor, "restart-nginx", &ctx.services().restart_nginx)
            }),
            task("reload-nginx", "Reload nginx configuration", &[Role::Nginx], |ctx, executor| {
                service(executor, "reload-nginx", &ctx.services().reload_nginx)
            }),
            task(
                "restart-application",
                "Restart application server",
                &[Role::Application],
                |ctx, executor| {
                    service(executor, "restart-application", &ctx.services().restart_application)
                },
            ),
            task(
                "reload-application",
                "Gracefully reload application server",
                &[Role::Application],
                |ctx, executor| {
                    service(executor, "reload-application", &ctx.services().reload_application)
                },
            ),
            task(
                "restart-database",
                "Restart database server",
                &[Role::Database],
                |ctx, executor| {
                    service(executor, "restart-database", &ctx.services().restart_database)
                },
            ),
            task(
                "reload-database",
                "Reload database configuration",
                &[Role::Database],
                |ctx, executor| {
                    service(executor, "reload-database", &ctx.services().reload_database)
                },
            ),
            task(
                "down-for-maintenance",
                "Serve maintenance page as index",
                &[Role::Nginx],
                |ctx, executor| {
                    let page = ctx.project().maintenance_page.clone();
                    swap_index(ctx, executor, "down-for-maintenance", &page)
                },
            ),
            task(
                "coming-soon",
                "Serve coming soon page as index",
                &[Role::Nginx],
                |ctx, executor| {
                    let page = ctx.project().coming_soon_page.clone();
                    swap_index(ctx, executor, "coming-soon", &page)
                },
            ),
            task(
                "list-releases",
                "List recent releases and the current one",
                &DEPLOY_ROLES,
                |ctx, executor| {
                    let entries = ActivationController::new(ctx)
                        .list_releases(executor, RELEASE_LISTING_LIMIT)?;
                    for entry in entries {
                        info!("{}: {} ({})", executor.host(), entry.version, entry.status);
                    }
                    Ok(())
                },
            ),
        ];

        Self {
            tasks: tasks.into_iter().map(|task| (task.name, task)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    /// Every registered task in name order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Resolve every task name.
    ///
    /// # Errors
    ///
    /// - Return [`TaskError::Unknown`] for the first name that is not
    ///   registered.
    pub fn resolve(&self, names: impl IntoIterator<Item = impl AsRef<str>>) -> Result<Vec<Task>> {
        names
            .into_iter()
            .map(|name| {
                self.get(name.as_ref())
                    .copied()
                    .ok_or_else(|| TaskError::Unknown {
                        name: name.as_ref().into(),
                        known: self.tasks.keys().copied().collect::<Vec<_>>().join(", "),
                    })
            })
            .collect()
    }
}

fn task(
    name: &'static str,
    summary: &'static str,
    roles: &'static [Role],
    handler: TaskHandler,
) -> Task {
    Task {
        name,
        summary,
        roles,
        handler,
    }
}

fn service(executor: &dyn RemoteExecutor, task: &str, command: &str) -> Result<()> {
    executor.sudo(command).map_err(|source| TaskError::Exec {
        host: executor.host().into(),
        task: task.into(),
        source,
    })?;

    Ok(())
}

fn swap_index(
    ctx: &DeploymentContext,
    executor: &dyn RemoteExecutor,
    task: &str,
    page: &str,
) -> Result<()> {
    let static_dir = ctx
        .layout()
        .current_link()
        .join(&ctx.project().static_subdir);
    let command = format!("cp index.html index.html.bak && cp {} index.html", quote(page));
    executor
        .run(&in_dir(&static_dir, &command))
        .map_err(|source| TaskError::Exec {
            host: executor.host().into(),
            task: task.into(),
            source,
        })?;

    Ok(())
}

/// Task error types.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Task name is not registered.
    #[error("unknown task {name:?}, expected one of: {known}")]
    Unknown { name: String, known: String },

    /// Task command failed.
    #[error("task {task} failed on {host}")]
    Exec {
        host: String,
        task: String,
        #[source]
        source: ExecError,
    },

    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error(transparent)]
    Role(#[from] RoleError),
}

/// Friendly result alias :3
pub type Result<T, E = TaskError> = std::result::Result<T, E>;
