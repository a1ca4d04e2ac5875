// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deployment workflows.
//!
//! A [`Workflow`] is the ordered list of steps carried out on every host of
//! a stage. Within one host, steps run strictly one after the other, since
//! each step depends on what the previous one left on disk. The first
//! failing step aborts that host's workflow. Nothing is rolled back, so a
//! host whose deploy failed before activation keeps serving its previous
//! release, with the new release at most prepared.
//!
//! Hosts are worked on by a fixed size pool of workers, sized by the stage.
//! Every remote command blocks its worker until the host answers. No order
//! between hosts is guaranteed, and one host failing neither stops nor
//! rolls back the others.

use crate::{
    activate::{ActivationController, ActivationError},
    gate::{Gated, RoleGate, DEPLOY_ROLES},
    release::{CleanupError, FetchError, PrepareError, ReleaseManager},
    remote::RemoteExecutor,
    role::{Role, RoleError},
    stage::DeploymentContext,
    task::{Task, TaskError},
};

use futures::stream::{self, StreamExt};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    sync::Arc,
};
use tracing::{info, instrument};

/// Step of a workflow on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Fetch,
    Prepare,
    Activate,
    Restart,
    Cleanup,
    RemoveStale,
    Task(&'static str),
}

impl Display for Step {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match *self {
            Self::Fetch => "fetch_release",
            Self::Prepare => "prepare_release",
            Self::Activate => "activate",
            Self::Restart => "restart_after_deploy",
            Self::Cleanup => "cleanup_release",
            Self::RemoveStale => "remove_stale",
            Self::Task(name) => name,
        })
    }
}

/// What to do on every host of a stage.
#[derive(Debug, Clone)]
pub enum Workflow {
    /// Fetch, prepare, activate, restart, and clean up.
    Deploy { version: String },

    /// Fetch and prepare, leaving activation for later.
    Prepare { version: String },

    /// Activate already prepared release, restart, and clean up.
    Activate { version: String },

    /// Re-activate retained release, and restart.
    Rollback { version: String },

    /// Remove superseded release.
    Prune { version: String },

    /// Run registered tasks in order.
    Tasks(Vec<Task>),
}

/// Steps completed and skipped on a host.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Progress {
    pub completed: Vec<Step>,
    pub skipped: Vec<Step>,
}

/// Outcome of a workflow on one host.
#[derive(Debug)]
pub struct HostReport {
    pub host: String,
    pub result: Result<Progress, WorkflowError>,
}

impl Workflow {
    /// Run workflow on one host, stopping at the first failing step.
    #[instrument(skip(self, ctx, executor), fields(host = %executor.host()), level = "debug")]
    pub fn run_on_host(
        &self,
        ctx: &DeploymentContext,
        executor: &dyn RemoteExecutor,
    ) -> Result<Progress, WorkflowError> {
        let mut run = HostRun::new(ctx, executor);
        let releases = ReleaseManager::new(ctx);
        let activation = ActivationController::new(ctx);

        match self {
            Self::Deploy { version } | Self::Prepare { version } => {
                let Some(mut release) = run.step(Step::Fetch, &DEPLOY_ROLES, || {
                    Ok(releases.fetch_release(version, executor)?)
                })?
                else {
                    return Ok(run.skip_rest([
                        Step::Prepare,
                        Step::Activate,
                        Step::Restart,
                        Step::Cleanup,
                    ]));
                };

                run.step(Step::Prepare, &DEPLOY_ROLES, || {
                    Ok(releases.prepare_release(&mut release, executor)?)
                })?;

                if matches!(self, Self::Prepare { .. }) {
                    return Ok(run.finish());
                }

                run.step(Step::Activate, &DEPLOY_ROLES, || {
                    Ok(activation.activate(&mut release, executor)?)
                })?;
                run.restart(&activation)?;
                run.step(Step::Cleanup, &DEPLOY_ROLES, || {
                    Ok(releases.cleanup_release(&release)?)
                })?;
            }
            Self::Activate { version } => {
                let mut release = releases
                    .release(version)
                    .map_err(|err| run.failed(Step::Activate, ActivationError::from(err)))?;
                let activated = run.step(Step::Activate, &DEPLOY_ROLES, || {
                    Ok(activation.activate(&mut release, executor)?)
                })?;
                if activated.is_none() {
                    return Ok(run.skip_rest([Step::Restart, Step::Cleanup]));
                }

                run.restart(&activation)?;
                run.step(Step::Cleanup, &DEPLOY_ROLES, || {
                    Ok(releases.cleanup_release(&release)?)
                })?;
            }
            Self::Rollback { version } => {
                let activated = run.step(Step::Activate, &DEPLOY_ROLES, || {
                    Ok(activation.rollback_to(version, executor)?)
                })?;
                if activated.is_none() {
                    return Ok(run.skip_rest([Step::Restart]));
                }

                run.restart(&activation)?;
            }
            Self::Prune { version } => {
                run.step(Step::RemoveStale, &DEPLOY_ROLES, || {
                    Ok(activation.remove_stale(version, executor)?)
                })?;
            }
            Self::Tasks(tasks) => {
                for task in tasks {
                    let step = Step::Task(task.name);
                    match task.run(ctx, executor).map_err(|err| run.failed(step, err))? {
                        Gated::Ran(()) => run.progress.completed.push(step),
                        Gated::Skipped => run.progress.skipped.push(step),
                    }
                }
            }
        }

        Ok(run.finish())
    }
}

/// Run workflow on every host through a fixed size worker pool.
///
/// Reports are returned in the order the executors were given.
pub async fn run_workflow(
    ctx: Arc<DeploymentContext>,
    workflow: Arc<Workflow>,
    executors: Vec<Arc<dyn RemoteExecutor>>,
) -> Vec<HostReport> {
    let workers = ctx.workers().max(1);
    info!("run on {} hosts with {workers} workers", executors.len());

    let mut reports = stream::iter(executors.into_iter().enumerate())
        .map(|(index, executor)| {
            let ctx = Arc::clone(&ctx);
            let workflow = Arc::clone(&workflow);
            async move {
                let host = executor.host().to_string();
                let result = tokio::task::spawn_blocking(move || {
                    workflow.run_on_host(&ctx, executor.as_ref())
                })
                .await
                .unwrap_or_else(|source| {
                    Err(WorkflowError::Worker {
                        host: host.clone(),
                        source,
                    })
                });

                (index, HostReport { host, result })
            }
        })
        .buffer_unordered(workers)
        .collect::<Vec<_>>()
        .await;

    reports.sort_by_key(|(index, _)| *index);
    reports.into_iter().map(|(_, report)| report).collect()
}

/// Deploy release of version to every host.
pub async fn deploy(
    ctx: Arc<DeploymentContext>,
    version: impl Into<String>,
    executors: Vec<Arc<dyn RemoteExecutor>>,
) -> Vec<HostReport> {
    let version = version.into();
    run_workflow(ctx, Arc::new(Workflow::Deploy { version }), executors).await
}

/// Fetch and prepare release of version on every host without activating.
pub async fn prep_new_release(
    ctx: Arc<DeploymentContext>,
    version: impl Into<String>,
    executors: Vec<Arc<dyn RemoteExecutor>>,
) -> Vec<HostReport> {
    let version = version.into();
    let reports = run_workflow(
        ctx,
        Arc::new(Workflow::Prepare {
            version: version.clone(),
        }),
        executors,
    )
    .await;

    if reports.iter().all(|report| report.result.is_ok()) {
        info!("release {version} is prepared everywhere, activate {version} to go live");
    }

    reports
}

/// Activate prepared release of version on every host.
pub async fn activate_release(
    ctx: Arc<DeploymentContext>,
    version: impl Into<String>,
    executors: Vec<Arc<dyn RemoteExecutor>>,
) -> Vec<HostReport> {
    let version = version.into();
    run_workflow(ctx, Arc::new(Workflow::Activate { version }), executors).await
}

/// Re-activate retained release of version on every host.
pub async fn rollback(
    ctx: Arc<DeploymentContext>,
    version: impl Into<String>,
    executors: Vec<Arc<dyn RemoteExecutor>>,
) -> Vec<HostReport> {
    let version = version.into();
    run_workflow(ctx, Arc::new(Workflow::Rollback { version }), executors).await
}

struct HostRun<'a> {
    ctx: &'a DeploymentContext,
    executor: &'a dyn RemoteExecutor,
    progress: Progress,
}

impl<'a> HostRun<'a> {
    fn new(ctx: &'a DeploymentContext, executor: &'a dyn RemoteExecutor) -> Self {
        Self {
            ctx,
            executor,
            progress: Progress::default(),
        }
    }

    fn step<T>(
        &mut self,
        step: Step,
        roles: &[Role],
        operation: impl FnOnce() -> Result<T, StepError>,
    ) -> Result<Option<T>, WorkflowError> {
        let host = self.executor.host();
        match RoleGate::new(roles).run(self.ctx, host, &step.to_string(), operation)? {
            Gated::Ran(Ok(value)) => {
                self.progress.completed.push(step);
                Ok(Some(value))
            }
            Gated::Ran(Err(source)) => Err(self.failed(step, source)),
            Gated::Skipped => {
                self.progress.skipped.push(step);
                Ok(None)
            }
        }
    }

    fn restart(&mut self, activation: &ActivationController<'_>) -> Result<(), WorkflowError> {
        match activation
            .restart_after_deploy(self.executor)
            .map_err(|err| self.failed(Step::Restart, err))?
        {
            Gated::Ran(()) => self.progress.completed.push(Step::Restart),
            Gated::Skipped => self.progress.skipped.push(Step::Restart),
        }

        Ok(())
    }

    fn failed(&self, step: Step, source: impl Into<StepError>) -> WorkflowError {
        WorkflowError::Step {
            host: self.executor.host().into(),
            step,
            source: source.into(),
        }
    }

    fn skip_rest(mut self, steps: impl IntoIterator<Item = Step>) -> Progress {
        self.progress.skipped.extend(steps);
        self.progress
    }

    fn finish(self) -> Progress {
        self.progress
    }
}

/// Failure of a single workflow step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Prepare(#[from] PrepareError),

    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Workflow error types.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Step failed on host, aborting the rest of its workflow.
    #[error("step {step} failed on {host}")]
    Step {
        host: String,
        step: Step,
        #[source]
        source: StepError,
    },

    /// Worker running host's workflow panicked.
    #[error("worker for {host} stopped unexpectedly")]
    Worker {
        host: String,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error(transparent)]
    Role(#[from] RoleError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DeployConfig, StageSettings},
        remote::{CommandOutput, ExecError, Privilege},
        role::HostPair,
        stage::StageName,
    };

    use pretty_assertions::assert_eq;
    use std::{path::Path, sync::Mutex};

    /// Executor that records commands, and answers every one of them with
    /// success unless it contains `fail_on`.
    struct RecordingExecutor {
        host: String,
        fail_on: Option<&'static str>,
        commands: Mutex<Vec<(String, Privilege)>>,
    }

    impl RecordingExecutor {
        fn new(host: &str) -> Self {
            Self {
                host: host.into(),
                fail_on: None,
                commands: Mutex::new(Vec::new()),
            }
        }

        fn failing_on(mut self, pattern: &'static str) -> Self {
            self.fail_on = Some(pattern);
            self
        }

        fn commands(&self) -> Vec<(String, Privilege)> {
            self.commands.lock().unwrap().clone()
        }

        fn count(&self, pattern: &str) -> usize {
            self.commands()
                .iter()
                .filter(|(command, _)| command.contains(pattern))
                .count()
        }
    }

    impl RemoteExecutor for RecordingExecutor {
        fn host(&self) -> &str {
            &self.host
        }

        fn execute(&self, command: &str, privilege: &Privilege) -> crate::remote::Result<CommandOutput> {
            self.commands
                .lock()
                .unwrap()
                .push((command.into(), privilege.clone()));

            let failed = self.fail_on.is_some_and(|pattern| command.contains(pattern));
            Ok(CommandOutput {
                status: if failed { 1 } else { 0 },
                output: String::new(),
            })
        }

        fn upload_file(&self, _local: &Path, _remote: &Path) -> crate::remote::Result<()> {
            Ok(())
        }
    }

    fn context() -> DeploymentContext {
        let mut settings = StageSettings {
            workers: 2,
            ..Default::default()
        };
        let web = HostPair::new("web", "10.0.0.1");
        let app = HostPair::new("app", "10.0.0.2");
        let db = HostPair::new("db", "10.0.0.3");
        settings.roles.insert("nginx".into(), vec![web, app.clone()]);
        settings.roles.insert("application".into(), vec![app]);
        settings.roles.insert("database".into(), vec![db.clone()]);
        settings.roles.insert("mail".into(), vec![db]);

        let mut config = DeployConfig::default();
        config.project.package_dir = "/nonexistent/fixjam/packages".into();
        config.stages.insert("dev".into(), settings);
        DeploymentContext::select(StageName::Dev, &config).unwrap()
    }

    fn deploy(version: &str) -> Workflow {
        Workflow::Deploy {
            version: version.into(),
        }
    }

    #[test]
    fn deploy_runs_every_step_in_order_on_application_host() {
        let ctx = context();
        let executor = RecordingExecutor::new("app");
        let progress = deploy("abc123").run_on_host(&ctx, &executor).unwrap();

        assert_eq!(
            progress.completed,
            vec![
                Step::Fetch,
                Step::Prepare,
                Step::Activate,
                Step::Restart,
                Step::Cleanup
            ]
        );
        assert!(progress.skipped.is_empty());

        let commands = executor.commands();
        let position = |pattern: &str| {
            commands
                .iter()
                .position(|(command, _)| command.contains(pattern))
                .unwrap()
        };
        assert!(position("git clone") < position("git reset --hard 'abc123'"));
        assert!(position("git reset --hard") < position("mv -Tf"));
        assert!(position("mv -Tf") < position("apache2ctl graceful"));
        assert_eq!(executor.count("apache2ctl graceful"), 1);

        let (_, privilege) = &commands[position("apache2ctl graceful")];
        assert_eq!(privilege, &Privilege::Root);
    }

    #[test]
    fn deploy_skips_restart_on_nginx_only_host() {
        let ctx = context();
        let executor = RecordingExecutor::new("web");
        let progress = deploy("abc123").run_on_host(&ctx, &executor).unwrap();

        assert_eq!(progress.skipped, vec![Step::Restart]);
        assert_eq!(executor.count("mv -Tf"), 1);
        assert_eq!(executor.count("apache2ctl"), 0);
    }

    #[test]
    fn deploy_skips_everything_on_database_host() {
        let ctx = context();
        let executor = RecordingExecutor::new("db");
        let progress = deploy("abc123").run_on_host(&ctx, &executor).unwrap();

        assert!(progress.completed.is_empty());
        assert_eq!(
            progress.skipped,
            vec![
                Step::Fetch,
                Step::Prepare,
                Step::Activate,
                Step::Restart,
                Step::Cleanup
            ]
        );
        assert!(executor.commands().is_empty());
    }

    #[test]
    fn failed_fetch_aborts_before_activation() {
        let ctx = context();
        let executor = RecordingExecutor::new("app").failing_on("git clone");
        let result = deploy("abc123").run_on_host(&ctx, &executor);

        assert!(matches!(
            result,
            Err(WorkflowError::Step {
                step: Step::Fetch,
                source: StepError::Fetch(_),
                ..
            })
        ));
        assert_eq!(executor.count("mv -Tf"), 0);
        assert_eq!(executor.count("apache2ctl"), 0);
    }

    #[test]
    fn failed_swap_keeps_host_from_restarting() {
        let ctx = context();
        let executor = RecordingExecutor::new("app").failing_on("mv -Tf");
        let result = deploy("abc123").run_on_host(&ctx, &executor);

        match result {
            Err(WorkflowError::Step {
                host,
                step: Step::Activate,
                source: StepError::Activation(ActivationError::Swap { source, .. }),
            }) => {
                assert_eq!(host, "app");
                assert!(matches!(source, ExecError::Failed { status: 1, .. }));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(executor.count("apache2ctl"), 0);
    }

    #[test]
    fn prepare_stops_before_activation() {
        let ctx = context();
        let executor = RecordingExecutor::new("app");
        let workflow = Workflow::Prepare {
            version: "abc123".into(),
        };
        let progress = workflow.run_on_host(&ctx, &executor).unwrap();

        assert_eq!(progress.completed, vec![Step::Fetch, Step::Prepare]);
        assert_eq!(executor.count("mv -Tf"), 0);
    }

    #[test]
    fn unknown_host_is_rejected() {
        let ctx = context();
        let executor = RecordingExecutor::new("elsewhere");
        let result = deploy("abc123").run_on_host(&ctx, &executor);
        assert!(matches!(result, Err(WorkflowError::Role(_))));
    }

    #[tokio::test]
    async fn pool_reports_every_host_in_order() {
        let ctx = Arc::new(context());
        let executors: Vec<Arc<dyn RemoteExecutor>> = vec![
            Arc::new(RecordingExecutor::new("web")),
            Arc::new(RecordingExecutor::new("app").failing_on("git clone")),
            Arc::new(RecordingExecutor::new("db")),
        ];

        let reports = run_workflow(ctx, Arc::new(deploy("abc123")), executors).await;
        let hosts = reports.iter().map(|report| report.host.as_str()).collect::<Vec<_>>();
        assert_eq!(hosts, vec!["web", "app", "db"]);
        assert!(reports[0].result.is_ok());
        assert!(reports[1].result.is_err());
        assert!(reports[2].result.is_ok());
    }
}
