// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use fixjam_deploy::{
    config::DeployConfig,
    git,
    path::default_config_path,
    remote::{connect, RemoteExecutor},
    role::Role,
    stage::{DeploymentContext, StageName},
    task::TaskRegistry,
    workflow::{self, HostReport, Workflow},
};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::{fs, path::PathBuf, process::exit, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "fixjam-deploy [options] <stage> <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to deployment configuration file.
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Stage to deploy to: dev, staging, or production.
    #[arg(value_name = "stage")]
    pub stage: StageName,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let config = load_config(self.config)?;
        let ctx = Arc::new(DeploymentContext::select(self.stage, &config)?);
        info!("selected stage {} of {}", ctx.stage(), ctx.project().name);

        match self.command {
            Command::Deploy(opts) => run_deploy(ctx, opts).await,
            Command::Prep(opts) => run_prep(ctx, opts).await,
            Command::Activate(opts) => {
                report(workflow::activate_release(ctx.clone(), opts.version, executors(&ctx)).await)
            }
            Command::Rollback(opts) => {
                report(workflow::rollback(ctx.clone(), opts.version, executors(&ctx)).await)
            }
            Command::Prune(opts) => run_prune(ctx, opts).await,
            Command::Task(opts) => run_task(ctx, opts).await,
            Command::Hosts(opts) => run_hosts(&ctx, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Fetch, prepare, and activate new release on every host.
    #[command(override_usage = "fixjam-deploy <stage> deploy [options]")]
    Deploy(ReleaseOptions),

    /// Fetch and prepare new release without activating it.
    #[command(override_usage = "fixjam-deploy <stage> prep [options]")]
    Prep(ReleaseOptions),

    /// Activate prepared release on every host.
    #[command(override_usage = "fixjam-deploy <stage> activate <version>")]
    Activate(VersionOptions),

    /// Re-activate retained release on every host.
    #[command(override_usage = "fixjam-deploy <stage> rollback <version>")]
    Rollback(VersionOptions),

    /// Remove superseded release from every host.
    #[command(override_usage = "fixjam-deploy <stage> prune <version>")]
    Prune(VersionOptions),

    /// Run named service tasks on every host playing their roles.
    #[command(override_usage = "fixjam-deploy <stage> task [options] <task_name>...")]
    Task(TaskOptions),

    /// Show hosts of stage and the roles they play.
    #[command(override_usage = "fixjam-deploy <stage> hosts [options]")]
    Hosts(HostsOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ReleaseOptions {
    /// Commit to release instead of the head of the deploy branch.
    #[arg(short, long, value_name = "rev")]
    pub version: Option<String>,

    /// Push deploy branch to its remote first.
    #[arg(short, long)]
    pub push: bool,

    /// Remote to push deploy branch to.
    #[arg(short, long, value_name = "remote", default_value = "origin")]
    pub remote: String,

    /// Path to local clone of the application repository.
    #[arg(long, value_name = "path", default_value = ".")]
    pub repo: PathBuf,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct VersionOptions {
    /// Version of release to operate on.
    #[arg(required = true, value_name = "version")]
    pub version: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct TaskOptions {
    /// Names of tasks to run in order.
    #[arg(required_unless_present = "list", value_name = "task_name")]
    pub task_names: Vec<String>,

    /// List every registered task.
    #[arg(short, long)]
    pub list: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct HostsOptions {
    /// Only show hosts playing this role.
    #[arg(short, long, value_name = "role")]
    pub role: Option<Role>,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

fn load_config(path: Option<PathBuf>) -> Result<DeployConfig> {
    let Some(path) = path.or_else(default_config_path) else {
        info!("no configuration file found, using built-in defaults");
        return Ok(DeployConfig::default());
    };

    let data = fs::read_to_string(&path)
        .with_context(|| format!("failed to read configuration {:?}", path.display()))?;
    let config = data
        .parse::<DeployConfig>()
        .with_context(|| format!("invalid configuration {:?}", path.display()))?;

    Ok(config)
}

fn executors(ctx: &DeploymentContext) -> Vec<Arc<dyn RemoteExecutor>> {
    ctx.hosts().iter().map(|host| connect(ctx, host)).collect()
}

fn resolve_version(ctx: &DeploymentContext, opts: &ReleaseOptions) -> Result<String> {
    let branch = &ctx.project().branch;
    if opts.push {
        git::push_branch(&opts.repo, &opts.remote, branch)?;
    }

    let revision = opts.version.as_deref().unwrap_or(branch);
    let version = git::resolve_commit(&opts.repo, revision)
        .with_context(|| format!("failed to resolve {revision:?} in {:?}", opts.repo.display()))?;
    info!("release version {version}");

    Ok(version)
}

async fn run_deploy(ctx: Arc<DeploymentContext>, opts: ReleaseOptions) -> Result<()> {
    let version = resolve_version(&ctx, &opts)?;
    report(workflow::deploy(ctx.clone(), version, executors(&ctx)).await)
}

async fn run_prep(ctx: Arc<DeploymentContext>, opts: ReleaseOptions) -> Result<()> {
    let version = resolve_version(&ctx, &opts)?;
    report(workflow::prep_new_release(ctx.clone(), version, executors(&ctx)).await)
}

async fn run_prune(ctx: Arc<DeploymentContext>, opts: VersionOptions) -> Result<()> {
    let prune = Arc::new(Workflow::Prune {
        version: opts.version,
    });
    report(workflow::run_workflow(ctx.clone(), prune, executors(&ctx)).await)
}

async fn run_task(ctx: Arc<DeploymentContext>, opts: TaskOptions) -> Result<()> {
    let registry = TaskRegistry::builtin();
    if opts.list {
        for task in registry.tasks() {
            let roles = task.roles.iter().map(Role::as_str).collect::<Vec<_>>();
            println!("{:<24} {} [{}]", task.name, task.summary, roles.join(", "));
        }

        return Ok(());
    }

    // INVARIANT: Reject unknown task names before contacting any host.
    let tasks = registry.resolve(&opts.task_names)?;
    let workflow = Arc::new(Workflow::Tasks(tasks));
    report(workflow::run_workflow(ctx.clone(), workflow, executors(&ctx)).await)
}

fn run_hosts(ctx: &DeploymentContext, opts: HostsOptions) -> Result<()> {
    let hosts = match opts.role {
        Some(role) => ctx.roledefs().hosts_in_role(role),
        None => ctx.hosts(),
    };

    for host in hosts {
        let roles = ctx.roles_for_host(&host)?;
        let roles = roles.iter().map(Role::as_str).collect::<Vec<_>>();
        println!("{host:<32} {}", roles.join(", "));
    }

    Ok(())
}

fn report(reports: Vec<HostReport>) -> Result<()> {
    let total = reports.len();
    let mut failed = 0;
    for report in reports {
        match report.result {
            Ok(progress) => {
                let completed = progress
                    .completed
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>();
                info!("{}: done [{}]", report.host, completed.join(", "));
            }
            Err(err) => {
                failed += 1;
                error!("{:?}", anyhow::Error::new(err));
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{failed} of {total} hosts failed"));
    }

    Ok(())
}
