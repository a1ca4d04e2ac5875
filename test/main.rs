// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

mod activation;

use fixjam_deploy::{
    config::DeployConfig,
    remote::LocalExecutor,
    stage::{DeploymentContext, StageName},
};

use anyhow::Result;
use git2::{IndexEntry, IndexTime, Repository, RepositoryInitOptions};
use indoc::formatdoc;
use std::{
    fs,
    path::{Path, PathBuf},
};

pub(crate) struct RepoFixture {
    repo: Repository,
}

impl RepoFixture {
    pub(crate) fn new(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path.as_ref(), &opts)?;

        // INVARIANT: Always provide valid name and email.
        //   - Git will complain if this is not set in CI/CD environments.
        let mut config = repo.config()?;
        config.set_str("user.name", "John Doe")?;
        config.set_str("user.email", "john@doe.com")?;

        Ok(Self { repo })
    }

    /// Commit file, and return full hash of new commit.
    pub(crate) fn stage_and_commit(
        &self,
        filename: impl AsRef<Path>,
        contents: impl AsRef<str>,
    ) -> Result<String> {
        let entry = IndexEntry {
            ctime: IndexTime::new(0, 0),
            mtime: IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            file_size: contents.as_ref().len() as u32,
            id: self.repo.blob(contents.as_ref().as_bytes())?,
            flags: 0,
            flags_extended: 0,
            path: filename
                .as_ref()
                .as_os_str()
                .to_string_lossy()
                .into_owned()
                .as_bytes()
                .to_vec(),
        };

        // INVARIANT: Always use new tree produced by index after staging new entry.
        let mut index = self.repo.index()?;
        index.add_frombuffer(&entry, contents.as_ref().as_bytes())?;
        index.write()?;
        let tree_oid = index.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;

        // INVARIANT: Always determine latest parent commits to append to.
        let signature = self.repo.signature()?;
        let mut parents = Vec::new();
        if let Some(parent) = self.repo.head().ok().map(|head| head.target().unwrap()) {
            parents.push(self.repo.find_commit(parent)?);
        }
        let parents = parents.iter().collect::<Vec<_>>();

        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            format!("chore: add {:?}", filename.as_ref()).as_ref(),
            &tree,
            &parents,
        )?;

        Ok(oid.to_string())
    }
}

/// Local stage deploying to a project root inside the working directory.
pub(crate) struct StageFixture {
    pub(crate) config: DeployConfig,
    pub(crate) ctx: DeploymentContext,
    pub(crate) origin: RepoFixture,
    pub(crate) origin_path: PathBuf,
    pub(crate) root: PathBuf,
    pub(crate) packages: PathBuf,
}

impl StageFixture {
    /// Set up origin repository, project root, and local stage.
    ///
    /// Services just append to log files in the project root, so tests can
    /// count how often each of them ran. Migrations log the name exported by
    /// the virtual environment they ran in.
    pub(crate) fn new() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let origin_path = cwd.join("origin");
        let root = cwd.join("project");
        let packages = cwd.join("packages");
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&packages)?;
        fs::write(root.join("stagesettings.py"), "STAGE = 'dev'\n")?;
        fs::write(root.join("localsettings.py"), "DEBUG = True\n")?;
        let virtualenv = cwd.join("env");
        fs::create_dir_all(virtualenv.join("bin"))?;
        fs::write(virtualenv.join("bin/activate"), "FIXJAM_ENV=fixjam\n")?;

        let origin = RepoFixture::new(&origin_path)?;
        let config: DeployConfig = formatdoc! {r#"
            [project]
            root = "{root}"
            repository = "{origin}"
            package_dir = "{packages}"
            virtualenv = "{virtualenv}"

            [services]
            restart_application = "echo restart >> {root}/restarts.log"
            migrate = ["echo migrate $FIXJAM_ENV >> {root}/migrations.log"]
            fixtures = ["echo fixtures >> {root}/fixtures.log"]

            [stage.dev]
            hostname = "localhost"
            transport = "local"
        "#,
            root = root.display(),
            origin = origin_path.display(),
            packages = packages.display(),
            virtualenv = virtualenv.display(),
        }
        .parse()?;
        let ctx = DeploymentContext::select(StageName::Dev, &config)?;

        Ok(Self {
            config,
            ctx,
            origin,
            origin_path,
            root,
            packages,
        })
    }

    /// Commit new version of the application.
    pub(crate) fn commit(&self, contents: &str) -> Result<String> {
        self.origin.stage_and_commit("fixjam/urls.py", contents)
    }

    /// Same stage with different configuration.
    pub(crate) fn context_with(
        &self,
        change: impl FnOnce(&mut DeployConfig),
    ) -> Result<DeploymentContext> {
        let mut config = self.config.clone();
        change(&mut config);
        Ok(DeploymentContext::select(StageName::Dev, &config)?)
    }

    pub(crate) fn executor(&self) -> LocalExecutor {
        LocalExecutor::new("localhost").without_sudo()
    }

    pub(crate) fn release_dir(&self, version: &str) -> PathBuf {
        self.root.join("releases").join(version)
    }

    pub(crate) fn current_target(&self) -> Result<PathBuf> {
        Ok(fs::read_link(self.root.join("current"))?)
    }

    /// Lines logged by a service into project root.
    pub(crate) fn log_lines(&self, name: &str) -> usize {
        fs::read_to_string(self.root.join(name))
            .map(|data| data.lines().count())
            .unwrap_or(0)
    }
}
