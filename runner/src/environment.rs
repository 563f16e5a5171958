use config_loader::{DistFamily, WorkerConfig};
use package_checks::{
    run_suite, CommandHost, HostShell, PackageFormat, QueryError, ShellOutput, SuiteReport,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendContext, ResourceHandle};
use crate::error::{ProvisionError, RenderError, RunnerError};
use crate::executor::{command_line, CommandExecutor, CommandOutput, SystemCommandExecutor};
use crate::provision::{AnsibleProvisioner, ProvisionContext, Provisioner};
use crate::state::EnvironmentState;
use crate::target::{Repository, Target};
use crate::templates::TemplateRenderer;

/// A disposable test environment and its lifecycle.
///
/// ```text
/// UNINITIALIZED -> RENDERED -> CREATED -> BOOTSTRAPPED -> PROVISIONED -> DESTROYED
///        \______________\___________\___________\_____________\--> FAILED -> DESTROYED
/// ```
///
/// The environment exclusively owns its working directory and backend handle.
/// Operations are sequential; callers wanting parallelism drive one
/// environment per thread.
pub struct Environment {
    task_id: String,
    env_name: String,
    target: Target,
    family: DistFamily,
    repositories: Vec<Repository>,
    backend: Backend,
    config: Arc<WorkerConfig>,
    executor: Arc<dyn CommandExecutor>,
    provisioner: Arc<dyn Provisioner>,
    work_dir: Option<TempDir>,
    handle: Option<ResourceHandle>,
    apply_attempted: bool,
    state: EnvironmentState,
}

impl Environment {
    /// Build an environment and its private working directory.
    ///
    /// Defaults to the host executor and the Ansible provisioner.
    pub fn new(
        task_id: impl Into<String>,
        backend: Backend,
        target: Target,
        config: Arc<WorkerConfig>,
    ) -> Result<Self, RunnerError> {
        let task_id = task_id.into();
        let env_name = environment_name(backend, &target, &task_id);
        let family = config.classify(&target.dist_name);

        let mut builder = tempfile::Builder::new();
        builder.prefix(backend.work_dir_prefix());
        let work_dir = match &config.work_dir_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| RunnerError::Io {
            message: format!("cannot create working directory for {}: {}", env_name, e),
        })?;

        debug!(
            "Environment {} ({} family) uses {}",
            env_name,
            family,
            work_dir.path().display()
        );

        Ok(Self {
            task_id,
            env_name,
            target,
            family,
            repositories: Vec::new(),
            backend,
            config,
            executor: Arc::new(SystemCommandExecutor),
            provisioner: Arc::new(AnsibleProvisioner),
            work_dir: Some(work_dir),
            handle: None,
            apply_attempted: false,
            state: EnvironmentState::Uninitialized,
        })
    }

    pub fn with_repositories(mut self, repositories: Vec<Repository>) -> Self {
        self.repositories = repositories;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn env_name(&self) -> &str {
        &self.env_name
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn family(&self) -> DistFamily {
        self.family
    }

    pub fn repositories(&self) -> &[Repository] {
        &self.repositories
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    /// `None` once the environment has been destroyed.
    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_ref().map(TempDir::path)
    }

    pub fn handle(&self) -> Option<&ResourceHandle> {
        self.handle.as_ref()
    }

    /// Render the backend definition and materialize it.
    ///
    /// A render failure never reaches the backend. A failed apply is not rolled
    /// back here; `destroy()` tears down whatever the backend left behind.
    pub fn create(&mut self) -> Result<(), RunnerError> {
        self.ensure_state("create", &[EnvironmentState::Uninitialized])?;
        let work_dir = self.require_work_dir()?.to_path_buf();

        if let Some(message) = self.repositories.iter().find_map(|r| r.validate().err()) {
            let e = RenderError::InvalidValue {
                name: "repositories".to_string(),
                message,
            };
            self.fail(&e);
            return Err(e.into());
        }

        let renderer = TemplateRenderer::new(&self.config.templates_dir);
        let params = self.backend.render_parameters(
            &self.env_name,
            &self.target,
            &self.repositories,
            &self.config,
        );
        let definition = work_dir.join(self.backend.definition_file());

        if let Err(e) = renderer.render(self.backend.template_name(), &definition, &params) {
            self.fail(&e);
            return Err(e.into());
        }
        self.advance(EnvironmentState::Rendered);

        info!("Creating {} environment {}", self.backend, self.env_name);
        let ctx = BackendContext {
            env_name: &self.env_name,
            work_dir: &work_dir,
            config: &self.config,
            executor: self.executor.as_ref(),
        };
        // A failed init leaves nothing on the backend for destroy() to remove.
        let created = match self.backend.init(&ctx) {
            Ok(()) => {
                self.apply_attempted = true;
                self.backend.create(&ctx)
            }
            Err(e) => Err(e),
        };

        match created {
            Ok(handle) => {
                info!("Environment {} is up ({})", self.env_name, handle);
                self.handle = Some(handle);
                self.advance(EnvironmentState::Created);
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e.into())
            }
        }
    }

    /// Bootstrap the environment and hand it to the provisioner.
    pub fn initial_provision(&mut self, verbose: bool) -> Result<(), RunnerError> {
        self.ensure_state("provision", &[EnvironmentState::Created])?;

        let steps = self
            .backend
            .bootstrap_steps(self.family, &self.target.dist_version);
        if steps.is_empty() {
            debug!("No bootstrap required for {}", self.env_name);
        }

        for step in steps {
            info!("Bootstrapping {}: {}", self.env_name, step.command.join(" "));
            let output = match self.run_command(&step.command) {
                Ok(output) => output,
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            };
            if !output.success() {
                let e = ProvisionError::Bootstrap {
                    message: step.failure_message,
                    stderr: output.stderr,
                };
                self.fail(&e);
                return Err(e.into());
            }
        }
        self.advance(EnvironmentState::Bootstrapped);

        let (handle, work_dir) = match (&self.handle, self.work_dir()) {
            (Some(handle), Some(work_dir)) => (handle.clone(), work_dir.to_path_buf()),
            _ => {
                let e = RunnerError::Io {
                    message: format!("{} has no live resource", self.env_name),
                };
                self.fail(&e);
                return Err(e);
            }
        };
        let ctx = ProvisionContext {
            env_name: &self.env_name,
            backend: self.backend,
            handle: &handle,
            target: &self.target,
            family: self.family,
            repositories: &self.repositories,
            work_dir: &work_dir,
            config: &self.config,
            executor: self.executor.as_ref(),
        };
        let provisioned = self.provisioner.provision(&ctx, verbose);

        match provisioned {
            Ok(()) => {
                self.advance(EnvironmentState::Provisioned);
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e.into())
            }
        }
    }

    /// Run a command inside the environment. A non-zero exit is returned, not raised.
    pub fn run_command(&self, command: &[String]) -> Result<CommandOutput, RunnerError> {
        if !self.state.is_live() {
            return Err(self.invalid_state("run command in"));
        }
        let handle = self.handle.as_ref().ok_or_else(|| RunnerError::Io {
            message: format!("{} has no live resource", self.env_name),
        })?;

        let (program, args) = self
            .backend
            .translate_command(handle, command, &self.config)?;
        debug!("Running \"{}\" command", command_line(&program, &args));

        let output = self.executor.execute(&program, &args, self.work_dir())?;
        if !output.success() {
            debug!(
                "Command exited with {} in {}: {}",
                output.exit_code,
                self.env_name,
                output.stderr.trim()
            );
        }
        Ok(output)
    }

    /// Install a package with the distribution's package manager.
    ///
    /// A failed install is a test result: the environment stays provisioned.
    pub fn install_package(&self, name: &str, version: Option<&str>) -> Result<(), RunnerError> {
        self.ensure_state("install a package in", &[EnvironmentState::Provisioned])?;

        let package_manager = self.family.package_manager(&self.target.dist_version);
        let spec = package_spec(self.family, name, version);
        let command = vec![
            package_manager.to_string(),
            "install".to_string(),
            "-y".to_string(),
            spec.clone(),
        ];

        info!("Installing {} in {}", spec, self.env_name);
        let output = self.run_command(&command)?;
        if !output.success() {
            return Err(ProvisionError::PackageInstall {
                package: spec,
                stderr: output.stderr,
            }
            .into());
        }
        Ok(())
    }

    /// Run the package correctness checks against this environment.
    pub fn run_package_checks(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<SuiteReport, RunnerError> {
        self.ensure_state("check a package in", &[EnvironmentState::Provisioned])?;

        let format = if self.family.uses_rpm() {
            PackageFormat::Rpm
        } else {
            PackageFormat::Deb
        };
        let host = CommandHost::new(self, format);
        Ok(run_suite(&host, name, version))
    }

    /// Tear down the backend resource and remove the working directory.
    ///
    /// Safe from any state and idempotent. If the backend teardown fails the
    /// environment keeps its state and working directory so the call can be retried.
    pub fn destroy(&mut self) -> Result<(), RunnerError> {
        if self.state == EnvironmentState::Destroyed {
            debug!("{} is already destroyed", self.env_name);
            return Ok(());
        }

        if self.apply_attempted {
            if let Some(work_dir) = self.work_dir() {
                info!("Destroying environment {}", self.env_name);
                let ctx = BackendContext {
                    env_name: &self.env_name,
                    work_dir,
                    config: &self.config,
                    executor: self.executor.as_ref(),
                };
                if let Err(e) = self.backend.destroy(&ctx) {
                    error!("Teardown of {} failed: {}", self.env_name, e);
                    return Err(e);
                }
            }
            self.apply_attempted = false;
        }

        if let Some(work_dir) = self.work_dir.take() {
            let path = work_dir.path().to_path_buf();
            if let Err(e) = work_dir.close() {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }

        self.handle = None;
        self.advance(EnvironmentState::Destroyed);
        Ok(())
    }

    fn ensure_state(
        &self,
        operation: &'static str,
        allowed: &[EnvironmentState],
    ) -> Result<(), RunnerError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn invalid_state(&self, operation: &'static str) -> RunnerError {
        RunnerError::InvalidState {
            operation,
            env_name: self.env_name.clone(),
            state: self.state,
        }
    }

    fn require_work_dir(&self) -> Result<&Path, RunnerError> {
        self.work_dir().ok_or_else(|| RunnerError::Io {
            message: format!("{} has no working directory", self.env_name),
        })
    }

    fn advance(&mut self, next: EnvironmentState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "{} -> {}",
            self.state,
            next
        );
        debug!("{}: {} -> {}", self.env_name, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, cause: &dyn std::fmt::Display) {
        error!(
            "{} failed in state {}: {}",
            self.env_name, self.state, cause
        );
        self.advance(EnvironmentState::Failed);
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.apply_attempted && self.state != EnvironmentState::Destroyed {
            warn!(
                "Environment {} dropped without destroy(); backend resources may still exist",
                self.env_name
            );
        }
    }
}

/// Lets the package checks query the environment through `run_command`.
impl HostShell for Environment {
    fn run(&self, argv: &[&str]) -> Result<ShellOutput, QueryError> {
        let command: Vec<String> = argv.iter().map(|a| a.to_string()).collect();
        let output = self
            .run_command(&command)
            .map_err(|e| QueryError::Shell {
                message: e.to_string(),
            })?;
        Ok(ShellOutput {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// `envctl_<backend>_<dist>_<version>_<arch>_<task>` restricted to `[A-Za-z0-9_-]`.
pub fn environment_name(backend: Backend, target: &Target, task_id: &str) -> String {
    format!(
        "envctl_{}_{}_{}_{}_{}",
        backend.tag(),
        target.dist_name,
        target.dist_version,
        target.dist_arch,
        task_id
    )
    .chars()
    .map(|c| {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            c
        } else {
            '_'
        }
    })
    .collect()
}

fn package_spec(family: DistFamily, name: &str, version: Option<&str>) -> String {
    match version.filter(|v| !v.is_empty()) {
        Some(v) if family == DistFamily::Debian => format!("{}={}", name, v),
        Some(v) => format!("{}-{}", name, v),
        None => name.to_string(),
    }
}
