pub mod config;
pub mod matrix;
pub mod run;

use anyhow::{Context, Result};
use clap::Args;
use config_loader::{ConfigLoader, WorkerConfig};
use package_checks::SuiteReport;
use runner::{
    Backend, CommandExecutor, Environment, Repository, RunnerError, SystemCommandExecutor,
    Target, TimeoutCommandExecutor,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Options shared by `run` and `matrix`.
#[derive(Args, Debug, Clone)]
pub struct PackageArgs {
    /// Backend to create environments on (docker, opennebula, aws)
    #[arg(long, default_value = "docker")]
    pub backend: Backend,

    /// Package to install and check
    #[arg(long)]
    pub package: String,

    /// Expected package version
    #[arg(long)]
    pub package_version: Option<String>,

    /// Extra repository as NAME=URL; may be repeated
    #[arg(long = "repo", value_name = "NAME=URL")]
    pub repositories: Vec<Repository>,

    /// Correlation id embedded in environment names
    #[arg(long)]
    pub task_id: Option<String>,

    /// Worker config file (defaults to $ENVCTL_CONFIG, then built-in defaults)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl PackageArgs {
    pub fn task_id(&self) -> String {
        self.task_id
            .clone()
            .unwrap_or_else(|| format!("local{}", std::process::id()))
    }

    pub fn load_config(&self) -> Result<Arc<WorkerConfig>> {
        let loader = match &self.config {
            Some(path) => ConfigLoader::with_path(path),
            None => ConfigLoader::new(),
        };
        let config = loader.load().context("Failed to load worker config")?;
        Ok(Arc::new(config))
    }
}

/// Outcome of driving one target through the whole lifecycle.
pub struct TargetRun {
    pub target: Target,
    pub env_name: Option<String>,
    pub report: Option<SuiteReport>,
    pub error: Option<String>,
}

impl TargetRun {
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.report.as_ref().is_some_and(SuiteReport::passed)
    }

    pub fn print(&self) {
        let name = self.env_name.as_deref().unwrap_or("-");
        println!("==> {} [{}]", self.target, name);
        if let Some(report) = &self.report {
            print!("{}", report);
        }
        if let Some(error) = &self.error {
            eprintln!("Error for {}: {}", self.target, error);
        }
    }
}

fn drive(
    env: &mut Environment,
    args: &PackageArgs,
    verbose: bool,
) -> Result<SuiteReport, RunnerError> {
    env.create()?;
    env.initial_provision(verbose)?;
    env.install_package(&args.package, args.package_version.as_deref())?;
    env.run_package_checks(&args.package, args.package_version.as_deref())
}

fn executor_for(config: &WorkerConfig) -> Arc<dyn CommandExecutor> {
    match config.command_timeout() {
        Some(timeout) => Arc::new(TimeoutCommandExecutor::new(timeout)),
        None => Arc::new(SystemCommandExecutor),
    }
}

/// create -> provision -> install -> check, then always destroy.
pub fn run_target(
    config: Arc<WorkerConfig>,
    args: &PackageArgs,
    target: Target,
    task_id: &str,
    verbose: bool,
) -> TargetRun {
    let executor = executor_for(&config);
    let mut env = match Environment::new(task_id, args.backend, target.clone(), config) {
        Ok(env) => env
            .with_repositories(args.repositories.clone())
            .with_executor(executor),
        Err(e) => {
            return TargetRun {
                target,
                env_name: None,
                report: None,
                error: Some(e.to_string()),
            }
        }
    };

    let outcome = drive(&mut env, args, verbose);

    let mut run = TargetRun {
        target,
        env_name: Some(env.env_name().to_string()),
        report: None,
        error: None,
    };
    match outcome {
        Ok(report) => {
            info!(
                "{}: package checks {}",
                env.env_name(),
                if report.passed() { "passed" } else { "failed" }
            );
            run.report = Some(report);
        }
        Err(e) => run.error = Some(e.to_string()),
    }

    if let Err(e) = env.destroy() {
        error!("{}", e);
        let teardown = format!("teardown failed: {}", e);
        run.error = Some(match run.error.take() {
            Some(previous) => format!("{}; {}", previous, teardown),
            None => teardown,
        });
    }

    run
}
