use config_loader::{DistFamily, WorkerConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{EnvironmentCreationError, ExecutorError, RunnerError};
use crate::executor::{command_line, shell_join, CommandExecutor, CommandOutput};
use crate::target::{Repository, Target};
use crate::templates::TemplateParams;

/// Infrastructure technology an environment runs on.
///
/// Everything backend-specific lives here: template parameters, the create
/// primitive, bootstrap pre-steps and command translation. The lifecycle in
/// `Environment` is shared by all variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Docker,
    OpenNebula,
    Aws,
}

/// Live backend resource owned by an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResourceHandle {
    Container { name: String },
    Host { address: String },
}

impl ResourceHandle {
    pub fn id(&self) -> &str {
        match self {
            ResourceHandle::Container { name } => name,
            ResourceHandle::Host { address } => address,
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceHandle::Container { name } => write!(f, "container {}", name),
            ResourceHandle::Host { address } => write!(f, "host {}", address),
        }
    }
}

/// A bootstrap sub-command and the message reported when it exits non-zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapStep {
    pub command: Vec<String>,
    pub failure_message: String,
}

/// Borrowed view of an environment handed to the create and destroy primitives.
pub(crate) struct BackendContext<'a> {
    pub env_name: &'a str,
    pub work_dir: &'a Path,
    pub config: &'a WorkerConfig,
    pub executor: &'a dyn CommandExecutor,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Docker, Backend::OpenNebula, Backend::Aws];

    pub fn tag(&self) -> &'static str {
        match self {
            Backend::Docker => "docker",
            Backend::OpenNebula => "opennebula",
            Backend::Aws => "aws",
        }
    }

    pub fn template_name(&self) -> &'static str {
        match self {
            Backend::Docker => "docker.tf.tmpl",
            Backend::OpenNebula => "opennebula.tf.tmpl",
            Backend::Aws => "aws.tf.tmpl",
        }
    }

    /// Name of the rendered definition inside the working directory.
    pub fn definition_file(&self) -> &'static str {
        match self {
            Backend::Docker => "docker.tf",
            Backend::OpenNebula => "opennebula.tf",
            Backend::Aws => "aws.tf",
        }
    }

    pub fn work_dir_prefix(&self) -> &'static str {
        match self {
            Backend::Docker => "docker_test_runner_",
            Backend::OpenNebula => "opennebula_test_runner_",
            Backend::Aws => "aws_test_runner_",
        }
    }

    /// Ansible connection plugin used to reach the environment.
    pub fn connection(&self) -> &'static str {
        match self {
            Backend::Docker => "docker",
            Backend::OpenNebula | Backend::Aws => "ssh",
        }
    }

    pub fn render_parameters(
        &self,
        env_name: &str,
        target: &Target,
        repositories: &[Repository],
        config: &WorkerConfig,
    ) -> TemplateParams {
        let mut params = TemplateParams::new();
        params.insert("env_name".to_string(), json!(env_name));
        params.insert("dist_name".to_string(), json!(target.dist_name));
        params.insert("dist_version".to_string(), json!(target.dist_version));
        params.insert("dist_arch".to_string(), json!(target.dist_arch));
        params.insert(
            "repositories".to_string(),
            serde_json::to_value(repositories).unwrap_or(Value::Array(Vec::new())),
        );

        match self {
            Backend::Docker => {
                params.insert(
                    "image_name".to_string(),
                    json!(format!("{}:{}", target.dist_name, target.dist_version)),
                );
                params.insert("container_name".to_string(), json!(env_name));
                params.insert(
                    "external_network".to_string(),
                    config
                        .external_network
                        .as_ref()
                        .map_or(Value::Null, |n| json!(n)),
                );
            }
            Backend::OpenNebula => {
                params.insert("vm_name".to_string(), json!(env_name));
                params.insert(
                    "image_name".to_string(),
                    json!(format!(
                        "{}-{}-{}",
                        target.dist_name, target.dist_version, target.dist_arch
                    )),
                );
            }
            Backend::Aws => {
                params.insert("instance_name".to_string(), json!(env_name));
                params.insert(
                    "ami_name".to_string(),
                    json!(format!(
                        "{}-{}-{}",
                        target.dist_name, target.dist_version, target.dist_arch
                    )),
                );
                params.insert(
                    "instance_type".to_string(),
                    json!(aws_instance_type(&target.dist_arch)),
                );
            }
        }

        params
    }

    /// Prepare the working directory. Nothing exists on the backend until `create`.
    pub(crate) fn init(&self, ctx: &BackendContext<'_>) -> Result<(), EnvironmentCreationError> {
        terraform(ctx, &["init", "-input=false", "-no-color"])?;
        Ok(())
    }

    /// Materialize the rendered definition and resolve the handle of the new resource.
    pub(crate) fn create(
        &self,
        ctx: &BackendContext<'_>,
    ) -> Result<ResourceHandle, EnvironmentCreationError> {
        terraform(ctx, &["apply", "-auto-approve", "-input=false", "-no-color"])?;

        match self {
            Backend::Docker => Ok(ResourceHandle::Container {
                name: ctx.env_name.to_string(),
            }),
            Backend::OpenNebula => host_from_output(ctx, "vm_ip"),
            Backend::Aws => host_from_output(ctx, "instance_ip"),
        }
    }

    pub(crate) fn destroy(&self, ctx: &BackendContext<'_>) -> Result<(), RunnerError> {
        let args = ["destroy", "-auto-approve", "-input=false", "-no-color"];
        let output = run_terraform(ctx, &args)?;
        if !output.success() {
            return Err(RunnerError::Teardown {
                env_name: ctx.env_name.to_string(),
                stderr: output.stderr,
            });
        }
        info!("Destroyed backend resources for {}", ctx.env_name);
        Ok(())
    }

    /// Pre-steps that make the environment reachable by the provisioner.
    ///
    /// Container images of the Debian family ship without python3; VM and cloud
    /// images are built with it.
    pub fn bootstrap_steps(&self, family: DistFamily, dist_version: &str) -> Vec<BootstrapStep> {
        match (self, family) {
            (Backend::Docker, DistFamily::Debian) => {
                let package_manager = family.package_manager(dist_version);
                vec![
                    BootstrapStep {
                        command: vec![package_manager.to_string(), "update".to_string()],
                        failure_message: "Cannot update metadata".to_string(),
                    },
                    BootstrapStep {
                        command: vec![
                            package_manager.to_string(),
                            "install".to_string(),
                            "-y".to_string(),
                            "python3".to_string(),
                        ],
                        failure_message: "Cannot install package python3".to_string(),
                    },
                ]
            }
            _ => Vec::new(),
        }
    }

    /// Wrap a logical command so it runs inside the environment.
    pub fn translate_command(
        &self,
        handle: &ResourceHandle,
        command: &[String],
        config: &WorkerConfig,
    ) -> Result<(String, Vec<String>), ExecutorError> {
        if command.is_empty() {
            return Err(ExecutorError::EmptyCommand);
        }

        match (self, handle) {
            (Backend::Docker, ResourceHandle::Container { name }) if !name.trim().is_empty() => {
                let mut args = vec!["exec".to_string(), name.clone()];
                args.extend(command.iter().cloned());
                Ok((config.docker_bin.clone(), args))
            }
            (Backend::OpenNebula | Backend::Aws, ResourceHandle::Host { address })
                if !address.trim().is_empty() =>
            {
                let mut args = vec![
                    "-o".to_string(),
                    "StrictHostKeyChecking=no".to_string(),
                    "-o".to_string(),
                    "UserKnownHostsFile=/dev/null".to_string(),
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                ];
                if let Some(key) = &config.ssh_key_path {
                    args.push("-i".to_string());
                    args.push(key.display().to_string());
                }
                args.push(format!("{}@{}", config.ssh_user, address));
                args.push(shell_join(command));
                Ok(("ssh".to_string(), args))
            }
            (backend, handle) => Err(ExecutorError::MalformedHandle {
                message: format!("{} cannot address {}", backend, handle),
            }),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Backend::ALL
            .into_iter()
            .find(|b| b.tag().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown backend '{}', expected one of: docker, opennebula, aws",
                    s
                )
            })
    }
}

fn aws_instance_type(arch: &str) -> &'static str {
    match arch {
        "aarch64" | "arm64" => "t4g.micro",
        _ => "t3.micro",
    }
}

fn run_terraform(ctx: &BackendContext<'_>, args: &[&str]) -> Result<CommandOutput, ExecutorError> {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    debug!(
        "Running \"{}\" command",
        command_line(&ctx.config.terraform_bin, &args)
    );
    ctx.executor
        .execute(&ctx.config.terraform_bin, &args, Some(ctx.work_dir))
}

fn terraform(
    ctx: &BackendContext<'_>,
    args: &[&str],
) -> Result<CommandOutput, EnvironmentCreationError> {
    let output = run_terraform(ctx, args).map_err(|source| EnvironmentCreationError::Executor {
        env_name: ctx.env_name.to_string(),
        source,
    })?;

    if !output.success() {
        return Err(EnvironmentCreationError::CommandFailed {
            env_name: ctx.env_name.to_string(),
            command: format!("{} {}", ctx.config.terraform_bin, args.join(" ")),
            exit_code: output.exit_code,
            stderr: output.stderr,
        });
    }

    Ok(output)
}

fn host_from_output(
    ctx: &BackendContext<'_>,
    output_name: &str,
) -> Result<ResourceHandle, EnvironmentCreationError> {
    let output = terraform(ctx, &["output", "-raw", output_name])?;
    let address = output.stdout.trim();
    if address.is_empty() {
        return Err(EnvironmentCreationError::MissingHandle {
            env_name: ctx.env_name.to_string(),
            message: format!("terraform output '{}' is empty", output_name),
        });
    }
    Ok(ResourceHandle::Host {
        address: address.to_string(),
    })
}
