use config_loader::{DistFamily, WorkerConfig};
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::backend::{Backend, ResourceHandle};
use crate::error::ProvisionError;
use crate::executor::{command_line, CommandExecutor};
use crate::target::{Repository, Target};
use crate::templates::{TemplateParams, TemplateRenderer};

pub const INVENTORY_TEMPLATE: &str = "ansible_inventory.tmpl";
pub const INVENTORY_FILE: &str = "inventory";
pub const VARS_FILE: &str = "provision_vars.json";

/// Everything a provisioner may know about a live, bootstrapped environment.
pub struct ProvisionContext<'a> {
    pub env_name: &'a str,
    pub backend: Backend,
    pub handle: &'a ResourceHandle,
    pub target: &'a Target,
    pub family: DistFamily,
    pub repositories: &'a [Repository],
    pub work_dir: &'a Path,
    pub config: &'a WorkerConfig,
    pub executor: &'a dyn CommandExecutor,
}

/// Installs and configures the software under test inside an environment.
pub trait Provisioner: Send + Sync {
    fn provision(&self, ctx: &ProvisionContext<'_>, verbose: bool) -> Result<(), ProvisionError>;
}

#[derive(Serialize)]
struct ProvisionVars<'a> {
    env_name: &'a str,
    dist_name: &'a str,
    dist_version: &'a str,
    dist_arch: &'a str,
    dist_family: DistFamily,
    package_manager: &'a str,
    repositories: &'a [Repository],
}

/// Runs the provisioning playbook against the environment through `ansible-playbook`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnsibleProvisioner;

impl AnsibleProvisioner {
    fn write_inventory(&self, ctx: &ProvisionContext<'_>) -> Result<PathBuf, ProvisionError> {
        let path = ctx.work_dir.join(INVENTORY_FILE);
        let renderer = TemplateRenderer::new(&ctx.config.templates_dir);
        renderer
            .render(INVENTORY_TEMPLATE, &path, &inventory_parameters(ctx))
            .map_err(|e| ProvisionError::Provisioner {
                message: format!("cannot write inventory: {}", e),
                stderr: String::new(),
            })?;
        Ok(path)
    }

    fn write_vars(&self, ctx: &ProvisionContext<'_>) -> Result<PathBuf, ProvisionError> {
        let vars = ProvisionVars {
            env_name: ctx.env_name,
            dist_name: &ctx.target.dist_name,
            dist_version: &ctx.target.dist_version,
            dist_arch: &ctx.target.dist_arch,
            dist_family: ctx.family,
            package_manager: ctx.family.package_manager(&ctx.target.dist_version),
            repositories: ctx.repositories,
        };

        let path = ctx.work_dir.join(VARS_FILE);
        let content = serde_json::to_string_pretty(&vars).map_err(|e| {
            ProvisionError::Provisioner {
                message: format!("cannot serialize provisioning variables: {}", e),
                stderr: String::new(),
            }
        })?;
        fs::write(&path, content).map_err(|e| ProvisionError::Provisioner {
            message: format!("cannot write {}: {}", path.display(), e),
            stderr: String::new(),
        })?;
        Ok(path)
    }
}

impl Provisioner for AnsibleProvisioner {
    fn provision(&self, ctx: &ProvisionContext<'_>, verbose: bool) -> Result<(), ProvisionError> {
        self.write_inventory(ctx)?;
        self.write_vars(ctx)?;

        let mut args = vec![
            "-i".to_string(),
            INVENTORY_FILE.to_string(),
            "-e".to_string(),
            format!("@{}", VARS_FILE),
            playbook_path(&ctx.config.provision_playbook)
                .display()
                .to_string(),
        ];
        if verbose {
            args.push("-vv".to_string());
        }

        let program = &ctx.config.ansible_playbook_bin;
        info!("Provisioning {} ({})", ctx.env_name, ctx.handle);
        debug!("Running \"{}\" command", command_line(program, &args));

        let output = ctx
            .executor
            .execute(program, &args, Some(ctx.work_dir))
            .map_err(|e| ProvisionError::Provisioner {
                message: e.to_string(),
                stderr: String::new(),
            })?;

        if !output.success() {
            return Err(ProvisionError::Provisioner {
                message: format!("{} exited with code {}", program, output.exit_code),
                stderr: output.stderr,
            });
        }

        info!("Provisioned {}", ctx.env_name);
        Ok(())
    }
}

fn inventory_parameters(ctx: &ProvisionContext<'_>) -> TemplateParams {
    let over_ssh = ctx.backend.connection() == "ssh";
    let mut params = TemplateParams::new();
    params.insert("host".to_string(), json!(ctx.handle.id()));
    params.insert("connection".to_string(), json!(ctx.backend.connection()));
    params.insert(
        "ssh_user".to_string(),
        if over_ssh {
            json!(ctx.config.ssh_user)
        } else {
            Value::Null
        },
    );
    params.insert(
        "ssh_key_path".to_string(),
        match &ctx.config.ssh_key_path {
            Some(key) if over_ssh => json!(key.display().to_string()),
            _ => Value::Null,
        },
    );
    params
}

/// The playbook runs with the working directory as cwd, so relative paths are anchored here.
fn playbook_path(playbook: &Path) -> PathBuf {
    if playbook.is_absolute() {
        return playbook.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(playbook))
        .unwrap_or_else(|_| playbook.to_path_buf())
}
