use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::family::DistFamily;

pub const EXTERNAL_NETWORK_ENV: &str = "EXTERNAL_NETWORK";
pub const TEMPLATES_DIR_ENV: &str = "ENVCTL_TEMPLATES_DIR";
pub const TERRAFORM_BIN_ENV: &str = "ENVCTL_TERRAFORM_BIN";

/// Read-only settings shared by every environment runner in the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_debian_flavors")]
    pub debian_flavors: Vec<String>,
    #[serde(default = "default_rhel_flavors")]
    pub rhel_flavors: Vec<String>,
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
    #[serde(default = "default_terraform_bin")]
    pub terraform_bin: String,
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
    #[serde(default = "default_ansible_playbook_bin")]
    pub ansible_playbook_bin: String,
    #[serde(default = "default_provision_playbook")]
    pub provision_playbook: PathBuf,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
    /// Named network the container backend attaches to instead of its default.
    #[serde(default)]
    pub external_network: Option<String>,
    #[serde(default)]
    pub work_dir_root: Option<PathBuf>,
    /// Only consulted by callers wrapping the executor; the runner never times out.
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
}

fn default_debian_flavors() -> Vec<String> {
    ["debian", "ubuntu", "raspbian"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_rhel_flavors() -> Vec<String> {
    ["almalinux", "centos", "rhel", "rocky", "oraclelinux", "fedora"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_terraform_bin() -> String {
    "terraform".to_string()
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_ansible_playbook_bin() -> String {
    "ansible-playbook".to_string()
}

fn default_provision_playbook() -> PathBuf {
    PathBuf::from("playbooks/initial_provision.yml")
}

fn default_ssh_user() -> String {
    "root".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            debian_flavors: default_debian_flavors(),
            rhel_flavors: default_rhel_flavors(),
            templates_dir: default_templates_dir(),
            terraform_bin: default_terraform_bin(),
            docker_bin: default_docker_bin(),
            ansible_playbook_bin: default_ansible_playbook_bin(),
            provision_playbook: default_provision_playbook(),
            ssh_user: default_ssh_user(),
            ssh_key_path: None,
            external_network: None,
            work_dir_root: None,
            command_timeout_secs: None,
        }
    }
}

impl WorkerConfig {
    /// Apply overrides from a key lookup (normally the process environment).
    /// Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(network) = non_blank(EXTERNAL_NETWORK_ENV) {
            self.external_network = Some(network);
        }
        if let Some(dir) = non_blank(TEMPLATES_DIR_ENV) {
            self.templates_dir = PathBuf::from(dir);
        }
        if let Some(bin) = non_blank(TERRAFORM_BIN_ENV) {
            self.terraform_bin = bin;
        }
    }

    pub fn classify(&self, dist_name: &str) -> DistFamily {
        DistFamily::classify(dist_name, &self.debian_flavors, &self.rhel_flavors)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}
