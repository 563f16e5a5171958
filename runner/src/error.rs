use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::state::EnvironmentState;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Template not found: {}", path.display())]
    TemplateNotFound { path: PathBuf },

    #[error("Failed to read template {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Template {template} requires parameter '{name}'")]
    MissingParameter { template: String, name: String },

    #[error("Parameter '{name}' cannot be substituted: {message}")]
    InvalidValue { name: String, message: String },

    #[error("Template {template} has no `{{{{- end }}}}` for `{directive}`")]
    UnterminatedBlock { template: String, directive: String },

    #[error("Failed to write rendered template {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The execution primitive itself could not run. A non-zero exit is never this.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Backend tool '{program}' not found")]
    ToolNotFound { program: String },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Failed waiting for {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },

    #[error("Malformed environment handle: {message}")]
    MalformedHandle { message: String },

    #[error("No command given")]
    EmptyCommand,

    #[error("Command `{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
}

#[derive(Debug, Error)]
pub enum EnvironmentCreationError {
    #[error("`{command}` exited with code {exit_code} while creating {env_name}: {stderr}")]
    CommandFailed {
        env_name: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Backend tool failed while creating {env_name}: {source}")]
    Executor {
        env_name: String,
        #[source]
        source: ExecutorError,
    },

    #[error("Environment {env_name} was created but its address is unknown: {message}")]
    MissingHandle { env_name: String, message: String },
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{message}: {stderr}")]
    Bootstrap { message: String, stderr: String },

    #[error("Provisioning failed: {message}: {stderr}")]
    Provisioner { message: String, stderr: String },

    #[error("Cannot install package {package}: {stderr}")]
    PackageInstall { package: String, stderr: String },
}

impl ProvisionError {
    pub fn stderr(&self) -> &str {
        match self {
            ProvisionError::Bootstrap { stderr, .. }
            | ProvisionError::Provisioner { stderr, .. }
            | ProvisionError::PackageInstall { stderr, .. } => stderr,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Creation(#[from] EnvironmentCreationError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("Cannot {operation} environment {env_name} in state {state}")]
    InvalidState {
        operation: &'static str,
        env_name: String,
        state: EnvironmentState,
    },

    #[error("Failed to tear down {env_name}: {stderr}")]
    Teardown { env_name: String, stderr: String },

    #[error("Working directory error: {message}")]
    Io { message: String },
}
