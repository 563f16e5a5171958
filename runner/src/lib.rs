//! Disposable test environments for package validation.
//!
//! An [`Environment`] renders an infrastructure definition for its [`Backend`],
//! materializes it, bootstraps just enough to be provisioned, hands it to a
//! [`Provisioner`] and finally tears everything down again.

pub mod backend;
pub mod environment;
pub mod error;
pub mod executor;
pub mod provision;
pub mod state;
pub mod target;
pub mod templates;

pub use backend::{Backend, BootstrapStep, ResourceHandle};
pub use environment::{environment_name, Environment};
pub use error::{
    EnvironmentCreationError, ExecutorError, ProvisionError, RenderError, RunnerError,
};
pub use executor::{
    CommandExecutor, CommandOutput, RecordedCall, SimulatedCommandExecutor,
    SystemCommandExecutor, TimeoutCommandExecutor,
};
pub use provision::{AnsibleProvisioner, ProvisionContext, Provisioner};
pub use state::EnvironmentState;
pub use target::{Repository, Target};
pub use templates::{TemplateParams, TemplateRenderer};
