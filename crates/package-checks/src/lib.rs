//! Package correctness checks run against a live test environment.
//!
//! The checks only ever read from the host through [`HostQuery`]; they never
//! allocate, mutate or tear down the environment they inspect.

pub mod checks;
pub mod host;
pub mod report;

pub use checks::{
    check_files_exist, check_installed, check_rpath, check_shared_libraries_resolvable,
    is_rpath_correct, run_suite, BinaryLinkage, CheckFailure,
};
pub use host::{
    CommandHost, HostQuery, HostShell, LinkCheck, PackageFormat, PackageInfo, QueryError,
    ShellOutput,
};
pub use report::{CheckKind, CheckOutcome, SuiteReport};
