use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("host command could not be run: {message}")]
    Shell { message: String },

    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    Command {
        command: String,
        exit_code: i32,
        stderr: String,
    },
}

/// Result of one command run on the target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs a command inside the environment under test.
pub trait HostShell {
    fn run(&self, argv: &[&str]) -> Result<ShellOutput, QueryError>;
}

impl<T: HostShell + ?Sized> HostShell for &T {
    fn run(&self, argv: &[&str]) -> Result<ShellOutput, QueryError> {
        (**self).run(argv)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub installed: bool,
    pub version: String,
    /// Only rpm separates release from version.
    pub release: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkCheck {
    pub missing: Vec<String>,
    pub output: String,
}

/// Read-only view of a host, as consumed by the correctness checks.
pub trait HostQuery {
    fn package(&self, name: &str) -> Result<PackageInfo, QueryError>;
    fn package_files(&self, name: &str) -> Result<Vec<String>, QueryError>;
    fn file_exists(&self, path: &str) -> Result<bool, QueryError>;
    fn is_symlink(&self, path: &str) -> Result<bool, QueryError>;
    /// Final target of a symlink; empty when it cannot be resolved.
    fn resolve_symlink(&self, path: &str) -> Result<String, QueryError>;
    fn is_dynamically_linked(&self, path: &str) -> Result<bool, QueryError>;
    fn missing_shared_libraries(&self, path: &str) -> Result<LinkCheck, QueryError>;
    /// Every RPATH/RUNPATH value embedded in the file; empty when it has none.
    fn rpath(&self, path: &str) -> Result<Vec<String>, QueryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFormat {
    Rpm,
    Deb,
}

/// [`HostQuery`] implemented with stock userland tools over a [`HostShell`].
pub struct CommandHost<S> {
    shell: S,
    format: PackageFormat,
}

impl<S: HostShell> CommandHost<S> {
    pub fn new(shell: S, format: PackageFormat) -> Self {
        Self { shell, format }
    }

    pub fn format(&self) -> PackageFormat {
        self.format
    }

    fn run(&self, argv: &[&str]) -> Result<ShellOutput, QueryError> {
        debug!("Querying host: {}", argv.join(" "));
        self.shell.run(argv)
    }

    fn run_checked(&self, argv: &[&str]) -> Result<ShellOutput, QueryError> {
        let output = self.run(argv)?;
        if !output.success() {
            return Err(QueryError::Command {
                command: argv.join(" "),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    fn test_flag(&self, flag: &str, path: &str) -> Result<bool, QueryError> {
        Ok(self.run(&["test", flag, path])?.success())
    }
}

impl<S: HostShell> HostQuery for CommandHost<S> {
    fn package(&self, name: &str) -> Result<PackageInfo, QueryError> {
        match self.format {
            PackageFormat::Rpm => {
                let output = self.run(&["rpm", "-q", "--queryformat", "%{VERSION}\\n%{RELEASE}", name])?;
                if !output.success() {
                    return Ok(PackageInfo {
                        installed: false,
                        version: String::new(),
                        release: None,
                    });
                }
                let mut lines = output.stdout.lines();
                let version = lines.next().unwrap_or_default().trim().to_string();
                let release = lines.next().map(|r| r.trim().to_string());
                Ok(PackageInfo {
                    installed: true,
                    version,
                    release,
                })
            }
            PackageFormat::Deb => {
                let output = self.run(&["dpkg-query", "-W", "-f=${Status}\\n${Version}", name])?;
                let mut lines = output.stdout.lines();
                let status = lines.next().unwrap_or_default();
                let version = lines.next().unwrap_or_default().trim().to_string();
                Ok(PackageInfo {
                    installed: output.success() && status.trim().ends_with(" installed"),
                    version,
                    release: None,
                })
            }
        }
    }

    fn package_files(&self, name: &str) -> Result<Vec<String>, QueryError> {
        let output = match self.format {
            PackageFormat::Rpm => self.run_checked(&["rpm", "-ql", name])?,
            PackageFormat::Deb => self.run_checked(&["dpkg-query", "-L", name])?,
        };

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('/') && *line != "/.")
            .map(str::to_string)
            .collect())
    }

    fn file_exists(&self, path: &str) -> Result<bool, QueryError> {
        self.test_flag("-e", path)
    }

    fn is_symlink(&self, path: &str) -> Result<bool, QueryError> {
        self.test_flag("-L", path)
    }

    fn resolve_symlink(&self, path: &str) -> Result<String, QueryError> {
        // readlink -f fails on loops and on targets under a missing directory.
        let output = self.run(&["readlink", "-f", path])?;
        if !output.success() {
            return Ok(String::new());
        }
        Ok(output.stdout.trim().to_string())
    }

    fn is_dynamically_linked(&self, path: &str) -> Result<bool, QueryError> {
        let output = self.run(&["file", "-L", "-b", path])?;
        Ok(output.success() && output.stdout.contains("dynamically linked"))
    }

    fn missing_shared_libraries(&self, path: &str) -> Result<LinkCheck, QueryError> {
        // ldd exits non-zero for static binaries; that still means nothing is missing.
        let output = self.run(&["ldd", path])?;
        Ok(LinkCheck {
            missing: parse_missing_libraries(&output.stdout),
            output: output.stdout,
        })
    }

    fn rpath(&self, path: &str) -> Result<Vec<String>, QueryError> {
        let output = self.run(&["readelf", "-d", path])?;
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(parse_rpath_entries(&output.stdout))
    }
}

pub(crate) fn parse_missing_libraries(ldd_output: &str) -> Vec<String> {
    ldd_output
        .lines()
        .filter(|line| line.contains("=> not found"))
        .filter_map(|line| line.split("=>").next())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

pub(crate) fn parse_rpath_entries(readelf_output: &str) -> Vec<String> {
    readelf_output
        .lines()
        .filter(|line| line.contains("(RPATH)") || line.contains("(RUNPATH)"))
        .filter_map(|line| {
            let start = line.find('[')?;
            let end = line.rfind(']')?;
            (end > start).then(|| line[start + 1..end].to_string())
        })
        .collect()
}
