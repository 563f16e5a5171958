use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

use crate::host::{HostQuery, QueryError};
use crate::report::{CheckKind, CheckOutcome, SuiteReport};

static SHARED_LIBRARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.so(\.|$)").unwrap());

/// A dynamically linked file with unresolved dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryLinkage {
    pub path: String,
    pub missing: Vec<String>,
    pub output: String,
}

impl fmt::Display for BinaryLinkage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.missing.join(", "))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckFailure {
    #[error("package {package} is not installed")]
    NotInstalled { package: String },

    #[error("package {package} has version {found}, expected {expected}")]
    VersionMismatch {
        package: String,
        expected: String,
        found: String,
    },

    #[error(
        "package {package} files missing: [{}]; broken symlinks: [{}]",
        missing.join(", "),
        broken_links.join(", ")
    )]
    FilesMissing {
        package: String,
        missing: Vec<String>,
        broken_links: Vec<String>,
    },

    #[error(
        "package {package} has unresolved shared libraries: {}",
        binaries.iter().map(|b| b.to_string()).collect::<Vec<_>>().join("; ")
    )]
    MissingLibraries {
        package: String,
        binaries: Vec<BinaryLinkage>,
    },

    #[error(
        "package {package} has malformed RPATH entries: {}",
        offenders.iter().map(|(path, rpath)| format!("{path} -> '{rpath}'")).collect::<Vec<_>>().join("; ")
    )]
    MalformedRpath {
        package: String,
        offenders: Vec<(String, String)>,
    },

    #[error("host query failed: {0}")]
    Query(#[from] QueryError),
}

impl CheckFailure {
    /// Every missing library name across all reported binaries.
    pub fn missing_libraries(&self) -> Vec<&str> {
        match self {
            CheckFailure::MissingLibraries { binaries, .. } => binaries
                .iter()
                .flat_map(|b| b.missing.iter().map(String::as_str))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Owned files, or `None` when the package owns nothing and every check is skipped.
fn owned_files<H: HostQuery + ?Sized>(
    host: &H,
    package: &str,
) -> Result<Option<Vec<String>>, CheckFailure> {
    let files = host.package_files(package)?;
    if files.is_empty() {
        debug!("Package {} owns no files, skipping check", package);
        return Ok(None);
    }
    Ok(Some(files))
}

/// Package metadata reports it installed, at the expected version when one is given.
pub fn check_installed<H: HostQuery + ?Sized>(
    host: &H,
    package: &str,
    expected_version: Option<&str>,
) -> Result<(), CheckFailure> {
    // Metadata first: listing files of a package that is not installed fails on the host.
    let info = host.package(package)?;
    if !info.installed {
        return Err(CheckFailure::NotInstalled {
            package: package.to_string(),
        });
    }

    if owned_files(host, package)?.is_none() {
        return Ok(());
    }

    let Some(expected) = expected_version.filter(|v| !v.is_empty()) else {
        return Ok(());
    };

    let release_matches = info
        .release
        .as_deref()
        .map_or(true, |release| expected.contains(release));

    if !expected.contains(info.version.as_str()) || !release_matches {
        let found = match &info.release {
            Some(release) => format!("{}-{}", info.version, release),
            None => info.version.clone(),
        };
        return Err(CheckFailure::VersionMismatch {
            package: package.to_string(),
            expected: expected.to_string(),
            found,
        });
    }

    Ok(())
}

/// Every owned path exists and every owned symlink resolves to an existing target.
pub fn check_files_exist<H: HostQuery + ?Sized>(
    host: &H,
    package: &str,
) -> Result<(), CheckFailure> {
    let Some(files) = owned_files(host, package)? else {
        return Ok(());
    };

    let mut missing = Vec::new();
    let mut broken_links = Vec::new();

    for path in &files {
        if host.is_symlink(path)? {
            let target = host.resolve_symlink(path)?;
            if target.is_empty() {
                broken_links.push(format!("{path} -> (unresolved)"));
            } else if !host.file_exists(&target)? {
                broken_links.push(format!("{path} -> {target}"));
            }
        } else if !host.file_exists(path)? {
            missing.push(path.clone());
        }
    }

    if missing.is_empty() && broken_links.is_empty() {
        return Ok(());
    }

    Err(CheckFailure::FilesMissing {
        package: package.to_string(),
        missing,
        broken_links,
    })
}

/// Every dynamically linked owned file resolves all of its shared libraries.
pub fn check_shared_libraries_resolvable<H: HostQuery + ?Sized>(
    host: &H,
    package: &str,
) -> Result<(), CheckFailure> {
    let Some(files) = owned_files(host, package)? else {
        return Ok(());
    };

    let mut binaries = Vec::new();

    for path in &files {
        let mut target = path.clone();
        if host.is_symlink(path)? {
            target = host.resolve_symlink(path)?;
            // Dangling links are reported by the file-presence check.
            if target.is_empty() || !host.file_exists(&target)? {
                continue;
            }
        }

        if !host.is_dynamically_linked(&target)? {
            continue;
        }

        let linkage = host.missing_shared_libraries(&target)?;
        if !linkage.missing.is_empty() {
            binaries.push(BinaryLinkage {
                path: target,
                missing: linkage.missing,
                output: linkage.output,
            });
        }
    }

    if binaries.is_empty() {
        Ok(())
    } else {
        Err(CheckFailure::MissingLibraries {
            package: package.to_string(),
            binaries,
        })
    }
}

/// Every owned shared library has a well-formed RPATH/RUNPATH.
pub fn check_rpath<H: HostQuery + ?Sized>(host: &H, package: &str) -> Result<(), CheckFailure> {
    let Some(files) = owned_files(host, package)? else {
        return Ok(());
    };

    let mut offenders = Vec::new();

    for library in files.iter().filter(|f| is_shared_library(f)) {
        for rpath in host.rpath(library)? {
            if !is_rpath_correct(&rpath) {
                offenders.push((library.clone(), rpath));
            }
        }
    }

    if offenders.is_empty() {
        Ok(())
    } else {
        Err(CheckFailure::MalformedRpath {
            package: package.to_string(),
            offenders,
        })
    }
}

pub(crate) fn is_shared_library(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    SHARED_LIBRARY.is_match(name)
}

/// An RPATH is malformed when any of its colon-separated entries is empty.
pub fn is_rpath_correct(rpath: &str) -> bool {
    rpath.split(':').all(|entry| !entry.trim().is_empty())
}

/// Run all four checks; a failing check never prevents the others from running.
pub fn run_suite<H: HostQuery + ?Sized>(
    host: &H,
    package: &str,
    expected_version: Option<&str>,
) -> SuiteReport {
    info!("Running package checks for {}", package);

    let outcomes = vec![
        CheckOutcome::new(
            CheckKind::Installed,
            check_installed(host, package, expected_version),
        ),
        CheckOutcome::new(CheckKind::FilesPresent, check_files_exist(host, package)),
        CheckOutcome::new(
            CheckKind::Linkage,
            check_shared_libraries_resolvable(host, package),
        ),
        CheckOutcome::new(CheckKind::Rpath, check_rpath(host, package)),
    ];

    SuiteReport {
        package: package.to_string(),
        expected_version: expected_version.map(str::to_string),
        outcomes,
    }
}
