use serde::Serialize;
use std::fmt;

use crate::checks::CheckFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckKind {
    Installed,
    FilesPresent,
    Linkage,
    Rpath,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::Installed => write!(f, "installed"),
            CheckKind::FilesPresent => write!(f, "files-present"),
            CheckKind::Linkage => write!(f, "linkage"),
            CheckKind::Rpath => write!(f, "rpath"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub check: CheckKind,
    pub result: Result<(), CheckFailure>,
}

impl CheckOutcome {
    pub fn new(check: CheckKind, result: Result<(), CheckFailure>) -> Self {
        Self { check, result }
    }

    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct SuiteReport {
    pub package: String,
    pub expected_version: Option<String>,
    pub outcomes: Vec<CheckOutcome>,
}

impl SuiteReport {
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(CheckOutcome::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = (CheckKind, &CheckFailure)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.check, e)))
    }

    pub fn outcome(&self, check: CheckKind) -> Option<&CheckOutcome> {
        self.outcomes.iter().find(|o| o.check == check)
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "package checks for {}:", self.package)?;
        for outcome in &self.outcomes {
            match &outcome.result {
                Ok(()) => writeln!(f, "  PASS {}", outcome.check)?,
                Err(failure) => writeln!(f, "  FAIL {}: {}", outcome.check, failure)?,
            }
        }
        Ok(())
    }
}
