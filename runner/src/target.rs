use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

static REPOSITORY_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// Distribution and architecture an environment is built for. Immutable once set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub dist_name: String,
    pub dist_version: String,
    pub dist_arch: String,
}

impl Target {
    pub fn new(
        dist_name: impl Into<String>,
        dist_version: impl Into<String>,
        dist_arch: impl Into<String>,
    ) -> Self {
        Self {
            dist_name: dist_name.into(),
            dist_version: dist_version.into(),
            dist_arch: dist_arch.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} ({})",
            self.dist_name, self.dist_version, self.dist_arch
        )
    }
}

/// Package repository injected into the rendered definition and the provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Repository {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Names become HCL attribute keys and URLs land inside quoted HCL strings.
    pub fn validate(&self) -> Result<(), String> {
        if !REPOSITORY_NAME.is_match(&self.name) {
            return Err(format!(
                "repository name '{}' may only contain letters, digits, '_' and '-'",
                self.name
            ));
        }
        if self.url.is_empty()
            || self
                .url
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || c == '"' || c == '\\')
            || self.url.contains("${")
            || self.url.contains("%{")
        {
            return Err(format!(
                "repository '{}' has an unusable url '{}'",
                self.name, self.url
            ));
        }
        Ok(())
    }
}

/// Parses `name=url`.
impl FromStr for Repository {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, url)) if !name.trim().is_empty() && !url.trim().is_empty() => {
                let repository = Repository::new(name.trim(), url.trim());
                repository.validate()?;
                Ok(repository)
            }
            _ => Err(format!("expected NAME=URL, got '{}'", s)),
        }
    }
}
