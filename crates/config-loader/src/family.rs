use serde::{Deserialize, Serialize};
use std::fmt;

/// Distribution family, decided by membership in the configured flavor lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistFamily {
    Debian,
    Rhel,
    Other,
}

impl DistFamily {
    pub fn classify(dist_name: &str, debian_flavors: &[String], rhel_flavors: &[String]) -> Self {
        let name = dist_name.trim();
        let member = |flavors: &[String]| flavors.iter().any(|f| f.eq_ignore_ascii_case(name));

        if member(debian_flavors) {
            DistFamily::Debian
        } else if member(rhel_flavors) {
            DistFamily::Rhel
        } else {
            DistFamily::Other
        }
    }

    /// Package manager binary used inside an environment of this family.
    pub fn package_manager(&self, dist_version: &str) -> &'static str {
        match self {
            DistFamily::Debian => "apt-get",
            DistFamily::Rhel => match major_version(dist_version) {
                Some(major) if major < 8 => "yum",
                _ => "dnf",
            },
            DistFamily::Other => "dnf",
        }
    }

    pub fn uses_rpm(&self) -> bool {
        !matches!(self, DistFamily::Debian)
    }
}

impl fmt::Display for DistFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistFamily::Debian => write!(f, "debian"),
            DistFamily::Rhel => write!(f, "rhel"),
            DistFamily::Other => write!(f, "other"),
        }
    }
}

fn major_version(dist_version: &str) -> Option<u32> {
    dist_version.trim().split('.').next()?.parse().ok()
}
