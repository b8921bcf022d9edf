use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

const KNOWN: &[&str] = &[
    "x86_64", "aarch64", "i686", "ppc64le", "s390x", "riscv64", "armv7hl", "noarch", "src",
];

/// A target architecture name as RPM spells it (`x86_64`, `aarch64`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Arch(String);

impl Arch {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Architecture of the machine running rpmgate.
    pub fn host() -> Self {
        Self(std::env::consts::ARCH.to_string())
    }

    /// Whether packages of this arch install on every target.
    pub fn is_noarch(&self) -> bool {
        self.0 == "noarch"
    }

    pub fn is_source(&self) -> bool {
        self.0 == "src"
    }

    /// Whether a package built for `self` belongs in a repository for `target`.
    pub fn installs_on(&self, target: &Arch) -> bool {
        self == target || self.is_noarch()
    }
}

impl FromStr for Arch {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if KNOWN.contains(&s) {
            Ok(Self(s.to_string()))
        } else {
            Err(DomainError::UnknownArch(s.to_string()))
        }
    }
}

impl TryFrom<String> for Arch {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Arch> for String {
    fn from(value: Arch) -> Self {
        value.0
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
