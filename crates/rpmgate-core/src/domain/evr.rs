//! RPM epoch/version/release triple and its ordering.
//!
//! Ordering follows `rpmvercmp`: epoch first, then version, then release.
//! Each string is split into alternating numeric and alphabetic runs;
//! numeric runs compare numerically (leading zeros ignored), alphabetic runs
//! compare byte-wise, and a numeric run is always newer than an alphabetic
//! one. `~` sorts before everything (pre-releases) and `^` sorts after the
//! end of a string but before any further run (post-release snapshots).
//!
//! `rpmvercmp` treats `1.001` and `1.1` as the same version. [`Evr::rpm_cmp`]
//! keeps that view; `Ord` breaks such ties on the raw text so that it agrees
//! with `Eq`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Epoch, version and release of a package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Evr {
    /// Epoch; `0` when the package does not declare one.
    #[serde(default)]
    pub epoch: u32,
    pub version: String,
    pub release: String,
}

impl Evr {
    pub fn new(epoch: u32, version: impl Into<String>, release: impl Into<String>) -> Self {
        Self {
            epoch,
            version: version.into(),
            release: release.into(),
        }
    }

    /// Compare the way rpm and yum do. `Equal` does not imply `==`.
    pub fn rpm_cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| rpmvercmp(&self.version, &other.version))
            .then_with(|| rpmvercmp(&self.release, &other.release))
    }
}

impl Ord for Evr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rpm_cmp(other)
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.release.cmp(&other.release))
    }
}

impl PartialOrd for Evr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Evr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch > 0 {
            write!(f, "{}:", self.epoch)?;
        }
        write!(f, "{}-{}", self.version, self.release)
    }
}

impl FromStr for Evr {
    type Err = DomainError;

    /// Parse `[epoch:]version-release`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::InvalidEvr(s.to_string());
        let (epoch, rest) = match s.split_once(':') {
            Some((e, rest)) => (e.parse::<u32>().map_err(|_| invalid())?, rest),
            None => (0, s),
        };
        let (version, release) = rest.rsplit_once('-').ok_or_else(invalid)?;
        if version.is_empty() || release.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(epoch, version, release))
    }
}

fn is_separator(b: u8) -> bool {
    !b.is_ascii_alphanumeric() && b != b'~' && b != b'^'
}

fn take_run<'a>(s: &'a [u8], pos: &mut usize, numeric: bool) -> &'a [u8] {
    let start = *pos;
    while *pos < s.len()
        && if numeric {
            s[*pos].is_ascii_digit()
        } else {
            s[*pos].is_ascii_alphabetic()
        }
    {
        *pos += 1;
    }
    &s[start..*pos]
}

/// Compare two version (or release) strings with RPM semantics.
pub fn rpmvercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (mut i, mut j) = (0usize, 0usize);

    loop {
        while i < a.len() && is_separator(a[i]) {
            i += 1;
        }
        while j < b.len() && is_separator(b[j]) {
            j += 1;
        }

        let (a_tilde, b_tilde) = (a.get(i) == Some(&b'~'), b.get(j) == Some(&b'~'));
        if a_tilde || b_tilde {
            if !a_tilde {
                return Ordering::Greater;
            }
            if !b_tilde {
                return Ordering::Less;
            }
            i += 1;
            j += 1;
            continue;
        }

        let (a_caret, b_caret) = (a.get(i) == Some(&b'^'), b.get(j) == Some(&b'^'));
        if a_caret || b_caret {
            if i >= a.len() {
                return Ordering::Less;
            }
            if j >= b.len() {
                return Ordering::Greater;
            }
            if !a_caret {
                return Ordering::Greater;
            }
            if !b_caret {
                return Ordering::Less;
            }
            i += 1;
            j += 1;
            continue;
        }

        if i >= a.len() || j >= b.len() {
            break;
        }

        let numeric = a[i].is_ascii_digit();
        let run_a = take_run(a, &mut i, numeric);
        let run_b = take_run(b, &mut j, numeric);

        // Runs of different kinds: numeric wins.
        if run_b.is_empty() {
            return if numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let ord = if numeric {
            let ra = strip_zeros(run_a);
            let rb = strip_zeros(run_b);
            ra.len().cmp(&rb.len()).then_with(|| ra.cmp(rb))
        } else {
            run_a.cmp(run_b)
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    match (i >= a.len(), j >= b.len()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        _ => Ordering::Greater,
    }
}

fn strip_zeros(run: &[u8]) -> &[u8] {
    let first = run.iter().position(|&c| c != b'0').unwrap_or(run.len());
    &run[first..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_runs_compare_numerically() {
        let old = Evr::new(0, "1.2", "3");
        let new = Evr::new(0, "1.10", "1");
        assert!(new > old);
    }

    #[test]
    fn epoch_dominates() {
        assert!(Evr::new(1, "0.1", "1") > Evr::new(0, "99", "99"));
    }

    #[test]
    fn rpm_equivalent_versions_still_order_consistently() {
        let padded = Evr::new(0, "1.001", "1");
        let plain = Evr::new(0, "1.1", "1");
        assert_eq!(padded.rpm_cmp(&plain), Ordering::Equal);
        assert_ne!(padded, plain);
        assert_ne!(padded.cmp(&plain), Ordering::Equal);
        assert_eq!(padded.cmp(&plain), plain.cmp(&padded).reverse());

        let set: std::collections::BTreeSet<Evr> = [padded.clone(), plain.clone()].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(padded.cmp(&padded.clone()), Ordering::Equal);
    }

    #[test]
    fn release_breaks_ties() {
        assert!(Evr::new(0, "2.0", "2.el8") > Evr::new(0, "2.0", "1.el8"));
    }

    #[test]
    fn leading_zeros_are_ignored() {
        assert_eq!(rpmvercmp("1.001", "1.1"), Ordering::Equal);
    }

    #[test]
    fn numeric_beats_alpha() {
        assert_eq!(rpmvercmp("1.1", "1.a"), Ordering::Greater);
        assert_eq!(rpmvercmp("1.a", "1.1"), Ordering::Less);
    }

    #[test]
    fn alpha_runs_compare_bytewise() {
        assert_eq!(rpmvercmp("1.beta", "1.alpha"), Ordering::Greater);
    }

    #[test]
    fn longer_version_is_newer() {
        assert_eq!(rpmvercmp("1.0.1", "1.0"), Ordering::Greater);
    }

    #[test]
    fn tilde_sorts_before_release() {
        assert_eq!(rpmvercmp("1.0~rc1", "1.0"), Ordering::Less);
        assert_eq!(rpmvercmp("1.0~rc1", "1.0~rc2"), Ordering::Less);
    }

    #[test]
    fn caret_sorts_after_base() {
        assert_eq!(rpmvercmp("1.0^git1", "1.0"), Ordering::Greater);
        assert_eq!(rpmvercmp("1.0^git1", "1.0.1"), Ordering::Less);
    }

    #[test]
    fn separators_are_equivalent() {
        assert_eq!(rpmvercmp("1_2", "1.2"), Ordering::Equal);
    }

    #[test]
    fn parse_and_display() {
        let evr: Evr = "2:1.4-3.el9".parse().unwrap();
        assert_eq!(evr, Evr::new(2, "1.4", "3.el9"));
        assert_eq!(evr.to_string(), "2:1.4-3.el9");
        assert_eq!(Evr::new(0, "1", "1").to_string(), "1-1");
        assert!("nodash".parse::<Evr>().is_err());
    }
}
