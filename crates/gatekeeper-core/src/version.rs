//! Version tuples and the maintenance-version lattice.
//!
//! A [`Version`] is `(major, minor[, patch])`. Patch-present versions are
//! hotfix lines and form a parallel lattice that never interleaves with the
//! main cascade (see [`Lattice::cascade`]).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

impl Version {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor, patch: None }
    }

    pub fn hotfix(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch: Some(patch) }
    }

    pub fn is_hotfix(&self) -> bool {
        self.patch.is_some()
    }

    /// Parse `"5.1"` or `"5.1.3"`. Rejects anything else.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [major, minor] => Some(Self {
                major: major.parse().ok()?,
                minor: minor.parse().ok()?,
                patch: None,
            }),
            [major, minor, patch] => Some(Self {
                major: major.parse().ok()?,
                minor: minor.parse().ok()?,
                patch: Some(patch.parse().ok()?),
            }),
            _ => None,
        }
    }

    /// Sort key: a patch-present version sorts lower than a patch-absent
    /// version with the same (major, minor), so hotfix lines never get
    /// hoisted into the mainline cascade ordering.
    fn sort_key(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch.unwrap_or(u32::MAX))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.patch {
            Some(p) => write!(f, "{}.{}.{}", self.major, self.minor, p),
            None => write!(f, "{}.{}", self.major, self.minor),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// The set of active maintenance versions, derived from observed
/// `development/*` refs plus an explicit registry of which ones are
/// hotfix (patch) lines.
///
/// Hotfix membership is an explicit fact about the lattice (recorded
/// here), never inferred by counting dots in the branch name.
#[derive(Debug, Clone, Default)]
pub struct Lattice {
    versions: Vec<Version>,
}

impl Lattice {
    pub fn new(mut versions: Vec<Version>) -> Self {
        versions.sort();
        versions.dedup();
        Self { versions }
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    pub fn contains(&self, v: &Version) -> bool {
        self.versions.contains(v)
    }

    /// Highest non-hotfix version in the lattice, if any.
    pub fn tip(&self) -> Option<Version> {
        self.versions.iter().filter(|v| !v.is_hotfix()).max().copied()
    }

    /// All versions a change targeting `target` must cascade onto, in
    /// ascending order.
    ///
    /// - If `target` is a hotfix (patch-present) version, the cascade is
    ///   the single-element `[target]` provided it is a registered line —
    ///   a hotfix never cascades into the main lattice.
    /// - Otherwise, the cascade is every non-hotfix lattice version
    ///   greater than or equal to `target`, ascending.
    pub fn cascade(&self, target: Version) -> Vec<Version> {
        if target.is_hotfix() {
            return if self.versions.contains(&target) { vec![target] } else { vec![] };
        }
        let mut out: Vec<Version> = self
            .versions
            .iter()
            .copied()
            .filter(|v| !v.is_hotfix() && *v >= target)
            .collect();
        out.sort();
        out
    }
}
