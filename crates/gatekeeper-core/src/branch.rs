//! Branch name grammar: classify a ref name into exactly one [`BranchKind`].

use std::fmt;

use crate::version::Version;

/// The prefixes a "change" branch (as opposed to a development/integration/
/// queue branch) may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangePrefix {
    Feature,
    Bugfix,
    Improvement,
    Hotfix,
    User,
}

impl ChangePrefix {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "feature" => Some(Self::Feature),
            "bugfix" => Some(Self::Bugfix),
            "improvement" => Some(Self::Improvement),
            "hotfix" => Some(Self::Hotfix),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Bugfix => "bugfix",
            Self::Improvement => "improvement",
            Self::Hotfix => "hotfix",
            Self::User => "user",
        }
    }
}

impl fmt::Display for ChangePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchKind {
    Development(Version),
    Stabilization(Version),
    /// `w/<version>/<prefix>/<subname>` — bot-owned integration branch.
    Integration { version: Version, prefix: String, subname: String },
    /// `q/<pr>/<sha>/<version>` — bot-owned queue branch.
    Queue { pr_id: u64, sha: String, version: Version },
    /// `<prefix>/<subname>` where prefix is a recognized change prefix.
    Change { prefix: ChangePrefix, subname: String },
    Other(String),
}

impl BranchKind {
    /// True for refs the bot is allowed to create, advance, and delete.
    pub fn is_bot_owned(&self) -> bool {
        matches!(self, Self::Integration { .. } | Self::Queue { .. })
    }

    /// The bot must refuse to delete any ref not prefixed by `w/` or `q/`.
    pub fn deletable_by_bot(&self) -> bool {
        self.is_bot_owned()
    }
}

/// Deterministic branch name parser. Unknown shapes map to [`BranchKind::Other`].
pub fn parse(name: &str) -> BranchKind {
    let parts: Vec<&str> = name.split('/').collect();

    match parts.as_slice() {
        ["development", v] => {
            if let Some(version) = Version::parse(v) {
                return BranchKind::Development(version);
            }
        }
        ["stabilization", v] => {
            if let Some(version) = Version::parse(v) {
                return BranchKind::Stabilization(version);
            }
        }
        ["w", v, rest @ ..] if rest.len() >= 2 => {
            if let Some(version) = Version::parse(v) {
                let prefix = rest[0].to_string();
                let subname = rest[1..].join("/");
                if !subname.is_empty() {
                    return BranchKind::Integration { version, prefix, subname };
                }
            }
        }
        ["q", pr, sha, v] => {
            if let (Ok(pr_id), Some(version)) = (pr.parse::<u64>(), Version::parse(v)) {
                return BranchKind::Queue { pr_id, sha: sha.to_string(), version };
            }
        }
        [prefix, rest @ ..] if !rest.is_empty() => {
            if let Some(prefix) = ChangePrefix::parse(prefix) {
                let subname = rest.join("/");
                if !subname.is_empty() {
                    return BranchKind::Change { prefix, subname };
                }
            }
        }
        _ => {}
    }

    BranchKind::Other(name.to_string())
}

/// Encodes the prefix-admission rule:
/// - `feature` is forbidden into any maintenance development line (every
///   version but the lattice tip).
/// - `hotfix` is ignored by the cascade engine (it has its own sub-queue).
/// - `user/` is never handled.
pub fn admits(prefix: ChangePrefix, dst_is_tip: bool) -> bool {
    match prefix {
        ChangePrefix::Feature => dst_is_tip,
        ChangePrefix::Bugfix | ChangePrefix::Improvement => true,
        ChangePrefix::Hotfix => false,
        ChangePrefix::User => false,
    }
}
