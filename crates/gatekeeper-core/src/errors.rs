//! Error taxonomy.
//!
//! The gating layer returns a verdict, not a thrown exception — [`UserError`]
//! and [`SilentIgnored`] are values, not control flow. Only IO failures at
//! the host/git boundary travel as `?`-propagated [`GateError`] variants.

use thiserror::Error;

/// Admission-predicate failures. Each surfaces as exactly one idempotent
/// comment (see `commenter`) and halts the PR's current gating cycle; these
/// are never retried — the next event for the PR re-runs gating from
/// scratch.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UserError {
    #[error("`{0}` is not a recognized branch name")]
    BranchNameInvalid(String),
    #[error("prefix `{prefix}` cannot be merged into `{branch}`")]
    PrefixForbidden { prefix: String, branch: String },
    #[error("`{0}` does not accept feature branches (maintenance line)")]
    BranchDoesNotAcceptFeatures(String),
    #[error("conflict merging `{source}` into `{target}`")]
    Conflict { source: String, target: String, files: Vec<String> },
    #[error("author approval is required")]
    NeedAuthorApproval,
    #[error("{needed} more peer approval(s) required")]
    NeedPeerApproval { needed: u32 },
    #[error("{needed} more leader approval(s) required")]
    NeedLeaderApproval { needed: u32 },
    #[error("issue check failed: {0}")]
    IssueCheckFailed(String),
    #[error("build `{0}` failed")]
    BuildFailed(String),
    #[error("build `{0}` has not started")]
    BuildNotStarted(String),
    #[error("build `{0}` is in progress")]
    BuildInProgress(String),
    #[error("commit diff of {actual} exceeds the configured max of {max}")]
    CommitTooLarge { actual: u64, max: u64 },
}

impl UserError {
    /// The idempotent-commenter `message_id` this error renders under.
    pub fn message_id(&self) -> &'static str {
        match self {
            Self::BranchNameInvalid(_) => "invalid-branch",
            Self::PrefixForbidden { .. } => "forbidden-branch",
            Self::BranchDoesNotAcceptFeatures(_) => "forbidden-branch",
            Self::Conflict { .. } => "conflict",
            Self::NeedAuthorApproval => "need-approval",
            Self::NeedPeerApproval { .. } => "need-approval",
            Self::NeedLeaderApproval { .. } => "need-approval",
            Self::IssueCheckFailed(_) => "issue-check-failed",
            Self::BuildFailed(_) => "build-failed",
            Self::BuildNotStarted(_) => "build-not-started",
            Self::BuildInProgress(_) => "build-in-progress",
            Self::CommitTooLarge { .. } => "commit-too-large",
        }
    }

    /// Stable numeric exit code for the given terminal gate result,
    /// consumed by the CLI/status page.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BranchNameInvalid(_) => 10,
            Self::PrefixForbidden { .. } => 11,
            Self::BranchDoesNotAcceptFeatures(_) => 12,
            Self::Conflict { .. } => 20,
            Self::NeedAuthorApproval => 30,
            Self::NeedPeerApproval { .. } => 31,
            Self::NeedLeaderApproval { .. } => 32,
            Self::IssueCheckFailed(_) => 40,
            Self::BuildFailed(_) => 50,
            Self::BuildNotStarted(_) => 51,
            Self::BuildInProgress(_) => 52,
            Self::CommitTooLarge { .. } => 60,
        }
    }
}

/// Non-error terminal states: no comment, no retry.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SilentIgnored {
    #[error("not a branch the bot handles")]
    NotOurs,
    #[error("hotfix prefix is ignored by the cascade engine")]
    HotfixPrefix,
    #[error("pull request is closed")]
    PrClosed,
}

impl SilentIgnored {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::NotOurs => 0,
            Self::HotfixPrefix => 1,
            Self::PrClosed => 2,
        }
    }
}

/// The full error sum type threaded through the gating/cascade/queue layers.
#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    User(#[from] UserError),
    #[error(transparent)]
    Silent(#[from] SilentIgnored),
    /// Retried by the dispatcher with backoff.
    #[error("transient host error: {0}")]
    TransientHost(#[source] anyhow::Error),
    /// Retried by the dispatcher with backoff.
    #[error("transient git error: {0}")]
    TransientGit(#[source] anyhow::Error),
    /// Logged, reported, job marked Failed. The worker keeps running.
    #[error("fatal error: {0}")]
    Fatal(#[source] anyhow::Error),
    /// Halts queue promotions until an operator resolves and sends `reset`.
    #[error("queue inconsistency: {0}")]
    QueueInconsistency(String),
}

impl GateError {
    /// `NothingToDo` and friends are represented by [`SilentIgnored`]; the
    /// exit code for the terminal result of a gating cycle, for any
    /// variant this enum can hold.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::User(e) => e.exit_code(),
            Self::Silent(e) => e.exit_code(),
            Self::TransientHost(_) => 90,
            Self::TransientGit(_) => 91,
            Self::Fatal(_) => 99,
            Self::QueueInconsistency(_) => 98,
        }
    }

    pub fn transient_host(e: impl Into<anyhow::Error>) -> Self {
        Self::TransientHost(e.into())
    }

    pub fn transient_git(e: impl Into<anyhow::Error>) -> Self {
        Self::TransientGit(e.into())
    }
}

pub type GateResult<T> = Result<T, GateError>;
