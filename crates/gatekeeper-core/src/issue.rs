//! Issue-tracker façade: the boundary between the gate engine and a
//! concrete issue-tracking API, mirroring `host.rs`'s
//! one-trait-per-backend shape so `gatekeeper-hosts` can carry a real Jira
//! client alongside the host-API ones without the gating logic knowing
//! which tracker is behind the trait object.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

/// The fields the gating predicate needs out of an issue: its tracker type
/// (mapped to a branch prefix via `settings.prefixes`) and its declared
/// fix-versions (compared against the cascade's version set).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub key: String,
    pub issue_type: String,
    pub fix_versions: HashSet<String>,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn get_issue(&self, key: &str) -> Result<Issue>;
}

/// Used when no issue-tracker integration is configured. `get_issue` is
/// never actually called in that configuration — `gating::check_issue`
/// treats an absent tracker the same as `disable_version_checks` plus no
/// type table, i.e. presence of a key is all that's enforced.
pub struct NullIssueTracker;

#[async_trait]
impl IssueTracker for NullIssueTracker {
    async fn get_issue(&self, key: &str) -> Result<Issue> {
        Ok(Issue { key: key.to_string(), issue_type: String::new(), fix_versions: HashSet::new() })
    }
}
