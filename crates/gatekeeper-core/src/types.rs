//! Data model: pull requests, build statuses, cascade plans, and
//! merge-queue entries as they travel between components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::version::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrStatus {
    Open,
    Merged,
    Declined,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: u64,
    pub author: String,
    pub state: ReviewState,
}

/// Identity is `(host, owner, slug, id)`; the `host`/`owner`/`slug` live on
/// the façade that produced this value, not on the struct itself, to avoid
/// repeating them on every PR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: u64,
    pub title: String,
    pub author: String,
    pub src_branch: String,
    pub dst_branch: String,
    pub src_commit: String,
    pub status: PrStatus,
    pub description: String,
    pub comments: Vec<Comment>,
    pub reviews: Vec<Review>,
}

impl PullRequest {
    /// The latest non-`Commented` review per reviewer wins: reviews are
    /// sorted by id ascending and the last non-`Commented` state wins.
    pub fn latest_reviews(&self) -> Vec<(&str, ReviewState)> {
        let mut sorted: Vec<&Review> = self.reviews.iter().collect();
        sorted.sort_by_key(|r| r.id);
        let mut latest: Vec<(&str, ReviewState)> = Vec::new();
        for review in sorted {
            if review.state == ReviewState::Commented {
                continue;
            }
            if let Some(existing) = latest.iter_mut().find(|(author, _)| *author == review.author) {
                existing.1 = review.state;
            } else {
                latest.push((review.author.as_str(), review.state));
            }
        }
        latest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BuildState {
    NotStarted,
    InProgress,
    Successful,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStatus {
    pub key: String,
    pub state: BuildState,
    pub url: String,
    pub description: String,
}

/// One step of a [`CascadePlan`]: the integration ref required at version
/// `version`, its expected parent, and its expected destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeStep {
    pub version: Version,
    pub integration_branch: String,
    /// Previous cascade step's integration branch, or the source branch
    /// for the first step.
    pub expected_parent: String,
    pub development_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadePlan {
    pub source_pr_id: u64,
    pub prefix: String,
    pub subname: String,
    pub steps: Vec<CascadeStep>,
}

impl CascadePlan {
    pub fn versions(&self) -> Vec<Version> {
        self.steps.iter().map(|s| s.version).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub pr_id: u64,
    pub created_at: DateTime<Utc>,
    /// version -> queue branch tip sha
    pub wavefront: std::collections::BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review(id: u64, author: &str, state: ReviewState) -> Review {
        Review { id, author: author.into(), state }
    }

    #[test]
    fn latest_review_wins_and_comments_are_skipped() {
        let pr = PullRequest {
            id: 1,
            title: "t".into(),
            author: "a".into(),
            src_branch: "bugfix/x".into(),
            dst_branch: "development/5.1".into(),
            src_commit: "deadbeef".into(),
            status: PrStatus::Open,
            description: String::new(),
            comments: vec![],
            reviews: vec![
                review(1, "alice", ReviewState::Approved),
                review(2, "alice", ReviewState::Commented),
                review(3, "bob", ReviewState::ChangesRequested),
                review(4, "bob", ReviewState::Approved),
            ],
        };
        let latest = pr.latest_reviews();
        assert_eq!(latest.len(), 2);
        assert!(latest.contains(&("alice", ReviewState::Approved)));
        assert!(latest.contains(&("bob", ReviewState::Approved)));
    }
}
