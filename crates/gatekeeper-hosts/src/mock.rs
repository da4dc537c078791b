//! In-memory `HostFacade` used by the test harness (and for local/manual
//! operation against a scripted repository): no free-form dict state, just
//! the same [`PullRequest`]/[`BuildStatus`] types the real backends
//! produce, held in a `Mutex`-guarded table.
//!
//! PR ids are assigned by this host starting at 1, never by the bot — one
//! fixed scheme, consistent across the whole test harness.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use gatekeeper_core::host::HostFacade;
use gatekeeper_core::issue::{Issue, IssueTracker};
use gatekeeper_core::types::{BuildState, BuildStatus, Comment, PrStatus, PullRequest, Review, ReviewState};

struct State {
    next_pr_id: u64,
    next_comment_id: u64,
    next_review_id: u64,
    prs: HashMap<u64, PullRequest>,
    builds: HashMap<(String, String), BuildStatus>,
}

pub struct MockHost {
    state: Mutex<State>,
    robot_username: String,
}

impl MockHost {
    pub fn new(robot_username: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(State {
                next_pr_id: 1,
                next_comment_id: 1,
                next_review_id: 1,
                prs: HashMap::new(),
                builds: HashMap::new(),
            }),
            robot_username: robot_username.into(),
        }
    }

    /// Seeds a PR directly (bypassing `create_pull_request`'s auto id),
    /// returning the assigned id. Used by tests that need a specific
    /// author/src/dst combination in place before the first gating cycle.
    pub fn seed_pull_request(
        &self,
        author: impl Into<String>,
        src_branch: impl Into<String>,
        dst_branch: impl Into<String>,
        src_commit: impl Into<String>,
    ) -> u64 {
        let mut state = self.state.lock().expect("mock host state poisoned");
        let id = state.next_pr_id;
        state.next_pr_id += 1;
        state.prs.insert(
            id,
            PullRequest {
                id,
                title: format!("seeded pr {id}"),
                author: author.into(),
                src_branch: src_branch.into(),
                dst_branch: dst_branch.into(),
                src_commit: src_commit.into(),
                status: PrStatus::Open,
                description: String::new(),
                comments: Vec::new(),
                reviews: Vec::new(),
            },
        );
        id
    }

    /// Advances a PR's observed tip, simulating a push of new commits —
    /// the monotonic src-commit change that starts a new gating cycle.
    pub fn push_commit(&self, pr_id: u64, sha: impl Into<String>) {
        let mut state = self.state.lock().expect("mock host state poisoned");
        if let Some(pr) = state.prs.get_mut(&pr_id) {
            pr.src_commit = sha.into();
        }
    }

    pub fn add_review(&self, pr_id: u64, author: impl Into<String>, review_state: ReviewState) {
        let mut state = self.state.lock().expect("mock host state poisoned");
        let id = state.next_review_id;
        state.next_review_id += 1;
        if let Some(pr) = state.prs.get_mut(&pr_id) {
            pr.reviews.push(Review { id, author: author.into(), state: review_state });
        }
    }

    /// Directly sets a build's state, bypassing the positive-only cache in
    /// `engine.rs` — used by tests to simulate CI transitions
    /// (`NOTSTARTED` -> `INPROGRESS` -> `SUCCESSFUL`/`FAILED`).
    pub fn set_commit_build(&self, sha: impl Into<String>, key: impl Into<String>, state_val: BuildState) {
        let mut state = self.state.lock().expect("mock host state poisoned");
        let sha = sha.into();
        let key = key.into();
        state.builds.insert(
            (sha.clone(), key.clone()),
            BuildStatus { key, state: state_val, url: format!("https://ci.invalid/{sha}"), description: String::new() },
        );
    }

    pub fn pull_request(&self, pr_id: u64) -> Option<PullRequest> {
        self.state.lock().expect("mock host state poisoned").prs.get(&pr_id).cloned()
    }

    pub fn all_comments(&self, pr_id: u64) -> Vec<Comment> {
        self.state
            .lock()
            .expect("mock host state poisoned")
            .prs
            .get(&pr_id)
            .map(|pr| pr.comments.clone())
            .unwrap_or_default()
    }

    /// Posts a comment attributed to an arbitrary author, unlike
    /// `HostFacade::add_comment` (always the robot) — used by tests that
    /// need a privileged human to issue a bypass command.
    pub fn add_comment_as(&self, pr_id: u64, author: impl Into<String>, body: impl Into<String>) {
        let mut state = self.state.lock().expect("mock host state poisoned");
        let id = state.next_comment_id;
        state.next_comment_id += 1;
        let comment = Comment { id, author: author.into(), body: body.into(), created_at: Utc::now() };
        if let Some(pr) = state.prs.get_mut(&pr_id) {
            pr.comments.push(comment);
        }
    }
}

#[async_trait]
impl HostFacade for MockHost {
    async fn get_pull_request(&self, id: u64) -> Result<PullRequest> {
        self.state
            .lock()
            .expect("mock host state poisoned")
            .prs
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("mock host has no pull request {id}"))
    }

    async fn find_pull_requests_by_source(&self, branch: &str) -> Result<Vec<PullRequest>> {
        Ok(self
            .state
            .lock()
            .expect("mock host state poisoned")
            .prs
            .values()
            .filter(|pr| pr.src_branch == branch)
            .cloned()
            .collect())
    }

    async fn find_open_pull_requests_by_author(&self, author: &str) -> Result<Vec<PullRequest>> {
        Ok(self
            .state
            .lock()
            .expect("mock host state poisoned")
            .prs
            .values()
            .filter(|pr| pr.author == author && pr.status == PrStatus::Open)
            .cloned()
            .collect())
    }

    async fn create_pull_request(
        &self,
        title: &str,
        src_branch: &str,
        dst_branch: &str,
        description: &str,
    ) -> Result<PullRequest> {
        let mut state = self.state.lock().expect("mock host state poisoned");
        if let Some(existing) = state.prs.values().find(|pr| pr.src_branch == src_branch && pr.dst_branch == dst_branch && pr.status == PrStatus::Open) {
            return Ok(existing.clone());
        }
        let id = state.next_pr_id;
        state.next_pr_id += 1;
        let pr = PullRequest {
            id,
            title: title.to_string(),
            author: self.robot_username.clone(),
            src_branch: src_branch.to_string(),
            dst_branch: dst_branch.to_string(),
            src_commit: String::new(),
            status: PrStatus::Open,
            description: description.to_string(),
            comments: Vec::new(),
            reviews: Vec::new(),
        };
        state.prs.insert(id, pr.clone());
        Ok(pr)
    }

    async fn add_comment(&self, pr_id: u64, body: &str) -> Result<Comment> {
        let mut state = self.state.lock().expect("mock host state poisoned");
        let id = state.next_comment_id;
        state.next_comment_id += 1;
        let comment = Comment { id, author: self.robot_username.clone(), body: body.to_string(), created_at: Utc::now() };
        let pr = state.prs.get_mut(&pr_id).ok_or_else(|| anyhow!("mock host has no pull request {pr_id}"))?;
        pr.comments.push(comment.clone());
        Ok(comment)
    }

    async fn get_build_status(&self, sha: &str, key: &str) -> Result<BuildStatus> {
        Ok(self
            .state
            .lock()
            .expect("mock host state poisoned")
            .builds
            .get(&(sha.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_else(|| BuildStatus {
                key: key.to_string(),
                state: BuildState::NotStarted,
                url: String::new(),
                description: String::new(),
            }))
    }

    async fn set_build_status(&self, sha: &str, status: &BuildStatus) -> Result<()> {
        self.state
            .lock()
            .expect("mock host state poisoned")
            .builds
            .insert((sha.to_string(), status.key.clone()), status.clone());
        Ok(())
    }

    async fn set_gate_status(&self, pr_id: u64, sha: &str, success: bool, summary: &str) -> Result<()> {
        self.set_build_status(
            sha,
            &BuildStatus {
                key: "gatekeeper".to_string(),
                state: if success { BuildState::Successful } else { BuildState::Failed },
                url: String::new(),
                description: summary.to_string(),
            },
        )
        .await?;
        let _ = pr_id;
        Ok(())
    }

    async fn merge_pull_request(&self, pr_id: u64, sha: &str) -> Result<()> {
        let mut state = self.state.lock().expect("mock host state poisoned");
        let pr = state.prs.get_mut(&pr_id).ok_or_else(|| anyhow!("mock host has no pull request {pr_id}"))?;
        pr.src_commit = sha.to_string();
        pr.status = PrStatus::Merged;
        Ok(())
    }

    async fn decline_pull_request(&self, pr_id: u64) -> Result<()> {
        let mut state = self.state.lock().expect("mock host state poisoned");
        let pr = state.prs.get_mut(&pr_id).ok_or_else(|| anyhow!("mock host has no pull request {pr_id}"))?;
        pr.status = PrStatus::Declined;
        Ok(())
    }

    async fn list_participants(&self, pr_id: u64) -> Result<Vec<String>> {
        let pr = self.get_pull_request(pr_id).await?;
        let mut participants: Vec<String> = pr.reviews.iter().map(|r| r.author.clone()).collect();
        participants.push(pr.author);
        participants.sort();
        participants.dedup();
        Ok(participants)
    }

    fn robot_username(&self) -> &str {
        &self.robot_username
    }
}

/// In-memory `IssueTracker` for the test harness: issues are seeded by key
/// rather than fetched from a real Jira instance, mirroring `MockHost`'s
/// seed-then-drive shape.
#[derive(Default)]
pub struct MockIssueTracker {
    issues: Mutex<HashMap<String, Issue>>,
}

impl MockIssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, issue: Issue) {
        self.issues.lock().expect("mock issue tracker state poisoned").insert(issue.key.clone(), issue);
    }
}

#[async_trait]
impl IssueTracker for MockIssueTracker {
    async fn get_issue(&self, key: &str) -> Result<Issue> {
        self.issues
            .lock()
            .expect("mock issue tracker state poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("mock issue tracker has no issue {key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_pull_request_is_idempotent_on_src_dst() {
        let host = MockHost::new("gatekeeper");
        let a = host.create_pull_request("t1", "w/6.0/bugfix/x", "development/6.0", "d").await.unwrap();
        let b = host.create_pull_request("t2", "w/6.0/bugfix/x", "development/6.0", "d").await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn build_status_defaults_to_not_started() {
        let host = MockHost::new("gatekeeper");
        let status = host.get_build_status("deadbeef", "ci/build").await.unwrap();
        assert_eq!(status.state, BuildState::NotStarted);
    }

    #[tokio::test]
    async fn issue_tracker_returns_seeded_issues_and_errors_on_unknown_keys() {
        let tracker = MockIssueTracker::new();
        tracker.seed(Issue {
            key: "PROJ-4".into(),
            issue_type: "Bug".into(),
            fix_versions: ["5.1".to_string()].into_iter().collect(),
        });
        let issue = tracker.get_issue("PROJ-4").await.unwrap();
        assert_eq!(issue.issue_type, "Bug");
        assert!(tracker.get_issue("PROJ-UNKNOWN").await.is_err());
    }

    #[tokio::test]
    async fn merge_sets_status_and_final_sha() {
        let host = MockHost::new("gatekeeper");
        let id = host.seed_pull_request("alice", "bugfix/x", "development/5.1", "aaa");
        host.merge_pull_request(id, "bbb").await.unwrap();
        let pr = host.pull_request(id).unwrap();
        assert_eq!(pr.status, PrStatus::Merged);
        assert_eq!(pr.src_commit, "bbb");
    }
}
