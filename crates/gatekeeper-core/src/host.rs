//! Host façade: the boundary between the gate engine and a concrete
//! code-hosting API — one async trait, implemented per host in
//! `gatekeeper-hosts`.

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{BuildStatus, Comment, PullRequest};

#[async_trait]
pub trait HostFacade: Send + Sync {
    async fn get_pull_request(&self, id: u64) -> Result<PullRequest>;

    async fn find_pull_requests_by_source(&self, branch: &str) -> Result<Vec<PullRequest>>;

    async fn find_open_pull_requests_by_author(&self, author: &str) -> Result<Vec<PullRequest>>;

    async fn create_pull_request(
        &self,
        title: &str,
        src_branch: &str,
        dst_branch: &str,
        description: &str,
    ) -> Result<PullRequest>;

    async fn add_comment(&self, pr_id: u64, body: &str) -> Result<Comment>;

    async fn get_build_status(&self, sha: &str, key: &str) -> Result<BuildStatus>;

    async fn set_build_status(&self, sha: &str, status: &BuildStatus) -> Result<()>;

    /// A bot-authored check run on the source PR itself, distinct from
    /// `set_build_status` which targets the CI integration keys on the
    /// commit: the bot reports its own gating verdict as a status alongside
    /// the CI build key.
    async fn set_gate_status(&self, pr_id: u64, sha: &str, success: bool, summary: &str) -> Result<()>;

    async fn merge_pull_request(&self, pr_id: u64, sha: &str) -> Result<()>;

    async fn decline_pull_request(&self, pr_id: u64) -> Result<()>;

    /// Reviewer identities with write access, used to resolve peer vs.
    /// leader approval tallies against `Settings.project_leaders`.
    async fn list_participants(&self, pr_id: u64) -> Result<Vec<String>>;

    fn robot_username(&self) -> &str;
}
