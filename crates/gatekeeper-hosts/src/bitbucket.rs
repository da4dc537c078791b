//! Bitbucket Cloud `HostFacade` implementation, calling the v2.0 REST API
//! the same way `github.rs` calls the v3 API: one small request/response
//! struct pair per endpoint, no generated SDK.
//!
//! Bitbucket's own vocabulary differs from GitHub's in three places worth
//! calling out: participant "approved" flags live on the PR payload itself
//! rather than on a separate reviews list, declined PRs are `DECLINED` (not
//! `closed`), and build statuses are reported against a commit by `key`
//! under `/commitstatuses` rather than `/statuses`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use gatekeeper_core::host::HostFacade;
use gatekeeper_core::types::{BuildState, BuildStatus, Comment, PrStatus, PullRequest, Review, ReviewState};
use serde::{Deserialize, Serialize};

pub struct BitbucketHost {
    client: reqwest::Client,
    base_url: String,
    owner: String,
    repo: String,
    username: String,
    app_password: String,
    robot_username: String,
}

impl BitbucketHost {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        username: impl Into<String>,
        app_password: impl Into<String>,
        robot_username: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.bitbucket.org/2.0".to_string(),
            owner: owner.into(),
            repo: repo.into(),
            username: username.into(),
            app_password: app_password.into(),
            robot_username: robot_username.into(),
        }
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repositories/{}/{}{}", self.base_url, self.owner, self.repo, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.basic_auth(&self.username, Some(&self.app_password))
    }
}

#[derive(Deserialize)]
struct BbAccount {
    #[serde(alias = "nickname", alias = "username")]
    display_name: String,
}

#[derive(Deserialize)]
struct BbBranchRef {
    branch: BbBranchName,
    commit: BbCommit,
}

#[derive(Deserialize)]
struct BbBranchName {
    name: String,
}

#[derive(Deserialize)]
struct BbCommit {
    hash: String,
}

#[derive(Deserialize)]
struct BbParticipant {
    user: BbAccount,
    approved: bool,
    role: String,
}

#[derive(Deserialize)]
struct BbPullRequest {
    id: u64,
    title: String,
    author: BbAccount,
    source: BbBranchRef,
    destination: BbBranchRef,
    state: String,
    description: Option<String>,
    #[serde(default)]
    participants: Vec<BbParticipant>,
}

#[derive(Deserialize)]
struct BbComment {
    id: u64,
    user: BbAccount,
    content: BbContent,
    created_on: chrono::DateTime<Utc>,
}

#[derive(Deserialize)]
struct BbContent {
    raw: String,
}

#[derive(Deserialize)]
struct Paginated<T> {
    values: Vec<T>,
}

fn map_pr_status(state: &str) -> PrStatus {
    match state {
        "MERGED" => PrStatus::Merged,
        "DECLINED" => PrStatus::Declined,
        _ => PrStatus::Open,
    }
}

/// Bitbucket's participant model carries an `approved: bool` flag rather
/// than a review-state enum; a participant with `approved=false` and
/// `role=REVIEWER` is mapped to [`ReviewState::Commented`] so gating's
/// last-non-COMMENTED-wins logic treats a withdrawn approval as "no verdict
/// yet" rather than as a rejection.
fn map_participant(p: &BbParticipant) -> Option<Review> {
    if p.role != "REVIEWER" && p.role != "PARTICIPANT" {
        return None;
    }
    let state = if p.approved { ReviewState::Approved } else { ReviewState::Commented };
    Some(Review { id: 0, author: p.user.display_name.clone(), state })
}

impl BitbucketHost {
    async fn hydrate(&self, bb: BbPullRequest) -> Result<PullRequest> {
        let comments: Paginated<BbComment> = self
            .authed(self.client.get(self.repo_url(&format!("/pullrequests/{}/comments", bb.id))))
            .send()
            .await
            .context("list comments")?
            .error_for_status()
            .context("list comments status")?
            .json()
            .await
            .context("parse comments")?;

        let mut reviews: Vec<Review> = bb.participants.iter().filter_map(map_participant).collect();
        for (idx, review) in reviews.iter_mut().enumerate() {
            // Bitbucket participants carry no ordering id; assign one by
            // array position so `latest_reviews`' ascending sort is stable
            // (a participant's approval toggle always replaces its own
            // earlier entry, never another reviewer's).
            review.id = idx as u64;
        }

        Ok(PullRequest {
            id: bb.id,
            title: bb.title,
            author: bb.author.display_name,
            src_branch: bb.source.branch.name,
            dst_branch: bb.destination.branch.name,
            src_commit: bb.source.commit.hash,
            status: map_pr_status(&bb.state),
            description: bb.description.unwrap_or_default(),
            comments: comments
                .values
                .into_iter()
                .map(|c| Comment { id: c.id, author: c.user.display_name, body: c.content.raw, created_at: c.created_on })
                .collect(),
            reviews,
        })
    }
}

#[async_trait]
impl HostFacade for BitbucketHost {
    async fn get_pull_request(&self, id: u64) -> Result<PullRequest> {
        let bb: BbPullRequest = self
            .authed(self.client.get(self.repo_url(&format!("/pullrequests/{id}"))))
            .send()
            .await
            .context("get pull request")?
            .error_for_status()
            .context("get pull request status")?
            .json()
            .await
            .context("parse pull request")?;
        self.hydrate(bb).await
    }

    async fn find_pull_requests_by_source(&self, branch: &str) -> Result<Vec<PullRequest>> {
        let q = format!("source.branch.name=\"{branch}\"");
        let list: Paginated<BbPullRequest> = self
            .authed(self.client.get(self.repo_url("/pullrequests")).query(&[("q", q.as_str()), ("state", "ALL")]))
            .send()
            .await
            .context("find pull requests by source")?
            .error_for_status()
            .context("find pull requests by source status")?
            .json()
            .await
            .context("parse pull requests")?;
        let mut out = Vec::with_capacity(list.values.len());
        for bb in list.values {
            out.push(self.hydrate(bb).await?);
        }
        Ok(out)
    }

    async fn find_open_pull_requests_by_author(&self, author: &str) -> Result<Vec<PullRequest>> {
        let q = format!("author.username=\"{author}\"");
        let list: Paginated<BbPullRequest> = self
            .authed(self.client.get(self.repo_url("/pullrequests")).query(&[("q", q.as_str()), ("state", "OPEN")]))
            .send()
            .await
            .context("list open pull requests")?
            .error_for_status()
            .context("list open pull requests status")?
            .json()
            .await
            .context("parse open pull requests")?;
        let mut out = Vec::with_capacity(list.values.len());
        for bb in list.values {
            out.push(self.hydrate(bb).await?);
        }
        Ok(out)
    }

    async fn create_pull_request(
        &self,
        title: &str,
        src_branch: &str,
        dst_branch: &str,
        description: &str,
    ) -> Result<PullRequest> {
        #[derive(Serialize)]
        struct NameRef<'a> {
            name: &'a str,
        }
        #[derive(Serialize)]
        struct BranchRef<'a> {
            branch: NameRef<'a>,
        }
        #[derive(Serialize)]
        struct Body<'a> {
            title: &'a str,
            source: BranchRef<'a>,
            destination: BranchRef<'a>,
            description: &'a str,
            close_source_branch: bool,
        }
        let bb: BbPullRequest = self
            .authed(self.client.post(self.repo_url("/pullrequests")).json(&Body {
                title,
                source: BranchRef { branch: NameRef { name: src_branch } },
                destination: BranchRef { branch: NameRef { name: dst_branch } },
                description,
                close_source_branch: false,
            }))
            .send()
            .await
            .context("create pull request")?
            .error_for_status()
            .context("create pull request status")?
            .json()
            .await
            .context("parse created pull request")?;
        self.hydrate(bb).await
    }

    async fn add_comment(&self, pr_id: u64, body: &str) -> Result<Comment> {
        #[derive(Serialize)]
        struct Content<'a> {
            raw: &'a str,
        }
        #[derive(Serialize)]
        struct Body<'a> {
            content: Content<'a>,
        }
        let comment: BbComment = self
            .authed(
                self.client
                    .post(self.repo_url(&format!("/pullrequests/{pr_id}/comments")))
                    .json(&Body { content: Content { raw: body } }),
            )
            .send()
            .await
            .context("add comment")?
            .error_for_status()
            .context("add comment status")?
            .json()
            .await
            .context("parse created comment")?;
        Ok(Comment { id: comment.id, author: comment.user.display_name, body: comment.content.raw, created_at: comment.created_on })
    }

    async fn get_build_status(&self, sha: &str, key: &str) -> Result<BuildStatus> {
        #[derive(Deserialize)]
        struct BbStatus {
            key: String,
            state: String,
            url: Option<String>,
            description: Option<String>,
        }
        let statuses: Paginated<BbStatus> = self
            .authed(self.client.get(self.repo_url(&format!("/commit/{sha}/statuses"))))
            .send()
            .await
            .context("get commit statuses")?
            .error_for_status()
            .context("get commit statuses http status")?
            .json()
            .await
            .context("parse commit statuses")?;
        let Some(status) = statuses.values.into_iter().find(|s| s.key == key) else {
            return Ok(BuildStatus { key: key.to_string(), state: BuildState::NotStarted, url: String::new(), description: String::new() });
        };
        let state = match status.state.as_str() {
            "SUCCESSFUL" => BuildState::Successful,
            "INPROGRESS" => BuildState::InProgress,
            "FAILED" => BuildState::Failed,
            "STOPPED" => BuildState::Stopped,
            _ => BuildState::NotStarted,
        };
        Ok(BuildStatus { key: status.key, state, url: status.url.unwrap_or_default(), description: status.description.unwrap_or_default() })
    }

    async fn set_build_status(&self, sha: &str, status: &BuildStatus) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            key: &'a str,
            state: &'a str,
            url: &'a str,
            description: &'a str,
        }
        let state = match status.state {
            BuildState::Successful => "SUCCESSFUL",
            BuildState::InProgress | BuildState::NotStarted => "INPROGRESS",
            BuildState::Failed => "FAILED",
            BuildState::Stopped => "STOPPED",
        };
        let url = if status.url.is_empty() { "https://example.invalid/build" } else { status.url.as_str() };
        self.authed(self.client.post(self.repo_url(&format!("/commit/{sha}/statuses/build"))).json(&Body {
            key: &status.key,
            state,
            url,
            description: &status.description,
        }))
        .send()
        .await
        .context("set build status")?
        .error_for_status()
        .context("set build status http status")?;
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
        .await
        .with_context(|| format!("set gate status for pull request {pr_id}"))
    }

    async fn merge_pull_request(&self, pr_id: u64, sha: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            merge_strategy: &'a str,
        }
        let response = self
            .authed(self.client.post(self.repo_url(&format!("/pullrequests/{pr_id}/merge"))).json(&Body {
                merge_strategy: "merge_commit",
            }))
            .send()
            .await
            .context("merge pull request")?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("merge of pull request {pr_id} at {sha} failed: {text}");
        }
        Ok(())
    }

    async fn decline_pull_request(&self, pr_id: u64) -> Result<()> {
        self.authed(self.client.post(self.repo_url(&format!("/pullrequests/{pr_id}/decline"))))
            .send()
            .await
            .context("decline pull request")?
            .error_for_status()
            .context("decline pull request status")?;
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
