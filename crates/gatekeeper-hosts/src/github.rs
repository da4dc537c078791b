//! GitHub `HostFacade` implementation, calling the REST v3 API directly
//! over `reqwest`: one small request/response struct pair per endpoint, no
//! generated SDK.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use gatekeeper_core::host::HostFacade;
use gatekeeper_core::types::{BuildState, BuildStatus, Comment, PrStatus, PullRequest, Review, ReviewState};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub struct GithubHost {
    client: reqwest::Client,
    base_url: String,
    owner: String,
    repo: String,
    token: String,
    robot_username: String,
}

impl GithubHost {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, token: impl Into<String>, robot_username: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.github.com".to_string(),
            owner: owner.into(),
            repo: repo.into(),
            token: token.into(),
            robot_username: robot_username.into(),
        }
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}{}", self.base_url, self.owner, self.repo, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "gatekeeper-bot")
    }
}

#[derive(Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Deserialize)]
struct GhPullRequest {
    number: u64,
    title: String,
    user: GhUser,
    head: GhRef,
    base: GhRef,
    state: String,
    merged: bool,
    body: Option<String>,
}

#[derive(Deserialize)]
struct GhRef {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
}

#[derive(Deserialize)]
struct GhComment {
    id: u64,
    user: GhUser,
    body: String,
    created_at: chrono::DateTime<Utc>,
}

#[derive(Deserialize)]
struct GhReview {
    id: u64,
    user: GhUser,
    state: String,
}

fn map_review_state(state: &str) -> ReviewState {
    match state {
        "APPROVED" => ReviewState::Approved,
        "CHANGES_REQUESTED" => ReviewState::ChangesRequested,
        "DISMISSED" => ReviewState::Dismissed,
        _ => ReviewState::Commented,
    }
}

fn map_pr_status(gh: &GhPullRequest) -> PrStatus {
    if gh.merged {
        PrStatus::Merged
    } else if gh.state == "closed" {
        PrStatus::Declined
    } else {
        PrStatus::Open
    }
}

impl GithubHost {
    async fn hydrate(&self, gh: GhPullRequest) -> Result<PullRequest> {
        let comments: Vec<GhComment> = self
            .authed(self.client.get(self.repo_url(&format!("/issues/{}/comments", gh.number))))
            .send()
            .await
            .context("list comments")?
            .error_for_status()
            .context("list comments status")?
            .json()
            .await
            .context("parse comments")?;

        let reviews: Vec<GhReview> = self
            .authed(self.client.get(self.repo_url(&format!("/pulls/{}/reviews", gh.number))))
            .send()
            .await
            .context("list reviews")?
            .error_for_status()
            .context("list reviews status")?
            .json()
            .await
            .context("parse reviews")?;

        Ok(PullRequest {
            id: gh.number,
            title: gh.title,
            author: gh.user.login,
            src_branch: gh.head.git_ref,
            dst_branch: gh.base.git_ref,
            src_commit: gh.head.sha,
            status: map_pr_status(&gh),
            description: gh.body.unwrap_or_default(),
            comments: comments
                .into_iter()
                .map(|c| Comment { id: c.id, author: c.user.login, body: c.body, created_at: c.created_at })
                .collect(),
            reviews: reviews
                .into_iter()
                .map(|r| Review { id: r.id, author: r.user.login, state: map_review_state(&r.state) })
                .collect(),
        })
    }
}

#[async_trait]
impl HostFacade for GithubHost {
    async fn get_pull_request(&self, id: u64) -> Result<PullRequest> {
        let gh: GhPullRequest = self
            .authed(self.client.get(self.repo_url(&format!("/pulls/{id}"))))
            .send()
            .await
            .context("get pull request")?
            .error_for_status()
            .context("get pull request status")?
            .json()
            .await
            .context("parse pull request")?;
        self.hydrate(gh).await
    }

    async fn find_pull_requests_by_source(&self, branch: &str) -> Result<Vec<PullRequest>> {
        let head = format!("{}:{}", self.owner, branch);
        let list: Vec<GhPullRequest> = self
            .authed(
                self.client
                    .get(self.repo_url("/pulls"))
                    .query(&[("head", head.as_str()), ("state", "all")]),
            )
            .send()
            .await
            .context("find pull requests by source")?
            .error_for_status()
            .context("find pull requests by source status")?
            .json()
            .await
            .context("parse pull requests")?;
        let mut out = Vec::with_capacity(list.len());
        for gh in list {
            out.push(self.hydrate(gh).await?);
        }
        Ok(out)
    }

    async fn find_open_pull_requests_by_author(&self, author: &str) -> Result<Vec<PullRequest>> {
        let list: Vec<GhPullRequest> = self
            .authed(self.client.get(self.repo_url("/pulls")).query(&[("state", "open")]))
            .send()
            .await
            .context("list open pull requests")?
            .error_for_status()
            .context("list open pull requests status")?
            .json()
            .await
            .context("parse open pull requests")?;
        let mut out = Vec::new();
        for gh in list.into_iter().filter(|gh| gh.user.login == author) {
            out.push(self.hydrate(gh).await?);
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
        struct Body<'a> {
            title: &'a str,
            head: &'a str,
            base: &'a str,
            body: &'a str,
        }
        let gh: GhPullRequest = self
            .authed(self.client.post(self.repo_url("/pulls")).json(&Body {
                title,
                head: src_branch,
                base: dst_branch,
                body: description,
            }))
            .send()
            .await
            .context("create pull request")?
            .error_for_status()
            .context("create pull request status")?
            .json()
            .await
            .context("parse created pull request")?;
        self.hydrate(gh).await
    }

    async fn add_comment(&self, pr_id: u64, body: &str) -> Result<Comment> {
        #[derive(Serialize)]
        struct Body<'a> {
            body: &'a str,
        }
        let comment: GhComment = self
            .authed(
                self.client
                    .post(self.repo_url(&format!("/issues/{pr_id}/comments")))
                    .json(&Body { body }),
            )
            .send()
            .await
            .context("add comment")?
            .error_for_status()
            .context("add comment status")?
            .json()
            .await
            .context("parse created comment")?;
        Ok(Comment { id: comment.id, author: comment.user.login, body: comment.body, created_at: comment.created_at })
    }

    async fn get_build_status(&self, sha: &str, key: &str) -> Result<BuildStatus> {
        #[derive(Deserialize)]
        struct Statuses {
            statuses: Vec<GhStatus>,
        }
        #[derive(Deserialize)]
        struct GhStatus {
            context: String,
            state: String,
            target_url: Option<String>,
            description: Option<String>,
        }
        let combined: Statuses = self
            .authed(self.client.get(self.repo_url(&format!("/commits/{sha}/status"))))
            .send()
            .await
            .context("get combined status")?
            .error_for_status()
            .context("get combined status http status")?
            .json()
            .await
            .context("parse combined status")?;
        let matching = combined.statuses.into_iter().find(|s| s.context == key);
        let Some(status) = matching else {
            return Ok(BuildStatus {
                key: key.to_string(),
                state: BuildState::NotStarted,
                url: String::new(),
                description: String::new(),
            });
        };
        let state = match status.state.as_str() {
            "success" => BuildState::Successful,
            "pending" => BuildState::InProgress,
            "failure" => BuildState::Failed,
            "error" => BuildState::Stopped,
            _ => BuildState::NotStarted,
        };
        Ok(BuildStatus {
            key: status.context,
            state,
            url: status.target_url.unwrap_or_default(),
            description: status.description.unwrap_or_default(),
        })
    }

    async fn set_build_status(&self, sha: &str, status: &BuildStatus) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            context: &'a str,
            state: &'a str,
            target_url: &'a str,
            description: &'a str,
        }
        let state = match status.state {
            BuildState::Successful => "success",
            BuildState::InProgress | BuildState::NotStarted => "pending",
            BuildState::Failed => "failure",
            BuildState::Stopped => "error",
        };
        self.authed(self.client.post(self.repo_url(&format!("/statuses/{sha}"))).json(&Body {
            context: &status.key,
            state,
            target_url: &status.url,
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
            sha: &'a str,
            merge_method: &'a str,
        }
        let response = self
            .authed(
                self.client
                    .put(self.repo_url(&format!("/pulls/{pr_id}/merge")))
                    .json(&Body { sha, merge_method: "merge" }),
            )
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
        #[derive(Serialize)]
        struct Body<'a> {
            state: &'a str,
        }
        self.authed(self.client.patch(self.repo_url(&format!("/pulls/{pr_id}"))).json(&Body { state: "closed" }))
            .send()
            .await
            .context("decline pull request")?
            .error_for_status()
            .context("decline pull request status")?;
        Ok(())
    }

    async fn list_participants(&self, pr_id: u64) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Reviewer {
            login: String,
        }
        #[derive(Deserialize)]
        struct Requested {
            users: Vec<Reviewer>,
        }
        let pr = self.get_pull_request(pr_id).await?;
        let mut participants: Vec<String> = pr.reviews.iter().map(|r| r.author.clone()).collect();
        participants.push(pr.author);

        match self
            .authed(self.client.get(self.repo_url(&format!("/pulls/{pr_id}/requested_reviewers"))))
            .send()
            .await
        {
            Ok(response) => match response.json::<Requested>().await {
                Ok(requested) => participants.extend(requested.users.into_iter().map(|r| r.login)),
                Err(e) => warn!(error = %e, "failed to parse requested reviewers"),
            },
            Err(e) => warn!(error = %e, "failed to fetch requested reviewers"),
        }

        participants.sort();
        participants.dedup();
        Ok(participants)
    }

    fn robot_username(&self) -> &str {
        &self.robot_username
    }
}
