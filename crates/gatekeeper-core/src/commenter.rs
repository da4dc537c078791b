//! Idempotent commenter: renders a template for a `message_id`, prefixes it
//! with a sentinel, and posts it only if that sentinel is not already
//! present among the robot's last N comments on the pull request.
//! Templates are plain markdown with `{PLACEHOLDER}` substitution, not a
//! templating engine.

use anyhow::{bail, Result};

use crate::host::HostFacade;
use crate::types::PullRequest;

/// How many of the robot's most recent comments are scanned for a sentinel
/// before concluding a template has not yet been posted.
pub const HISTORY_SCAN_LIMIT: usize = 10;

fn template_for(message_id: &str) -> Result<&'static str> {
    Ok(match message_id {
        "invalid-branch" => include_str!("../templates/invalid-branch.md"),
        "forbidden-branch" => include_str!("../templates/forbidden-branch.md"),
        "conflict" => include_str!("../templates/conflict.md"),
        "need-approval" => include_str!("../templates/need-approval.md"),
        "issue-check-failed" => include_str!("../templates/issue-check-failed.md"),
        "build-failed" => include_str!("../templates/build-failed.md"),
        "build-not-started" => include_str!("../templates/build-not-started.md"),
        "build-in-progress" => include_str!("../templates/build-in-progress.md"),
        "commit-too-large" => include_str!("../templates/commit-too-large.md"),
        "queued" => include_str!("../templates/queued.md"),
        "merged" => include_str!("../templates/merged.md"),
        "queue-build-failed" => include_str!("../templates/queue-build-failed.md"),
        "status" => include_str!("../templates/status.md"),
        "reset-done" => include_str!("../templates/reset-done.md"),
        "waiting" => include_str!("../templates/waiting.md"),
        other => bail!("no template registered for message_id {other:?}"),
    })
}

pub fn sentinel(message_id: &str) -> String {
    format!("<!-- gatekeeper:{message_id} -->")
}

/// Substitutes every `{KEY}` occurrence in `template` with the matching
/// value from `vars`. Unmatched placeholders are left verbatim rather than
/// failing on a missing key; an unrecognized `message_id` is the only
/// failure mode, surfaced as an error rather than a panic.
pub fn render(message_id: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut body = template_for(message_id)?.to_string();
    for (key, value) in vars {
        body = body.replace(&format!("{{{key}}}"), value);
    }
    Ok(format!("{}\n{}", sentinel(message_id), body))
}

pub struct Commenter<'a> {
    host: &'a dyn HostFacade,
}

impl<'a> Commenter<'a> {
    pub fn new(host: &'a dyn HostFacade) -> Self {
        Self { host }
    }

    /// Whether `message_id`'s sentinel already appears among the robot's
    /// last [`HISTORY_SCAN_LIMIT`] comments — exposed beyond
    /// `post_idempotent` for callers that need to gate a non-comment
    /// action (e.g. a one-shot operator command) on the same history scan.
    pub(crate) fn already_posted(&self, pr: &PullRequest, message_id: &str) -> bool {
        let needle = sentinel(message_id);
        pr.comments
            .iter()
            .rev()
            .filter(|c| c.author == self.host.robot_username())
            .take(HISTORY_SCAN_LIMIT)
            .any(|c| c.body.contains(&needle))
    }

    /// Posts the rendered template unless it was already posted within the
    /// robot's last [`HISTORY_SCAN_LIMIT`] comments on this PR.
    pub async fn post_idempotent(
        &self,
        pr: &PullRequest,
        message_id: &str,
        vars: &[(&str, &str)],
    ) -> Result<bool> {
        if self.already_posted(pr, message_id) {
            return Ok(false);
        }
        let body = render(message_id, vars)?;
        self.host.add_comment(pr.id, &body).await?;
        Ok(true)
    }

    /// Renders and posts the template without deduping against history —
    /// for commands like `status` that must reply fresh on every invocation
    /// rather than once per PR lifetime.
    pub async fn post_fresh(&self, pr: &PullRequest, message_id: &str, vars: &[(&str, &str)]) -> Result<()> {
        let body = render(message_id, vars)?;
        self.host.add_comment(pr.id, &body).await?;
        Ok(())
    }

    async fn post_raw(&self, pr: &PullRequest, message_id: &str, body: &str) -> Result<()> {
        let full = format!("{}\n{}", sentinel(message_id), body);
        self.host.add_comment(pr.id, &full).await?;
        Ok(())
    }

    /// Like [`Self::post_idempotent`] but for content that isn't one of the
    /// fixed templates (e.g. one comment per configured task name). The
    /// caller picks a `message_id` unique to the dynamic content it wants
    /// deduped — callers posting several distinct pieces of raw content per
    /// PR should give each a distinct `message_id`.
    pub async fn post_idempotent_raw(&self, pr: &PullRequest, message_id: &str, body: &str) -> Result<bool> {
        if self.already_posted(pr, message_id) {
            return Ok(false);
        }
        self.post_raw(pr, message_id, body).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostFacade;
    use crate::types::{BuildStatus, Comment, PrStatus, PullRequest};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct FakeHost {
        posted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HostFacade for FakeHost {
        async fn get_pull_request(&self, _id: u64) -> Result<PullRequest> {
            unimplemented!()
        }
        async fn find_pull_requests_by_source(&self, _branch: &str) -> Result<Vec<PullRequest>> {
            unimplemented!()
        }
        async fn find_open_pull_requests_by_author(&self, _author: &str) -> Result<Vec<PullRequest>> {
            unimplemented!()
        }
        async fn create_pull_request(
            &self,
            _title: &str,
            _src: &str,
            _dst: &str,
            _desc: &str,
        ) -> Result<PullRequest> {
            unimplemented!()
        }
        async fn add_comment(&self, _pr_id: u64, body: &str) -> Result<Comment> {
            self.posted.lock().unwrap().push(body.to_string());
            Ok(Comment { id: 1, author: "gatekeeper-bot".into(), body: body.to_string(), created_at: Utc::now() })
        }
        async fn get_build_status(&self, _sha: &str, _key: &str) -> Result<BuildStatus> {
            unimplemented!()
        }
        async fn set_build_status(&self, _sha: &str, _status: &BuildStatus) -> Result<()> {
            unimplemented!()
        }
        async fn set_gate_status(&self, _pr_id: u64, _sha: &str, _success: bool, _summary: &str) -> Result<()> {
            unimplemented!()
        }
        async fn merge_pull_request(&self, _pr_id: u64, _sha: &str) -> Result<()> {
            unimplemented!()
        }
        async fn decline_pull_request(&self, _pr_id: u64) -> Result<()> {
            unimplemented!()
        }
        async fn list_participants(&self, _pr_id: u64) -> Result<Vec<String>> {
            unimplemented!()
        }
        fn robot_username(&self) -> &str {
            "gatekeeper-bot"
        }
    }

    fn pr_with_comments(comments: Vec<Comment>) -> PullRequest {
        PullRequest {
            id: 1,
            title: "t".into(),
            author: "dev".into(),
            src_branch: "bugfix/x".into(),
            dst_branch: "development/6.0".into(),
            src_commit: "deadbeef".into(),
            status: PrStatus::Open,
            description: String::new(),
            comments,
            reviews: vec![],
        }
    }

    #[tokio::test]
    async fn posts_once_then_stays_silent() {
        let host = FakeHost { posted: Mutex::new(vec![]) };
        let commenter = Commenter::new(&host);
        let mut pr = pr_with_comments(vec![]);

        let posted = commenter.post_idempotent(&pr, "conflict", &[("SOURCE", "bugfix/x"), ("TARGET", "development/6.0"), ("FILES", "a.txt")]).await.unwrap();
        assert!(posted);
        assert_eq!(host.posted.lock().unwrap().len(), 1);

        pr.comments.push(Comment {
            id: 2,
            author: "gatekeeper-bot".into(),
            body: host.posted.lock().unwrap()[0].clone(),
            created_at: Utc::now(),
        });

        let posted_again = commenter
            .post_idempotent(&pr, "conflict", &[("SOURCE", "bugfix/x"), ("TARGET", "development/6.0"), ("FILES", "a.txt")])
            .await
            .unwrap();
        assert!(!posted_again);
        assert_eq!(host.posted.lock().unwrap().len(), 1);
    }

    #[test]
    fn sentinel_is_leading_and_distinct_per_message_id() {
        let rendered = render("invalid-branch", &[("BRANCH", "weird-name")]).unwrap();
        assert!(rendered.starts_with(&sentinel("invalid-branch")));
        assert_ne!(sentinel("invalid-branch"), sentinel("conflict"));
    }

    #[test]
    fn unknown_message_id_is_an_error_not_a_panic() {
        assert!(render("not-a-real-template", &[]).is_err());
    }
}
