//! Webhook ingress. Event *parsing* is the thin boundary layer the core
//! deliberately stays ignorant of — this module's only job is to pick the
//! right [`Job`] out of a host's event envelope and check the
//! `(owner, slug)` the event names against configuration before handing
//! off to the dispatcher.

use std::borrow::Cow;

use gatekeeper_core::dispatcher::Job;
use serde_json::Value;

pub enum HostName {
    Github,
    Bitbucket,
}

impl HostName {
    pub fn parse(path_segment: &str) -> Option<Self> {
        match path_segment {
            "github" => Some(Self::Github),
            "bitbucket" => Some(Self::Bitbucket),
            _ => None,
        }
    }
}

/// Outcome of looking at one webhook delivery: either a job to enqueue, or
/// a reason nothing needs to run (still a 2xx response: accepted, whether
/// enqueued or intentionally ignored).
pub enum Ingested {
    Job(Job),
    Ignored(Cow<'static, str>),
    WrongRepository,
}

fn matches_repo(value: &Value, owner_path: &[&str], slug_path: &[&str], owner: &str, slug: &str) -> bool {
    let seen_owner = dig_str(value, owner_path);
    let seen_slug = dig_str(value, slug_path);
    seen_owner.as_deref() == Some(owner) && seen_slug.as_deref() == Some(slug)
}

fn dig_str(value: &Value, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for key in path {
        cur = cur.get(key)?;
    }
    cur.as_str().map(str::to_string)
}

/// GitHub events consumed: `pull_request`
/// (opened/synchronize/reopened enqueue; closed is ignored — the host
/// naturally reflects a merge in its own state, no cascade work follows a
/// close), `issue_comment` on a PR, `pull_request_review`, `status`
/// (commit build status; `pending` is cache-only), `check_suite`
/// (`completed` only).
pub fn ingest_github(event_type: &str, body: &Value, owner: &str, slug: &str) -> Ingested {
    match event_type {
        "pull_request" => {
            if !matches_repo(body, &["repository", "owner", "login"], &["repository", "name"], owner, slug) {
                return Ingested::WrongRepository;
            }
            let action = body.get("action").and_then(Value::as_str).unwrap_or("");
            if action == "closed" {
                return Ingested::Ignored(Cow::Borrowed("pull request closed"));
            }
            let Some(number) = body.get("number").and_then(Value::as_u64) else {
                return Ingested::Ignored(Cow::Borrowed("no pull request number in payload"));
            };
            Ingested::Job(Job::PullRequestJob(number))
        }
        "issue_comment" => {
            if !matches_repo(body, &["repository", "owner", "login"], &["repository", "name"], owner, slug) {
                return Ingested::WrongRepository;
            }
            if body.get("issue").and_then(|i| i.get("pull_request")).is_none() {
                return Ingested::Ignored(Cow::Borrowed("comment is not on a pull request"));
            }
            let Some(number) = body.get("issue").and_then(|i| i.get("number")).and_then(Value::as_u64) else {
                return Ingested::Ignored(Cow::Borrowed("no issue number in payload"));
            };
            Ingested::Job(Job::PullRequestJob(number))
        }
        "pull_request_review" => {
            if !matches_repo(body, &["repository", "owner", "login"], &["repository", "name"], owner, slug) {
                return Ingested::WrongRepository;
            }
            let Some(number) = body.get("pull_request").and_then(|p| p.get("number")).and_then(Value::as_u64) else {
                return Ingested::Ignored(Cow::Borrowed("no pull request number in payload"));
            };
            Ingested::Job(Job::PullRequestJob(number))
        }
        "status" => {
            if !matches_repo(body, &["repository", "owner", "login"], &["repository", "name"], owner, slug) {
                return Ingested::WrongRepository;
            }
            let state = body.get("state").and_then(Value::as_str).unwrap_or("");
            if state == "pending" {
                return Ingested::Ignored(Cow::Borrowed("build in progress, cache-only"));
            }
            let Some(sha) = body.get("sha").and_then(Value::as_str) else {
                return Ingested::Ignored(Cow::Borrowed("no commit sha in payload"));
            };
            Ingested::Job(Job::CommitJob(sha.to_string()))
        }
        "check_suite" => {
            if !matches_repo(body, &["repository", "owner", "login"], &["repository", "name"], owner, slug) {
                return Ingested::WrongRepository;
            }
            let action = body.get("action").and_then(Value::as_str).unwrap_or("");
            if action != "completed" {
                return Ingested::Ignored(Cow::Borrowed("check suite not yet completed"));
            }
            let Some(sha) = body.get("check_suite").and_then(|c| c.get("head_sha")).and_then(Value::as_str) else {
                return Ingested::Ignored(Cow::Borrowed("no head sha in payload"));
            };
            Ingested::Job(Job::CommitJob(sha.to_string()))
        }
        other => Ingested::Ignored(Cow::Owned(format!("unhandled github event type {other}"))),
    }
}

/// Bitbucket events consumed: `pullrequest:created`/`:updated` enqueue,
/// `:fulfilled`/`:rejected` are ignored (terminal states the host already
/// reflects), `pullrequest:comment_created`, `pullrequest:approved`/
/// `:unapproved`, `repo:commit_status_created`/`:updated`.
pub fn ingest_bitbucket(event_key: &str, body: &Value, owner: &str, slug: &str) -> Ingested {
    if !matches_repo(body, &["repository", "workspace", "slug"], &["repository", "slug"], owner, slug) {
        return Ingested::WrongRepository;
    }
    match event_key {
        "pullrequest:created" | "pullrequest:updated" | "pullrequest:comment_created" | "pullrequest:approved" | "pullrequest:unapproved" => {
            let Some(id) = body.get("pullrequest").and_then(|p| p.get("id")).and_then(Value::as_u64) else {
                return Ingested::Ignored(Cow::Borrowed("no pull request id in payload"));
            };
            Ingested::Job(Job::PullRequestJob(id))
        }
        "pullrequest:fulfilled" | "pullrequest:rejected" => Ingested::Ignored(Cow::Borrowed("pull request closed")),
        "repo:commit_status_created" | "repo:commit_status_updated" => {
            let state = body
                .get("commit_status")
                .and_then(|s| s.get("state"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if state == "INPROGRESS" {
                return Ingested::Ignored(Cow::Borrowed("build in progress, cache-only"));
            }
            let Some(sha) = body.get("commit").and_then(|c| c.get("hash")).and_then(Value::as_str) else {
                return Ingested::Ignored(Cow::Borrowed("no commit hash in payload"));
            };
            Ingested::Job(Job::CommitJob(sha.to_string()))
        }
        other => Ingested::Ignored(Cow::Owned(format!("unhandled bitbucket event key {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn github_pull_request_closed_is_ignored() {
        let body = json!({
            "action": "closed",
            "number": 7,
            "repository": {"owner": {"login": "acme"}, "name": "widgets"},
        });
        assert!(matches!(ingest_github("pull_request", &body, "acme", "widgets"), Ingested::Ignored(_)));
    }

    #[test]
    fn github_pull_request_opened_enqueues_a_job() {
        let body = json!({
            "action": "opened",
            "number": 7,
            "repository": {"owner": {"login": "acme"}, "name": "widgets"},
        });
        match ingest_github("pull_request", &body, "acme", "widgets") {
            Ingested::Job(Job::PullRequestJob(id)) => assert_eq!(id, 7),
            _ => panic!("expected a pull request job"),
        }
    }

    #[test]
    fn github_status_in_progress_is_cache_only() {
        let body = json!({
            "state": "pending",
            "sha": "deadbeef",
            "repository": {"owner": {"login": "acme"}, "name": "widgets"},
        });
        assert!(matches!(ingest_github("status", &body, "acme", "widgets"), Ingested::Ignored(_)));
    }

    #[test]
    fn mismatched_repository_is_rejected() {
        let body = json!({
            "action": "opened",
            "number": 7,
            "repository": {"owner": {"login": "someoneelse"}, "name": "widgets"},
        });
        assert!(matches!(ingest_github("pull_request", &body, "acme", "widgets"), Ingested::WrongRepository));
    }

    #[test]
    fn bitbucket_comment_created_enqueues_a_job() {
        let body = json!({
            "pullrequest": {"id": 3},
            "repository": {"workspace": {"slug": "acme"}, "slug": "widgets"},
        });
        match ingest_bitbucket("pullrequest:comment_created", &body, "acme", "widgets") {
            Ingested::Job(Job::PullRequestJob(id)) => assert_eq!(id, 3),
            _ => panic!("expected a pull request job"),
        }
    }

    #[test]
    fn bitbucket_commit_status_in_progress_is_cache_only() {
        let body = json!({
            "commit_status": {"state": "INPROGRESS"},
            "commit": {"hash": "abc123"},
            "repository": {"workspace": {"slug": "acme"}, "slug": "widgets"},
        });
        assert!(matches!(
            ingest_bitbucket("repo:commit_status_updated", &body, "acme", "widgets"),
            Ingested::Ignored(_)
        ));
    }
}
