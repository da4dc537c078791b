//! Jira `IssueTracker` implementation, calling the REST v2 API over
//! `reqwest` in the same one-small-struct-per-endpoint idiom as
//! `github.rs`/`bitbucket.rs`.

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use gatekeeper_core::issue::{Issue, IssueTracker};
use serde::Deserialize;

pub struct JiraTracker {
    client: reqwest::Client,
    base_url: String,
    username: String,
    api_token: String,
}

impl JiraTracker {
    pub fn new(base_url: impl Into<String>, username: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            username: username.into(),
            api_token: api_token.into(),
        }
    }
}

#[derive(Deserialize)]
struct JiraIssue {
    key: String,
    fields: JiraFields,
}

#[derive(Deserialize)]
struct JiraFields {
    issuetype: JiraIssueType,
    #[serde(rename = "fixVersions", default)]
    fix_versions: Vec<JiraVersion>,
}

#[derive(Deserialize)]
struct JiraIssueType {
    name: String,
}

#[derive(Deserialize)]
struct JiraVersion {
    name: String,
}

#[async_trait]
impl IssueTracker for JiraTracker {
    async fn get_issue(&self, key: &str) -> Result<Issue> {
        let url = format!("{}/rest/api/2/issue/{key}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.api_token))
            .send()
            .await
            .with_context(|| format!("fetching jira issue {key}"))?
            .error_for_status()
            .with_context(|| format!("jira returned an error status for issue {key}"))?;
        let issue: JiraIssue = resp.json().await.context("decoding jira issue response")?;
        let fix_versions: HashSet<String> = issue.fields.fix_versions.into_iter().map(|v| v.name).collect();
        Ok(Issue { key: issue.key, issue_type: issue.fields.issuetype.name, fix_versions })
    }
}
