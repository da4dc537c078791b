//! Configuration. Loaded from a YAML settings file with
//! `GATEKEEPER_`-prefixed environment variable overrides, with a richer
//! nested shape (nested robot identity, user lists, per-author bypass
//! maps).

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::version::{Lattice, Version};

/// A user identified by username and/or host account id, compared by
/// account id when both sides have one, falling back to username.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub account_id: Option<String>,
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        match (&self.account_id, &other.account_id) {
            (Some(a), Some(b)) => a == b,
            _ => self.username == other.username,
        }
    }
}

impl User {
    pub fn matches(&self, name: &str) -> bool {
        self.username == name || self.account_id.as_deref() == Some(name)
    }
}

pub const BYPASS_FLAGS: &[&str] = &[
    "bypass_author_approval",
    "bypass_jira_check",
    "bypass_build_status",
    "bypass_commit_size",
    "bypass_incompatible_branch",
    "bypass_peer_approval",
    "bypass_leader_approval",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorBypass {
    pub bypass_author_approval: bool,
    pub bypass_jira_check: bool,
    pub bypass_build_status: bool,
    pub bypass_commit_size: bool,
    pub bypass_incompatible_branch: bool,
    pub bypass_peer_approval: bool,
    pub bypass_leader_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub repository_host: String,
    pub repository_owner: String,
    pub repository_slug: String,
    /// `git`-fetchable URL for the mirror clone; not one of the
    /// recognized host-API options but required to drive the repository
    /// façade.
    #[serde(default)]
    pub git_url: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// The lattice of active maintenance versions, given explicitly
    /// rather than discovered: hotfix membership is a fact about which
    /// entries here carry a patch
    /// component, never inferred from a branch name's shape.
    #[serde(default)]
    pub versions: Vec<String>,

    pub robot: User,
    pub robot_email: String,

    /// Basic-auth credentials the webhook ingress requires.
    #[serde(default)]
    pub webhook_username: String,
    #[serde(default)]
    pub webhook_password: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_build_key")]
    pub build_key: String,

    #[serde(default = "default_true")]
    pub need_author_approval: bool,
    #[serde(default)]
    pub required_leader_approvals: u32,
    #[serde(default = "default_peer_approvals")]
    pub required_peer_approvals: u32,
    #[serde(default)]
    pub pr_author_options: HashMap<String, AuthorBypass>,

    #[serde(default)]
    pub prefixes: HashMap<String, String>,
    #[serde(default)]
    pub bypass_prefixes: Vec<String>,
    #[serde(default)]
    pub disable_version_checks: bool,

    #[serde(default)]
    pub admins: Vec<User>,
    #[serde(default)]
    pub project_leaders: Vec<User>,
    #[serde(default)]
    pub tasks: Vec<String>,

    #[serde(default)]
    pub max_commit_diff: u64,

    #[serde(default = "default_true")]
    pub always_create_integration_branches: bool,
    #[serde(default = "default_true")]
    pub always_create_integration_pull_requests: bool,

    #[serde(default = "default_true")]
    pub use_queues: bool,
    #[serde(default)]
    pub skip_queue_when_possible: bool,
    #[serde(default)]
    pub disable_queues: bool,

    /// Polling interval for the `TimerJob` queue-promotion backstop.
    #[serde(default = "default_timer_interval_s")]
    pub timer_interval_s: u64,

    /// Git subprocess / host call timeout, in seconds.
    #[serde(default = "default_command_timeout_s")]
    pub command_timeout_s: u64,
}

fn default_true() -> bool {
    true
}
fn default_build_key() -> String {
    "pre-merge".to_string()
}
fn default_peer_approvals() -> u32 {
    2
}
fn default_timer_interval_s() -> u64 {
    60
}
fn default_command_timeout_s() -> u64 {
    300
}
fn default_cache_dir() -> String {
    "./gatekeeper-cache".to_string()
}
fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Settings {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut settings: Settings =
            serde_yaml::from_str(yaml).context("failed to parse settings YAML")?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file at {path}"))?;
        Self::from_yaml(&contents)
    }

    /// `GATEKEEPER_<FIELD>` environment variables override the simple
    /// string/bool/int fields.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GATEKEEPER_REPOSITORY_HOST") {
            self.repository_host = v;
        }
        if let Ok(v) = std::env::var("GATEKEEPER_REPOSITORY_OWNER") {
            self.repository_owner = v;
        }
        if let Ok(v) = std::env::var("GATEKEEPER_REPOSITORY_SLUG") {
            self.repository_slug = v;
        }
        if let Ok(v) = std::env::var("GATEKEEPER_BUILD_KEY") {
            self.build_key = v;
        }
    }

    /// Cross-field validation: leader approval requirements can never
    /// exceed peer approval requirements or the pool of registered leaders.
    fn validate(&self) -> Result<()> {
        if self.required_leader_approvals > self.required_peer_approvals {
            bail!(
                "required_peer_approvals ({}) must be equal to or exceed required_leader_approvals ({})",
                self.required_peer_approvals,
                self.required_leader_approvals
            );
        }
        if self.required_leader_approvals as usize > self.project_leaders.len() {
            bail!(
                "the number of project_leaders ({}) must be equal to or exceed required_leader_approvals ({})",
                self.project_leaders.len(),
                self.required_leader_approvals
            );
        }
        match self.repository_host.as_str() {
            "bitbucket" | "github" | "mock" => {}
            other => bail!("unknown repository_host: {other}"),
        }
        Ok(())
    }

    pub fn is_admin(&self, name: &str) -> bool {
        self.admins.iter().any(|u| u.matches(name))
    }

    pub fn is_project_leader(&self, name: &str) -> bool {
        self.project_leaders.iter().any(|u| u.matches(name))
    }

    pub fn is_privileged(&self, name: &str) -> bool {
        self.is_admin(name) || self.is_project_leader(name)
    }

    pub fn author_bypass(&self, author: &str) -> AuthorBypass {
        self.pr_author_options.get(author).cloned().unwrap_or_default()
    }

    /// Parses `versions` into the lattice the cascade and queue modules walk.
    /// Given explicitly rather than discovered from `development/*` refs, so
    /// a typo here is a config error, not a runtime surprise during a
    /// cascade.
    pub fn lattice(&self) -> Result<Lattice> {
        let parsed: Vec<Version> = self
            .versions
            .iter()
            .map(|v| Version::parse(v).ok_or_else(|| anyhow::anyhow!("invalid entry in versions: {v}")))
            .collect::<Result<_>>()?;
        Ok(Lattice::new(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
repository_host: mock
repository_owner: acme
repository_slug: widgets
robot:
  username: gatekeeper-bot
robot_email: bot@acme.test
"#;

    #[test]
    fn loads_minimal_settings_with_defaults() {
        let settings = Settings::from_yaml(MINIMAL).unwrap();
        assert_eq!(settings.build_key, "pre-merge");
        assert!(settings.need_author_approval);
        assert_eq!(settings.required_peer_approvals, 2);
        assert_eq!(settings.required_leader_approvals, 0);
    }

    #[test]
    fn rejects_leader_approvals_exceeding_peer_approvals() {
        let yaml = format!("{MINIMAL}\nrequired_leader_approvals: 3\nrequired_peer_approvals: 1\n");
        assert!(Settings::from_yaml(&yaml).is_err());
    }

    #[test]
    fn rejects_leader_approvals_exceeding_leader_count() {
        let yaml = format!("{MINIMAL}\nrequired_leader_approvals: 2\n");
        assert!(Settings::from_yaml(&yaml).is_err());
    }

    #[test]
    fn user_matches_by_account_id_over_username() {
        let u = User { username: "alice".into(), account_id: Some("abc123".into()) };
        assert!(u.matches("abc123"));
        assert!(u.matches("alice"));
        assert!(!u.matches("bob"));
    }

    #[test]
    fn lattice_parses_configured_versions() {
        let yaml = format!("{MINIMAL}\nversions: [\"5.1\", \"6.0\", \"5.1.3\"]\n");
        let settings = Settings::from_yaml(&yaml).unwrap();
        let lattice = settings.lattice().unwrap();
        assert_eq!(lattice.tip(), Some(Version::new(6, 0)));
    }

    #[test]
    fn lattice_rejects_unparseable_version_entry() {
        let yaml = format!("{MINIMAL}\nversions: [\"not-a-version\"]\n");
        let settings = Settings::from_yaml(&yaml).unwrap();
        assert!(settings.lattice().is_err());
    }
}
