//! Gating state machine: the admission predicate a pull request must
//! satisfy before it can enter the merge queue, plus parsing of the
//! command comments that bypass individual clauses.

use std::collections::HashSet;

use regex::Regex;
use once_cell::sync::Lazy;

use crate::branch::{self, BranchKind, ChangePrefix};
use crate::config::{AuthorBypass, Settings};
use crate::errors::{GateError, GateResult, UserError};
use crate::issue::IssueTracker;
use crate::types::{BuildState, BuildStatus, PullRequest, ReviewState};
use crate::version::Version;

/// Bypass/control commands recognized in a comment addressed to the robot,
/// e.g. `@gatekeeper-bot bypass_peer_approval`, following the
/// `@<robot> <command>` comment-command convention.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSet {
    pub bypass: AuthorBypass,
    pub status: bool,
    pub wait: bool,
    pub unanimity: bool,
    pub reset: bool,
    pub force_reset: bool,
    pub build: bool,
    pub clear: bool,
}

static MENTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^@([\w.\-]+)\s+(.+)$").unwrap());
static ISSUE_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z][A-Z0-9]+-\d+\b").unwrap());

/// Scans every comment addressed to `robot_username` (`@robot <command>` as
/// the first token(s) of a line) and folds recognized commands into a
/// [`CommandSet`]. Unrecognized commands are silently ignored. Only
/// comments from an admin or project leader can mutate gating options —
/// command comments are honored only from a privileged commenter;
/// everyone else's mentions are parsed for nothing.
pub fn parse_commands(pr: &PullRequest, robot_username: &str, settings: &Settings) -> CommandSet {
    let mut commands = CommandSet::default();
    for comment in &pr.comments {
        if !settings.is_privileged(&comment.author) {
            continue;
        }
        for caps in MENTION_RE.captures_iter(&comment.body) {
            if &caps[1] != robot_username {
                continue;
            }
            for token in caps[2].split_whitespace() {
                apply_command(&mut commands, token);
            }
        }
    }
    commands
}

fn apply_command(commands: &mut CommandSet, token: &str) {
    match token {
        "bypass_author_approval" => commands.bypass.bypass_author_approval = true,
        "bypass_jira_check" => commands.bypass.bypass_jira_check = true,
        "bypass_build_status" => commands.bypass.bypass_build_status = true,
        "bypass_commit_size" => commands.bypass.bypass_commit_size = true,
        "bypass_incompatible_branch" => commands.bypass.bypass_incompatible_branch = true,
        "bypass_peer_approval" => commands.bypass.bypass_peer_approval = true,
        "bypass_leader_approval" => commands.bypass.bypass_leader_approval = true,
        "status" => commands.status = true,
        "wait" => commands.wait = true,
        "unanimity" => commands.unanimity = true,
        "reset" => commands.reset = true,
        "force_reset" => commands.force_reset = true,
        "build" => commands.build = true,
        "clear" => commands.clear = true,
        _ => {}
    }
}

/// Per-clause bypass flags in effect for this cycle: the union of the
/// author's standing `pr_author_options` entry and any command posted on
/// the PR itself.
pub fn effective_bypass(settings: &Settings, pr: &PullRequest, commands: &CommandSet) -> AuthorBypass {
    let standing = settings.author_bypass(&pr.author);
    AuthorBypass {
        bypass_author_approval: standing.bypass_author_approval || commands.bypass.bypass_author_approval,
        bypass_jira_check: standing.bypass_jira_check || commands.bypass.bypass_jira_check,
        bypass_build_status: standing.bypass_build_status || commands.bypass.bypass_build_status,
        bypass_commit_size: standing.bypass_commit_size || commands.bypass.bypass_commit_size,
        bypass_incompatible_branch: standing.bypass_incompatible_branch
            || commands.bypass.bypass_incompatible_branch,
        bypass_peer_approval: standing.bypass_peer_approval || commands.bypass.bypass_peer_approval,
        bypass_leader_approval: standing.bypass_leader_approval || commands.bypass.bypass_leader_approval,
    }
}

/// Branch-grammar and prefix-admission check: the source branch must
/// parse as a `Change` branch, and its prefix must be allowed into the
/// destination line.
pub fn check_branches(pr: &PullRequest, dst_is_tip: bool) -> GateResult<(ChangePrefix, String)> {
    let kind = branch::parse(&pr.src_branch);
    let prefix = match kind {
        BranchKind::Change { prefix, subname } => {
            if !branch::admits(prefix, dst_is_tip) {
                return Err(UserError::BranchDoesNotAcceptFeatures(pr.dst_branch.clone()).into());
            }
            (prefix, subname)
        }
        _ => return Err(UserError::BranchNameInvalid(pr.src_branch.clone()).into()),
    };
    Ok(prefix)
}

/// Issue-tracker check: extracts `PROJ-NNNN` from the source
/// branch's subname. Absent a key, the check passes iff the destination is
/// the lattice tip (no maintenance propagation is expected, so there is
/// nothing to check fix-versions against). Otherwise the issue is fetched
/// and two facts are enforced against it:
/// - its tracker-reported type maps (via `settings.prefixes`) to the same
///   prefix the branch itself carries, when the table has an entry for that
///   type;
/// - its fix-versions set equals the cascade's version set, unless
///   `disable_version_checks` or the tracker reports no fix-versions at all
///   (the latter covers a tracker integration that doesn't carry the field,
///   rather than forcing every deployment to populate it).
///
/// `bypass_prefixes` (settings) and the per-cycle `bypass_jira_check`
/// command skip the whole check, key extraction included.
pub async fn check_issue(
    subname: &str,
    prefix: ChangePrefix,
    dst_is_tip: bool,
    cascade_versions: &[Version],
    settings: &Settings,
    bypass: &AuthorBypass,
    tracker: &dyn IssueTracker,
) -> GateResult<()> {
    if bypass.bypass_jira_check || settings.bypass_prefixes.iter().any(|p| p == prefix.as_str()) {
        return Ok(());
    }

    let Some(key) = ISSUE_KEY_RE.find(subname).map(|m| m.as_str().to_string()) else {
        return if dst_is_tip {
            Ok(())
        } else {
            Err(UserError::IssueCheckFailed(format!(
                "no issue key found in branch subname `{subname}`, and destination is not the lattice tip"
            ))
            .into())
        };
    };

    let issue = tracker.get_issue(&key).await.map_err(GateError::transient_host)?;

    if let Some(expected_prefix) = settings.prefixes.get(&issue.issue_type) {
        if expected_prefix != prefix.as_str() {
            return Err(UserError::IssueCheckFailed(format!(
                "issue {key} has type `{}` (maps to prefix `{expected_prefix}`), but the branch prefix is `{}`",
                issue.issue_type,
                prefix.as_str()
            ))
            .into());
        }
    }

    if !settings.disable_version_checks && !issue.fix_versions.is_empty() {
        let expected: HashSet<String> = cascade_versions.iter().map(Version::to_string).collect();
        if issue.fix_versions != expected {
            let mut actual: Vec<&String> = issue.fix_versions.iter().collect();
            actual.sort();
            let mut wanted: Vec<&String> = expected.iter().collect();
            wanted.sort();
            return Err(UserError::IssueCheckFailed(format!(
                "issue {key} fix-versions {{{}}} do not match the expected cascade {{{}}}",
                actual.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
                wanted.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
            ))
            .into());
        }
    }

    Ok(())
}

/// Approval tally: author approval (unless bypassed or
/// self-approval is disallowed), N peer approvals, and M leader approvals
/// among `settings.project_leaders`. `unanimity` temporarily requires every
/// current participant to have approved.
pub fn check_approvals(
    pr: &PullRequest,
    settings: &Settings,
    bypass: &AuthorBypass,
    participants: &[String],
    commands: &CommandSet,
) -> GateResult<()> {
    let latest = pr.latest_reviews();
    let approved: HashSet<&str> =
        latest.iter().filter(|(_, s)| *s == ReviewState::Approved).map(|(a, _)| *a).collect();

    if settings.need_author_approval && !bypass.bypass_author_approval && !approved.contains(pr.author.as_str()) {
        return Err(UserError::NeedAuthorApproval.into());
    }

    if commands.unanimity {
        let missing = participants.iter().filter(|p| !approved.contains(p.as_str())).count();
        if missing > 0 {
            return Err(UserError::NeedPeerApproval { needed: missing as u32 }.into());
        }
        return Ok(());
    }

    if !bypass.bypass_peer_approval {
        let peer_count = approved.iter().filter(|a| **a != pr.author).count() as u32;
        if peer_count < settings.required_peer_approvals {
            return Err(UserError::NeedPeerApproval {
                needed: settings.required_peer_approvals - peer_count,
            }
            .into());
        }
    }

    if !bypass.bypass_leader_approval && settings.required_leader_approvals > 0 {
        let leader_count =
            approved.iter().filter(|a| settings.is_project_leader(a)).count() as u32;
        if leader_count < settings.required_leader_approvals {
            return Err(UserError::NeedLeaderApproval {
                needed: settings.required_leader_approvals - leader_count,
            }
            .into());
        }
    }

    Ok(())
}

/// Build-status check: the source PR's build and every
/// child integration PR's build must report `Successful`.
pub fn check_build_statuses(
    statuses: &[(&str, BuildStatus)],
    bypass: &AuthorBypass,
) -> GateResult<()> {
    if bypass.bypass_build_status {
        return Ok(());
    }
    for (label, status) in statuses {
        match status.state {
            BuildState::Successful => {}
            BuildState::NotStarted => {
                return Err(UserError::BuildNotStarted((*label).to_string()).into())
            }
            BuildState::InProgress => {
                return Err(UserError::BuildInProgress((*label).to_string()).into())
            }
            BuildState::Failed | BuildState::Stopped => {
                return Err(UserError::BuildFailed((*label).to_string()).into())
            }
        }
    }
    Ok(())
}

/// Diff-size cap. `0` disables the check.
pub fn check_diff_size(diff_size: u64, settings: &Settings, bypass: &AuthorBypass) -> GateResult<()> {
    if bypass.bypass_commit_size || settings.max_commit_diff == 0 {
        return Ok(());
    }
    if diff_size > settings.max_commit_diff {
        return Err(UserError::CommitTooLarge { actual: diff_size, max: settings.max_commit_diff }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Comment, PrStatus, Review};
    use chrono::Utc;

    fn base_pr() -> PullRequest {
        PullRequest {
            id: 1,
            title: "PROJ-42 fix the thing".into(),
            author: "dev".into(),
            src_branch: "bugfix/PROJ-42".into(),
            dst_branch: "development/6.0".into(),
            src_commit: "deadbeef".into(),
            status: PrStatus::Open,
            description: String::new(),
            comments: vec![],
            reviews: vec![],
        }
    }

    fn settings_with_admin(name: &str) -> crate::config::Settings {
        let yaml = format!(
            "repository_host: mock\nrepository_owner: a\nrepository_slug: b\nrobot:\n  username: gatekeeper-bot\nrobot_email: x@y\nadmins:\n  - username: {name}\n"
        );
        crate::config::Settings::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn parses_bot_mention_commands_from_privileged_commenter() {
        let mut pr = base_pr();
        pr.comments.push(Comment {
            id: 1,
            author: "admin".into(),
            body: "@gatekeeper-bot bypass_peer_approval\nsome other text".into(),
            created_at: Utc::now(),
        });
        let settings = settings_with_admin("admin");
        let commands = parse_commands(&pr, "gatekeeper-bot", &settings);
        assert!(commands.bypass.bypass_peer_approval);
        assert!(!commands.bypass.bypass_leader_approval);
    }

    #[test]
    fn ignores_mentions_of_other_users() {
        let mut pr = base_pr();
        pr.comments.push(Comment {
            id: 1,
            author: "dev".into(),
            body: "@someone-else bypass_peer_approval".into(),
            created_at: Utc::now(),
        });
        let settings = settings_with_admin("dev");
        let commands = parse_commands(&pr, "gatekeeper-bot", &settings);
        assert!(!commands.bypass.bypass_peer_approval);
    }

    #[test]
    fn ignores_commands_from_non_privileged_commenter() {
        let mut pr = base_pr();
        pr.comments.push(Comment {
            id: 1,
            author: "dev".into(),
            body: "@gatekeeper-bot bypass_peer_approval".into(),
            created_at: Utc::now(),
        });
        let settings = settings_with_admin("someone-else");
        let commands = parse_commands(&pr, "gatekeeper-bot", &settings);
        assert!(!commands.bypass.bypass_peer_approval);
    }

    #[test]
    fn feature_branch_forbidden_into_non_tip() {
        let mut pr = base_pr();
        pr.src_branch = "feature/new-thing".into();
        let err = check_branches(&pr, false).unwrap_err();
        assert!(matches!(err, crate::errors::GateError::User(UserError::BranchDoesNotAcceptFeatures(_))));
    }

    struct StubTracker(crate::issue::Issue);

    #[async_trait::async_trait]
    impl IssueTracker for StubTracker {
        async fn get_issue(&self, _key: &str) -> anyhow::Result<crate::issue::Issue> {
            Ok(self.0.clone())
        }
    }

    fn minimal_settings() -> crate::config::Settings {
        crate::config::Settings::from_yaml(
            "repository_host: mock\nrepository_owner: a\nrepository_slug: b\nrobot:\n  username: gatekeeper-bot\nrobot_email: x@y\n",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn issue_check_passes_with_key_in_subname_and_no_tracker_configured() {
        let settings = minimal_settings();
        let tracker = crate::issue::NullIssueTracker;
        let versions = [Version::new(5, 1), Version::new(6, 0)];
        assert!(check_issue(
            "PROJ-42",
            ChangePrefix::Bugfix,
            false,
            &versions,
            &settings,
            &AuthorBypass::default(),
            &tracker,
        )
        .await
        .is_ok());
    }

    #[tokio::test]
    async fn issue_check_fails_without_key_off_the_lattice_tip() {
        let settings = minimal_settings();
        let tracker = crate::issue::NullIssueTracker;
        let versions = [Version::new(5, 1), Version::new(6, 0)];
        assert!(check_issue(
            "no-key-here",
            ChangePrefix::Bugfix,
            false,
            &versions,
            &settings,
            &AuthorBypass::default(),
            &tracker,
        )
        .await
        .is_err());
    }

    #[tokio::test]
    async fn issue_check_passes_without_key_at_the_lattice_tip() {
        let settings = minimal_settings();
        let tracker = crate::issue::NullIssueTracker;
        assert!(check_issue(
            "no-key-here",
            ChangePrefix::Bugfix,
            true,
            &[Version::new(6, 0)],
            &settings,
            &AuthorBypass::default(),
            &tracker,
        )
        .await
        .is_ok());
    }

    #[tokio::test]
    async fn issue_check_fails_on_fix_version_mismatch() {
        let settings = minimal_settings();
        let tracker = StubTracker(crate::issue::Issue {
            key: "PROJ-4".into(),
            issue_type: String::new(),
            fix_versions: ["5.1".to_string()].into_iter().collect(),
        });
        let versions = [Version::new(5, 1), Version::new(6, 0)];
        let err = check_issue(
            "PROJ-4",
            ChangePrefix::Bugfix,
            false,
            &versions,
            &settings,
            &AuthorBypass::default(),
            &tracker,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, crate::errors::GateError::User(UserError::IssueCheckFailed(_))));
    }

    #[tokio::test]
    async fn issue_check_passes_when_disable_version_checks_is_set() {
        let yaml = "repository_host: mock\nrepository_owner: a\nrepository_slug: b\nrobot:\n  username: gatekeeper-bot\nrobot_email: x@y\ndisable_version_checks: true\n";
        let settings = crate::config::Settings::from_yaml(yaml).unwrap();
        let tracker = StubTracker(crate::issue::Issue {
            key: "PROJ-4".into(),
            issue_type: String::new(),
            fix_versions: ["5.1".to_string()].into_iter().collect(),
        });
        let versions = [Version::new(5, 1), Version::new(6, 0)];
        assert!(check_issue(
            "PROJ-4",
            ChangePrefix::Bugfix,
            false,
            &versions,
            &settings,
            &AuthorBypass::default(),
            &tracker,
        )
        .await
        .is_ok());
    }

    #[tokio::test]
    async fn issue_check_fails_on_issue_type_prefix_mismatch() {
        let yaml = "repository_host: mock\nrepository_owner: a\nrepository_slug: b\nrobot:\n  username: gatekeeper-bot\nrobot_email: x@y\nprefixes:\n  Bug: bugfix\n  Story: feature\n";
        let settings = crate::config::Settings::from_yaml(yaml).unwrap();
        let tracker = StubTracker(crate::issue::Issue {
            key: "PROJ-9".into(),
            issue_type: "Story".into(),
            fix_versions: HashSet::new(),
        });
        let versions = [Version::new(5, 1)];
        let err = check_issue(
            "PROJ-9",
            ChangePrefix::Bugfix,
            true,
            &versions,
            &settings,
            &AuthorBypass::default(),
            &tracker,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, crate::errors::GateError::User(UserError::IssueCheckFailed(_))));
    }

    #[test]
    fn approvals_require_author_and_peers() {
        let mut pr = base_pr();
        pr.reviews = vec![
            Review { id: 1, author: "dev".into(), state: ReviewState::Approved },
            Review { id: 2, author: "alice".into(), state: ReviewState::Approved },
        ];
        let settings = crate::config::Settings::from_yaml(
            "repository_host: mock\nrepository_owner: a\nrepository_slug: b\nrobot:\n  username: gatekeeper-bot\nrobot_email: x@y\nrequired_peer_approvals: 2\n",
        )
        .unwrap();
        let err = check_approvals(&pr, &settings, &AuthorBypass::default(), &[], &CommandSet::default())
            .unwrap_err();
        assert!(matches!(err, crate::errors::GateError::User(UserError::NeedPeerApproval { needed: 1 })));

        pr.reviews.push(Review { id: 3, author: "bob".into(), state: ReviewState::Approved });
        assert!(check_approvals(&pr, &settings, &AuthorBypass::default(), &[], &CommandSet::default()).is_ok());
    }
}
