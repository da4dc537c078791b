//! Cascade engine: propagate a source pull request's change
//! through every development line at or above its destination by iterating
//! the merge across integration branches, one per lattice version.

use tracing::info;

use crate::branch::ChangePrefix;
use crate::config::Settings;
use crate::errors::{GateError, GateResult, UserError};
use crate::git::{MergeOutcome, RepoFacade};
use crate::host::HostFacade;
use crate::types::{CascadePlan, CascadeStep, PullRequest};
use crate::version::{Lattice, Version};

/// Builds the ordered cascade plan for a source pull request targeting
/// `dst_version`: one step per version in `lattice.cascade(dst_version)`,
/// each naming its integration branch, expected parent (the previous step's
/// integration branch, or `src_branch` for the first step), and destination
/// development branch.
pub fn plan(
    lattice: &Lattice,
    dst_version: Version,
    src_branch: &str,
    source_pr_id: u64,
    prefix: ChangePrefix,
    subname: &str,
) -> CascadePlan {
    let versions = lattice.cascade(dst_version);
    let mut steps = Vec::with_capacity(versions.len());
    let mut parent = src_branch.to_string();
    for version in versions {
        let integration_branch = format!("w/{version}/{prefix}/{subname}");
        steps.push(CascadeStep {
            version,
            integration_branch: integration_branch.clone(),
            expected_parent: parent,
            development_branch: format!("development/{version}"),
        });
        parent = integration_branch;
    }
    CascadePlan { source_pr_id, prefix: prefix.to_string(), subname: subname.to_string(), steps }
}

/// The result of propagating one [`CascadeStep`]: the integration branch's
/// new tip sha and the child pull request that carries it toward its
/// development branch. `child_pr_id` is `None` when either no integration
/// branch was created to back one (`skip_branch`, see [`run_step`]) or
/// `always_create_integration_pull_requests` is disabled.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub version: crate::version::Version,
    pub integration_branch: String,
    pub sha: String,
    pub child_pr_id: Option<u64>,
}

/// Runs every step of `plan` in order, feeding each integration branch's
/// resulting sha forward as the next step's merge source. Re-entrant: the
/// engine always resets from the remote state and re-merges, so replaying
/// the same plan after a transient failure reproduces the same result —
/// cascade application is idempotent given the same pair of endpoint shas.
pub async fn build(
    plan: &CascadePlan,
    source_pr: &PullRequest,
    repo: &RepoFacade,
    host: &dyn HostFacade,
    settings: &Settings,
) -> GateResult<Vec<StepResult>> {
    let mut results = Vec::with_capacity(plan.steps.len());
    let mut merge_source = source_pr.src_commit.clone();

    for step in &plan.steps {
        let result = run_step(step, &merge_source, plan, host, repo, settings).await?;
        merge_source = result.sha.clone();
        results.push(result);
    }

    Ok(results)
}

async fn run_step(
    step: &CascadeStep,
    merge_source: &str,
    plan: &CascadePlan,
    host: &dyn HostFacade,
    repo: &RepoFacade,
    settings: &Settings,
) -> GateResult<StepResult> {
    // A single-step cascade's integration branch only ever exists to carry
    // a sha into `development/vi` at admission time — nothing merges on top
    // of it as a later step's parent. When the operator has disabled
    // always-create, skip publishing it: merge straight into a worktree
    // seeded from the development branch and address the result by sha,
    // which a worktree can do without ever pushing a named ref (worktrees
    // share the mirror's object database).
    if !settings.always_create_integration_branches && plan.steps.len() == 1 {
        let worktree = repo.create_worktree(&step.integration_branch, &step.development_branch)?;
        merge_or_conflict(repo, &worktree, merge_source, &step.integration_branch)?;
        let sha = repo.rev_parse_worktree_head(&worktree)?;
        return Ok(StepResult {
            version: step.version,
            integration_branch: step.integration_branch.clone(),
            sha,
            child_pr_id: None,
        });
    }

    let exists = repo.remote_branch_exists(&step.integration_branch)?;
    let worktree = if exists {
        let wt = repo.create_worktree(&step.integration_branch, &step.integration_branch)?;
        repo.reset_to_remote(&wt, &step.integration_branch)?;
        wt
    } else {
        let wt = repo.create_worktree(&step.integration_branch, &step.development_branch)?;
        repo.create_branch_from(&wt, &step.integration_branch, &step.development_branch)?;
        wt
    };

    // Merge the parent (previous cascade step, or the source branch for
    // the first step) into the integration branch.
    merge_or_conflict(repo, &worktree, merge_source, &step.integration_branch)?;

    // Merge the current development line in too, so a rebuild picks up
    // history that landed on `development/vi` since the integration branch
    // was last advanced.
    merge_or_conflict(repo, &worktree, &step.development_branch, &step.integration_branch)?;

    repo.push(&worktree, &step.integration_branch)?;
    let sha = repo.rev_parse(&format!("refs/heads/{}", step.integration_branch))?;

    let child_pr_id = if settings.always_create_integration_pull_requests {
        Some(ensure_child_pr(step, plan, host).await?)
    } else {
        None
    };

    Ok(StepResult {
        version: step.version,
        integration_branch: step.integration_branch.clone(),
        sha,
        child_pr_id,
    })
}

/// Merges `other_ref` into the worktree's current branch, translating a
/// conflict into `UserError::Conflict` naming both refs involved.
fn merge_or_conflict(
    repo: &RepoFacade,
    worktree: &crate::git::Worktree,
    other_ref: &str,
    integration_branch: &str,
) -> GateResult<()> {
    match repo.merge_no_ff(worktree, other_ref)? {
        MergeOutcome::Conflict { files } => {
            info!(
                branch = %integration_branch,
                source = %other_ref,
                conflicts = files.len(),
                "cascade merge produced conflicts"
            );
            Err(GateError::User(UserError::Conflict {
                source: other_ref.to_string(),
                target: integration_branch.to_string(),
                files,
            }))
        }
        MergeOutcome::Merged => Ok(()),
    }
}

/// The child integration PR is created once and reused on every
/// subsequent cascade run: the bot never opens a second integration PR for
/// the same branch pair.
async fn ensure_child_pr(
    step: &CascadeStep,
    plan: &CascadePlan,
    host: &dyn HostFacade,
) -> GateResult<u64> {
    let existing = host
        .find_pull_requests_by_source(&step.integration_branch)
        .await
        .map_err(GateError::transient_host)?;
    if let Some(pr) = existing.into_iter().find(|pr| pr.dst_branch == step.development_branch) {
        return Ok(pr.id);
    }
    let title = format!(
        "[{}/{}] integration into {}",
        plan.prefix, plan.subname, step.development_branch
    );
    let description = format!(
        "Automatic integration branch for pull request #{} into `{}`.",
        plan.source_pr_id, step.development_branch
    );
    let pr = host
        .create_pull_request(&title, &step.integration_branch, &step.development_branch, &description)
        .await
        .map_err(GateError::transient_host)?;
    Ok(pr.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    fn step(version: Version, parent: &str) -> CascadeStep {
        CascadeStep {
            version,
            integration_branch: format!("w/{version}/bugfix/PROJ-1"),
            expected_parent: parent.to_string(),
            development_branch: format!("development/{version}"),
        }
    }

    #[test]
    fn plan_builds_one_step_per_cascade_version_chaining_parents() {
        let lattice = Lattice::new(vec![Version::new(5, 1), Version::new(6, 0), Version::new(7, 0)]);
        let built = plan(&lattice, Version::new(5, 1), "bugfix/PROJ-1", 9, ChangePrefix::Bugfix, "PROJ-1");
        assert_eq!(built.steps.len(), 3);
        assert_eq!(built.steps[0].expected_parent, "bugfix/PROJ-1");
        assert_eq!(built.steps[0].integration_branch, "w/5.1/bugfix/PROJ-1");
        assert_eq!(built.steps[1].expected_parent, "w/5.1/bugfix/PROJ-1");
        assert_eq!(built.steps[2].expected_parent, "w/6.0/bugfix/PROJ-1");
        assert_eq!(built.steps[2].development_branch, "development/7.0");
    }

    #[test]
    fn plan_for_hotfix_target_is_single_step() {
        let lattice = Lattice::new(vec![Version::new(5, 1), Version::hotfix(5, 1, 3)]);
        let built = plan(&lattice, Version::hotfix(5, 1, 3), "hotfix/PROJ-2", 1, ChangePrefix::Hotfix, "PROJ-2");
        assert_eq!(built.steps.len(), 1);
        assert_eq!(built.steps[0].integration_branch, "w/5.1.3/hotfix/PROJ-2");
    }

    #[test]
    fn plan_versions_follow_step_order() {
        let plan = CascadePlan {
            source_pr_id: 1,
            prefix: "bugfix".into(),
            subname: "PROJ-1".into(),
            steps: vec![
                step(Version::new(5, 1), "development/5.1"),
                step(Version::new(6, 0), "w/5.1/bugfix/PROJ-1"),
            ],
        };
        assert_eq!(plan.versions(), vec![Version::new(5, 1), Version::new(6, 0)]);
    }
}
