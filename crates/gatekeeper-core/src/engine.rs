//! Orchestrator: wires the gating predicate, the
//! cascade engine, the merge queue, and the idempotent commenter together
//! for one event at a time. This is the closure body the job dispatcher
//! calls per dequeued [`crate::dispatcher::Job`]; `gatekeeper-server` only
//! has to construct an [`Engine`] and hand its methods to
//! `Dispatcher::spawn`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::branch::{self, BranchKind, ChangePrefix};
use crate::cascade::{self, StepResult};
use crate::commenter::Commenter;
use crate::config::Settings;
use crate::db::{BuildStatusCacheRow, Db};
use crate::errors::{GateError, GateResult, SilentIgnored, UserError};
use crate::gating;
use crate::git::RepoFacade;
use crate::host::HostFacade;
use crate::issue::IssueTracker;
use crate::queue::{self, MergeQueue, PromotionOutcome};
use crate::types::{BuildState, BuildStatus, PrStatus, PullRequest};
use crate::version::{Lattice, Version};

/// Everything one running instance needs to re-gate a pull request from
/// scratch: configuration, the version lattice it was configured with, the
/// git and host façades, the completed-jobs/build-status database, and the
/// in-memory merge queue (reloaded from `q/` refs on [`Engine::recover`]).
pub struct Engine {
    pub settings: Settings,
    pub lattice: Lattice,
    pub repo: RepoFacade,
    pub host: Arc<dyn HostFacade>,
    pub issue_tracker: Arc<dyn IssueTracker>,
    pub db: Arc<Db>,
    pub queue: tokio::sync::Mutex<MergeQueue>,
}

impl Engine {
    pub fn new(
        settings: Settings,
        lattice: Lattice,
        repo: RepoFacade,
        host: Arc<dyn HostFacade>,
        db: Arc<Db>,
    ) -> Self {
        Self::with_issue_tracker(settings, lattice, repo, host, Arc::new(crate::issue::NullIssueTracker), db)
    }

    pub fn with_issue_tracker(
        settings: Settings,
        lattice: Lattice,
        repo: RepoFacade,
        host: Arc<dyn HostFacade>,
        issue_tracker: Arc<dyn IssueTracker>,
        db: Arc<Db>,
    ) -> Self {
        Self {
            settings,
            lattice,
            repo,
            host,
            issue_tracker,
            db,
            queue: tokio::sync::Mutex::new(MergeQueue::new()),
        }
    }

    /// Reloads every version's queue from the surviving `q/` refs. Call once
    /// at startup before serving jobs.
    pub async fn recover(&self) -> GateResult<()> {
        self.repo.ensure_mirror()?;
        let mut queue = self.queue.lock().await;
        queue::recover(&mut queue, &self.db, &self.repo, self.lattice.versions(), Utc::now())
    }

    // ── Job entry points ─────────────────────────────────────────────────

    /// Re-runs gating/cascade/queue admission for one pull request from
    /// scratch, fully idempotent. `UserError` and
    /// `SilentIgnored` outcomes are handled here (a comment is posted, or
    /// nothing happens) rather than propagated — only transient/fatal
    /// conditions reach the dispatcher's retry loop.
    pub async fn handle_pull_request_job(&self, pr_id: u64) -> GateResult<()> {
        let pr = self.host.get_pull_request(pr_id).await.map_err(GateError::transient_host)?;

        if pr.status != PrStatus::Open {
            info!(pr_id, "pull request is no longer open, dropping its queue entries");
            self.queue.lock().await.remove_pr(pr_id);
            return Ok(());
        }

        match self.run_pull_request(&pr).await {
            Ok(()) => Ok(()),
            Err(GateError::User(e)) => self.notify_user_error(&pr, &e).await,
            Err(GateError::Silent(reason)) => {
                info!(pr_id, %reason, "pull request ignored");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// A commit's build status changed. The only fact a bare sha carries is
    /// whether it is currently the head of some version's merge queue, so
    /// this checks every version's wavefront for a match and attempts
    /// promotion for whichever pull request owns it.
    pub async fn handle_commit_job(&self, sha: &str) -> GateResult<()> {
        let pr_id = {
            let queue = self.queue.lock().await;
            queue
                .versions()
                .into_iter()
                .find_map(|v| queue.wavefront(v).filter(|e| e.sha == sha).map(|e| e.pr_id))
        };
        let Some(pr_id) = pr_id else {
            return Ok(());
        };
        self.try_promote(pr_id).await
    }

    /// Backstop sweep: re-attempts promotion for every
    /// distinct pull request currently at the head of any version's queue,
    /// independent of whether a webhook delivery was missed.
    pub async fn handle_timer_job(&self) -> GateResult<()> {
        let heads: Vec<u64> = {
            let queue = self.queue.lock().await;
            let mut seen = HashSet::new();
            queue
                .versions()
                .into_iter()
                .filter_map(|v| queue.wavefront(v).map(|e| e.pr_id))
                .filter(|id| seen.insert(*id))
                .collect()
        };
        for pr_id in heads {
            self.try_promote(pr_id).await?;
        }
        Ok(())
    }

    async fn try_promote(&self, pr_id: u64) -> GateResult<()> {
        if let Some(reason) = self.db.get_queue_halt().map_err(GateError::Fatal)? {
            warn!(pr_id, %reason, "queue promotions are halted, skipping");
            return Ok(());
        }

        let versions = {
            let queue = self.queue.lock().await;
            queue.occupied_versions(pr_id, self.lattice.versions())
        };
        if versions.is_empty() {
            return Ok(());
        }
        let mut queue = self.queue.lock().await;
        let outcome = queue::promote_entry(
            &mut queue,
            &self.db,
            &self.repo,
            self.host.as_ref(),
            pr_id,
            &versions,
            &self.settings.build_key,
        )
        .await;
        drop(queue);
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(GateError::QueueInconsistency(reason)) => {
                self.db.set_queue_halt(&reason).map_err(GateError::Fatal)?;
                return Err(GateError::QueueInconsistency(reason));
            }
            Err(other) => return Err(other),
        };

        match outcome {
            PromotionOutcome::Merged { pr_id } => {
                info!(pr_id, "pull request merged across its full cascade");
                if let Ok(pr) = self.host.get_pull_request(pr_id).await {
                    let versions_list =
                        versions.iter().map(Version::to_string).collect::<Vec<_>>().join(", ");
                    let commenter = Commenter::new(self.host.as_ref());
                    let _ = commenter.post_idempotent(&pr, "merged", &[("VERSIONS", versions_list.as_str())]).await;
                }
            }
            PromotionOutcome::Evicted { pr_id, reason } => {
                warn!(pr_id, %reason, "evicted from merge queue after a build failure");
                if let Ok(pr) = self.host.get_pull_request(pr_id).await {
                    let commenter = Commenter::new(self.host.as_ref());
                    let _ = commenter.post_idempotent(&pr, "queue-build-failed", &[("URL", reason.as_str())]).await;
                }
            }
            PromotionOutcome::WaitingOnBuild | PromotionOutcome::Empty => {}
        }
        Ok(())
    }

    // ── Gating → cascade → queue pipeline for one pull request ──────────

    async fn run_pull_request(&self, pr: &PullRequest) -> GateResult<()> {
        self.repo.ensure_mirror()?;

        let src_kind = branch::parse(&pr.src_branch);
        if let BranchKind::Change { prefix: ChangePrefix::Hotfix, .. } = src_kind {
            return Err(GateError::Silent(SilentIgnored::HotfixPrefix));
        }

        let dst_version = match branch::parse(&pr.dst_branch) {
            BranchKind::Development(v) if self.lattice.contains(&v) => v,
            _ => return Err(GateError::Silent(SilentIgnored::NotOurs)),
        };
        let dst_is_tip = self.lattice.tip() == Some(dst_version);

        let (prefix, subname) = gating::check_branches(pr, dst_is_tip)?;
        let commands = gating::parse_commands(pr, self.host.robot_username(), &self.settings);
        let bypass = gating::effective_bypass(&self.settings, pr, &commands);

        self.post_auto_tasks(pr).await?;

        let plan = cascade::plan(&self.lattice, dst_version, &pr.src_branch, pr.id, prefix, &subname);

        let commenter = Commenter::new(self.host.as_ref());
        if (commands.reset || commands.force_reset) && !commenter.already_posted(pr, "reset-done") {
            return self.apply_reset(pr, &plan, commands.force_reset).await;
        }
        if commands.status {
            let _ = self.post_status(pr, &plan).await;
        }

        gating::check_issue(
            &subname,
            prefix,
            dst_is_tip,
            &plan.versions(),
            &self.settings,
            &bypass,
            self.issue_tracker.as_ref(),
        )
        .await?;

        let steps = cascade::build(&plan, pr, &self.repo, self.host.as_ref(), &self.settings).await?;

        let participants = self.host.list_participants(pr.id).await.map_err(GateError::transient_host)?;
        gating::check_approvals(pr, &self.settings, &bypass, &participants, &commands)?;

        let labels: Vec<String> = std::iter::once("source".to_string())
            .chain(steps.iter().map(|s| s.integration_branch.clone()))
            .collect();
        let shas: Vec<&str> = std::iter::once(pr.src_commit.as_str())
            .chain(steps.iter().map(|s| s.sha.as_str()))
            .collect();
        let force_build_check = commands.build || commands.clear;
        let mut statuses = Vec::with_capacity(shas.len());
        for sha in &shas {
            statuses.push(self.build_status_for(sha, force_build_check).await?);
        }
        let labeled: Vec<(&str, BuildStatus)> =
            labels.iter().map(String::as_str).zip(statuses).collect();
        gating::check_build_statuses(&labeled, &bypass)?;

        let diff_size = self.repo.diff_size_between(&pr.dst_branch, &pr.src_commit)?;
        gating::check_diff_size(diff_size, &self.settings, &bypass)?;

        if commands.wait {
            self.queue.lock().await.remove_pr(pr.id);
            let _ = self.host.set_gate_status(pr.id, &pr.src_commit, true, "held by operator wait").await;
            let commenter = Commenter::new(self.host.as_ref());
            commenter.post_idempotent(pr, "waiting", &[]).await.map_err(GateError::transient_host)?;
            return Ok(());
        }

        self.admit_to_queue(pr, &plan, &steps).await?;
        let _ = self.host.set_gate_status(pr.id, &pr.src_commit, true, "gating checks passed").await;
        Ok(())
    }

    /// Operator recovery path for `reset`/`force_reset`: deletes this pull
    /// request's integration branches so the next cycle rebuilds them
    /// clean, drops its queue entries, and — for `force_reset` only —
    /// clears a standing queue halt. Gated on `reset-done` not already
    /// having been posted recently so a standing `reset` comment doesn't
    /// re-fire (and re-block admission) on every future event.
    async fn apply_reset(&self, pr: &PullRequest, plan: &crate::types::CascadePlan, force: bool) -> GateResult<()> {
        for step in &plan.steps {
            let _ = self.repo.delete_remote_ref(&step.integration_branch);
        }
        self.queue.lock().await.remove_pr(pr.id);
        if force {
            self.db.clear_queue_halt().map_err(GateError::Fatal)?;
        }
        let base = plan.steps.first().map(|s| s.development_branch.as_str()).unwrap_or(pr.dst_branch.as_str());
        let commenter = Commenter::new(self.host.as_ref());
        commenter.post_fresh(pr, "reset-done", &[("BASE", base)]).await.map_err(GateError::transient_host)?;
        Ok(())
    }

    /// `status` command: posts a fresh (non-deduped) snapshot of this pull
    /// request's queue position on every version its cascade touches, plus
    /// whether queue promotions are currently halted.
    async fn post_status(&self, pr: &PullRequest, plan: &crate::types::CascadePlan) -> GateResult<()> {
        let versions = plan.versions();
        let lines: Vec<String> = {
            let queue = self.queue.lock().await;
            versions
                .iter()
                .map(|v| match queue.wavefront(*v) {
                    Some(entry) if entry.pr_id == pr.id => format!("{v}: at the head of the queue"),
                    Some(entry) => format!("{v}: queued behind pull request #{}", entry.pr_id),
                    None => format!("{v}: not queued"),
                })
                .collect()
        };
        let mut status_text = lines.join("\n");
        if let Some(reason) = self.db.get_queue_halt().map_err(GateError::Fatal)? {
            status_text.push_str(&format!("\nqueue promotions are halted: {reason}"));
        }
        let commenter = Commenter::new(self.host.as_ref());
        commenter.post_fresh(pr, "status", &[("STATUS", status_text.as_str())]).await.map_err(GateError::transient_host)
    }

    /// `tasks` (settings): posts one idempotent checklist comment per
    /// configured task name, each deduped independently so adding a new
    /// task to the config doesn't re-post the ones already acknowledged.
    async fn post_auto_tasks(&self, pr: &PullRequest) -> GateResult<()> {
        if self.settings.tasks.is_empty() {
            return Ok(());
        }
        let commenter = Commenter::new(self.host.as_ref());
        for task in &self.settings.tasks {
            let message_id = format!("task-{task}");
            commenter
                .post_idempotent_raw(pr, &message_id, &format!("- [ ] {task}"))
                .await
                .map_err(GateError::transient_host)?;
        }
        Ok(())
    }

    /// Memoizes only `SUCCESSFUL` results across calls; any other state is
    /// always re-fetched since it may have since transitioned. `force`
    /// (the `build`/`clear` commands) drops any cached row first so a
    /// known-stale green result can't shadow a fresh host poll.
    async fn build_status_for(&self, sha: &str, force: bool) -> GateResult<BuildStatus> {
        if force {
            self.db.clear_cached_build_status(&self.settings.build_key, sha).map_err(GateError::Fatal)?;
        }
        if let Some(cached) = self
            .db
            .get_cached_build_status(&self.settings.build_key, sha)
            .map_err(GateError::Fatal)?
        {
            if cached.state == "SUCCESSFUL" {
                return Ok(BuildStatus {
                    key: cached.build_key,
                    state: BuildState::Successful,
                    url: cached.url,
                    description: cached.description,
                });
            }
        }
        let status =
            self.host.get_build_status(sha, &self.settings.build_key).await.map_err(GateError::transient_host)?;
        if status.state == BuildState::Successful {
            self.db
                .cache_build_status(&BuildStatusCacheRow {
                    build_key: self.settings.build_key.clone(),
                    sha: sha.to_string(),
                    state: "SUCCESSFUL".to_string(),
                    url: status.url.clone(),
                    description: status.description.clone(),
                })
                .map_err(GateError::Fatal)?;
        }
        Ok(status)
    }

    /// Admits a pull request that passed every gating clause. `use_queues:
    /// false` or `disable_queues` (and `skip_queue_when_possible` when every
    /// target version's queue is currently empty) merge directly instead of
    /// going through `q/` refs.
    async fn admit_to_queue(&self, pr: &PullRequest, plan: &crate::types::CascadePlan, steps: &[StepResult]) -> GateResult<()> {
        let versions = plan.versions();
        let can_skip_queue = !self.settings.use_queues || self.settings.disable_queues || {
            let queue = self.queue.lock().await;
            self.settings.skip_queue_when_possible && versions.iter().all(|v| queue.wavefront(*v).is_none())
        };

        if can_skip_queue {
            let refs: Vec<(String, String)> =
                steps.iter().map(|s| (s.sha.clone(), format!("development/{}", s.version))).collect();
            match self.repo.push_all_atomic(&refs)? {
                crate::git::PushAllOutcome::AllSucceeded => {}
                crate::git::PushAllOutcome::PartialFailure { succeeded, failed } => {
                    let reason = format!(
                        "direct merge of pull request {} partially failed: {} of {} refs advanced ({})",
                        pr.id,
                        succeeded.len(),
                        refs.len(),
                        failed.iter().map(|(b, e)| format!("{b}: {e}")).collect::<Vec<_>>().join("; ")
                    );
                    self.db.set_queue_halt(&reason).map_err(GateError::Fatal)?;
                    return Err(GateError::QueueInconsistency(reason));
                }
            }
            self.host.merge_pull_request(pr.id, &steps[0].sha).await.map_err(GateError::transient_host)?;
            let versions_list = versions.iter().map(Version::to_string).collect::<Vec<_>>().join(", ");
            let commenter = Commenter::new(self.host.as_ref());
            commenter
                .post_idempotent(pr, "merged", &[("VERSIONS", versions_list.as_str())])
                .await
                .map_err(GateError::transient_host)?;
            return Ok(());
        }

        // Entry into the queue across every touched version is one atomic
        // push of `q/` refs, not one push per version.
        let refs = queue::entry_refs(steps, pr.id);
        match self.repo.push_all_atomic(&refs)? {
            crate::git::PushAllOutcome::AllSucceeded => {}
            crate::git::PushAllOutcome::PartialFailure { succeeded, failed } => {
                let reason = format!(
                    "queue entry for pull request {} partially failed: {} of {} refs pushed ({})",
                    pr.id,
                    succeeded.len(),
                    refs.len(),
                    failed.iter().map(|(b, e)| format!("{b}: {e}")).collect::<Vec<_>>().join("; ")
                );
                self.db.set_queue_halt(&reason).map_err(GateError::Fatal)?;
                return Err(GateError::QueueInconsistency(reason));
            }
        }

        let now = Utc::now();
        {
            let mut queue = self.queue.lock().await;
            for step in steps {
                queue.enqueue(step.version, pr.id, step.sha.clone(), now);
                self.db
                    .replace_queue_snapshot(&step.version.to_string(), &queue.snapshot(step.version))
                    .map_err(GateError::Fatal)?;
            }
        }

        let versions_list = versions.iter().map(Version::to_string).collect::<Vec<_>>().join(", ");
        let commenter = Commenter::new(self.host.as_ref());
        commenter
            .post_idempotent(pr, "queued", &[("VERSIONS", versions_list.as_str())])
            .await
            .map_err(GateError::transient_host)?;

        // A build may already be green by the time we admit (e.g. CI
        // finished mid-cascade); try to promote immediately instead of
        // waiting for the next commit-status event.
        drop(self.try_promote(pr.id).await);
        Ok(())
    }

    async fn notify_user_error(&self, pr: &PullRequest, err: &UserError) -> GateResult<()> {
        let commenter = Commenter::new(self.host.as_ref());
        let (message_id, vars) = user_error_template(err);
        let vars: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        commenter.post_idempotent(pr, message_id, &vars).await.map_err(GateError::transient_host)?;
        let _ = self.host.set_gate_status(pr.id, &pr.src_commit, false, &err.to_string()).await;
        Ok(())
    }
}

/// Maps a [`UserError`] to its template `message_id` and rendered
/// placeholder values; `UserError::message_id` already names the template,
/// this just supplies the `{KEY}` substitutions each one expects.
fn user_error_template(err: &UserError) -> (&'static str, Vec<(&'static str, String)>) {
    match err {
        UserError::BranchNameInvalid(branch) => ("invalid-branch", vec![("BRANCH", branch.clone())]),
        UserError::PrefixForbidden { prefix, branch } => {
            ("forbidden-branch", vec![("BRANCH", branch.clone()), ("PREFIX", prefix.clone()), ("REASON", format!("`{prefix}` is not accepted here"))])
        }
        UserError::BranchDoesNotAcceptFeatures(branch) => (
            "forbidden-branch",
            vec![
                ("BRANCH", branch.clone()),
                ("PREFIX", "feature".to_string()),
                ("REASON", "maintenance lines only accept bugfix/improvement changes".to_string()),
            ],
        ),
        UserError::Conflict { source, target, files } => (
            "conflict",
            vec![("SOURCE", source.clone()), ("TARGET", target.clone()), ("FILES", files.join("\n"))],
        ),
        UserError::NeedAuthorApproval => {
            ("need-approval", vec![("REQUIREMENTS", "the pull request author's own approval".to_string())])
        }
        UserError::NeedPeerApproval { needed } => {
            ("need-approval", vec![("REQUIREMENTS", format!("{needed} more peer approval(s)"))])
        }
        UserError::NeedLeaderApproval { needed } => {
            ("need-approval", vec![("REQUIREMENTS", format!("{needed} more project leader approval(s)"))])
        }
        UserError::IssueCheckFailed(reason) => ("issue-check-failed", vec![("REASON", reason.clone())]),
        UserError::BuildFailed(label) => ("build-failed", vec![("KEY", label.clone()), ("URL", String::new())]),
        UserError::BuildNotStarted(label) => ("build-not-started", vec![("KEY", label.clone())]),
        UserError::BuildInProgress(label) => ("build-in-progress", vec![("KEY", label.clone()), ("URL", String::new())]),
        UserError::CommitTooLarge { actual, max } => {
            ("commit-too-large", vec![("ACTUAL", actual.to_string()), ("MAX", max.to_string())])
        }
    }
}
