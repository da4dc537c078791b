//! Merge queue: one FIFO per lattice version (hotfix lines included —
//! different versions never share a queue, so they cannot interleave),
//! backed on disk by `q/<pr>/<sha>/<version>` refs for recovery and by
//! `Db::queue_snapshot` for ordering and the status page.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::branch::BranchKind;
use crate::cascade::StepResult;
use crate::db::Db;
use crate::errors::{GateError, GateResult};
use crate::git::{PushAllOutcome, RepoFacade};
use crate::host::HostFacade;
use crate::types::BuildState;
use crate::version::Version;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedPrWithTime {
    pub pr_id: u64,
    pub sha: String,
    pub enqueued_at: DateTime<Utc>,
}

pub fn queue_ref(pr_id: u64, sha: &str, version: Version) -> String {
    format!("q/{pr_id}/{sha}/{version}")
}

/// The refs to push atomically when a pull request enters the queue for
/// every version its cascade touched in one go: entry into the queue
/// across a multi-version cascade is a single atomic event, not one queue
/// insertion per version.
pub fn entry_refs(steps: &[StepResult], pr_id: u64) -> Vec<(String, String)> {
    steps.iter().map(|s| (s.sha.clone(), queue_ref(pr_id, &s.sha, s.version))).collect()
}

#[derive(Debug, Default)]
pub struct MergeQueue {
    queues: HashMap<Version, VecDeque<QueuedPrWithTime>>,
}

#[derive(Debug, PartialEq)]
pub enum PromotionOutcome {
    Merged { pr_id: u64 },
    WaitingOnBuild,
    Evicted { pr_id: u64, reason: String },
    Empty,
}

impl MergeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, version: Version, pr_id: u64, sha: String, now: DateTime<Utc>) {
        let queue = self.queues.entry(version).or_default();
        if queue.iter().any(|e| e.pr_id == pr_id) {
            return;
        }
        queue.push_back(QueuedPrWithTime { pr_id, sha, enqueued_at: now });
    }

    pub fn wavefront(&self, version: Version) -> Option<&QueuedPrWithTime> {
        self.queues.get(&version).and_then(|q| q.front())
    }

    fn pop_front(&mut self, version: Version) -> Option<QueuedPrWithTime> {
        self.queues.get_mut(&version).and_then(|q| q.pop_front())
    }

    /// Removes a pull request from every version's queue, e.g. when it is
    /// closed or declined out from under the queue.
    pub fn remove_pr(&mut self, pr_id: u64) {
        for queue in self.queues.values_mut() {
            queue.retain(|e| e.pr_id != pr_id);
        }
    }

    pub fn snapshot(&self, version: Version) -> Vec<(i64, String)> {
        self.queues
            .get(&version)
            .map(|q| q.iter().map(|e| (e.pr_id as i64, e.sha.clone())).collect())
            .unwrap_or_default()
    }

    pub fn restore(&mut self, version: Version, entries: Vec<(u64, String)>, now: DateTime<Utc>) {
        let queue = self.queues.entry(version).or_default();
        queue.clear();
        for (pr_id, sha) in entries {
            queue.push_back(QueuedPrWithTime { pr_id, sha, enqueued_at: now });
        }
    }

    pub fn versions(&self) -> Vec<Version> {
        let mut versions: Vec<Version> = self.queues.keys().copied().collect();
        versions.sort();
        versions
    }

    /// The versions among `candidates` on which `pr_id` currently holds a
    /// queued entry at all (head or not).
    pub fn occupied_versions(&self, pr_id: u64, candidates: &[Version]) -> Vec<Version> {
        candidates
            .iter()
            .copied()
            .filter(|v| self.queues.get(v).is_some_and(|q| q.iter().any(|e| e.pr_id == pr_id)))
            .collect()
    }

    /// True iff `pr_id` is the earliest-admitted entry on every one of
    /// `versions` (the wavefront rule). A PR not present on a version it's
    /// asked about never counts as its wavefront.
    pub fn is_wavefront_on_all(&self, pr_id: u64, versions: &[Version]) -> bool {
        !versions.is_empty() && versions.iter().all(|v| self.wavefront(*v).is_some_and(|e| e.pr_id == pr_id))
    }

    fn sha_for(&self, version: Version, pr_id: u64) -> Option<String> {
        self.queues.get(&version)?.iter().find(|e| e.pr_id == pr_id).map(|e| e.sha.clone())
    }
}

/// Evaluates whether `pr_id`'s queue entry across `versions` can promote,
/// must be evicted, or should keep waiting, and acts accordingly. Only a
/// PR that is wavefront on *every* version it occupies is eligible to
/// promote or be evicted here; callers should try candidates in FIFO order
/// so one PR's eviction can unblock the next without a second event
/// round-trip.
pub async fn promote_entry(
    queue: &mut MergeQueue,
    db: &Db,
    repo: &RepoFacade,
    host: &dyn HostFacade,
    pr_id: u64,
    versions: &[Version],
    build_key: &str,
) -> GateResult<PromotionOutcome> {
    if versions.is_empty() || !queue.is_wavefront_on_all(pr_id, versions) {
        return Ok(PromotionOutcome::Empty);
    }

    let mut statuses = Vec::with_capacity(versions.len());
    for &version in versions {
        let Some(sha) = queue.sha_for(version, pr_id) else {
            return Ok(PromotionOutcome::Empty);
        };
        let status = host.get_build_status(&sha, build_key).await.map_err(GateError::transient_host)?;
        statuses.push((version, sha, status));
    }

    if let Some((version, _, status)) =
        statuses.iter().find(|(_, _, s)| matches!(s.state, BuildState::Failed | BuildState::Stopped))
    {
        let reason = status.description.clone();
        warn!(pr_id, %version, "evicted queue head after build failure");
        evict(queue, db, pr_id, versions)?;
        return Ok(PromotionOutcome::Evicted { pr_id, reason });
    }

    if !statuses.iter().all(|(_, _, s)| s.state == BuildState::Successful) {
        return Ok(PromotionOutcome::WaitingOnBuild);
    }

    // Fast-forward every development/vi to its q/ tip as a single atomic
    // push.
    let refs: Vec<(String, String)> =
        statuses.iter().map(|(v, sha, _)| (sha.clone(), format!("development/{v}"))).collect();
    match repo.push_all_atomic(&refs)? {
        PushAllOutcome::AllSucceeded => {}
        PushAllOutcome::PartialFailure { succeeded, failed } => {
            return Err(GateError::QueueInconsistency(format!(
                "atomic promotion of pull request {pr_id} partially failed: {} of {} refs advanced ({})",
                succeeded.len(),
                refs.len(),
                failed.iter().map(|(b, e)| format!("{b}: {e}")).collect::<Vec<_>>().join("; ")
            )));
        }
    }

    for (version, sha, _) in &statuses {
        let _ = repo.delete_remote_ref(&queue_ref(pr_id, sha, *version));
    }
    host.merge_pull_request(pr_id, &statuses[0].1).await.map_err(GateError::transient_host)?;
    evict(queue, db, pr_id, versions)?;
    info!(pr_id, versions = versions.len(), "promoted queue head atomically across its cascade");

    Ok(PromotionOutcome::Merged { pr_id })
}

/// Removes `pr_id` from every one of `versions`' FIFOs and persists the
/// resulting snapshot for each.
fn evict(queue: &mut MergeQueue, db: &Db, pr_id: u64, versions: &[Version]) -> GateResult<()> {
    for &version in versions {
        if let Some(q) = queue.queues.get_mut(&version) {
            q.retain(|e| e.pr_id != pr_id);
        }
        db.replace_queue_snapshot(&version.to_string(), &queue.snapshot(version)).map_err(GateError::Fatal)?;
    }
    Ok(())
}

/// Reloads every version's in-memory queue from the `q/<pr>/<sha>/<version>`
/// refs still present on the remote — the queue is never itself the
/// persisted state, it's a cache of which `q/*` refs survived a restart.
/// The database snapshot is consulted only as an ordering hint: a pr_id the
/// snapshot recorded a position for sorts by that position; a pr_id with a
/// surviving ref but no recorded position (e.g. it was enqueued and the
/// process died before the snapshot write) sorts after every ranked entry,
/// ordered by pr_id for determinism.
pub fn recover(
    queue: &mut MergeQueue,
    db: &Db,
    repo: &RepoFacade,
    versions: &[Version],
    now: DateTime<Utc>,
) -> GateResult<()> {
    let refs = repo.list_refs_matching("q/")?;
    let mut by_version: HashMap<Version, Vec<(u64, String)>> = HashMap::new();
    for (name, _objectname) in refs {
        if let BranchKind::Queue { pr_id, sha, version } = crate::branch::parse(&name) {
            by_version.entry(version).or_default().push((pr_id, sha));
        }
    }

    for &version in versions {
        let mut entries = by_version.remove(&version).unwrap_or_default();
        let rows = db.list_queue_snapshot(&version.to_string()).map_err(GateError::Fatal)?;
        let position: HashMap<u64, i64> =
            rows.into_iter().map(|r| (r.pr_id as u64, r.position)).collect();
        entries.sort_by_key(|(pr_id, _)| (position.get(pr_id).copied().unwrap_or(i64::MAX), *pr_id));
        queue.restore(version, entries, now);
        db.replace_queue_snapshot(&version.to_string(), &queue.snapshot(version)).map_err(GateError::Fatal)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn fifo_order_is_preserved_per_version() {
        let mut queue = MergeQueue::new();
        let v = Version::new(6, 0);
        let now = Utc::now();
        queue.enqueue(v, 1, "sha1".into(), now);
        queue.enqueue(v, 2, "sha2".into(), now);
        assert_eq!(queue.wavefront(v).unwrap().pr_id, 1);
        queue.pop_front(v);
        assert_eq!(queue.wavefront(v).unwrap().pr_id, 2);
    }

    #[test]
    fn different_versions_never_interleave() {
        let mut queue = MergeQueue::new();
        let now = Utc::now();
        queue.enqueue(Version::new(5, 1), 1, "a".into(), now);
        queue.enqueue(Version::hotfix(5, 0, 1), 2, "b".into(), now);
        assert_eq!(queue.wavefront(Version::new(5, 1)).unwrap().pr_id, 1);
        assert_eq!(queue.wavefront(Version::hotfix(5, 0, 1)).unwrap().pr_id, 2);
    }

    #[test]
    fn enqueue_is_idempotent_per_pr() {
        let mut queue = MergeQueue::new();
        let v = Version::new(6, 0);
        let now = Utc::now();
        queue.enqueue(v, 1, "sha1".into(), now);
        queue.enqueue(v, 1, "sha1-updated".into(), now);
        assert_eq!(queue.snapshot(v), vec![(1, "sha1".to_string())]);
    }

    #[test]
    fn wavefront_on_all_requires_head_on_every_occupied_version() {
        let mut queue = MergeQueue::new();
        let now = Utc::now();
        let v1 = Version::new(5, 1);
        let v2 = Version::new(6, 0);
        queue.enqueue(v1, 1, "a1".into(), now);
        queue.enqueue(v2, 1, "a2".into(), now);
        queue.enqueue(v1, 2, "b1".into(), now);
        assert!(queue.is_wavefront_on_all(1, &[v1, v2]));

        queue.enqueue(v2, 2, "b2".into(), now);
        queue.pop_front(v1);
        // pr 2 is now head on v1, but pr 1 is still head on v2 — neither is
        // wavefront everywhere it's queued.
        assert!(!queue.is_wavefront_on_all(1, &[v1, v2]));
        assert!(!queue.is_wavefront_on_all(2, &[v1, v2]));
    }

    #[test]
    fn remove_pr_clears_every_version() {
        let mut queue = MergeQueue::new();
        let now = Utc::now();
        queue.enqueue(Version::new(5, 1), 1, "a".into(), now);
        queue.enqueue(Version::new(6, 0), 1, "b".into(), now);
        queue.remove_pr(1);
        assert!(queue.wavefront(Version::new(5, 1)).is_none());
        assert!(queue.wavefront(Version::new(6, 0)).is_none());
    }

    fn init_bare_repo(dir: &std::path::Path) {
        std::process::Command::new("git").args(["init", "--bare"]).arg(dir).output().unwrap();
    }

    fn git(dir: &std::path::Path, args: &[&str]) {
        let status = std::process::Command::new("git").arg("-C").arg(dir).args(args).status().unwrap();
        assert!(status.success(), "git {args:?} failed in {}", dir.display());
    }

    fn open_test_db() -> Db {
        let db = Db::open(":memory:").unwrap();
        db.migrate().unwrap();
        db
    }

    /// Recovery rebuilds the in-memory queue from surviving `q/*` refs, not
    /// from the database: a pr the snapshot never recorded a position for
    /// (crash between push and snapshot write) still recovers, sorted after
    /// every ranked entry.
    #[test]
    fn recover_rebuilds_from_surviving_queue_refs() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = tmp.path().join("origin.git");
        init_bare_repo(&origin);
        let seed = tmp.path().join("seed");
        std::process::Command::new("git")
            .args(["clone", &origin.to_string_lossy()])
            .arg(&seed)
            .output()
            .unwrap();
        std::fs::write(seed.join("file.txt"), "hello\n").unwrap();
        git(&seed, &["config", "user.email", "bot@test"]);
        git(&seed, &["config", "user.name", "bot"]);
        git(&seed, &["add", "."]);
        git(&seed, &["commit", "-m", "seed"]);
        git(&seed, &["push", "origin", "HEAD:refs/heads/development/6.0"]);
        let v = Version::new(6, 0);
        git(&seed, &["push", "origin", &format!("HEAD:refs/heads/{}", queue_ref(1, "a", v))]);
        git(&seed, &["push", "origin", &format!("HEAD:refs/heads/{}", queue_ref(2, "b", v))]);

        let mirror_path = tmp.path().join("mirror.git");
        let repo = RepoFacade::new(
            crate::git::Mirror::new(origin.to_string_lossy().to_string(), mirror_path),
            std::time::Duration::from_secs(30),
        );
        repo.ensure_mirror().unwrap();

        let db = open_test_db();
        // Only pr 1 made it into the snapshot before the simulated crash.
        db.replace_queue_snapshot(&v.to_string(), &[(1, "a".to_string())]).unwrap();

        let mut queue = MergeQueue::new();
        recover(&mut queue, &db, &repo, &[v], Utc::now()).unwrap();

        assert_eq!(queue.snapshot(v), vec![(1, "a".to_string()), (2, "b".to_string())]);
    }
}
