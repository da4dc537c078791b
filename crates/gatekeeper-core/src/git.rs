//! Repository façade: a single on-disk mirror clone plus disposable
//! per-job worktrees, wrapping `git` subprocess invocations as a thin typed
//! `exec` plus named operations built on top of it, with a command timeout
//! (default 5 minutes) and a worktree guard that guarantees removal on
//! every exit path.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::errors::GateError;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Outcome of a no-ff merge attempt: either it went through cleanly, or it
/// left the worktree in a conflicted state (which the caller must abort).
#[derive(Debug)]
pub enum MergeOutcome {
    Merged,
    Conflict { files: Vec<String> },
}

/// Outcome of an atomic multi-ref push attempt: not all hosts honor
/// atomicity across refs, so a caller must handle the degraded partial-push
/// case explicitly.
#[derive(Debug)]
pub enum PushAllOutcome {
    AllSucceeded,
    PartialFailure { succeeded: Vec<String>, failed: Vec<(String, String)> },
}

/// A single on-disk `--mirror` clone, refreshed in place.
pub struct Mirror {
    pub url: String,
    pub path: PathBuf,
}

impl Mirror {
    pub fn new(url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self { url: url.into(), path: cache_dir.into() }
    }
}

/// An acquired disposable worktree, with a scoped guarantee of removal:
/// removal is guaranteed on every exit path by `Drop`.
pub struct Worktree {
    pub path: PathBuf,
    mirror_path: PathBuf,
}

impl Drop for Worktree {
    fn drop(&mut self) {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.mirror_path)
            .args(["worktree", "remove", "--force"])
            .arg(&self.path)
            .output();
        if let Ok(out) = output {
            if !out.status.success() {
                warn!(
                    path = %self.path.display(),
                    stderr = %String::from_utf8_lossy(&out.stderr),
                    "failed to remove worktree on drop"
                );
            }
        }
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

pub struct RepoFacade {
    mirror: Mirror,
    timeout: Duration,
}

impl RepoFacade {
    pub fn new(mirror: Mirror, timeout: Duration) -> Self {
        Self { mirror, timeout }
    }

    fn mirror_dir(&self) -> &Path {
        &self.mirror
    }

    /// Run `git -C <dir> <args>`, killing and returning a `TransientGit`
    /// error if it runs longer than `self.timeout`.
    fn exec(&self, dir: impl AsRef<Path>, args: &[&str]) -> Result<ExecResult, GateError> {
        let dir = dir.as_ref();
        let mut child = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                GateError::transient_git(anyhow::anyhow!(
                    "failed to spawn git -C {} {}: {e}",
                    dir.display(),
                    args.join(" ")
                ))
            })?;

        let started = Instant::now();
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| GateError::transient_git(anyhow::anyhow!("git wait failed: {e}")))?
            {
                let output = child.wait_with_output().map_err(|e| {
                    GateError::transient_git(anyhow::anyhow!("failed to collect git output: {e}"))
                })?;
                return Ok(ExecResult {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: status.code().unwrap_or(1),
                });
            }
            if started.elapsed() > self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(GateError::transient_git(anyhow::anyhow!(
                    "git -C {} {} timed out after {:?}",
                    dir.display(),
                    args.join(" "),
                    self.timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    // ── Mirror lifecycle ───────────────────────────────────────────────

    pub fn ensure_mirror(&self) -> Result<(), GateError> {
        if self.mirror_dir().join("HEAD").exists() {
            let result = self.exec(self.mirror_dir(), &["fetch", "--prune"])?;
            if !result.success() {
                return Err(GateError::transient_git(anyhow::anyhow!(
                    "git fetch --prune failed: {}",
                    result.combined_output()
                )));
            }
            return Ok(());
        }
        std::fs::create_dir_all(
            self.mirror_dir()
                .parent()
                .unwrap_or_else(|| Path::new(".")),
        )
        .map_err(|e| GateError::transient_git(anyhow::anyhow!("failed to create cache dir: {e}")))?;
        let result = Command::new("git")
            .args(["clone", "--mirror", &self.mirror.url])
            .arg(self.mirror_dir())
            .output()
            .map_err(|e| GateError::transient_git(anyhow::anyhow!("failed to spawn git clone: {e}")))?;
        if !result.status.success() {
            return Err(GateError::transient_git(anyhow::anyhow!(
                "git clone --mirror {} failed: {}",
                self.mirror.url,
                String::from_utf8_lossy(&result.stderr)
            )));
        }
        Ok(())
    }

    // ── Worktree lifecycle ──────────────────────────────────────────────

    pub fn worktree_path(&self, name: &str) -> PathBuf {
        self.mirror_dir()
            .parent()
            .unwrap_or_else(|| Path::new("/tmp"))
            .join("worktrees")
            .join(name.replace('/', "__"))
    }

    /// Check out `start_point` into a fresh disposable worktree.
    pub fn create_worktree(&self, name: &str, start_point: &str) -> Result<Worktree, GateError> {
        let path = self.worktree_path(name);
        if path.exists() {
            let _ = std::fs::remove_dir_all(&path);
        }
        let result = self.exec(
            self.mirror_dir(),
            &["worktree", "add", "--detach", &path.to_string_lossy(), start_point],
        )?;
        if !result.success() {
            return Err(GateError::transient_git(anyhow::anyhow!(
                "git worktree add failed for {start_point}: {}",
                result.combined_output()
            )));
        }
        Ok(Worktree { path, mirror_path: self.mirror_dir().to_path_buf() })
    }

    // ── Branches ─────────────────────────────────────────────────────────

    pub fn remote_branch_exists(&self, branch: &str) -> Result<bool, GateError> {
        let result = self.exec(self.mirror_dir(), &["rev-parse", "--verify", "--quiet", branch])?;
        Ok(result.success())
    }

    pub fn rev_parse(&self, refname: &str) -> Result<String, GateError> {
        let result = self.exec(self.mirror_dir(), &["rev-parse", refname])?;
        if !result.success() {
            return Err(GateError::transient_git(anyhow::anyhow!(
                "git rev-parse {refname} failed: {}",
                result.combined_output()
            )));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GateError> {
        let result =
            self.exec(self.mirror_dir(), &["merge-base", "--is-ancestor", ancestor, descendant])?;
        Ok(result.exit_code == 0)
    }

    pub fn commit_count_between(&self, base: &str, head: &str) -> Result<u64, GateError> {
        let range = format!("{base}..{head}");
        let result = self.exec(self.mirror_dir(), &["rev-list", "--count", &range])?;
        if !result.success() {
            return Err(GateError::transient_git(anyhow::anyhow!(
                "git rev-list --count {range} failed: {}",
                result.combined_output()
            )));
        }
        result
            .stdout
            .trim()
            .parse()
            .map_err(|e| GateError::transient_git(anyhow::anyhow!("unparseable rev-list count: {e}")))
    }

    /// Total added+removed line count between `base` and `head`, summed
    /// from `git diff --numstat`, for the commit-diff-size gating clause.
    /// Binary files (reported as `-\t-\tpath`) don't contribute a line count.
    pub fn diff_size_between(&self, base: &str, head: &str) -> Result<u64, GateError> {
        let range = format!("{base}...{head}");
        let result = self.exec(self.mirror_dir(), &["diff", "--numstat", &range])?;
        if !result.success() {
            return Err(GateError::transient_git(anyhow::anyhow!(
                "git diff --numstat {range} failed: {}",
                result.combined_output()
            )));
        }
        let total = result
            .stdout
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let added: u64 = fields.next()?.parse().ok()?;
                let removed: u64 = fields.next()?.parse().ok()?;
                Some(added + removed)
            })
            .sum();
        Ok(total)
    }

    /// Create `branch` at `base` and push it, used when an integration
    /// branch does not exist remotely yet.
    pub fn create_branch_from(&self, worktree: &Worktree, branch: &str, base: &str) -> Result<(), GateError> {
        let result = self.exec(&worktree.path, &["checkout", "-B", branch, base])?;
        if !result.success() {
            return Err(GateError::transient_git(anyhow::anyhow!(
                "git checkout -B {branch} {base} failed: {}",
                result.combined_output()
            )));
        }
        Ok(())
    }

    /// Reset `branch` to the remote tip, used when the integration branch
    /// already exists and must be advanced from a known-good base. A
    /// `--mirror` clone's local `refs/heads/<branch>` already *is* the
    /// remote tip, so the branch name itself is the start point.
    pub fn reset_to_remote(&self, worktree: &Worktree, branch: &str) -> Result<(), GateError> {
        let result = self.exec(&worktree.path, &["checkout", "-B", branch, branch])?;
        if !result.success() {
            return Err(GateError::transient_git(anyhow::anyhow!(
                "git checkout -B {branch} {branch} failed: {}",
                result.combined_output()
            )));
        }
        Ok(())
    }

    /// Merge `other_ref` into the worktree's current branch with `--no-ff`.
    /// On conflict, aborts the merge and reports the conflicted files.
    pub fn merge_no_ff(&self, worktree: &Worktree, other_ref: &str) -> Result<MergeOutcome, GateError> {
        let result = self.exec(&worktree.path, &["merge", "--no-ff", "--no-edit", other_ref])?;
        if result.success() {
            return Ok(MergeOutcome::Merged);
        }
        let status = self.exec(&worktree.path, &["diff", "--name-only", "--diff-filter=U"])?;
        let files: Vec<String> = status.stdout.lines().map(str::to_string).collect();
        let _ = self.exec(&worktree.path, &["merge", "--abort"]);
        Ok(MergeOutcome::Conflict { files })
    }

    pub fn push(&self, worktree: &Worktree, branch: &str) -> Result<(), GateError> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        let result = self.exec(&worktree.path, &["push", "--force", "origin", &refspec])?;
        if !result.success() {
            return Err(GateError::transient_git(anyhow::anyhow!(
                "git push origin {refspec} failed: {}",
                result.combined_output()
            )));
        }
        Ok(())
    }

    /// Push every `(local_sha, remote_branch)` pair as a single atomic
    /// push where the host supports it; degrades to sequential pushes
    /// otherwise, reporting which refs actually advanced.
    pub fn push_all_atomic(&self, refs: &[(String, String)]) -> Result<PushAllOutcome, GateError> {
        let mut args: Vec<String> = vec!["push".into(), "--atomic".into(), "origin".into()];
        for (sha, branch) in refs {
            args.push(format!("{sha}:refs/heads/{branch}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self.exec(self.mirror_dir(), &arg_refs)?;
        if result.success() {
            return Ok(PushAllOutcome::AllSucceeded);
        }
        warn!(
            "atomic push failed ({}), degrading to sequential pushes",
            result.combined_output()
        );
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (sha, branch) in refs {
            let refspec = format!("{sha}:refs/heads/{branch}");
            let single = self.exec(self.mirror_dir(), &["push", "origin", &refspec])?;
            if single.success() {
                succeeded.push(branch.clone());
            } else {
                failed.push((branch.clone(), single.combined_output()));
            }
        }
        if failed.is_empty() {
            Ok(PushAllOutcome::AllSucceeded)
        } else {
            Ok(PushAllOutcome::PartialFailure { succeeded, failed })
        }
    }

    /// Refuses to delete anything not prefixed by `w/` or `q/`.
    pub fn delete_remote_ref(&self, branch: &str) -> Result<(), GateError> {
        let kind = crate::branch::parse(branch);
        if !kind.deletable_by_bot() {
            return Err(GateError::Fatal(anyhow::anyhow!(
                "refusing to delete non-bot-owned ref: {branch}"
            )));
        }
        let result = self.exec(self.mirror_dir(), &["push", "origin", "--delete", branch])?;
        // Tolerate "remote ref does not exist" — deletion is idempotent.
        if !result.success() && !result.stderr.contains("remote ref does not exist") {
            return Err(GateError::transient_git(anyhow::anyhow!(
                "git push origin --delete {branch} failed: {}",
                result.combined_output()
            )));
        }
        Ok(())
    }

    /// Lists every local ref under `refs/heads/<prefix>` as
    /// `(short_name, sha)` pairs. A `--mirror` clone's `refs/heads/*`
    /// mirrors the remote exactly, so this is equivalent to listing the
    /// remote's refs without a network round trip per call.
    pub fn list_refs_matching(&self, prefix: &str) -> Result<Vec<(String, String)>, GateError> {
        let pattern = format!("refs/heads/{prefix}");
        let result = self.exec(
            self.mirror_dir(),
            &["for-each-ref", "--format=%(refname:short) %(objectname)", &pattern],
        )?;
        if !result.success() {
            return Err(GateError::transient_git(anyhow::anyhow!(
                "git for-each-ref {pattern} failed: {}",
                result.combined_output()
            )));
        }
        Ok(result
            .stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let name = parts.next()?.to_string();
                let sha = parts.next()?.to_string();
                Some((name, sha))
            })
            .collect())
    }

    /// The commit a worktree's `HEAD` points at, without requiring it to be
    /// reachable from any pushed ref — used to address a locally merged
    /// commit by sha when a step's integration branch was skipped.
    pub fn rev_parse_worktree_head(&self, worktree: &Worktree) -> Result<String, GateError> {
        let result = self.exec(&worktree.path, &["rev-parse", "HEAD"])?;
        if !result.success() {
            return Err(GateError::transient_git(anyhow::anyhow!(
                "git rev-parse HEAD in worktree failed: {}",
                result.combined_output()
            )));
        }
        Ok(result.stdout.trim().to_string())
    }
}

impl std::ops::Deref for Mirror {
    type Target = Path;
    fn deref(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_bare_repo(dir: &Path) {
        StdCommand::new("git").args(["init", "--bare"]).arg(dir).output().unwrap();
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git").arg("-C").arg(dir).args(args).status().unwrap();
        assert!(status.success(), "git {args:?} failed in {}", dir.display());
    }

    /// Builds a local bare "origin" plus a working clone, seeds a single
    /// commit on main, and returns (origin_path, seed_clone_path).
    fn seed_origin(tmp: &tempfile::TempDir) -> (PathBuf, PathBuf) {
        let origin = tmp.path().join("origin.git");
        init_bare_repo(&origin);
        let seed = tmp.path().join("seed");
        StdCommand::new("git")
            .args(["clone", &origin.to_string_lossy()])
            .arg(&seed)
            .output()
            .unwrap();
        std::fs::write(seed.join("file.txt"), "hello\n").unwrap();
        git(&seed, &["config", "user.email", "bot@test"]);
        git(&seed, &["config", "user.name", "bot"]);
        git(&seed, &["add", "."]);
        git(&seed, &["commit", "-m", "seed"]);
        git(&seed, &["push", "origin", "HEAD:refs/heads/development/5.1"]);
        (origin, seed)
    }

    #[test]
    fn merges_cleanly_when_no_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let (origin, seed) = seed_origin(&tmp);
        git(&seed, &["checkout", "-b", "bugfix/x"]);
        std::fs::write(seed.join("other.txt"), "feature\n").unwrap();
        git(&seed, &["add", "."]);
        git(&seed, &["commit", "-m", "feature work"]);
        git(&seed, &["push", "origin", "bugfix/x"]);

        let mirror_path = tmp.path().join("mirror.git");
        let repo = RepoFacade::new(
            Mirror::new(origin.to_string_lossy().to_string(), mirror_path),
            Duration::from_secs(30),
        );
        repo.ensure_mirror().unwrap();
        let wt = repo.create_worktree("w1", "development/5.1").unwrap();
        let outcome = repo.merge_no_ff(&wt, "bugfix/x").unwrap();
        assert!(matches!(outcome, MergeOutcome::Merged));
    }

    #[test]
    fn reports_conflict_and_restores_clean_state() {
        let tmp = tempfile::tempdir().unwrap();
        let (origin, seed) = seed_origin(&tmp);
        git(&seed, &["checkout", "-b", "bugfix/x"]);
        std::fs::write(seed.join("file.txt"), "from bugfix\n").unwrap();
        git(&seed, &["add", "."]);
        git(&seed, &["commit", "-m", "bugfix edits file.txt"]);
        git(&seed, &["push", "origin", "bugfix/x"]);

        git(&seed, &["checkout", "development/5.1"]);
        std::fs::write(seed.join("file.txt"), "from development\n").unwrap();
        git(&seed, &["add", "."]);
        git(&seed, &["commit", "-m", "development edits file.txt"]);
        git(&seed, &["push", "origin", "development/5.1"]);

        let mirror_path = tmp.path().join("mirror.git");
        let repo = RepoFacade::new(
            Mirror::new(origin.to_string_lossy().to_string(), mirror_path),
            Duration::from_secs(30),
        );
        repo.ensure_mirror().unwrap();
        let wt = repo.create_worktree("w2", "development/5.1").unwrap();
        let outcome = repo.merge_no_ff(&wt, "bugfix/x").unwrap();
        match outcome {
            MergeOutcome::Conflict { files } => assert_eq!(files, vec!["file.txt".to_string()]),
            MergeOutcome::Merged => panic!("expected conflict"),
        }
        let status = StdCommand::new("git")
            .arg("-C")
            .arg(&wt.path)
            .args(["status", "--porcelain"])
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&status.stdout).trim().is_empty());
    }

    #[test]
    fn diff_size_counts_added_and_removed_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let (origin, seed) = seed_origin(&tmp);
        git(&seed, &["checkout", "-b", "bugfix/x"]);
        std::fs::write(seed.join("file.txt"), "hello\nworld\n").unwrap();
        git(&seed, &["add", "."]);
        git(&seed, &["commit", "-m", "add a line"]);
        git(&seed, &["push", "origin", "bugfix/x"]);

        let mirror_path = tmp.path().join("mirror.git");
        let repo = RepoFacade::new(
            Mirror::new(origin.to_string_lossy().to_string(), mirror_path),
            Duration::from_secs(30),
        );
        repo.ensure_mirror().unwrap();
        let size = repo.diff_size_between("development/5.1", "bugfix/x").unwrap();
        assert_eq!(size, 2);
    }

    #[test]
    fn refuses_to_delete_non_bot_owned_ref() {
        let tmp = tempfile::tempdir().unwrap();
        let (origin, _seed) = seed_origin(&tmp);
        let mirror_path = tmp.path().join("mirror.git");
        let repo = RepoFacade::new(
            Mirror::new(origin.to_string_lossy().to_string(), mirror_path),
            Duration::from_secs(30),
        );
        repo.ensure_mirror().unwrap();
        let err = repo.delete_remote_ref("development/5.1").unwrap_err();
        assert!(matches!(err, GateError::Fatal(_)));
    }

    #[test]
    fn lists_refs_matching_a_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let (origin, seed) = seed_origin(&tmp);
        git(&seed, &["push", "origin", "development/5.1:q/7/deadbeef/5.1"]);
        git(&seed, &["push", "origin", "development/5.1:q/7/deadbeef/6.0"]);

        let mirror_path = tmp.path().join("mirror.git");
        let repo = RepoFacade::new(
            Mirror::new(origin.to_string_lossy().to_string(), mirror_path),
            Duration::from_secs(30),
        );
        repo.ensure_mirror().unwrap();
        let mut refs = repo.list_refs_matching("q/").unwrap();
        refs.sort();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].0, "q/7/deadbeef/5.1");
        assert_eq!(refs[1].0, "q/7/deadbeef/6.0");
    }
}
