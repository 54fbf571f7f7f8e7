//! Version-control collaborator
//!
//! Provides the atomic per-iteration commit/rollback the orchestrator
//! relies on, plus a content hash of the working tree so rollback can be
//! verified rather than assumed.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use git2::{IndexAddOption, ObjectType, Oid, Repository, ResetType, Signature};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// The subset of version control the orchestrator needs.
pub trait Vcs {
    fn current_head(&self) -> Result<String>;
    /// Stage everything and commit. Returns the new commit id.
    fn commit_all(&self, message: &str) -> Result<String>;
    /// Discard all changes and move back to the given commit.
    fn reset_hard(&self, commit_id: &str) -> Result<()>;
}

/// Directories never included in the working-tree hash.
const HASH_IGNORE: &[&str] = &[
    ".git",
    ".mend",
    "target",
    "node_modules",
    "__pycache__",
    ".venv",
    ".pytest_cache",
];

pub struct GitVcs {
    repo: Repository,
}

impl GitVcs {
    pub fn open(repo_path: &Path) -> Result<Self> {
        let repo = Repository::discover(repo_path)
            .with_context(|| format!("not a git repository: {}", repo_path.display()))?;
        Ok(Self { repo })
    }
}

impl Vcs for GitVcs {
    fn current_head(&self) -> Result<String> {
        let head = self.repo.head().context("Failed to get HEAD")?;
        let oid = head
            .target()
            .ok_or_else(|| anyhow::anyhow!("HEAD is not a direct reference"))?;
        Ok(oid.to_string())
    }

    fn commit_all(&self, message: &str) -> Result<String> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        // add_all stages new and modified files but not removals.
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let head = self.repo.head()?;
        let parent = head.peel_to_commit()?;

        // Get author info from git config, with a fallback identity
        let config = self.repo.config()?;
        let name = config
            .get_string("user.name")
            .unwrap_or_else(|_| "mend".to_string());
        let email = config
            .get_string("user.email")
            .unwrap_or_else(|_| "mend@local".to_string());
        let sig = Signature::now(&name, &email)?;

        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;

        Ok(oid.to_string())
    }

    fn reset_hard(&self, commit_id: &str) -> Result<()> {
        let oid = Oid::from_str(commit_id)
            .with_context(|| format!("invalid commit id '{}'", commit_id))?;
        let object = self
            .repo
            .find_object(oid, Some(ObjectType::Commit))
            .with_context(|| format!("commit '{}' not found", commit_id))?;
        self.repo
            .reset(&object, ResetType::Hard, None)
            .context("hard reset failed")?;

        // Hard reset leaves untracked files behind; a rolled-back iteration
        // must not.
        let statuses = self.repo.statuses(None)?;
        let workdir = self
            .repo
            .workdir()
            .ok_or_else(|| anyhow::anyhow!("bare repository"))?;
        for entry in statuses.iter() {
            if entry.status().is_wt_new() {
                if let Some(path) = entry.path() {
                    let _ = fs::remove_file(workdir.join(path));
                }
            }
        }
        Ok(())
    }
}

/// Content hash of the working tree, stable across runs.
///
/// Walks every non-ignored file in sorted order and hashes path + bytes.
/// Used to verify that rollback restored the tree bit-for-bit.
pub fn worktree_hash(root: &Path) -> Result<String> {
    let mut entries: Vec<_> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !HASH_IGNORE.contains(&name.as_ref())
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    entries.sort();

    let mut hasher = Sha256::new();
    for path in entries {
        let relative = path.strip_prefix(root).unwrap_or(&path);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let content = fs::read(&path)
            .with_context(|| format!("failed to read {} for hashing", path.display()))?;
        hasher.update(&content);
        hasher.update([0u8]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        {
            let mut config = repo.config().unwrap();
            config.set_str("user.name", "tester").unwrap();
            config.set_str("user.email", "tester@local").unwrap();
        }
        fs::write(dir.join("a.py"), "x = 1\n").unwrap();
        {
            let mut index = repo.index().unwrap();
            index
                .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
                .unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = Signature::now("tester", "tester@local").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }
        repo
    }

    #[test]
    fn test_commit_and_reset_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let vcs = GitVcs::open(dir.path()).unwrap();
        let base = vcs.current_head().unwrap();
        let base_hash = worktree_hash(dir.path()).unwrap();

        fs::write(dir.path().join("a.py"), "x = 2\n").unwrap();
        fs::write(dir.path().join("new.py"), "y = 1\n").unwrap();
        let commit = vcs.commit_all("change").unwrap();
        assert_ne!(commit, base);
        assert_eq!(vcs.current_head().unwrap(), commit);

        vcs.reset_hard(&base).unwrap();
        assert_eq!(vcs.current_head().unwrap(), base);
        assert_eq!(worktree_hash(dir.path()).unwrap(), base_hash);
    }

    #[test]
    fn test_commit_all_records_deletions() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let vcs = GitVcs::open(dir.path()).unwrap();
        fs::write(dir.path().join("keep.py"), "y = 1\n").unwrap();
        let with_both = vcs.commit_all("add keep.py").unwrap();

        fs::remove_file(dir.path().join("a.py")).unwrap();
        let after_delete = vcs.commit_all("drop a.py").unwrap();
        assert_ne!(after_delete, with_both);

        // Round-trip through the deleting commit: a.py must stay gone.
        vcs.reset_hard(&with_both).unwrap();
        assert!(dir.path().join("a.py").exists());
        vcs.reset_hard(&after_delete).unwrap();
        assert!(!dir.path().join("a.py").exists());
        assert!(dir.path().join("keep.py").exists());
    }

    #[test]
    fn test_reset_removes_untracked_files() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        let vcs = GitVcs::open(dir.path()).unwrap();
        let base = vcs.current_head().unwrap();
        let base_hash = worktree_hash(dir.path()).unwrap();

        // Uncommitted modification plus an untracked file
        fs::write(dir.path().join("a.py"), "x = 3\n").unwrap();
        fs::write(dir.path().join("stray.py"), "z = 1\n").unwrap();

        vcs.reset_hard(&base).unwrap();
        assert!(!dir.path().join("stray.py").exists());
        assert_eq!(worktree_hash(dir.path()).unwrap(), base_hash);
    }

    #[test]
    fn test_worktree_hash_sensitivity() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let h1 = worktree_hash(dir.path()).unwrap();

        fs::write(dir.path().join("a.py"), "x = 2\n").unwrap();
        let h2 = worktree_hash(dir.path()).unwrap();
        assert_ne!(h1, h2);

        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        assert_eq!(worktree_hash(dir.path()).unwrap(), h1);
    }

    #[test]
    fn test_hash_ignores_scratch_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.py"), "x = 1\n").unwrap();
        let h1 = worktree_hash(dir.path()).unwrap();

        fs::create_dir_all(dir.path().join(".mend")).unwrap();
        fs::write(dir.path().join(".mend/events.jsonl"), "{}\n").unwrap();
        assert_eq!(worktree_hash(dir.path()).unwrap(), h1);
    }
}
