//! A pure, read-only snapshot of repository state taken once per run:
//! merge base via `repo.merge_base` + `repo.diff_tree_to_tree` for changed
//! paths, `StatusOptions` for dirty-worktree detection. kiln
//! always runs against a real git checkout, so there is no shell-`git`
//! fallback path here.

use git2::{Repository, StatusOptions};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// The subset of repository state the engine ever consults. A trait (rather
/// than a concrete struct) so `selector.rs` can be tested against a fake
/// without a real git checkout. Consulted synchronously, never across a
/// thread boundary, so this carries no `Send`/`Sync` bound — `git2::Repository`
/// is not `Sync`.
pub trait RepoFacts {
    fn root(&self) -> Result<PathBuf>;
    fn head(&self) -> Result<String>;
    fn dirty(&self) -> Result<bool>;
    fn current_ref(&self) -> Result<String>;
    /// Paths that differ between the merge base of `compare_ref` and `HEAD`,
    /// unioned with untracked/uncommitted working-tree changes.
    fn changed_paths(&self, compare_ref: &str) -> Result<BTreeSet<PathBuf>>;
    fn remote_url(&self, name: &str) -> Result<Option<String>>;
}

pub struct GitRepoFacts {
    repo: Repository,
    root: PathBuf,
}

impl GitRepoFacts {
    /// Opens the repository containing `start_dir`, discovering it the way
    /// `git2::Repository::discover` does (walking up through parents).
    pub fn discover(start_dir: &Path) -> Result<Self> {
        let repo = Repository::discover(start_dir)?;
        let root = repo
            .workdir()
            .ok_or_else(|| Error::NotARepository(start_dir.display().to_string()))?
            .to_path_buf();
        Ok(Self { repo, root })
    }
}

impl RepoFacts for GitRepoFacts {
    fn root(&self) -> Result<PathBuf> {
        Ok(self.root.clone())
    }

    fn head(&self) -> Result<String> {
        let head = self.repo.head()?;
        let oid = head.target().ok_or_else(|| Error::UnknownRef("HEAD".into()))?;
        Ok(oid.to_string())
    }

    fn current_ref(&self) -> Result<String> {
        let head = self.repo.head()?;
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    fn dirty(&self) -> Result<bool> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = self.repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    fn changed_paths(&self, compare_ref: &str) -> Result<BTreeSet<PathBuf>> {
        let compare_obj = self
            .repo
            .revparse_single(compare_ref)
            .map_err(|_| Error::UnknownRef(compare_ref.to_string()))?;
        let head_obj = self.repo.revparse_single("HEAD").map_err(|_| Error::UnknownRef("HEAD".into()))?;

        let merge_base = self.repo.merge_base(compare_obj.id(), head_obj.id())?;
        let merge_base_tree = self.repo.find_object(merge_base, None)?.peel_to_tree()?;
        let head_tree = head_obj.peel_to_tree()?;

        let mut changed = BTreeSet::new();

        let diff = self.repo.diff_tree_to_tree(Some(&merge_base_tree), Some(&head_tree), None)?;
        diff.foreach(
            &mut |delta, _| {
                if let Some(path) = delta.new_file().path() {
                    changed.insert(path.to_path_buf());
                }
                true
            },
            None,
            None,
            None,
        )?;

        // Union in working-tree changes not yet committed (staged or not),
        // so a diff run reflects what the repo will look like, not just HEAD.
        // `include_untracked` is required here too: spec.md's `changed_paths`
        // contract explicitly includes untracked files.
        let mut workdir_opts = git2::DiffOptions::new();
        workdir_opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff_to_workdir =
            self.repo.diff_tree_to_workdir_with_index(Some(&head_tree), Some(&mut workdir_opts))?;
        diff_to_workdir.foreach(
            &mut |delta, _| {
                if let Some(path) = delta.new_file().path() {
                    changed.insert(path.to_path_buf());
                }
                true
            },
            None,
            None,
            None,
        )?;

        Ok(changed)
    }

    fn remote_url(&self, name: &str) -> Result<Option<String>> {
        match self.repo.find_remote(name) {
            Ok(remote) => Ok(remote.url().map(str::to_string)),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
