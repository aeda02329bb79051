//! A stable digest over a set of globs' matching file contents and relative
//! paths.
//!
//! The byte layout is fixed deliberately, so this module does not reach for
//! a general-purpose "hash a directory" crate; it builds the digest directly
//! over `sha2::Sha256`, with `globset` doing the matching.

use globset::{Glob, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::Result;

/// Globs that are always excluded, regardless of the caller's `exclude_globs`.
const DEFAULT_EXCLUDES: &[&str] = &[".git/**", "**/__pycache__/**"];

/// Hashes every file under `root` matching `include_globs` and not matching
/// `exclude_globs`.
///
/// Enumeration is deterministic: files are visited in lexicographic order of
/// their repo-relative POSIX-style paths. For each file the hasher absorbs
/// the relative path bytes, a separator byte, the file length as a
/// fixed-width big-endian `u64`, and the file's content. Symlinks are
/// followed only if their target lies within `root`; otherwise the link
/// path and its textual target are absorbed instead. Missing globs
/// contribute nothing but do not fail.
pub fn hash(root: &Path, include_globs: &[String], exclude_globs: &[String]) -> Result<String> {
    let files = enumerate(root, include_globs, exclude_globs)?;
    let mut hasher = Sha256::new();
    for rel in &files {
        let posix = to_posix(rel);
        hasher.update(posix.as_bytes());
        hasher.update([0u8]); // separator

        let abs = root.join(rel);
        let meta = fs::symlink_metadata(&abs)?;
        if meta.file_type().is_symlink() {
            absorb_symlink(&mut hasher, root, &abs)?;
        } else {
            let content = fs::read(&abs)?;
            hasher.update((content.len() as u64).to_be_bytes());
            hasher.update(&content);
        }
    }
    Ok(hex(&hasher.finalize()))
}

fn absorb_symlink(hasher: &mut Sha256, root: &Path, abs: &Path) -> Result<()> {
    let target = fs::read_link(abs)?;
    let resolved = abs.parent().unwrap_or(root).join(&target);
    let within_root = resolved
        .canonicalize()
        .ok()
        .and_then(|c| root.canonicalize().ok().map(|r| c.starts_with(r)))
        .unwrap_or(false);
    if within_root {
        let content = fs::read(abs)?;
        hasher.update((content.len() as u64).to_be_bytes());
        hasher.update(&content);
    } else {
        let target_str = target.to_string_lossy();
        hasher.update((target_str.len() as u64).to_be_bytes());
        hasher.update(target_str.as_bytes());
    }
    Ok(())
}

/// Walk `root` (skipping `.git` eagerly since it can be enormous) and return
/// the sorted, deduplicated set of repo-relative paths matching
/// `include_globs` and none of `exclude_globs` + [`DEFAULT_EXCLUDES`].
fn enumerate(root: &Path, include_globs: &[String], exclude_globs: &[String]) -> Result<Vec<PathBuf>> {
    let mut include_builder = GlobSetBuilder::new();
    for g in include_globs {
        include_builder.add(Glob::new(g)?);
    }
    let include_set = include_builder.build()?;

    let mut exclude_builder = GlobSetBuilder::new();
    for g in DEFAULT_EXCLUDES.iter().copied().chain(exclude_globs.iter().map(|s| s.as_str())) {
        exclude_builder.add(Glob::new(g)?);
    }
    let exclude_set = exclude_builder.build()?;

    let mut out = Vec::new();
    let mut visited_dirs = std::collections::HashSet::new();
    if let Ok(canon) = root.canonicalize() {
        visited_dirs.insert(canon);
    }
    walk(root, root, &include_set, &exclude_set, &mut out, &mut visited_dirs)?;
    out.sort();
    out.dedup();
    Ok(out)
}

/// `visited_dirs` holds the canonical path of every directory already
/// descended into, so a symlinked directory that loops back on an ancestor
/// (or on itself) is not followed twice.
fn walk(
    root: &Path,
    dir: &Path,
    include: &globset::GlobSet,
    exclude: &globset::GlobSet,
    out: &mut Vec<PathBuf>,
    visited_dirs: &mut std::collections::HashSet<PathBuf>,
) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(()), // missing glob roots contribute nothing
    };
    let mut names: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    names.sort_by_key(|e| e.file_name());
    for entry in names {
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        if exclude.is_match(&rel) {
            continue;
        }
        let file_type = entry.file_type()?;
        // `DirEntry::file_type` does not follow symlinks, so a symlink whose
        // target is a directory must be checked separately or it gets treated
        // as a leaf and later fails to read as file content. Only follow it
        // if the target canonicalizes within `root` (same rule `absorb_symlink`
        // applies when hashing) and hasn't been visited yet, or a symlink
        // cycle/escape recurses forever or walks outside the workspace.
        let is_followable_symlink = file_type.is_symlink()
            && path.canonicalize().ok().filter(|c| c.is_dir()).is_some_and(|c| {
                root.canonicalize().ok().is_some_and(|r| c.starts_with(r)) && visited_dirs.insert(c)
            });
        if file_type.is_dir() || is_followable_symlink {
            walk(root, &path, include, exclude, out, visited_dirs)?;
        } else if include.is_match(&rel) {
            out.push(rel);
        }
    }
    Ok(())
}

fn to_posix(p: &Path) -> String {
    p.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn deterministic_for_same_content() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "1").unwrap();
        let h1 = hash(dir.path(), &["*.txt".into()], &[]).unwrap();
        let h2 = hash(dir.path(), &["*.txt".into()], &[]).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn changes_when_content_changes() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "1").unwrap();
        let h1 = hash(dir.path(), &["*.txt".into()], &[]).unwrap();
        fs::write(dir.path().join("a.txt"), "2").unwrap();
        let h2 = hash(dir.path(), &["*.txt".into()], &[]).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn missing_glob_root_does_not_fail() {
        let dir = tempdir().unwrap();
        let h = hash(dir.path(), &["nope/**".into()], &[]).unwrap();
        assert_eq!(h.len(), 64);
    }

    #[test]
    fn default_excludes_git_dir() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();
        fs::write(dir.path().join("a.txt"), "1").unwrap();
        let with_git = hash(dir.path(), &["**/*".into()], &[]).unwrap();
        fs::write(dir.path().join(".git/HEAD"), "ref: refs/heads/other").unwrap();
        let after_git_change = hash(dir.path(), &["**/*".into()], &[]).unwrap();
        assert_eq!(with_git, after_git_change);
    }

    #[test]
    fn set_of_paths_matters_not_just_contents() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "1").unwrap();
        let h1 = hash(dir.path(), &["*.txt".into()], &[]).unwrap();
        fs::write(dir.path().join("b.txt"), "1").unwrap();
        let h2 = hash(dir.path(), &["*.txt".into()], &[]).unwrap();
        assert_ne!(h1, h2);
    }

    #[cfg(unix)]
    #[test]
    fn follows_a_symlinked_directory_within_root() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("real")).unwrap();
        fs::write(dir.path().join("real/a.txt"), "1").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("linked")).unwrap();

        let h1 = hash(dir.path(), &["**/*.txt".into()], &[]).unwrap();
        fs::write(dir.path().join("real/a.txt"), "2").unwrap();
        let h2 = hash(dir.path(), &["**/*.txt".into()], &[]).unwrap();
        assert_ne!(h1, h2, "content reachable only through the symlinked dir must affect the digest");
    }

    #[cfg(unix)]
    #[test]
    fn does_not_loop_forever_on_a_self_referential_symlink() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "1").unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).unwrap();

        let h = hash(dir.path(), &["**/*.txt".into()], &[]);
        assert!(h.is_ok());
    }
}
