use git2::Repository;
use std::path::{Path, PathBuf};

/// Locate the repository root containing `path`, if any. For worktrees this
/// is the worktree's checkout root, which lets the frontend group worktrees
/// of one repository together.
pub fn resolve_git_root(path: &Path) -> Option<PathBuf> {
    let repo = Repository::discover(path).ok()?;
    repo.workdir().map(|p| p.to_path_buf())
}

/// Short name of the currently checked-out branch, `HEAD` when detached.
pub fn current_branch(path: &Path) -> Option<String> {
    let repo = Repository::discover(path).ok()?;
    let head = repo.head().ok()?;
    head.shorthand().map(|s| s.to_string())
}

/// The user's global `user.email`, the pairing key for the peer fabric.
/// `None` when unset or empty.
pub fn global_user_email() -> Option<String> {
    let config = git2::Config::open_default().ok()?;
    let email = config.get_string("user.email").ok()?;
    let trimmed = email.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
