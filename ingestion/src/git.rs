use std::path::Path;

use context_core::{EngineError, Result};
use git2::build::RepoBuilder;
use git2::{FetchOptions, Repository};
use tracing::info;

/// Shallow-clones a ref into a caller-owned directory. Clones run on a
/// blocking thread; git2 is synchronous.
pub struct RepoFetcher;

impl RepoFetcher {
    /// Clone `branch` of `url` into `dest` at depth 1. When `sha` is
    /// given the worktree is detached onto it afterwards.
    pub async fn clone_shallow(
        url: &str,
        branch: &str,
        sha: Option<&str>,
        dest: &Path,
    ) -> Result<()> {
        let url = url.to_string();
        let branch = branch.to_string();
        let sha = sha.map(str::to_string);
        let dest = dest.to_path_buf();

        tokio::task::spawn_blocking(move || {
            info!("cloning {} ({}) into {:?}", url, branch, dest);
            let mut fetch = FetchOptions::new();
            fetch.depth(1);
            let repo = RepoBuilder::new()
                .branch(&branch)
                .fetch_options(fetch)
                .clone(&url, &dest)
                .map_err(git_err)?;

            if let Some(sha) = sha {
                checkout_sha(&repo, &sha)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| EngineError::transient(format!("clone task failed: {e}")))?
    }
}

fn checkout_sha(repo: &Repository, sha: &str) -> Result<()> {
    let oid = git2::Oid::from_str(sha)
        .map_err(|e| EngineError::validation(format!("invalid sha '{sha}': {e}"), vec![]))?;
    let commit = repo.find_commit(oid).map_err(git_err)?;
    repo.checkout_tree(commit.as_object(), None).map_err(git_err)?;
    repo.set_head_detached(oid).map_err(git_err)?;
    Ok(())
}

fn git_err(e: git2::Error) -> EngineError {
    match e.class() {
        git2::ErrorClass::Net | git2::ErrorClass::Http | git2::ErrorClass::Ssh => {
            EngineError::transient(format!("git transport error: {e}"))
        }
        _ => EngineError::upstream("git", e.to_string()),
    }
}
