//! The manifest workspace: a scratch clone of the manifest repository that a
//! release holds exclusively from clone to clean.
//!
//! libgit2 calls block, so callers on the async runtime are expected to wrap
//! these in `spawn_blocking`; `Workspace` is cheap to clone for that purpose.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use git2::build::RepoBuilder;
use git2::{
    Cred, CredentialType, FetchOptions, IndexAddOption, Oid, PushOptions, RemoteCallbacks,
    Repository, Signature,
};
use tempfile::TempDir;
use tracing::{debug, info};

const COMMIT_AUTHOR: &str = "drover";
const COMMIT_EMAIL: &str = "drover@drover.dev";

/// Where the manifests live. Immutable once constructed; cloning it produces
/// a [`Workspace`] with a private scratch directory.
#[derive(Debug, Clone, Default)]
pub struct Repo {
    /// Remote URL, e.g. `git@github.com:example/manifests`.
    pub url: String,
    /// Branch holding the manifests.
    pub branch: String,
    /// Path within the repository to the manifest files.
    pub path: String,
    /// Local path of the deploy key used to authenticate, if any.
    pub key_path: Option<PathBuf>,
}

impl Repo {
    /// Clone into a fresh scratch directory.
    pub fn clone_scratch(&self) -> Result<Workspace> {
        let dir = tempfile::Builder::new()
            .prefix("drover-working-")
            .tempdir()
            .context("creating scratch directory")?;

        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(self.callbacks());
        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch);
        if !self.branch.is_empty() {
            builder.branch(&self.branch);
        }
        builder
            .clone(&self.url, dir.path())
            .with_context(|| format!("cloning {}", self.url))?;

        debug!(url = %self.url, dir = %dir.path().display(), "cloned manifest repo");
        Ok(Workspace { repo: self.clone(), dir: Some(Arc::new(dir)) })
    }

    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let key_path = self.key_path.clone();
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, allowed| {
            let user = username_from_url.unwrap_or("git");
            if allowed.contains(CredentialType::SSH_KEY) {
                if let Some(key) = key_path.as_deref() {
                    return Cred::ssh_key(user, None, key, None);
                }
                return Cred::ssh_key_from_agent(user);
            }
            Cred::default()
        });
        callbacks
    }
}

/// A scratch clone. Dropping the last handle removes the directory, but
/// callers should prefer an explicit [`Workspace::clean`].
#[derive(Clone)]
pub struct Workspace {
    repo: Repo,
    dir: Option<Arc<TempDir>>,
}

impl Workspace {
    pub fn working_dir(&self) -> Result<&Path> {
        self.dir.as_ref().map(|d| d.path()).ok_or_else(|| anyhow!("workspace has been cleaned"))
    }

    /// The directory holding the manifests: the working copy joined with the
    /// repository sub-path.
    pub fn manifest_dir(&self) -> Result<PathBuf> {
        Ok(self.working_dir()?.join(&self.repo.path))
    }

    /// Stage everything changed since clone and push a single commit with
    /// `message` to the configured branch. Returns false when the tree is
    /// unchanged and no commit was created. A failed push leaves the working
    /// directory in place for diagnosis.
    pub fn commit_and_push(&self, message: &str) -> Result<bool> {
        let dir = self.working_dir()?;
        let repo = Repository::open(dir).context("opening working copy")?;

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let head = repo.head()?.peel_to_commit()?;
        if head.tree_id() == tree_id {
            debug!("nothing staged; skipping commit");
            return Ok(false);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now(COMMIT_AUTHOR, COMMIT_EMAIL)?;
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&head])
            .context("creating commit")?;

        let mut remote = repo.find_remote("origin").context("locating origin")?;
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", self.repo.branch);
        let mut options = PushOptions::new();
        options.remote_callbacks(self.repo.callbacks());
        remote
            .push(&[refspec.as_str()], Some(&mut options))
            .with_context(|| format!("pushing to {}", self.repo.url))?;

        info!(branch = %self.repo.branch, "pushed manifest commit");
        Ok(true)
    }

    /// Hash of the working copy's HEAD commit.
    pub fn head_hash(&self) -> Result<String> {
        let repo = Repository::open(self.working_dir()?)?;
        let hash = repo.head()?.peel_to_commit()?.id().to_string();
        Ok(hash)
    }

    /// Commits reachable from `reference` but not yet applied, newest first.
    /// `applied` (a commit hash) and its ancestors are excluded; an unknown
    /// or absent `applied` yields the full history of `reference`.
    pub fn pending_commits(&self, reference: &str, applied: Option<&str>) -> Result<Vec<String>> {
        let repo = Repository::open(self.working_dir()?)?;
        let target = repo
            .revparse_single(reference)
            .with_context(|| format!("resolving {:?}", reference))?
            .peel_to_commit()?;

        let mut walk = repo.revwalk()?;
        walk.push(target.id())?;
        if let Some(hash) = applied {
            if let Ok(oid) = Oid::from_str(hash) {
                // The applied commit may predate this clone's truncated view.
                let _ = walk.hide(oid);
            }
        }
        let mut hashes = Vec::new();
        for oid in walk {
            hashes.push(oid?.to_string());
        }
        Ok(hashes)
    }

    /// Remove the scratch directory. Safe to call repeatedly, and on a
    /// workspace that never cloned.
    pub fn clean(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Ok(dir) = Arc::try_unwrap(dir) {
                let path = dir.path().to_path_buf();
                if let Err(err) = dir.close() {
                    debug!(dir = %path.display(), error = %err, "failed to remove scratch dir");
                }
            }
        }
    }
}
