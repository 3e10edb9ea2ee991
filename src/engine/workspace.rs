use crate::error::{CopyError, WorkspaceError};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use std::time::{Duration, SystemTime};

/// Every workspace directory name starts with this.
pub(crate) const WORKSPACE_PREFIX: &str = "histmapseg_";

const SUFFIX_LEN: usize = 8;
const NAME_ATTEMPTS: usize = 16;

/// A per-job working directory. Owned by exactly one job.
#[derive(Debug)]
pub(crate) struct Workspace {
    path: PathBuf,
    id: String,
}

impl Workspace {
    /// Create a fresh, uniquely named directory under `root`.
    pub async fn create(root: &Path) -> Result<Self, WorkspaceError> {
        let wrap = |source| WorkspaceError {
            root: root.to_path_buf(),
            source,
        };
        tokio::fs::create_dir_all(root).await.map_err(wrap)?;

        // create_dir fails on an existing name, so a collision never hands out a shared dir.
        let mut collision = None;
        for _ in 0..NAME_ATTEMPTS {
            let id = random_suffix();
            let path = root.join(format!("{WORKSPACE_PREFIX}{id}"));
            match tokio::fs::create_dir(&path).await {
                Ok(()) => return Ok(Self { path, id }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => collision = Some(e),
                Err(e) => return Err(wrap(e)),
            }
        }
        Err(wrap(collision.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "no free workspace name",
            )
        })))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Copy `source` into the workspace root under its bare file name.
    ///
    /// Never overwrites: an existing file of the same name is an error.
    pub async fn copy_into(&self, source: &Path) -> Result<PathBuf, CopyError> {
        let name = source
            .file_name()
            .ok_or_else(|| CopyError::InvalidName(source.to_path_buf()))?;
        let dest = self.path.join(name);
        let io_err = |e: std::io::Error| CopyError::Io {
            from: source.to_path_buf(),
            source: e,
        };

        let mut src = tokio::fs::File::open(source).await.map_err(io_err)?;
        let mut dst = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&dest)
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(CopyError::Exists(dest))
            }
            Err(e) => return Err(io_err(e)),
        };
        tokio::io::copy(&mut src, &mut dst).await.map_err(io_err)?;
        dst.flush().await.map_err(io_err)?;
        let perms = src.metadata().await.map_err(io_err)?.permissions();
        tokio::fs::set_permissions(&dest, perms)
            .await
            .map_err(io_err)?;
        Ok(dest)
    }

    pub async fn remove(self) -> std::io::Result<()> {
        tokio::fs::remove_dir_all(&self.path).await
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect()
}

/// Remove workspaces under `root` not modified for at least `ttl`.
///
/// Returns how many were removed. A missing root counts as empty.
pub(crate) async fn sweep_stale(root: &Path, ttl: Duration) -> std::io::Result<usize> {
    let mut rd = match tokio::fs::read_dir(root).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = rd.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(WORKSPACE_PREFIX) {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_dir() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or(Duration::ZERO);
        if age >= ttl {
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "failed to remove stale workspace")
                }
            }
        }
    }
    Ok(removed)
}
