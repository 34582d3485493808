//! Agent-side directory requests.
//!
//! The working directory is the agent process's own, so command circuits
//! and relative upload paths opened after a change follow it.

use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::UNIX_EPOCH;

use starling_core::message::{
    DirEntry, ErrorKind, RemoteCdResponse, RemoteLsResponse, RemoteMkDirResponse,
    RemoteTmpDirResponse,
};

/// A request the agent could not carry out, answered as an error report
pub type Refusal = (ErrorKind, String);

/// Serializes changes of the process working directory
#[derive(Debug, Default)]
pub struct WorkingDir {
    lock: Mutex<()>,
}

impl WorkingDir {
    /// Current working directory.
    ///
    /// # Errors
    ///
    /// Refuses with [`ErrorKind::Generic`] if the directory is gone or
    /// unreadable.
    pub fn current(&self) -> Result<String, Refusal> {
        std::env::current_dir()
            .map(|dir| dir.display().to_string())
            .map_err(|e| (ErrorKind::Generic, format!("working directory: {e}")))
    }

    /// Move into `directory`, reporting where the agent was before.
    ///
    /// # Errors
    ///
    /// Refuses with [`ErrorKind::DirectoryChangeFailed`].
    pub fn change(&self, directory: &str) -> Result<RemoteCdResponse, Refusal> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.current()?;
        std::env::set_current_dir(directory)
            .map_err(|e| (ErrorKind::DirectoryChangeFailed, format!("{directory}: {e}")))?;
        Ok(RemoteCdResponse {
            directory: self.current()?,
            previous,
        })
    }

    /// Create `directory` and any missing parents, owner-only, then move
    /// into it.
    ///
    /// # Errors
    ///
    /// Refuses with [`ErrorKind::DirectoryCreationFailed`] or
    /// [`ErrorKind::DirectoryChangeFailed`].
    pub async fn make(&self, directory: &str) -> Result<RemoteMkDirResponse, Refusal> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder
            .create(directory)
            .await
            .map_err(|e| (ErrorKind::DirectoryCreationFailed, format!("{directory}: {e}")))?;

        Ok(RemoteMkDirResponse {
            directory: self.enter(Path::new(directory))?,
        })
    }

    /// Create a fresh directory under the system temp dir and move into it.
    ///
    /// The directory outlives the request.
    ///
    /// # Errors
    ///
    /// Refuses with [`ErrorKind::DirectoryCreationFailed`] or
    /// [`ErrorKind::DirectoryChangeFailed`].
    pub fn make_temporary(&self) -> Result<RemoteTmpDirResponse, Refusal> {
        let dir = tempfile::Builder::new()
            .prefix("starling-")
            .keep(true)
            .tempdir()
            .map_err(|e| (ErrorKind::DirectoryCreationFailed, e.to_string()))?;
        Ok(RemoteTmpDirResponse {
            directory: self.enter(dir.path())?,
        })
    }

    fn enter(&self, path: &Path) -> Result<String, Refusal> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        std::env::set_current_dir(path).map_err(|e| {
            (
                ErrorKind::DirectoryChangeFailed,
                format!("{}: {e}", path.display()),
            )
        })?;
        self.current()
    }
}

/// List `directory`, or the working directory when empty.
///
/// # Errors
///
/// Refuses with [`ErrorKind::DirectoryListFailed`] if the directory cannot
/// be read.
pub async fn list(directory: &str) -> Result<RemoteLsResponse, Refusal> {
    let target = if directory.is_empty() { "." } else { directory };
    let fail = |e: std::io::Error| (ErrorKind::DirectoryListFailed, format!("{target}: {e}"));

    let mut dir = tokio::fs::read_dir(target).await.map_err(fail)?;
    let mut entries = Vec::new();
    while let Some(entry) = dir.next_entry().await.map_err(fail)? {
        // Entries can vanish between the listing and the stat
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: meta.len(),
            mode: mode_bits(&meta),
            modified: meta
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|age| age.as_secs()),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let directory = std::path::absolute(target)
        .map_or_else(|_| target.to_string(), |dir| dir.display().to_string());
    Ok(RemoteLsResponse { directory, entries })
}

#[cfg(unix)]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(_meta: &std::fs::Metadata) -> u32 {
    0
}
