//! Request-scoped scratch files.
//!
//! A [`ScratchArea`] is the shared root directory. Each decode request opens a
//! [`ScratchScope`] in its own token-named subdirectory; every file acquired
//! through the scope is deleted when the scope is closed or dropped, including
//! during unwinding.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::types::RequestToken;

/// Scratch area error type.
#[derive(Debug, thiserror::Error)]
pub enum ScratchError {
    /// The scratch root or request directory could not be created.
    #[error("Failed to prepare scratch directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A scratch file could not be written.
    #[error("Failed to write scratch file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A scratch file could not be read back.
    #[error("Failed to read scratch file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The handle belongs to another scope or was already released.
    #[error("Scratch handle {0} is not live in this scope")]
    NotLive(PathBuf),
}

/// Root directory under which request scopes are created.
#[derive(Debug, Clone)]
pub struct ScratchArea {
    root: PathBuf,
}

impl ScratchArea {
    /// Use `root` as the scratch area, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ScratchError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| ScratchError::Prepare {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open a scope for one request. The token guarantees a private directory.
    ///
    /// The root is recreated if something removed it since startup.
    pub fn scope(&self, token: RequestToken) -> Result<ScratchScope, ScratchError> {
        fs::create_dir_all(&self.root).map_err(|source| ScratchError::Prepare {
            path: self.root.clone(),
            source,
        })?;
        let dir = self.root.join(format!("req-{}", token));
        fs::create_dir(&dir).map_err(|source| ScratchError::Prepare {
            path: dir.clone(),
            source,
        })?;
        tracing::trace!("Opened scratch scope {}", dir.display());
        Ok(ScratchScope {
            dir,
            live: Vec::new(),
            next_id: 0,
            closed: false,
        })
    }

    /// Number of entries currently under the root (request directories and stray files).
    pub fn entry_count(&self) -> io::Result<usize> {
        Ok(fs::read_dir(&self.root)?.count())
    }
}

/// Handle to one scratch file. Only the scope that issued it can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchHandle {
    id: u32,
    path: PathBuf,
}

impl ScratchHandle {
    /// Position of this file in its scope's acquisition order.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Owns every scratch file created for one request.
#[derive(Debug)]
pub struct ScratchScope {
    dir: PathBuf,
    live: Vec<PathBuf>,
    next_id: u32,
    closed: bool,
}

impl ScratchScope {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` to a new scratch file and take ownership of it.
    pub fn acquire(
        &mut self,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<ScratchHandle, ScratchError> {
        let id = self.next_id;
        self.next_id += 1;
        let path = self.dir.join(format!("{:02}-{}.{}", id, label, extension));

        // Track before writing so a partial write is still cleaned up.
        self.live.push(path.clone());
        fs::write(&path, bytes).map_err(|source| ScratchError::Write {
            path: path.clone(),
            source,
        })?;

        tracing::trace!("Acquired scratch file {} ({} bytes)", path.display(), bytes.len());
        Ok(ScratchHandle { id, path })
    }

    /// Read a live scratch file back.
    pub fn read(&self, handle: &ScratchHandle) -> Result<Vec<u8>, ScratchError> {
        if !self.live.contains(&handle.path) {
            return Err(ScratchError::NotLive(handle.path.clone()));
        }
        fs::read(&handle.path).map_err(|source| ScratchError::Read {
            path: handle.path.clone(),
            source,
        })
    }

    /// Delete the handle's file. Safe to call repeatedly or on a file that is already gone.
    pub fn release(&mut self, handle: &ScratchHandle) {
        if let Some(pos) = self.live.iter().position(|p| p == &handle.path) {
            let path = self.live.swap_remove(pos);
            remove_quietly(&path);
        }
    }

    /// Number of files acquired and not yet released.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Release every file and remove the request directory.
    pub fn close(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for path in self.live.drain(..) {
            remove_quietly(&path);
        }
        if let Err(e) = fs::remove_dir(&self.dir)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove scratch dir {}: {}", self.dir.display(), e);
        }
        tracing::trace!("Closed scratch scope {}", self.dir.display());
    }
}

impl Drop for ScratchScope {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Remove a file, logging and swallowing every error except "already gone".
pub fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to delete scratch file {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area() -> (tempfile::TempDir, ScratchArea) {
        let tmp = tempfile::tempdir().unwrap();
        let area = ScratchArea::new(tmp.path().join("scratch")).unwrap();
        (tmp, area)
    }

    #[test]
    fn test_acquire_writes_and_close_deletes() {
        let (_tmp, area) = area();
        let mut scope = area.scope(RequestToken::new()).unwrap();
        let handle = scope.acquire("raw", "jpg", b"hello").unwrap();

        assert_eq!(fs::read(handle.path()).unwrap(), b"hello");
        assert_eq!(scope.read(&handle).unwrap(), b"hello");
        assert_eq!(area.entry_count().unwrap(), 1);

        scope.close();
        assert!(!handle.path().exists());
        assert_eq!(area.entry_count().unwrap(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (_tmp, area) = area();
        let mut scope = area.scope(RequestToken::new()).unwrap();
        let handle = scope.acquire("variant", "png", b"x").unwrap();

        scope.release(&handle);
        scope.release(&handle);
        assert!(!handle.path().exists());
        assert_eq!(scope.live_count(), 0);
        assert!(matches!(scope.read(&handle), Err(ScratchError::NotLive(_))));
    }

    #[test]
    fn test_release_tolerates_externally_deleted_file() {
        let (_tmp, area) = area();
        let mut scope = area.scope(RequestToken::new()).unwrap();
        let handle = scope.acquire("raw", "bin", b"x").unwrap();

        fs::remove_file(handle.path()).unwrap();
        scope.release(&handle);
        assert_eq!(scope.live_count(), 0);
    }

    #[test]
    fn test_drop_cleans_up_on_panic() {
        let (_tmp, area) = area();
        let area_clone = area.clone();
        let result = std::panic::catch_unwind(move || {
            let mut scope = area_clone.scope(RequestToken::new()).unwrap();
            scope.acquire("raw", "jpg", b"a").unwrap();
            scope.acquire("optimized", "png", b"b").unwrap();
            panic!("simulated fault mid-chain");
        });
        assert!(result.is_err());
        assert_eq!(area.entry_count().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_scopes_do_not_collide() {
        let (_tmp, area) = area();
        let mut a = area.scope(RequestToken::new()).unwrap();
        let mut b = area.scope(RequestToken::new()).unwrap();
        let ha = a.acquire("raw", "jpg", b"a").unwrap();
        let hb = b.acquire("raw", "jpg", b"b").unwrap();

        assert_ne!(ha.path(), hb.path());
        assert_ne!(a.dir(), b.dir());
        drop(a);
        assert_eq!(fs::read(hb.path()).unwrap(), b"b");
        drop(b);
        assert_eq!(area.entry_count().unwrap(), 0);
    }

    #[test]
    fn test_handle_from_other_scope_is_ignored() {
        let (_tmp, area) = area();
        let mut a = area.scope(RequestToken::new()).unwrap();
        let mut b = area.scope(RequestToken::new()).unwrap();
        let ha = a.acquire("raw", "jpg", b"a").unwrap();

        b.release(&ha);
        assert!(ha.path().exists());
        assert_eq!(a.live_count(), 1);
    }

    #[test]
    fn test_scope_recreates_removed_root() {
        let (_tmp, area) = area();
        fs::remove_dir_all(area.root()).unwrap();

        let mut scope = area.scope(RequestToken::new()).unwrap();
        let handle = scope.acquire("raw", "jpg", b"a").unwrap();
        assert_eq!(scope.read(&handle).unwrap(), b"a");

        scope.close();
        assert_eq!(area.entry_count().unwrap(), 0);
    }
}
