//! The stay-failed marker: a persisted flag that stops a node from blind
//! guessing again after a guess it could not confirm.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{FailoverError, FailoverResult};

pub trait StayFailedMarker: Send {
    fn is_set(&self) -> bool;
    fn set(&mut self) -> FailoverResult<()>;
    fn clear(&mut self) -> FailoverResult<()>;
}

/// Presence-based marker file. Its contents are irrelevant.
#[derive(Debug, Clone)]
pub struct FileMarker {
    path: PathBuf,
}

impl FileMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StayFailedMarker for FileMarker {
    fn is_set(&self) -> bool {
        self.path.exists()
    }

    fn set(&mut self) -> FailoverResult<()> {
        std::fs::write(&self.path, b"stay failed\n").map_err(|source| FailoverError::Marker {
            path: self.path.clone(),
            source,
        })?;
        warn!(path = %self.path.display(), "stay-failed marker set");
        Ok(())
    }

    fn clear(&mut self) -> FailoverResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "stay-failed marker cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(FailoverError::Marker {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// Marker kept in memory, for simplex nodes and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryMarker {
    set: bool,
}

impl StayFailedMarker for MemoryMarker {
    fn is_set(&self) -> bool {
        self.set
    }

    fn set(&mut self) -> FailoverResult<()> {
        self.set = true;
        Ok(())
    }

    fn clear(&mut self) -> FailoverResult<()> {
        self.set = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_marker_is_presence_based() {
        let dir = tempfile::tempdir().unwrap();
        let mut marker = FileMarker::new(dir.path().join(".stayfailed"));
        assert!(!marker.is_set());
        marker.set().unwrap();
        assert!(marker.is_set());
        marker.clear().unwrap();
        assert!(!marker.is_set());
        // Clearing an absent marker is fine.
        marker.clear().unwrap();
    }

    #[test]
    fn unwritable_marker_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join(".stayfailed");
        let err = FileMarker::new(&path).set().unwrap_err();
        assert!(err.to_string().contains("missing-dir"));
    }
}
