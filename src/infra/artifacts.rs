//! Filesystem store for rendered artifacts.
//!
//! An artifact's presence at `<root>/<key>.wav` is the only record that a
//! render completed. Renderers write into a staging file inside the same
//! directory, which is renamed into place so readers never observe a partial
//! artifact.

use std::{
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};

use bytes::Bytes;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;

use crate::domain::text::{ARTIFACT_EXTENSION, ContentKey};

const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("invalid artifact name")]
    InvalidName,
    #[error("renderer produced no output")]
    Empty,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Initialise the store rooted at `root`, creating the directory if necessary.
    pub fn new(root: PathBuf) -> Result<Self, io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &ContentKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// Non-blocking existence check for the fast path.
    pub async fn exists(&self, key: &ContentKey) -> Result<bool, io::Error> {
        fs::try_exists(self.path_for(key)).await
    }

    /// Synchronous existence check, safe to call while holding a map lock.
    pub fn exists_now(&self, key: &ContentKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Create an empty staging file the renderer will write into.
    pub fn staging_file(&self) -> Result<NamedTempFile, io::Error> {
        tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(&format!(".{ARTIFACT_EXTENSION}"))
            .tempfile_in(&self.root)
    }

    /// Move a finished staging file to `destination`, a path inside this store.
    ///
    /// The size check and rename run on the blocking pool.
    pub async fn publish(
        &self,
        staging: NamedTempFile,
        destination: PathBuf,
    ) -> Result<PathBuf, ArtifactError> {
        if destination.parent() != Some(self.root.as_path()) {
            return Err(ArtifactError::InvalidName);
        }

        tokio::task::spawn_blocking(move || -> Result<PathBuf, ArtifactError> {
            persist(staging, &destination)?;
            Ok(destination)
        })
        .await
        .map_err(|err| ArtifactError::Io(io::Error::other(err)))?
    }

    /// Read a published artifact by file name.
    pub async fn read(&self, name: &str) -> Result<Bytes, ArtifactError> {
        let path = self.resolve(name)?;
        let bytes = fs::read(path).await?;
        Ok(Bytes::from(bytes))
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, ArtifactError> {
        let candidate = Path::new(name);
        let mut components = candidate.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => {
                let part = part.to_str().ok_or(ArtifactError::InvalidName)?;
                if part.starts_with('.') {
                    return Err(ArtifactError::InvalidName);
                }
                Ok(self.root.join(part))
            }
            _ => Err(ArtifactError::InvalidName),
        }
    }
}

fn persist(staging: NamedTempFile, destination: &Path) -> Result<(), ArtifactError> {
    let size = match std::fs::metadata(staging.path()) {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(ArtifactError::Empty),
        Err(err) => return Err(ArtifactError::Io(err)),
    };
    if size == 0 {
        return Err(ArtifactError::Empty);
    }

    match staging.persist_noclobber(destination) {
        Ok(_) => Ok(()),
        // Same key means same content; the existing file wins.
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(err) if err.error.kind() == ErrorKind::NotFound => Err(ArtifactError::Empty),
        Err(err) => Err(ArtifactError::Io(err.error)),
    }
}
