use async_trait::async_trait;
use log::{debug, warn};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::models::Id;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("not_found")]
    NotFound,
    #[error("other: {0}")]
    Other(String),
}

/// Which record a resource file is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Answers,
    Comments,
}

impl ResourceKind {
    pub fn dir_name(self) -> &'static str {
        match self {
            ResourceKind::Answers => "answers",
            ResourceKind::Comments => "comments",
        }
    }
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Bytes plus sniffed mime type.
    async fn load(&self, kind: ResourceKind, owner: Id, name: &str) -> Result<(Vec<u8>, String), ResourceError>;
}

/// Files under `<root>/{answers|comments}/{id}/{name}`.
pub struct FsResourceStore {
    root: PathBuf,
}

impl FsResourceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from `RESOURCE_DIR`, default `resources`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("RESOURCE_DIR").unwrap_or_else(|_| "resources".into()))
    }

    fn path_for(&self, kind: ResourceKind, owner: Id, name: &str) -> Option<PathBuf> {
        if !is_plain_file_name(name) {
            return None;
        }
        Some(self.root.join(kind.dir_name()).join(owner.to_string()).join(name))
    }
}

/// A single normal path component: no separators, no `.`/`..`, not empty.
fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return false;
    }
    let mut comps = Path::new(name).components();
    matches!((comps.next(), comps.next()), (Some(Component::Normal(_)), None))
}

#[async_trait]
impl ResourceStore for FsResourceStore {
    async fn load(&self, kind: ResourceKind, owner: Id, name: &str) -> Result<(Vec<u8>, String), ResourceError> {
        let Some(path) = self.path_for(kind, owner, name) else {
            warn!("rejected resource name {name:?} for {}/{owner}", kind.dir_name());
            return Err(ResourceError::NotFound);
        };
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ResourceError::NotFound),
            Err(e) => return Err(ResourceError::Other(e.to_string())),
        };
        let mime = infer::get(&bytes)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        debug!("served resource '{}' ({mime}, {} bytes)", path.display(), bytes.len());
        Ok((bytes, mime))
    }
}
