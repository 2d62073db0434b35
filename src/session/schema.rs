//! Schema source acquisition: process cache, then an external library, then
//! the live device. Every acquired source is cached and never invalidated.

use crate::device::{DeviceSession, SourceId};
use crate::error::SchemaError;
use crate::PinFuture;
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

/// Per-process map of module identifier to source text, optionally mirrored
/// to `<dir>/<name>@<revision>.yang`.
#[derive(Default)]
pub struct SchemaSourceCache {
    sources: RwLock<HashMap<SourceId, String>>,
    directory: Option<PathBuf>,
}

impl SchemaSourceCache {
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_directory(directory: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            sources: RwLock::new(HashMap::new()),
            directory: Some(directory.into()),
        })
    }

    pub fn get(&self, id: &SourceId) -> Option<String> {
        if let Some(text) = self.sources.read().get(id) {
            return Some(text.clone());
        }
        let path = self.directory.as_ref()?.join(id.file_name());
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                self.sources
                    .write()
                    .entry(id.clone())
                    .or_insert_with(|| text.clone());
                Some(text)
            }
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    warn!(
                        "event=schema_cache_read_failed source={} path={} error={}",
                        id,
                        path.display(),
                        err
                    );
                }
                None
            }
        }
    }

    /// Stores `text` unless the source is already cached.
    pub fn insert(&self, id: &SourceId, text: &str) -> Result<(), SchemaError> {
        {
            let mut sources = self.sources.write();
            if sources.contains_key(id) {
                return Ok(());
            }
            sources.insert(id.clone(), text.to_string());
        }
        if let Some(directory) = &self.directory {
            std::fs::create_dir_all(directory)?;
            let path = directory.join(id.file_name());
            if !path.exists() {
                std::fs::write(&path, text)?;
            }
        }
        debug!("event=schema_cached source={}", id);
        Ok(())
    }

    pub fn contains(&self, id: &SourceId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Externally configured schema source, consulted before the device.
pub trait SchemaLibrary: Send + Sync {
    fn fetch(&self, id: &SourceId) -> PinFuture<Result<Option<String>, SchemaError>>;
}

/// Library backed by a directory of `<name>@<revision>.yang` files.
pub struct DirectorySchemaLibrary {
    root: PathBuf,
}

impl DirectorySchemaLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SchemaLibrary for DirectorySchemaLibrary {
    fn fetch(&self, id: &SourceId) -> PinFuture<Result<Option<String>, SchemaError>> {
        let path = self.root.join(id.file_name());
        Box::pin(async move {
            match std::fs::read_to_string(&path) {
                Ok(text) => Ok(Some(text)),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                Err(err) => Err(SchemaError::Io(err)),
            }
        })
    }
}

#[derive(Clone)]
pub struct SchemaResolver {
    cache: Arc<SchemaSourceCache>,
    library: Option<Arc<dyn SchemaLibrary>>,
}

impl SchemaResolver {
    pub fn new(cache: Arc<SchemaSourceCache>, library: Option<Arc<dyn SchemaLibrary>>) -> Self {
        Self { cache, library }
    }

    pub fn cache(&self) -> &Arc<SchemaSourceCache> {
        &self.cache
    }

    pub async fn resolve(
        &self,
        session: &Arc<dyn DeviceSession>,
        id: &SourceId,
    ) -> Result<String, SchemaError> {
        if let Some(text) = self.cache.get(id) {
            return Ok(text);
        }
        if let Some(library) = &self.library {
            match library.fetch(id).await {
                Ok(Some(text)) => {
                    self.cache.insert(id, &text)?;
                    return Ok(text);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("event=schema_library_failed source={} error={}", id, err);
                }
            }
        }
        let text = session.schema_source(id).await?;
        self.cache.insert(id, &text)?;
        Ok(text)
    }

    /// Resolves every advertised source, returning the ones that succeeded.
    pub async fn resolve_all(
        &self,
        session: &Arc<dyn DeviceSession>,
        ids: &[SourceId],
    ) -> Vec<SourceId> {
        let mut resolved = Vec::with_capacity(ids.len());
        for id in ids {
            match self.resolve(session, id).await {
                Ok(_) => resolved.push(id.clone()),
                Err(err) => warn!(
                    "event=schema_unresolved device={} source={} error={}",
                    session.device(),
                    id,
                    err
                ),
            }
        }
        resolved
    }
}
