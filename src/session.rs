//! Multi-container load sessions and lazy cross-reference resolution.
//!
//! A [`LoadSession`] owns every container loaded together and resolves
//! external names to loaded containers on first use. Containers memoize the
//! per-slot outcome themselves; the session adds name-level memoization, so
//! a loader is consulted at most once per distinct normalized name no matter
//! how many references point at it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument};

use crate::{CrossRef, ObjectInfo, ObjectReader, ParseError, SerializedFile};

/// Supplies external containers by name on demand.
///
/// Called at most once per distinct normalized name for the lifetime of the
/// session, under the session's name lock; implementations must not call
/// back into the session. Returning `None` records the name as missing
/// permanently.
pub trait ExternalLoader: Send + Sync {
    fn load(&self, name: &str) -> Option<Arc<SerializedFile>>;
}

/// Lookup key for a container within a session: final path component of the
/// recorded external path, ASCII-lowercased. External references record
/// paths from the producer's build machine; only the file name survives
/// deployment.
pub(crate) fn normalize_name(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_ascii_lowercase()
}

/// A set of containers loaded together, indexed by normalized name.
///
/// Shared references across containers resolve within one session only;
/// two sessions never observe each other's containers.
#[derive(Default)]
pub struct LoadSession {
    files: RwLock<Vec<Arc<SerializedFile>>>,
    /// Name-level memo, including negative outcomes. `None` means the name
    /// was looked up before and is known absent.
    by_name: Mutex<HashMap<String, Option<usize>>>,
    loader: Option<Arc<dyn ExternalLoader>>,
}

impl LoadSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loader(loader: Arc<dyn ExternalLoader>) -> Self {
        Self {
            loader: Some(loader),
            ..Self::default()
        }
    }

    /// Registers an already-parsed container and returns its session index.
    /// A container whose normalized name is already present is not added
    /// again; the existing index is returned.
    pub fn add(&self, file: Arc<SerializedFile>) -> usize {
        let key = normalize_name(file.name());
        let mut by_name = self.by_name.lock();
        if let Some(Some(index)) = by_name.get(&key) {
            return *index;
        }
        let index = self.push(file);
        by_name.insert(key, Some(index));
        index
    }

    /// Parses and registers a container in one step.
    pub fn load_bytes(
        &self,
        name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<usize, ParseError> {
        let file = SerializedFile::parse(name, bytes)?;
        Ok(self.add(Arc::new(file)))
    }

    pub fn file_at(&self, index: usize) -> Option<Arc<SerializedFile>> {
        self.files.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }

    /// Session index of the container behind an external path, loading it
    /// through the configured loader on first sight of the name. Holding the
    /// name lock across the loader call is what makes the at-most-once
    /// guarantee hold under concurrent resolution.
    #[instrument(name = "LoadSession_lookup", skip(self))]
    pub(crate) fn lookup(&self, path: &str) -> Option<usize> {
        let key = normalize_name(path);
        let mut by_name = self.by_name.lock();
        if let Some(cached) = by_name.get(&key) {
            return *cached;
        }
        let loaded = self
            .loader
            .as_ref()
            .and_then(|loader| loader.load(&key))
            .map(|file| self.push(file));
        if loaded.is_none() {
            debug!(name = %key, "external container not available");
        }
        by_name.insert(key, loaded);
        loaded
    }

    /// Follows a cross-reference from an owning container to the referenced
    /// object. `None` covers the whole miss spectrum: a null reference, an
    /// unloadable external container, and an identity absent from the
    /// target's object table.
    pub fn resolve(
        &self,
        owner: &Arc<SerializedFile>,
        cross_ref: CrossRef,
    ) -> Option<ObjectRef> {
        if cross_ref.is_null() {
            return None;
        }
        let file = if cross_ref.file_index == 0 {
            Arc::clone(owner)
        } else {
            let index = owner.external_session_index(cross_ref.file_index, self)?;
            self.file_at(index)?
        };
        file.object(cross_ref.path_id)?;
        Some(ObjectRef {
            file,
            path_id: cross_ref.path_id,
        })
    }

    fn push(&self, file: Arc<SerializedFile>) -> usize {
        let mut files = self.files.write();
        files.push(file);
        files.len() - 1
    }
}

impl std::fmt::Debug for LoadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadSession")
            .field("files", &self.files.read().len())
            .field("has_loader", &self.loader.is_some())
            .finish()
    }
}

/// A resolved cross-reference: the target container plus a verified object
/// identity. Holds the container alive; decode state is created fresh per
/// [`ObjectRef::reader`] call, never cached here.
#[derive(Debug, Clone)]
pub struct ObjectRef {
    file: Arc<SerializedFile>,
    path_id: i64,
}

impl ObjectRef {
    pub fn file(&self) -> &Arc<SerializedFile> {
        &self.file
    }

    pub fn path_id(&self) -> i64 {
        self.path_id
    }

    pub fn info(&self) -> &ObjectInfo {
        // identity was verified at resolution
        self.file
            .object(self.path_id)
            .unwrap_or_else(|| unreachable!("resolved reference lost its object"))
    }

    pub fn reader(&self) -> ObjectReader<'_> {
        self.file.reader_for_info(self.info())
    }
}
