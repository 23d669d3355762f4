//! The pair of companion arrays behind one dimension label.

use crate::error::{DimLabelError, Result};
use crate::label::schema::{DimensionLabelSchema, INDEXED_ARRAY_NAME, LABELLED_ARRAY_NAME};
use crate::storage::{Array, ArraySchema, EncryptionKey, QueryType, StorageManager};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Both companion arrays, open under the same mode and key.
#[derive(Debug)]
pub(crate) struct OpenPair {
    pub(crate) mode: QueryType,
    pub(crate) schema: DimensionLabelSchema,
    pub(crate) indexed: Array,
    pub(crate) labelled: Array,
}

/// One dimension label: an indexed array (index -> label) and a labelled
/// array (position -> (label, index), sorted by label).
///
/// The two arrays open and close together; a half-open pair is never
/// observable. The pair can be shared across threads; read-mode pairs
/// serve concurrent resolvers.
///
/// Each successful [`open`](Self::open) starts a new generation, which
/// resolvers use to tell a re-opened pair from the one they last ran
/// against.
///
/// # Examples
/// ```rust,ignore
/// use alopex_dimlabel::label::LabelPair;
/// use alopex_dimlabel::storage::{EncryptionKey, QueryType};
///
/// let pair = LabelPair::new(array_uri.join("__labels/x"), storage);
/// pair.open(QueryType::Read, &EncryptionKey::none())?;
/// let schema = pair.schema()?;
/// pair.close()?;
/// ```
#[derive(Debug)]
pub struct LabelPair {
    uri: PathBuf,
    storage: Arc<StorageManager>,
    state: RwLock<Option<OpenPair>>,
    generation: AtomicU64,
}

impl LabelPair {
    /// Creates a closed pair for the label stored at `uri`.
    pub fn new(uri: impl Into<PathBuf>, storage: Arc<StorageManager>) -> Self {
        Self {
            uri: uri.into(),
            storage,
            state: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Label location.
    pub fn uri(&self) -> &Path {
        &self.uri
    }

    fn read_state(&self) -> RwLockReadGuard<'_, Option<OpenPair>> {
        self.state.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, Option<OpenPair>> {
        self.state.write().unwrap_or_else(|err| err.into_inner())
    }

    /// Opens both companion arrays.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyOpen` if open, `SchemaMismatch` if a companion array
    /// does not match the stored label schema, or the storage error from
    /// opening either array. On error the pair stays closed.
    pub fn open(&self, mode: QueryType, key: &EncryptionKey) -> Result<()> {
        let mut state = self.write_state();
        if state.is_some() {
            return Err(DimLabelError::AlreadyOpen(self.uri.display().to_string()));
        }

        let schema = DimensionLabelSchema::load(&self.storage, &self.uri)?;
        let indexed = self.open_companion(
            INDEXED_ARRAY_NAME,
            &schema.indexed_array_schema()?,
            mode,
            key,
        )?;
        let labelled = match self.open_companion(
            LABELLED_ARRAY_NAME,
            &schema.labelled_array_schema()?,
            mode,
            key,
        ) {
            Ok(array) => array,
            Err(e) => {
                Self::close_quietly(indexed);
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "Opened label pair {} for {} (generation {})",
            self.uri.display(),
            mode,
            generation
        );
        *state = Some(OpenPair {
            mode,
            schema,
            indexed,
            labelled,
        });
        Ok(())
    }

    fn open_companion(
        &self,
        name: &str,
        expected: &ArraySchema,
        mode: QueryType,
        key: &EncryptionKey,
    ) -> Result<Array> {
        let mut array = Array::new(self.uri.join(name), Arc::clone(&self.storage));
        array.open(mode, key)?;
        let checked = array
            .schema()
            .and_then(|found| DimensionLabelSchema::check_companion(name, expected, found));
        if let Err(e) = checked {
            Self::close_quietly(array);
            return Err(e);
        }
        Ok(array)
    }

    fn close_quietly(mut array: Array) {
        if let Err(e) = array.close() {
            warn!("Failed to close array {}: {:?}", array.uri().display(), e);
        }
    }

    /// Closes both companion arrays. Closing a closed pair does nothing.
    ///
    /// # Errors
    ///
    /// Returns the first error from closing either array; the pair is
    /// closed regardless.
    pub fn close(&self) -> Result<()> {
        let Some(mut open) = self.write_state().take() else {
            return Ok(());
        };
        let indexed = open.indexed.close();
        let labelled = open.labelled.close();
        debug!("Closed label pair {}", self.uri.display());
        indexed.and(labelled)
    }

    /// Returns true while the pair is open.
    pub fn is_open(&self) -> bool {
        self.read_state().is_some()
    }

    /// Mode the pair is open in.
    pub fn query_type(&self) -> Option<QueryType> {
        self.read_state().as_ref().map(|open| open.mode)
    }

    /// Number of successful opens so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Label schema of the open pair.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` if the pair is closed.
    pub fn schema(&self) -> Result<DimensionLabelSchema> {
        self.with_open(|open| Ok(open.schema.clone()))
    }

    /// Runs `f` against the open arrays under a shared lock.
    pub(crate) fn with_open<R>(&self, f: impl FnOnce(&OpenPair) -> Result<R>) -> Result<R> {
        let state = self.read_state();
        let open = state
            .as_ref()
            .ok_or_else(|| DimLabelError::NotOpen(self.uri.display().to_string()))?;
        f(open)
    }
}

impl Drop for LabelPair {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(
                "Failed to close label pair {} on drop: {:?}",
                self.uri.display(),
                e
            );
        }
    }
}
