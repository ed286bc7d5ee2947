//! Vector-store client.

use super::session::{
    CollectionSchema, DocumentRecord, IndexSpec, LoadState, NOT_LOADED_CODES, SearchParams,
    SearchRequest, TEXT_FIELD, VectorSession,
};
use crate::config::StoreSettings;
use crate::storage::pool::{Connector, PoolConfig, PoolStatus, ResilientPool};
use crate::{Error, ErrorKind, Result};

/// Filter expression matching every row.
pub const MATCH_ALL_EXPR: &str = "id >= 0";

/// Whether a collection exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    /// The collection exists.
    Present,
    /// The collection does not exist, or its state could not be read.
    Absent,
}

/// Existence and load status of a collection, read fresh on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    /// Collection name.
    pub name: String,
    /// Existence.
    pub status: CollectionStatus,
    /// Whether the collection is loaded for search.
    pub loaded: bool,
}

impl CollectionInfo {
    fn absent(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CollectionStatus::Absent,
            loaded: false,
        }
    }

    fn present(name: &str, state: LoadState) -> Self {
        Self {
            name: name.to_string(),
            status: CollectionStatus::Present,
            loaded: state == LoadState::Loaded,
        }
    }

    /// Returns `true` if the collection exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.status == CollectionStatus::Present
    }
}

/// Pooled client for document collections in a vector store.
///
/// Every operation runs through the pool's reconnect-and-retry-once
/// discipline. Write paths re-raise failures; status paths fail soft.
pub struct VectorStoreClient<C>
where
    C: Connector,
    C::Connection: VectorSession,
{
    pool: ResilientPool<C>,
    schema: CollectionSchema,
}

impl<C> VectorStoreClient<C>
where
    C: Connector,
    C::Connection: VectorSession,
{
    /// Creates a client, eagerly filling the pool (best-effort).
    #[must_use]
    pub fn new(connector: C, settings: &StoreSettings, dimension: usize) -> Self {
        Self::with_pool_config(connector, PoolConfig::from_settings(settings), dimension)
    }

    /// Creates a client with an explicit pool configuration.
    #[must_use]
    pub fn with_pool_config(connector: C, config: PoolConfig, dimension: usize) -> Self {
        Self {
            pool: ResilientPool::new(connector, config),
            schema: CollectionSchema::documents(dimension),
        }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &ResilientPool<C> {
        &self.pool
    }

    /// Returns the document schema used by [`create_collection`](Self::create_collection).
    #[must_use]
    pub const fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    /// Returns pool occupancy.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Creates a document collection and its IVF_FLAT index.
    ///
    /// Returns `Ok(false)` when the backend refuses (for example, the
    /// collection already exists).
    ///
    /// # Errors
    ///
    /// Returns connectivity and unexpected failures after the slot has been
    /// reconnected.
    pub fn create_collection(&self, name: &str) -> Result<bool> {
        let schema = &self.schema;
        let index = IndexSpec::documents();
        let created = self.pool.run("create_collection", |session| {
            session.create_collection(name, schema)?;
            session.create_index(name, &index)
        });

        match created {
            Ok(()) => {
                tracing::info!(collection = name, "Created collection");
                Ok(true)
            },
            Err(e) if e.kind() == ErrorKind::Domain => {
                tracing::warn!(collection = name, error = %e, "Collection not created");
                Ok(false)
            },
            Err(e) => Err(e),
        }
    }

    /// Returns `true` if the collection exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    pub fn has_collection(&self, name: &str) -> Result<bool> {
        self.pool.run("has_collection", |session| session.has_collection(name))
    }

    /// Returns existence and a fresh load state.
    ///
    /// Once existence is confirmed any error reading the load state yields
    /// [`CollectionStatus::Absent`].
    ///
    /// # Errors
    ///
    /// Returns an error if existence itself cannot be determined.
    pub fn collection_info(&self, name: &str) -> Result<CollectionInfo> {
        if !self.has_collection(name)? {
            return Ok(CollectionInfo::absent(name));
        }

        match self.pool.run("load_state", |session| session.load_state(name)) {
            Ok(state) => Ok(CollectionInfo::present(name, state)),
            Err(e) => {
                tracing::warn!(collection = name, error = %e, "Could not read load state");
                Ok(CollectionInfo::absent(name))
            },
        }
    }

    /// Lists every collection with a fresh load state. Returns an empty list
    /// on failure.
    #[must_use]
    pub fn collection_list(&self) -> Vec<CollectionInfo> {
        let listed = self.pool.run("collection_list", |session| {
            let names = session.list_collections()?;
            names
                .iter()
                .map(|name| {
                    session
                        .load_state(name)
                        .map(|state| CollectionInfo::present(name, state))
                })
                .collect::<Result<Vec<_>>>()
        });

        listed.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to list collections");
            Vec::new()
        })
    }

    /// Returns `true` if the collection is loaded. Returns `false` on failure.
    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        match self.pool.run("is_loaded", |session| session.load_state(name)) {
            Ok(state) => state == LoadState::Loaded,
            Err(e) => {
                tracing::warn!(collection = name, error = %e, "Could not read load state");
                false
            },
        }
    }

    /// Inserts records, creating the partition first when it is named and
    /// absent, then flushes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for records that do not fit the schema,
    /// and backend failures otherwise.
    pub fn insert(&self, name: &str, records: &[DocumentRecord], partition: Option<&str>) -> Result<u64> {
        self.insert_all(name, std::slice::from_ref(&records), partition)
    }

    /// Inserts several batches with a single flush at the end.
    ///
    /// A failure part-way reconnects the slot and is re-raised; batches
    /// written before it stay written and are never sent twice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for records that do not fit the schema,
    /// and backend failures otherwise.
    pub fn insert_all<B>(&self, name: &str, batches: &[B], partition: Option<&str>) -> Result<u64>
    where
        B: AsRef<[DocumentRecord]>,
    {
        for record in batches
            .iter()
            .flat_map(|batch| <B as AsRef<[DocumentRecord]>>::as_ref(batch))
        {
            record.validate(&self.schema)?;
        }

        // Not replayed: batches already written would be inserted twice.
        let inserted = self.pool.run_once("insert", |session| {
            if let Some(partition) = partition {
                if !session.has_partition(name, partition)? {
                    session.create_partition(name, partition)?;
                }
            }
            let mut total = 0;
            for batch in batches {
                total += session.insert(name, partition, batch.as_ref())?;
            }
            session.flush(name)?;
            Ok(total)
        })?;

        tracing::debug!(collection = name, partition, inserted, "Inserted records");
        Ok(inserted)
    }

    /// Loads a collection for searching.
    ///
    /// # Errors
    ///
    /// Returns backend failures.
    pub fn load_collection(&self, name: &str) -> Result<()> {
        self.pool.run("load_collection", |session| session.load(name))
    }

    /// Releases a loaded collection.
    ///
    /// # Errors
    ///
    /// Returns backend failures.
    pub fn release_collection(&self, name: &str) -> Result<()> {
        self.pool.run("release_collection", |session| session.release(name))
    }

    /// Searches `vec_content` and returns the `txt_content` of every hit,
    /// query by query, in rank order.
    ///
    /// Defaults to `{L2, nprobe 16}`. Searching a collection that is not
    /// loaded returns an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for query vectors of the wrong
    /// dimension, and other backend failures.
    pub fn search(
        &self,
        name: &str,
        query_vectors: &[Vec<f32>],
        limit: usize,
        params: Option<SearchParams>,
        partitions: Option<&[String]>,
    ) -> Result<Vec<String>> {
        if let Some(dim) = self.schema.dimension() {
            if let Some(bad) = query_vectors.iter().find(|v| v.len() != dim) {
                return Err(Error::InvalidInput(format!(
                    "query vector dimension {} does not match schema dimension {dim}",
                    bad.len()
                )));
            }
        }

        let request = SearchRequest {
            vectors: query_vectors,
            limit,
            params: params.unwrap_or_default(),
            partitions: partitions.unwrap_or_default(),
            output_fields: &["file_name", TEXT_FIELD],
        };

        match self.pool.run("search", |session| session.search(name, &request)) {
            Ok(results) => Ok(results
                .iter()
                .flatten()
                .filter_map(|hit| hit.text(TEXT_FIELD).map(str::to_string))
                .collect()),
            Err(e) if e.backend_code().is_some_and(|code| NOT_LOADED_CODES.contains(&code)) => {
                tracing::warn!(collection = name, error = %e, "Search on unloaded collection");
                Ok(Vec::new())
            },
            Err(e) => Err(e),
        }
    }

    /// Deletes rows matching `expr`. Without an expression every row is
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns backend failures.
    pub fn delete(&self, name: &str, expr: Option<&str>, partition: Option<&str>) -> Result<u64> {
        let expr = expr.unwrap_or_else(|| {
            tracing::warn!(collection = name, "No delete expression given, deleting every row");
            MATCH_ALL_EXPR
        });
        self.pool
            .run("delete", |session| session.delete(name, expr, partition))
    }

    /// Closes the pool.
    pub fn close(&self) {
        self.pool.close();
    }
}
