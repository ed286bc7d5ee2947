//! Vector-store session trait and the types that cross it.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field holding the embedding in document collections.
pub const VECTOR_FIELD: &str = "vec_content";
/// Field holding the text chunk returned by searches.
pub const TEXT_FIELD: &str = "txt_content";

/// Backend error codes meaning "collection not loaded".
pub const NOT_LOADED_CODES: [i64; 2] = [101, 1100];

/// Distance metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricType {
    /// Euclidean distance.
    #[default]
    L2,
    /// Inner product.
    Ip,
    /// Cosine similarity.
    Cosine,
}

impl MetricType {
    /// Returns the backend's name for the metric.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::L2 => "L2",
            Self::Ip => "IP",
            Self::Cosine => "COSINE",
        }
    }
}

/// Field data types used by the document schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// 64-bit integer.
    Int64,
    /// Bounded string.
    VarChar {
        /// Maximum length in bytes.
        max_length: usize,
    },
    /// Dense float vector.
    FloatVector {
        /// Vector dimension.
        dim: usize,
    },
}

impl FieldType {
    /// Returns the backend's name for the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int64 => "Int64",
            Self::VarChar { .. } => "VarChar",
            Self::FloatVector { .. } => "FloatVector",
        }
    }
}

/// One field of a collection schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name.
    pub name: &'static str,
    /// Data type.
    pub field_type: FieldType,
    /// Whether this is the primary key.
    pub primary: bool,
}

/// Collection schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    /// Fields in declaration order.
    pub fields: Vec<FieldSpec>,
    /// Whether primary keys are generated by the backend.
    pub auto_id: bool,
}

impl CollectionSchema {
    /// The document schema: auto-increment `id`, file and group identifiers,
    /// a text chunk and its embedding.
    #[must_use]
    pub fn documents(dimension: usize) -> Self {
        let varchar = |max_length| FieldType::VarChar { max_length };
        let field = |name, field_type| FieldSpec {
            name,
            field_type,
            primary: false,
        };
        Self {
            fields: vec![
                FieldSpec {
                    name: "id",
                    field_type: FieldType::Int64,
                    primary: true,
                },
                field("file_id", varchar(32)),
                field("file_name", varchar(256)),
                field("group_id", varchar(32)),
                field(TEXT_FIELD, varchar(2048)),
                field(VECTOR_FIELD, FieldType::FloatVector { dim: dimension }),
            ],
            auto_id: true,
        }
    }

    /// Returns the dimension of the first vector field.
    #[must_use]
    pub fn dimension(&self) -> Option<usize> {
        self.fields.iter().find_map(|f| match f.field_type {
            FieldType::FloatVector { dim } => Some(dim),
            _ => None,
        })
    }
}

/// Index definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Indexed field.
    pub field: &'static str,
    /// Index type, e.g. `IVF_FLAT`.
    pub index_type: &'static str,
    /// Distance metric.
    pub metric: MetricType,
    /// Number of IVF clusters.
    pub nlist: u32,
}

impl IndexSpec {
    /// IVF_FLAT over `vec_content`, L2, 128 clusters.
    #[must_use]
    pub const fn documents() -> Self {
        Self {
            field: VECTOR_FIELD,
            index_type: "IVF_FLAT",
            metric: MetricType::L2,
            nlist: 128,
        }
    }
}

/// Load state of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// The collection does not exist.
    NotExist,
    /// Exists but is not loaded.
    NotLoad,
    /// Loading in progress.
    Loading,
    /// Loaded and searchable.
    Loaded,
}

impl LoadState {
    /// Parses the backend's state name (`LoadStateLoaded`, ...).
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim_start_matches("LoadState") {
            "Loaded" => Self::Loaded,
            "Loading" => Self::Loading,
            "NotExist" => Self::NotExist,
            _ => Self::NotLoad,
        }
    }
}

/// Search tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Distance metric; must match the index.
    pub metric: MetricType,
    /// IVF clusters probed per query.
    pub nprobe: u32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            metric: MetricType::L2,
            nprobe: 16,
        }
    }
}

/// A similarity search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest<'a> {
    /// Query vectors.
    pub vectors: &'a [Vec<f32>],
    /// Hits per query vector.
    pub limit: usize,
    /// Tuning parameters.
    pub params: SearchParams,
    /// Partitions to search; empty searches all.
    pub partitions: &'a [String],
    /// Fields returned with each hit.
    pub output_fields: &'a [&'a str],
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Primary key.
    pub id: i64,
    /// Distance to the query vector.
    pub distance: f32,
    /// Requested output fields.
    pub fields: Map<String, Value>,
}

impl SearchHit {
    /// Returns a string output field.
    #[must_use]
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

/// A document chunk stored in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Source file identifier.
    pub file_id: String,
    /// Source file name.
    pub file_name: String,
    /// Owning group identifier.
    pub group_id: String,
    /// Text chunk.
    pub txt_content: String,
    /// Embedding of the text chunk.
    pub vec_content: Vec<f32>,
}

impl DocumentRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        group_id: impl Into<String>,
        txt_content: impl Into<String>,
        vec_content: Vec<f32>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            group_id: group_id.into(),
            txt_content: txt_content.into(),
            vec_content,
        }
    }

    /// Checks the record against the schema's field bounds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a wrong vector dimension or an
    /// over-long string field.
    pub fn validate(&self, schema: &CollectionSchema) -> Result<()> {
        for field in &schema.fields {
            match (field.name, field.field_type) {
                (VECTOR_FIELD, FieldType::FloatVector { dim }) if self.vec_content.len() != dim => {
                    return Err(Error::InvalidInput(format!(
                        "vector dimension {} does not match schema dimension {dim}",
                        self.vec_content.len()
                    )));
                },
                (name, FieldType::VarChar { max_length }) => {
                    if let Some(value) = self.text_field(name) {
                        if value.len() > max_length {
                            return Err(Error::InvalidInput(format!(
                                "{name} is {} bytes, limit is {max_length}",
                                value.len()
                            )));
                        }
                    }
                },
                _ => {},
            }
        }
        Ok(())
    }

    fn text_field(&self, name: &str) -> Option<&str> {
        match name {
            "file_id" => Some(&self.file_id),
            "file_name" => Some(&self.file_name),
            "group_id" => Some(&self.group_id),
            TEXT_FIELD => Some(&self.txt_content),
            _ => None,
        }
    }
}

/// One live connection to a vector store.
///
/// Implementations map backend failures onto the crate's error kinds:
/// transport problems are [`Error::Connection`], server-reported failures are
/// [`Error::Backend`] with the server's code.
pub trait VectorSession: Send {
    /// Cheap round trip used as the liveness probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend does not answer.
    fn ping(&mut self) -> Result<()>;

    /// Lists collection names.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    fn list_collections(&mut self) -> Result<Vec<String>>;

    /// Returns `true` if the collection exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    fn has_collection(&mut self, collection: &str) -> Result<bool>;

    /// Creates a collection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if the collection already exists or the
    /// schema is rejected.
    fn create_collection(&mut self, collection: &str, schema: &CollectionSchema) -> Result<()>;

    /// Creates an index.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    fn create_index(&mut self, collection: &str, index: &IndexSpec) -> Result<()>;

    /// Returns the collection's load state.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    fn load_state(&mut self, collection: &str) -> Result<LoadState>;

    /// Returns `true` if the partition exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    fn has_partition(&mut self, collection: &str, partition: &str) -> Result<bool>;

    /// Creates a partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    fn create_partition(&mut self, collection: &str, partition: &str) -> Result<()>;

    /// Inserts records, returning the inserted count.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    fn insert(
        &mut self,
        collection: &str,
        partition: Option<&str>,
        records: &[DocumentRecord],
    ) -> Result<u64>;

    /// Seals pending inserts.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    fn flush(&mut self, collection: &str) -> Result<()>;

    /// Loads a collection into memory for searching.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    fn load(&mut self, collection: &str) -> Result<()>;

    /// Releases a loaded collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    fn release(&mut self, collection: &str) -> Result<()>;

    /// Runs a similarity search; one hit list per query vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] with a code in [`NOT_LOADED_CODES`] when the
    /// collection is not loaded.
    fn search(&mut self, collection: &str, request: &SearchRequest<'_>) -> Result<Vec<Vec<SearchHit>>>;

    /// Deletes rows matching a filter expression, returning the deleted count.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the expression is rejected.
    fn delete(&mut self, collection: &str, expr: &str, partition: Option<&str>) -> Result<u64>;
}
