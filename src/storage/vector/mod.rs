//! Vector store.
//!
//! [`VectorStoreClient`] manages document collections (fixed schema, IVF_FLAT
//! index) and runs similarity searches. [`MilvusConnector`] reaches a Milvus
//! server over its RESTful API; [`InMemoryVectorStore`] stands in for it in
//! tests.

mod client;
mod memory;
mod milvus;
mod session;

pub use client::{CollectionInfo, CollectionStatus, MATCH_ALL_EXPR, VectorStoreClient};
pub use memory::{
    CODE_COLLECTION_NOT_FOUND, CODE_NOT_LOADED, InMemoryVectorSession, InMemoryVectorStore,
};
pub use milvus::{MilvusConnector, MilvusSession};
pub use session::{
    CollectionSchema, DocumentRecord, FieldSpec, FieldType, IndexSpec, LoadState, MetricType,
    NOT_LOADED_CODES, SearchHit, SearchParams, SearchRequest, TEXT_FIELD, VECTOR_FIELD,
    VectorSession,
};
