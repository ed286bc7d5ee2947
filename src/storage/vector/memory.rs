//! In-memory vector store.
//!
//! Behaves like a single-node Milvus for the operations the client uses:
//! collections must be loaded before searching (code 101 otherwise), search
//! is brute-force L2, and delete understands simple comparison filters such
//! as `id >= 0` or `group_id == "g1"`.

use super::session::{
    CollectionSchema, DocumentRecord, IndexSpec, LoadState, MetricType, SearchHit, SearchRequest,
    VectorSession,
};
use crate::storage::faults::FaultInjector;
use crate::storage::pool::{Connector, SlotId};
use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const BACKEND: &str = "vector-memory";
const DEFAULT_PARTITION: &str = "_default";

/// Code for a search against a collection that is not loaded.
pub const CODE_NOT_LOADED: i64 = 101;
/// Code for an unknown collection.
pub const CODE_COLLECTION_NOT_FOUND: i64 = 100;
/// Code for generic rejections (duplicate collection, bad filter).
pub const CODE_UNEXPECTED: i64 = 65535;

static FILTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(>=|<=|==|!=|>|<)\s*(-?\d+|"[^"]*"|'[^']*')\s*$"#)
        .unwrap_or_else(|_| unreachable!("filter pattern is valid"))
});

struct StoredRow {
    id: i64,
    partition: String,
    record: DocumentRecord,
}

struct MemCollection {
    dimension: Option<usize>,
    loaded: bool,
    indexes: Vec<IndexSpec>,
    partitions: HashSet<String>,
    rows: Vec<StoredRow>,
    next_id: i64,
}

#[derive(Default)]
struct VectorData {
    collections: HashMap<String, MemCollection>,
}

/// Shared in-memory vector store and its connector.
///
/// Cloning shares the same data and fault injector.
#[derive(Clone, Default)]
pub struct InMemoryVectorStore {
    data: Arc<Mutex<VectorData>>,
    faults: Arc<FaultInjector>,
}

impl InMemoryVectorStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fault injector driving this store.
    #[must_use]
    pub fn faults(&self) -> Arc<FaultInjector> {
        Arc::clone(&self.faults)
    }

    /// Number of rows in a collection, if it exists.
    #[must_use]
    pub fn row_count(&self, collection: &str) -> Option<usize> {
        lock(&self.data).collections.get(collection).map(|c| c.rows.len())
    }

    /// Indexes created on a collection.
    #[must_use]
    pub fn indexes(&self, collection: &str) -> Vec<IndexSpec> {
        lock(&self.data)
            .collections
            .get(collection)
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }
}

impl Connector for InMemoryVectorStore {
    type Connection = InMemoryVectorSession;

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn connect(&self, slot: SlotId) -> Result<InMemoryVectorSession> {
        self.faults.on_connect(BACKEND)?;
        Ok(InMemoryVectorSession {
            slot,
            data: Arc::clone(&self.data),
            faults: Arc::clone(&self.faults),
        })
    }

    fn probe(&self, _conn: &mut InMemoryVectorSession) -> Result<()> {
        self.faults.on_probe(BACKEND)
    }
}

/// A session on an [`InMemoryVectorStore`].
pub struct InMemoryVectorSession {
    slot: SlotId,
    data: Arc<Mutex<VectorData>>,
    faults: Arc<FaultInjector>,
}

impl InMemoryVectorSession {
    /// Slot this session was created for.
    #[must_use]
    pub const fn slot(&self) -> SlotId {
        self.slot
    }

    fn begin(&self) -> Result<MutexGuard<'_, VectorData>> {
        self.faults.on_operation(BACKEND)?;
        Ok(lock(&self.data))
    }
}

fn lock(data: &Mutex<VectorData>) -> MutexGuard<'_, VectorData> {
    data.lock().unwrap_or_else(PoisonError::into_inner)
}

fn backend_error(code: i64, message: String) -> Error {
    Error::Backend {
        backend: BACKEND,
        code: Some(code),
        message,
    }
}

fn collection_mut<'a>(data: &'a mut VectorData, name: &str) -> Result<&'a mut MemCollection> {
    data.collections
        .get_mut(name)
        .ok_or_else(|| backend_error(CODE_COLLECTION_NOT_FOUND, format!("collection not found: {name}")))
}

fn l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn field_value(row: &StoredRow, field: &str) -> Option<Value> {
    let record = &row.record;
    match field {
        "id" => Some(Value::from(row.id)),
        "file_id" => Some(Value::from(record.file_id.as_str())),
        "file_name" => Some(Value::from(record.file_name.as_str())),
        "group_id" => Some(Value::from(record.group_id.as_str())),
        "txt_content" => Some(Value::from(record.txt_content.as_str())),
        "vec_content" => Some(Value::from(record.vec_content.clone())),
        _ => None,
    }
}

/// A parsed `field op literal` filter.
struct Filter {
    field: String,
    op: String,
    literal: Value,
}

impl Filter {
    fn parse(expr: &str) -> Result<Self> {
        let captures = FILTER_RE.captures(expr).ok_or_else(|| {
            backend_error(CODE_UNEXPECTED, format!("cannot parse expression: {expr}"))
        })?;
        let raw = &captures[3];
        let literal = if raw.starts_with('"') || raw.starts_with('\'') {
            Value::from(&raw[1..raw.len() - 1])
        } else {
            raw.parse::<i64>()
                .map(Value::from)
                .map_err(|e| backend_error(CODE_UNEXPECTED, e.to_string()))?
        };
        Ok(Self {
            field: captures[1].to_string(),
            op: captures[2].to_string(),
            literal,
        })
    }

    fn matches(&self, row: &StoredRow) -> Result<bool> {
        let value = field_value(row, &self.field).ok_or_else(|| {
            backend_error(CODE_UNEXPECTED, format!("unknown field: {}", self.field))
        })?;
        let ordering = match (&value, &self.literal) {
            (Value::Number(a), Value::Number(b)) => a.as_i64().cmp(&b.as_i64()),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            _ => {
                return Err(backend_error(
                    CODE_UNEXPECTED,
                    format!("type mismatch comparing {}", self.field),
                ));
            },
        };
        Ok(match self.op.as_str() {
            ">=" => ordering.is_ge(),
            "<=" => ordering.is_le(),
            ">" => ordering.is_gt(),
            "<" => ordering.is_lt(),
            "!=" => ordering.is_ne(),
            _ => ordering.is_eq(),
        })
    }
}

impl VectorSession for InMemoryVectorSession {
    fn ping(&mut self) -> Result<()> {
        self.begin().map(|_| ())
    }

    fn list_collections(&mut self) -> Result<Vec<String>> {
        let data = self.begin()?;
        let mut names: Vec<_> = data.collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn has_collection(&mut self, collection: &str) -> Result<bool> {
        Ok(self.begin()?.collections.contains_key(collection))
    }

    fn create_collection(&mut self, collection: &str, schema: &CollectionSchema) -> Result<()> {
        let mut data = self.begin()?;
        if data.collections.contains_key(collection) {
            return Err(backend_error(
                CODE_UNEXPECTED,
                format!("collection {collection} already exists"),
            ));
        }
        data.collections.insert(
            collection.to_string(),
            MemCollection {
                dimension: schema.dimension(),
                loaded: false,
                indexes: Vec::new(),
                partitions: std::iter::once(DEFAULT_PARTITION.to_string()).collect(),
                rows: Vec::new(),
                next_id: 1,
            },
        );
        Ok(())
    }

    fn create_index(&mut self, collection: &str, index: &IndexSpec) -> Result<()> {
        let mut data = self.begin()?;
        collection_mut(&mut data, collection)?.indexes.push(index.clone());
        Ok(())
    }

    fn load_state(&mut self, collection: &str) -> Result<LoadState> {
        let data = self.begin()?;
        Ok(match data.collections.get(collection) {
            None => LoadState::NotExist,
            Some(c) if c.loaded => LoadState::Loaded,
            Some(_) => LoadState::NotLoad,
        })
    }

    fn has_partition(&mut self, collection: &str, partition: &str) -> Result<bool> {
        let mut data = self.begin()?;
        Ok(collection_mut(&mut data, collection)?.partitions.contains(partition))
    }

    fn create_partition(&mut self, collection: &str, partition: &str) -> Result<()> {
        let mut data = self.begin()?;
        collection_mut(&mut data, collection)?
            .partitions
            .insert(partition.to_string());
        Ok(())
    }

    fn insert(
        &mut self,
        collection: &str,
        partition: Option<&str>,
        records: &[DocumentRecord],
    ) -> Result<u64> {
        let mut data = self.begin()?;
        let target = collection_mut(&mut data, collection)?;
        let partition = partition.unwrap_or(DEFAULT_PARTITION);
        if !target.partitions.contains(partition) {
            return Err(backend_error(
                CODE_UNEXPECTED,
                format!("partition not found: {partition}"),
            ));
        }
        if let Some(dim) = target.dimension {
            if let Some(bad) = records.iter().find(|r| r.vec_content.len() != dim) {
                return Err(backend_error(
                    CODE_UNEXPECTED,
                    format!("dimension mismatch: expected {dim}, got {}", bad.vec_content.len()),
                ));
            }
        }
        for record in records {
            let id = target.next_id;
            target.next_id += 1;
            target.rows.push(StoredRow {
                id,
                partition: partition.to_string(),
                record: record.clone(),
            });
        }
        Ok(records.len() as u64)
    }

    fn flush(&mut self, collection: &str) -> Result<()> {
        let mut data = self.begin()?;
        collection_mut(&mut data, collection).map(|_| ())
    }

    fn load(&mut self, collection: &str) -> Result<()> {
        let mut data = self.begin()?;
        collection_mut(&mut data, collection)?.loaded = true;
        Ok(())
    }

    fn release(&mut self, collection: &str) -> Result<()> {
        let mut data = self.begin()?;
        collection_mut(&mut data, collection)?.loaded = false;
        Ok(())
    }

    fn search(&mut self, collection: &str, request: &SearchRequest<'_>) -> Result<Vec<Vec<SearchHit>>> {
        let mut data = self.begin()?;
        let target = collection_mut(&mut data, collection)?;
        if !target.loaded {
            return Err(backend_error(
                CODE_NOT_LOADED,
                format!("collection not loaded: {collection}"),
            ));
        }
        if request.params.metric != MetricType::L2 {
            return Err(backend_error(
                CODE_UNEXPECTED,
                format!("metric {} not supported", request.params.metric.as_str()),
            ));
        }

        let results: Vec<Vec<SearchHit>> = request
            .vectors
            .iter()
            .map(|query| {
                let mut scored: Vec<_> = target
                    .rows
                    .iter()
                    .filter(|row| {
                        request.partitions.is_empty() || request.partitions.contains(&row.partition)
                    })
                    .map(|row| (l2(query, &row.record.vec_content), row))
                    .collect();
                scored.sort_by(|a, b| a.0.total_cmp(&b.0));
                scored
                    .into_iter()
                    .take(request.limit)
                    .map(|(distance, row)| SearchHit {
                        id: row.id,
                        distance,
                        fields: request
                            .output_fields
                            .iter()
                            .filter_map(|f| field_value(row, f).map(|v| ((*f).to_string(), v)))
                            .collect::<Map<_, _>>(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        Ok(results)
    }

    fn delete(&mut self, collection: &str, expr: &str, partition: Option<&str>) -> Result<u64> {
        let filter = Filter::parse(expr)?;
        let mut data = self.begin()?;
        let target = collection_mut(&mut data, collection)?;

        let doomed = target
            .rows
            .iter()
            .map(|row| {
                let in_scope = partition.is_none_or(|p| p == row.partition);
                Ok(in_scope && filter.matches(row)?)
            })
            .collect::<Result<Vec<bool>>>()?;

        let before = target.rows.len();
        let mut doomed = doomed.into_iter();
        target.rows.retain(|_| !doomed.next().unwrap_or(false));
        Ok((before - target.rows.len()) as u64)
    }
}
