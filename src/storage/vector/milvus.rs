//! Milvus connector over the RESTful v2 API.
//!
//! Each pooled session owns its own blocking HTTP client, so a slot maps to
//! one keep-alive connection to the proxy. Every request is a `POST` to
//! `/v2/vectordb/<resource>/<action>` answered with an envelope:
//!
//! ```json
//! { "code": 0, "data": { ... } }
//! { "code": 1100, "message": "collection not loaded" }
//! ```
//!
//! A non-zero code is a backend (domain) error carrying that code; transport
//! failures and gateway errors are connection (transient) errors.

use super::session::{
    CollectionSchema, DocumentRecord, FieldType, IndexSpec, LoadState, SearchHit, SearchRequest,
    VECTOR_FIELD, VectorSession,
};
use crate::config::StoreSettings;
use crate::storage::pool::{Connector, SlotId};
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;

const BACKEND: &str = "milvus";

/// Connector creating Milvus REST sessions.
pub struct MilvusConnector {
    base_url: String,
    database: String,
    token: Option<SecretString>,
    timeout: Duration,
    connect_timeout: Duration,
    keep_alive: bool,
}

impl MilvusConnector {
    /// Creates a connector from store settings.
    ///
    /// `host` may carry a scheme (`https://milvus.example.com`); plain hosts
    /// use `http`.
    #[must_use]
    pub fn new(settings: &StoreSettings) -> Self {
        let base_url = if settings.host.contains("://") {
            format!("{}:{}", settings.host.trim_end_matches('/'), settings.port)
        } else {
            format!("http://{}:{}", settings.host, settings.port)
        };

        let token = match (&settings.username, settings.password_str()) {
            (Some(user), Some(password)) => Some(SecretString::from(format!("{user}:{password}"))),
            (None, Some(api_key)) => Some(SecretString::from(api_key.to_string())),
            _ => None,
        };

        Self {
            base_url,
            database: settings.database.clone(),
            token,
            timeout: settings.socket_timeout,
            connect_timeout: settings.connect_timeout,
            keep_alive: settings.keep_alive,
        }
    }

    /// Overrides the base URL (scheme, host and port).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Returns the base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_http_client(&self) -> Result<reqwest::blocking::Client> {
        let mut builder = reqwest::blocking::Client::builder().pool_max_idle_per_host(1);
        if !self.timeout.is_zero() {
            builder = builder.timeout(self.timeout);
        }
        if !self.connect_timeout.is_zero() {
            builder = builder.connect_timeout(self.connect_timeout);
        }
        if self.keep_alive {
            builder = builder.tcp_keepalive(Duration::from_secs(60));
        }
        builder.build().map_err(|e| Error::OperationFailed {
            operation: "milvus_client_build".to_string(),
            cause: e.to_string(),
        })
    }
}

impl Connector for MilvusConnector {
    type Connection = MilvusSession;

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn connect(&self, slot: SlotId) -> Result<MilvusSession> {
        let mut session = MilvusSession {
            client: self.build_http_client()?,
            base_url: self.base_url.clone(),
            database: self.database.clone(),
            token: self.token.clone(),
        };
        session.ping()?;
        tracing::debug!(backend = BACKEND, slot, url = %self.base_url, "Connected to Milvus");
        Ok(session)
    }

    fn probe(&self, conn: &mut MilvusSession) -> Result<()> {
        conn.ping()
    }
}

/// One Milvus REST session.
pub struct MilvusSession {
    client: reqwest::blocking::Client,
    base_url: String,
    database: String,
    token: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl MilvusSession {
    /// Posts `body` to `/v2/vectordb/{endpoint}` and unwraps the envelope.
    fn call(&self, endpoint: &str, mut body: Value) -> Result<Value> {
        if let Value::Object(map) = &mut body {
            map.insert("dbName".to_string(), Value::String(self.database.clone()));
        }

        let mut request = self
            .client
            .post(format!("{}/v2/vectordb/{endpoint}", self.base_url))
            .json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().map_err(|e| transport_error(endpoint, &e))?;

        let status = response.status();
        if matches!(status.as_u16(), 502..=504) {
            return Err(Error::Connection {
                backend: BACKEND,
                cause: format!("{endpoint}: gateway returned {status}"),
            });
        }
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(Error::Backend {
                backend: BACKEND,
                code: Some(i64::from(status.as_u16())),
                message: format!("{endpoint}: {message}"),
            });
        }

        let envelope: Envelope = response.json().map_err(|e| Error::OperationFailed {
            operation: format!("milvus_{endpoint}"),
            cause: format!("invalid response: {e}"),
        })?;

        if envelope.code != 0 {
            return Err(Error::Backend {
                backend: BACKEND,
                code: Some(envelope.code),
                message: envelope.message.unwrap_or_default(),
            });
        }
        Ok(envelope.data.unwrap_or(Value::Null))
    }
}

fn transport_error(endpoint: &str, e: &reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        tracing::debug!(
            backend = BACKEND,
            endpoint,
            is_timeout = e.is_timeout(),
            is_connect = e.is_connect(),
            "Milvus request failed"
        );
        Error::Connection {
            backend: BACKEND,
            cause: format!("{endpoint}: {e}"),
        }
    } else {
        Error::OperationFailed {
            operation: format!("milvus_{endpoint}"),
            cause: e.to_string(),
        }
    }
}

fn bool_field(data: &Value, field: &str) -> bool {
    data.get(field).and_then(Value::as_bool).unwrap_or(false)
}

fn count_field(data: &Value, field: &str) -> u64 {
    data.get(field).and_then(Value::as_u64).unwrap_or(0)
}

fn schema_json(schema: &CollectionSchema) -> Value {
    let fields: Vec<Value> = schema
        .fields
        .iter()
        .map(|f| {
            let mut field = json!({
                "fieldName": f.name,
                "dataType": f.field_type.as_str(),
            });
            if f.primary {
                field["isPrimary"] = json!(true);
            }
            match f.field_type {
                FieldType::VarChar { max_length } => {
                    field["elementTypeParams"] = json!({ "max_length": max_length });
                },
                FieldType::FloatVector { dim } => {
                    field["elementTypeParams"] = json!({ "dim": dim });
                },
                FieldType::Int64 => {},
            }
            field
        })
        .collect();

    json!({
        "autoId": schema.auto_id,
        "enableDynamicField": false,
        "fields": fields,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn parse_hit(value: &Value) -> Option<SearchHit> {
    let object = value.as_object()?;
    let id = match object.get("id")? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    let distance = object.get("distance").and_then(Value::as_f64).unwrap_or_default() as f32;
    let fields: Map<String, Value> = object
        .iter()
        .filter(|(k, _)| k.as_str() != "id" && k.as_str() != "distance")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Some(SearchHit { id, distance, fields })
}

/// Splits search output into one hit list per query.
///
/// Single-query responses come back as a flat list of hits; multi-query
/// responses as a list of lists.
fn parse_search_data(data: &Value) -> Vec<Vec<SearchHit>> {
    let Some(items) = data.as_array() else {
        return Vec::new();
    };
    if items.iter().all(Value::is_array) && !items.is_empty() {
        items
            .iter()
            .map(|group| {
                group
                    .as_array()
                    .map(|hits| hits.iter().filter_map(parse_hit).collect())
                    .unwrap_or_default()
            })
            .collect()
    } else {
        vec![items.iter().filter_map(parse_hit).collect()]
    }
}

impl VectorSession for MilvusSession {
    fn ping(&mut self) -> Result<()> {
        self.call("collections/list", json!({})).map(|_| ())
    }

    fn list_collections(&mut self) -> Result<Vec<String>> {
        let data = self.call("collections/list", json!({}))?;
        Ok(data
            .as_array()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn has_collection(&mut self, collection: &str) -> Result<bool> {
        let data = self.call("collections/has", json!({ "collectionName": collection }))?;
        Ok(bool_field(&data, "has"))
    }

    fn create_collection(&mut self, collection: &str, schema: &CollectionSchema) -> Result<()> {
        if self.has_collection(collection)? {
            return Err(Error::Backend {
                backend: BACKEND,
                code: Some(65535),
                message: format!("collection {collection} already exists"),
            });
        }
        self.call(
            "collections/create",
            json!({ "collectionName": collection, "schema": schema_json(schema) }),
        )
        .map(|_| ())
    }

    fn create_index(&mut self, collection: &str, index: &IndexSpec) -> Result<()> {
        self.call(
            "indexes/create",
            json!({
                "collectionName": collection,
                "indexParams": [{
                    "fieldName": index.field,
                    "indexName": index.field,
                    "metricType": index.metric.as_str(),
                    "params": { "index_type": index.index_type, "nlist": index.nlist },
                }],
            }),
        )
        .map(|_| ())
    }

    fn load_state(&mut self, collection: &str) -> Result<LoadState> {
        let data = self.call(
            "collections/get_load_state",
            json!({ "collectionName": collection }),
        )?;
        Ok(data
            .get("loadState")
            .and_then(Value::as_str)
            .map_or(LoadState::NotLoad, LoadState::parse))
    }

    fn has_partition(&mut self, collection: &str, partition: &str) -> Result<bool> {
        let data = self.call(
            "partitions/has",
            json!({ "collectionName": collection, "partitionName": partition }),
        )?;
        Ok(bool_field(&data, "has"))
    }

    fn create_partition(&mut self, collection: &str, partition: &str) -> Result<()> {
        self.call(
            "partitions/create",
            json!({ "collectionName": collection, "partitionName": partition }),
        )
        .map(|_| ())
    }

    fn insert(
        &mut self,
        collection: &str,
        partition: Option<&str>,
        records: &[DocumentRecord],
    ) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut body = json!({ "collectionName": collection, "data": records });
        if let Some(partition) = partition {
            body["partitionName"] = json!(partition);
        }
        let data = self.call("entities/insert", body)?;
        Ok(count_field(&data, "insertCount"))
    }

    fn flush(&mut self, collection: &str) -> Result<()> {
        self.call("collections/flush", json!({ "collectionName": collection }))
            .map(|_| ())
    }

    fn load(&mut self, collection: &str) -> Result<()> {
        self.call("collections/load", json!({ "collectionName": collection }))
            .map(|_| ())
    }

    fn release(&mut self, collection: &str) -> Result<()> {
        self.call("collections/release", json!({ "collectionName": collection }))
            .map(|_| ())
    }

    fn search(&mut self, collection: &str, request: &SearchRequest<'_>) -> Result<Vec<Vec<SearchHit>>> {
        let mut body = json!({
            "collectionName": collection,
            "data": request.vectors,
            "annsField": VECTOR_FIELD,
            "limit": request.limit,
            "outputFields": request.output_fields,
            "searchParams": {
                "metricType": request.params.metric.as_str(),
                "params": { "nprobe": request.params.nprobe },
            },
        });
        if !request.partitions.is_empty() {
            body["partitionNames"] = json!(request.partitions);
        }
        let data = self.call("entities/search", body)?;
        Ok(parse_search_data(&data))
    }

    fn delete(&mut self, collection: &str, expr: &str, partition: Option<&str>) -> Result<u64> {
        let mut body = json!({ "collectionName": collection, "filter": expr });
        if let Some(partition) = partition {
            body["partitionName"] = json!(partition);
        }
        let data = self.call("entities/delete", body)?;
        Ok(count_field(&data, "deleteCount"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreKind;

    #[test]
    fn test_base_url_from_settings() {
        let settings = StoreSettings::defaults_for(StoreKind::Vector);
        assert_eq!(MilvusConnector::new(&settings).base_url(), "http://localhost:19530");

        let settings = settings.with_address("https://milvus.example.com/", 443);
        assert_eq!(
            MilvusConnector::new(&settings).base_url(),
            "https://milvus.example.com:443"
        );
    }

    #[test]
    fn test_schema_json() {
        let value = schema_json(&CollectionSchema::documents(1024));
        assert_eq!(value["autoId"], json!(true));
        let fields = value["fields"].as_array().unwrap();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields[0]["isPrimary"], json!(true));
        assert_eq!(fields[1]["elementTypeParams"]["max_length"], json!(32));
        assert_eq!(fields[5]["dataType"], json!("FloatVector"));
        assert_eq!(fields[5]["elementTypeParams"]["dim"], json!(1024));
    }

    #[test]
    fn test_parse_search_data_single_and_multi_query() {
        let single = json!([
            { "id": 1, "distance": 0.5, "txt_content": "a" },
            { "id": "2", "distance": 0.9, "txt_content": "b" },
        ]);
        let groups = parse_search_data(&single);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0][1].id, 2);
        assert_eq!(groups[0][0].text("txt_content"), Some("a"));
        assert!(!groups[0][0].fields.contains_key("distance"));

        let multi = json!([[{ "id": 1, "distance": 0.1 }], [{ "id": 3, "distance": 0.2 }]]);
        let groups = parse_search_data(&multi);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1][0].id, 3);

        assert!(parse_search_data(&Value::Null).is_empty());
    }

    #[test]
    fn test_unreachable_server_is_transient() {
        let settings = StoreSettings::defaults_for(StoreKind::Vector);
        let mut settings = settings.with_address("127.0.0.1", 9);
        settings.connect_timeout = Duration::from_millis(200);
        settings.socket_timeout = Duration::from_millis(200);
        let err = MilvusConnector::new(&settings).connect(0).err().unwrap();
        assert!(err.is_transient(), "unexpected error: {err}");
    }
}
