//! Vector index service.
//!
//! Collections hold an `INT64` primary key `id` and one `FLOAT_VECTOR` field.
//! [`MilvusRestIndex`] speaks the Milvus RESTful API v2; the in-memory
//! implementation in [`crate::mock`] follows the same contract for tests.

use crate::retry::RetryPolicy;
use crate::types::RemoteError;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::core::config::IndexConfig;
use std::time::Duration;
use tracing::{debug, info};

pub const ID_FIELD: &str = "id";
pub const VECTOR_FIELD: &str = "embedding";

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSchema {
    pub name: String,
    pub dim: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexParams {
    pub field: String,
    pub index_type: String,
    pub metric: String,
    pub nlist: u32,
}

impl IndexParams {
    /// `IVF_FLAT` over L2 distance on the vector field.
    pub fn ivf_flat(nlist: u32) -> Self {
        Self {
            field: VECTOR_FIELD.to_string(),
            index_type: "IVF_FLAT".to_string(),
            metric: "L2".to_string(),
            nlist,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub metric: String,
    pub nprobe: u32,
}

impl SearchParams {
    pub fn l2(nprobe: u32) -> Self {
        Self {
            metric: "L2".to_string(),
            nprobe,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRow {
    pub id: u64,
    pub embedding: Vec<f32>,
}

/// One search result; smaller distances are closer under L2.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Hit {
    pub id: u64,
    pub distance: f32,
}

pub trait VectorIndex: Send + Sync {
    fn has_collection(&self, name: &str) -> Result<bool, RemoteError>;

    fn create_collection(&self, schema: &CollectionSchema) -> Result<(), RemoteError>;

    /// Writes rows, replacing any row with the same id, and returns how
    /// many the service accepted.
    fn insert(&self, collection: &str, rows: &[VectorRow]) -> Result<usize, RemoteError>;

    fn create_index(&self, collection: &str, params: &IndexParams) -> Result<(), RemoteError>;

    /// Makes the collection searchable.
    fn load(&self, collection: &str) -> Result<(), RemoteError>;

    /// Nearest neighbours for every query vector, closest first.
    fn search(
        &self,
        collection: &str,
        queries: &[Vec<f32>],
        field: &str,
        params: &SearchParams,
        limit: usize,
    ) -> Result<Vec<Vec<Hit>>, RemoteError>;

    fn disconnect(&self) -> Result<(), RemoteError>;
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Milvus client over the RESTful API v2.
pub struct MilvusRestIndex {
    endpoint: String,
    db_name: String,
    client: Client,
    retry: RetryPolicy,
}

impl MilvusRestIndex {
    /// Connects to `host:port` and checks that the database answers. Every
    /// request, the check included, is retried under `retry`.
    pub fn connect(
        config: &IndexConfig,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build HTTP client: {}", e)))?;
        let index = Self {
            endpoint: format!("http://{}:{}", config.host, config.port),
            db_name: config.db_name.clone(),
            client,
            retry,
        };
        index.call("/v2/vectordb/collections/list", json!({}))?;
        info!(endpoint = %index.endpoint, db = %index.db_name, "connected to vector index");
        Ok(index)
    }

    fn call(&self, path: &str, mut body: Value) -> Result<Value, RemoteError> {
        if let Value::Object(map) = &mut body {
            map.insert("dbName".to_string(), Value::String(self.db_name.clone()));
        }
        let url = format!("{}{}", self.endpoint, path);
        self.retry.run(|| self.send(&url, &body))
    }

    fn send(&self, url: &str, body: &Value) -> Result<Value, RemoteError> {
        debug!(%url, "vector index request");

        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    RemoteError::Transient(format!("vector index timed out: {}", e))
                } else {
                    RemoteError::Network(e.to_string())
                }
            })?;

        let status = resp.status();
        let text = resp
            .text()
            .map_err(|e| RemoteError::Network(format!("failed to read index response: {}", e)))?;
        if !status.is_success() {
            return Err(crate::client::classify_status(status.as_u16(), &text));
        }
        unwrap_envelope(&text)
    }
}

fn unwrap_envelope(text: &str) -> Result<Value, RemoteError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| RemoteError::InvalidResponse(format!("malformed index response: {}", e)))?;
    if envelope.code != 0 {
        return Err(RemoteError::Index(format!(
            "code {}: {}",
            envelope.code,
            envelope.message.unwrap_or_default()
        )));
    }
    Ok(envelope.data)
}

fn schema_body(schema: &CollectionSchema) -> Value {
    json!({
        "collectionName": schema.name,
        "schema": {
            "autoId": false,
            "enableDynamicField": false,
            "fields": [
                { "fieldName": ID_FIELD, "dataType": "Int64", "isPrimary": true },
                {
                    "fieldName": VECTOR_FIELD,
                    "dataType": "FloatVector",
                    "elementTypeParams": { "dim": schema.dim.to_string() }
                }
            ]
        }
    })
}

fn index_body(collection: &str, params: &IndexParams) -> Value {
    json!({
        "collectionName": collection,
        "indexParams": [{
            "fieldName": params.field,
            "indexName": format!("{}_idx", params.field),
            "metricType": params.metric,
            "params": { "index_type": params.index_type, "nlist": params.nlist }
        }]
    })
}

fn parse_hits(data: Value) -> Result<Vec<Hit>, RemoteError> {
    serde_json::from_value(data)
        .map_err(|e| RemoteError::InvalidResponse(format!("malformed search hits: {}", e)))
}

impl VectorIndex for MilvusRestIndex {
    fn has_collection(&self, name: &str) -> Result<bool, RemoteError> {
        let data = self.call(
            "/v2/vectordb/collections/has",
            json!({ "collectionName": name }),
        )?;
        Ok(data.get("has").and_then(Value::as_bool).unwrap_or(false))
    }

    fn create_collection(&self, schema: &CollectionSchema) -> Result<(), RemoteError> {
        self.call("/v2/vectordb/collections/create", schema_body(schema))?;
        info!(collection = %schema.name, dim = schema.dim, "created collection");
        Ok(())
    }

    fn insert(&self, collection: &str, rows: &[VectorRow]) -> Result<usize, RemoteError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let data = self.call(
            "/v2/vectordb/entities/upsert",
            json!({ "collectionName": collection, "data": rows }),
        )?;
        Ok(data
            .get("upsertCount")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(rows.len()))
    }

    fn create_index(&self, collection: &str, params: &IndexParams) -> Result<(), RemoteError> {
        self.call("/v2/vectordb/indexes/create", index_body(collection, params))?;
        info!(collection, index_type = %params.index_type, nlist = params.nlist, "created index");
        Ok(())
    }

    fn load(&self, collection: &str) -> Result<(), RemoteError> {
        self.call(
            "/v2/vectordb/collections/load",
            json!({ "collectionName": collection }),
        )?;
        Ok(())
    }

    fn search(
        &self,
        collection: &str,
        queries: &[Vec<f32>],
        field: &str,
        params: &SearchParams,
        limit: usize,
    ) -> Result<Vec<Vec<Hit>>, RemoteError> {
        // One request per query keeps hits unambiguously grouped.
        queries
            .iter()
            .map(|query| {
                let data = self.call(
                    "/v2/vectordb/entities/search",
                    json!({
                        "collectionName": collection,
                        "data": [query],
                        "annsField": field,
                        "limit": limit,
                        "outputFields": [ID_FIELD],
                        "searchParams": {
                            "metricType": params.metric,
                            "params": { "nprobe": params.nprobe }
                        }
                    }),
                )?;
                parse_hits(data)
            })
            .collect()
    }

    fn disconnect(&self) -> Result<(), RemoteError> {
        // Stateless over HTTP.
        debug!(endpoint = %self.endpoint, "disconnected from vector index");
        Ok(())
    }
}
