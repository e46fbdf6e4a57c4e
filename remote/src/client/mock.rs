//! In-process stand-ins for the remote services, for tests and dry runs.

use crate::client::{EmbeddingService, GenerationService};
use crate::index::{CollectionSchema, Hit, IndexParams, SearchParams, VectorIndex, VectorRow};
use crate::similarity::l2_distance;
use crate::types::{Generation, RemoteError};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type Responder = dyn Fn(&str) -> Result<String, RemoteError> + Send + Sync;

/// Generator answering from a closure, recording every prompt it sees.
pub struct MockGenerator {
    respond: Box<Responder>,
    latency: Option<Box<dyn Fn(&str) -> Duration + Send + Sync>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockGenerator {
    pub fn new(respond: impl Fn(&str) -> Result<String, RemoteError> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            latency: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Replies with the same text to every prompt.
    pub fn constant(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::new(move |_| Ok(reply.clone()))
    }

    /// Sleeps before answering, for as long as `latency` says for that prompt.
    pub fn with_latency(mut self, latency: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
        self.latency = Some(Box::new(latency));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

impl GenerationService for MockGenerator {
    fn generate(&self, prompt: &str) -> Result<Generation, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.prompts).push(prompt.to_string());
        if let Some(latency) = &self.latency {
            thread::sleep(latency(prompt));
        }
        let response = (self.respond)(prompt)?;
        Ok(Generation::new(prompt, response))
    }
}

/// Deterministic bag-of-words embedder: each lowercase word is hashed into
/// one of `dim` buckets and the vector is normalized. Texts sharing words
/// come out similar; identical texts come out identical.
pub struct MockEmbedder {
    dim: usize,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim: dim.max(1),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of `embed` calls served.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            v[(hasher.finish() % self.dim as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EmbeddingService for MockEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

#[derive(Debug, Default)]
struct MemCollection {
    dim: usize,
    rows: Vec<VectorRow>,
    indexed: bool,
    loaded: bool,
}

/// Brute-force L2 index held in memory.
#[derive(Debug, Default)]
pub struct InMemoryIndex {
    collections: Mutex<HashMap<String, MemCollection>>,
    disconnect_error: Option<String>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// An index whose `disconnect` always fails with `message`.
    pub fn failing_disconnect(message: &str) -> Self {
        Self {
            disconnect_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn row_count(&self, collection: &str) -> usize {
        lock(&self.collections)
            .get(collection)
            .map(|c| c.rows.len())
            .unwrap_or(0)
    }

    pub fn is_indexed(&self, collection: &str) -> bool {
        lock(&self.collections)
            .get(collection)
            .map(|c| c.indexed)
            .unwrap_or(false)
    }

    pub fn is_loaded(&self, collection: &str) -> bool {
        lock(&self.collections)
            .get(collection)
            .map(|c| c.loaded)
            .unwrap_or(false)
    }

    pub fn ids(&self, collection: &str) -> Vec<u64> {
        lock(&self.collections)
            .get(collection)
            .map(|c| c.rows.iter().map(|r| r.id).collect())
            .unwrap_or_default()
    }
}

fn missing(collection: &str) -> RemoteError {
    RemoteError::Index(format!("collection {} does not exist", collection))
}

impl VectorIndex for InMemoryIndex {
    fn has_collection(&self, name: &str) -> Result<bool, RemoteError> {
        Ok(lock(&self.collections).contains_key(name))
    }

    fn create_collection(&self, schema: &CollectionSchema) -> Result<(), RemoteError> {
        let mut collections = lock(&self.collections);
        if collections.contains_key(&schema.name) {
            return Err(RemoteError::Index(format!(
                "collection {} already exists",
                schema.name
            )));
        }
        collections.insert(
            schema.name.clone(),
            MemCollection {
                dim: schema.dim,
                ..MemCollection::default()
            },
        );
        Ok(())
    }

    fn insert(&self, collection: &str, rows: &[VectorRow]) -> Result<usize, RemoteError> {
        let mut collections = lock(&self.collections);
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| missing(collection))?;
        if let Some(bad) = rows.iter().find(|r| r.embedding.len() != target.dim) {
            return Err(RemoteError::Index(format!(
                "row {} has dimension {}, collection expects {}",
                bad.id,
                bad.embedding.len(),
                target.dim
            )));
        }
        for row in rows {
            match target.rows.iter_mut().find(|r| r.id == row.id) {
                Some(existing) => *existing = row.clone(),
                None => target.rows.push(row.clone()),
            }
        }
        Ok(rows.len())
    }

    fn create_index(&self, collection: &str, _params: &IndexParams) -> Result<(), RemoteError> {
        let mut collections = lock(&self.collections);
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| missing(collection))?;
        target.indexed = true;
        Ok(())
    }

    fn load(&self, collection: &str) -> Result<(), RemoteError> {
        let mut collections = lock(&self.collections);
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| missing(collection))?;
        target.loaded = true;
        Ok(())
    }

    fn search(
        &self,
        collection: &str,
        queries: &[Vec<f32>],
        _field: &str,
        _params: &SearchParams,
        limit: usize,
    ) -> Result<Vec<Vec<Hit>>, RemoteError> {
        let collections = lock(&self.collections);
        let target = collections.get(collection).ok_or_else(|| missing(collection))?;
        if !target.loaded {
            return Err(RemoteError::Index(format!(
                "collection {} is not loaded",
                collection
            )));
        }
        Ok(queries
            .iter()
            .map(|query| {
                let mut hits: Vec<Hit> = target
                    .rows
                    .iter()
                    .map(|row| Hit {
                        id: row.id,
                        distance: l2_distance(query, &row.embedding),
                    })
                    .collect();
                hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
                hits.truncate(limit);
                hits
            })
            .collect())
    }

    fn disconnect(&self) -> Result<(), RemoteError> {
        match &self.disconnect_error {
            Some(message) => Err(RemoteError::Network(message.clone())),
            None => Ok(()),
        }
    }
}
