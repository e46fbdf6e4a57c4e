//! Embeds reference slices into the vector index.
//!
//! Progress lives in its own sequence: a slice id is appended there only
//! after its row has been written to the collection. Rows are upserted, so
//! replaying a batch whose progress entry was lost leaves one row per id.

use crate::driver::{claim_sequence, run_span, sort_unique, RunSummary};
use checkpoint::load_records;
use dispatcher::BatchDispatcher;
use remote::index::VECTOR_FIELD;
use remote::{CollectionSchema, EmbeddingService, IndexParams, VectorIndex, VectorRow};
use shared::core::config::{EmbedConfig, IndexConfig, RuntimeConfig};
use shared::types::{EmbeddedRecord, SliceRecord};
use shared::{FailurePolicy, PipelineError};
use tracing::{info, warn};

pub const NAME: &str = "embed";

pub fn run(
    config: &EmbedConfig,
    runtime: &RuntimeConfig,
    index_config: &IndexConfig,
    dim: usize,
    embedder: &dyn EmbeddingService,
    index: &dyn VectorIndex,
) -> Result<RunSummary, PipelineError> {
    let span = run_span(NAME);
    let _enter = span.enter();

    if runtime.failure_policy == FailurePolicy::Tolerate {
        warn!("a missing vector cannot be degraded, embedding runs fail-fast");
    }
    let dispatcher = BatchDispatcher::new(runtime.concurrency, FailurePolicy::FailFast)?;

    let result = embed_all(config, index_config, dim, &dispatcher, embedder, index);
    if let Err(e) = index.disconnect() {
        warn!(error = %e, "failed to disconnect from the vector index");
    }
    result
}

fn embed_all(
    config: &EmbedConfig,
    index_config: &IndexConfig,
    dim: usize,
    dispatcher: &BatchDispatcher,
    embedder: &dyn EmbeddingService,
    index: &dyn VectorIndex,
) -> Result<RunSummary, PipelineError> {
    let slices: Vec<SliceRecord> = load_records(&config.reference_file)?;
    let slices = sort_unique(slices, |s| s.id, &config.reference_file)?;
    let (store, _lease) = claim_sequence(&config.progress_file)?;
    let collection = index_config.collection.as_str();

    if !index.has_collection(collection)? {
        index.create_collection(&CollectionSchema {
            name: collection.to_string(),
            dim,
        })?;
    }

    let resume_point = store.resume_point()?;
    let start = slices.partition_point(|s| s.id < resume_point);
    let mut summary = RunSummary {
        stage: NAME,
        resumed_from: resume_point,
        ..RunSummary::default()
    };

    if start >= slices.len() {
        info!(resume_point, slices = slices.len(), "every slice already embedded");
        summary.already_complete = true;
    } else {
        info!(
            resume_point,
            remaining = slices.len() - start,
            batch_size = config.batch_size,
            collection,
            "embedding slices"
        );
    }

    for batch in slices[start..].chunks(config.batch_size.max(1)) {
        let vectors = embed_batch(dispatcher, embedder, batch)?;
        let mut rows = Vec::with_capacity(batch.len());
        for (slice, embedding) in batch.iter().zip(vectors) {
            if embedding.len() != dim {
                return Err(PipelineError::InvalidResponse(format!(
                    "embedding for slice {} has dimension {}, expected {}",
                    slice.id,
                    embedding.len(),
                    dim
                )));
            }
            rows.push(VectorRow {
                id: slice.id,
                embedding,
            });
        }

        let accepted = index.insert(collection, &rows)?;
        if accepted != rows.len() {
            return Err(PipelineError::Index(format!(
                "index accepted {} of {} rows",
                accepted,
                rows.len()
            )));
        }
        let progress: Vec<EmbeddedRecord> = batch
            .iter()
            .map(|s| EmbeddedRecord { id: s.id, dim })
            .collect();
        store.append(&progress)?;

        summary.batches += 1;
        summary.written += progress.len();
        info!(
            batch = summary.batches,
            first_id = batch[0].id,
            last_id = batch[batch.len() - 1].id,
            written = summary.written,
            "rows inserted"
        );
    }

    index.create_index(collection, &IndexParams::ivf_flat(index_config.nlist))?;
    index.load(collection)?;
    info!(collection, field = VECTOR_FIELD, nlist = index_config.nlist, "collection indexed and loaded");

    Ok(summary)
}

/// Splits `batch` into one piece per worker and embeds the pieces in
/// parallel. Vectors come back in slice order.
fn embed_batch(
    dispatcher: &BatchDispatcher,
    embedder: &dyn EmbeddingService,
    batch: &[SliceRecord],
) -> Result<Vec<Vec<f32>>, PipelineError> {
    let piece_len = (batch.len() + dispatcher.concurrency() - 1) / dispatcher.concurrency();
    let pieces: Vec<&[SliceRecord]> = batch.chunks(piece_len.max(1)).collect();

    let outcomes = dispatcher
        .dispatch(&pieces, |piece| {
            let texts: Vec<String> = piece.iter().map(|s| s.slice.clone()).collect();
            let vectors = embedder.embed(&texts)?;
            if vectors.len() != texts.len() {
                return Err(PipelineError::InvalidResponse(format!(
                    "embedding service returned {} vectors for {} texts",
                    vectors.len(),
                    texts.len()
                )));
            }
            Ok(vectors)
        })
        .map_err(|failure| PipelineError::PartialBatch {
            stage: NAME,
            id: pieces[failure.index][0].id,
            source: Box::new(failure.error),
        })?;

    let mut vectors = Vec::with_capacity(batch.len());
    for outcome in outcomes {
        vectors.extend(outcome?);
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint::CheckpointStore;
    use remote::mock::{InMemoryIndex, MockEmbedder};
    use remote::RemoteError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn slice(id: u64, text: &str) -> SliceRecord {
        SliceRecord {
            id,
            source: "doc.txt".into(),
            slice: text.into(),
            offset: id as usize * 10,
            is_labeled: false,
            labels: vec![],
        }
    }

    fn setup(count: u64) -> (TempDir, EmbedConfig, IndexConfig) {
        let dir = TempDir::new().unwrap();
        let reference_file = dir.path().join("slices.jsonl");
        let store = CheckpointStore::open_or_create(&reference_file).unwrap();
        let slices: Vec<SliceRecord> = (0..count)
            .map(|id| slice(id, &format!("slice number {} about topic {}", id, id % 3)))
            .collect();
        store.append(&slices).unwrap();
        let config = EmbedConfig {
            reference_file,
            batch_size: 3,
            progress_file: dir.path().join("embedded.jsonl"),
        };
        let index_config = IndexConfig {
            host: "localhost".into(),
            port: 19530,
            db_name: "default".into(),
            collection: "slices".into(),
            nprobe: 16,
            limit: 2,
            nlist: 8,
        };
        (dir, config, index_config)
    }

    fn runtime() -> RuntimeConfig {
        RuntimeConfig {
            concurrency: 2,
            failure_policy: FailurePolicy::FailFast,
        }
    }

    #[test]
    fn embeds_every_slice_then_indexes_and_loads() {
        let (_dir, config, index_config) = setup(7);
        let embedder = MockEmbedder::new(16);
        let index = InMemoryIndex::new();

        let summary = run(&config, &runtime(), &index_config, 16, &embedder, &index).unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.written, 7);
        assert_eq!(index.ids("slices").len(), 7);
        assert!(index.is_indexed("slices"));
        assert!(index.is_loaded("slices"));

        let progress: Vec<EmbeddedRecord> = load_records(&config.progress_file).unwrap();
        let ids: Vec<u64> = progress.iter().map(|r| r.id).collect();
        assert_eq!(ids, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn restart_skips_slices_with_progress_entries() {
        let (_dir, config, index_config) = setup(7);
        let embedder = MockEmbedder::new(16);
        let index = InMemoryIndex::new();
        run(&config, &runtime(), &index_config, 16, &embedder, &index).unwrap();

        // Progress lost for the last batch: its rows get rewritten, not duplicated.
        let content = std::fs::read_to_string(&config.progress_file).unwrap();
        let kept: String = content.lines().take(6).map(|l| format!("{}\n", l)).collect();
        std::fs::write(&config.progress_file, kept).unwrap();

        let before = embedder.calls();
        let summary = run(&config, &runtime(), &index_config, 16, &embedder, &index).unwrap();
        assert_eq!(summary.resumed_from, 6);
        assert_eq!(summary.written, 1);
        assert_eq!(embedder.calls() - before, 1);
        assert_eq!(index.row_count("slices"), 7);

        let again = run(&config, &runtime(), &index_config, 16, &embedder, &index).unwrap();
        assert!(again.already_complete);
    }

    struct FailingEmbedder {
        inner: MockEmbedder,
        calls: AtomicUsize,
        fail_on: usize,
    }

    impl EmbeddingService for FailingEmbedder {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RemoteError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_on {
                return Err(RemoteError::Transient("503".into()));
            }
            self.inner.embed(texts)
        }
    }

    #[test]
    fn a_failed_embedding_stops_before_recording_progress() {
        let (_dir, config, index_config) = setup(7);
        let config = EmbedConfig { batch_size: 4, ..config };
        let runtime = RuntimeConfig {
            concurrency: 1,
            failure_policy: FailurePolicy::Tolerate,
        };
        let embedder = FailingEmbedder {
            inner: MockEmbedder::new(16),
            calls: AtomicUsize::new(0),
            fail_on: 1,
        };
        let index = InMemoryIndex::new();

        let err = run(&config, &runtime, &index_config, 16, &embedder, &index).unwrap_err();
        assert!(matches!(err, PipelineError::PartialBatch { id: 4, .. }));
        assert_eq!(CheckpointStore::open(&config.progress_file).unwrap().resume_point().unwrap(), 4);
        assert_eq!(index.row_count("slices"), 4);
    }

    #[test]
    fn a_failed_disconnect_is_only_logged() {
        let (_dir, config, index_config) = setup(4);
        let embedder = MockEmbedder::new(16);
        let index = InMemoryIndex::failing_disconnect("connection reset");

        let summary = run(&config, &runtime(), &index_config, 16, &embedder, &index).unwrap();
        assert_eq!(summary.written, 4);
        assert!(index.is_loaded("slices"));
    }

    #[test]
    fn a_failed_disconnect_does_not_replace_the_embedding_error() {
        let (_dir, config, index_config) = setup(7);
        let config = EmbedConfig { batch_size: 4, ..config };
        let runtime = RuntimeConfig {
            concurrency: 1,
            failure_policy: FailurePolicy::FailFast,
        };
        let embedder = FailingEmbedder {
            inner: MockEmbedder::new(16),
            calls: AtomicUsize::new(0),
            fail_on: 0,
        };
        let index = InMemoryIndex::failing_disconnect("connection reset");

        let err = run(&config, &runtime, &index_config, 16, &embedder, &index).unwrap_err();
        assert!(matches!(err, PipelineError::PartialBatch { id: 0, .. }), "{:?}", err);
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let (_dir, config, index_config) = setup(2);
        let embedder = MockEmbedder::new(8);
        let index = InMemoryIndex::new();
        let err = run(&config, &runtime(), &index_config, 16, &embedder, &index).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidResponse(_)));
    }
}
