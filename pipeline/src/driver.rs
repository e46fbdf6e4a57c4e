//! Resumable batch driver shared by the per-record stages.
//!
//! A run loads its inputs, asks the output sequence where to continue,
//! then pushes contiguous batches through the dispatcher and appends one
//! record per input after each batch. Killing the process at any point
//! loses at most the batch in flight.

use checkpoint::{CheckpointStore, WriterLease};
use dispatcher::BatchDispatcher;
use serde::Serialize;
use shared::PipelineError;
use std::path::Path;
use tracing::{info, info_span, warn, Span};
use uuid::Uuid;

/// A stage that turns each input record into exactly one output record
/// carrying the same id.
pub trait Stage: Sync {
    type Input: Sync;
    type Response: Send;
    type Output: Serialize;

    fn name(&self) -> &'static str;

    fn input_id(&self, input: &Self::Input) -> u64;

    /// The remote work for one item. Runs on a dispatcher worker.
    fn request(&self, input: &Self::Input) -> Result<Self::Response, PipelineError>;

    /// Builds the output record. `outcome` is an error only under the
    /// tolerate policy, in which case a degraded record is expected.
    fn record(
        &self,
        input: &Self::Input,
        outcome: Result<Self::Response, PipelineError>,
    ) -> Self::Output;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub stage: &'static str,
    pub resumed_from: u64,
    pub batches: usize,
    pub written: usize,
    pub degraded: usize,
    pub already_complete: bool,
}

/// Owns one output sequence for the duration of a run.
pub struct StageDriver {
    store: CheckpointStore,
    _lease: WriterLease,
    dispatcher: BatchDispatcher,
    batch_size: usize,
}

impl StageDriver {
    /// Takes the writer lease on `output` (creating the file if needed) and
    /// trims any record left half-written by a previous run.
    pub fn open(
        output: &Path,
        dispatcher: BatchDispatcher,
        batch_size: usize,
    ) -> Result<Self, PipelineError> {
        let (store, lease) = claim_sequence(output)?;
        Ok(Self {
            store,
            _lease: lease,
            dispatcher,
            batch_size: batch_size.max(1),
        })
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &BatchDispatcher {
        &self.dispatcher
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Processes every input whose id is at or past the resume point.
    /// `source` names the input file for error messages.
    pub fn run<S: Stage>(
        &self,
        stage: &S,
        inputs: Vec<S::Input>,
        source: &Path,
    ) -> Result<RunSummary, PipelineError> {
        let span = run_span(stage.name());
        let _enter = span.enter();

        let inputs = prepare_inputs(stage, inputs, source)?;
        let resume_point = self.store.resume_point()?;
        let start = inputs.partition_point(|input| stage.input_id(input) < resume_point);

        let mut summary = RunSummary {
            stage: stage.name(),
            resumed_from: resume_point,
            ..RunSummary::default()
        };

        if start >= inputs.len() {
            info!(resume_point, inputs = inputs.len(), "output already complete, nothing to do");
            summary.already_complete = true;
            return Ok(summary);
        }
        info!(
            resume_point,
            position = start,
            remaining = inputs.len() - start,
            batch_size = self.batch_size,
            concurrency = self.dispatcher.concurrency(),
            policy = %self.dispatcher.policy(),
            "starting"
        );

        for batch in inputs[start..].chunks(self.batch_size) {
            let outcomes = self
                .dispatcher
                .dispatch(batch, |input| stage.request(input))
                .map_err(|failure| PipelineError::PartialBatch {
                    stage: stage.name(),
                    id: stage.input_id(&batch[failure.index]),
                    source: Box::new(failure.error),
                })?;

            let mut records = Vec::with_capacity(batch.len());
            for (input, outcome) in batch.iter().zip(outcomes) {
                if let Err(err) = &outcome {
                    warn!(id = stage.input_id(input), error = %err, "writing degraded record");
                    summary.degraded += 1;
                }
                records.push(stage.record(input, outcome));
            }
            self.store.append(&records)?;

            summary.batches += 1;
            summary.written += records.len();
            info!(
                batch = summary.batches,
                first_id = stage.input_id(&batch[0]),
                last_id = stage.input_id(&batch[batch.len() - 1]),
                written = summary.written,
                "batch flushed"
            );
        }

        info!(
            batches = summary.batches,
            written = summary.written,
            degraded = summary.degraded,
            "stage complete"
        );
        Ok(summary)
    }
}

/// Sorts inputs by id and rejects empty collections and repeated ids.
pub fn prepare_inputs<S: Stage>(
    stage: &S,
    inputs: Vec<S::Input>,
    source: &Path,
) -> Result<Vec<S::Input>, PipelineError> {
    sort_unique(inputs, |input| stage.input_id(input), source)
}

/// Sorts `items` by `id`. Empty input and repeated ids are errors naming
/// `source`.
pub fn sort_unique<T>(
    mut items: Vec<T>,
    id: impl Fn(&T) -> u64,
    source: &Path,
) -> Result<Vec<T>, PipelineError> {
    if items.is_empty() {
        return Err(PipelineError::EmptyResource {
            path: source.to_path_buf(),
        });
    }
    items.sort_by_key(|item| id(item));
    if let Some(pair) = items.windows(2).find(|pair| id(&pair[0]) == id(&pair[1])) {
        return Err(PipelineError::DuplicateId {
            path: source.to_path_buf(),
            id: id(&pair[0]),
        });
    }
    Ok(items)
}

/// Opens (or creates) an output sequence for exclusive writing and trims a
/// torn final line left by an earlier run.
pub fn claim_sequence(path: &Path) -> Result<(CheckpointStore, WriterLease), PipelineError> {
    let store = CheckpointStore::open_or_create(path)?;
    let lease = WriterLease::acquire(path)?;
    store.recover_torn_tail()?;
    Ok((store, lease))
}

/// Span wrapping one stage run, tagged with a fresh run id.
pub fn run_span(stage: &'static str) -> Span {
    info_span!("stage", stage, run_id = %Uuid::new_v4())
}
