//! Pairs every instruction with its nearest reference slices.

use super::dispatcher_for;
use crate::driver::{RunSummary, Stage, StageDriver};
use crate::prompts::PromptTemplate;
use checkpoint::load_records;
use remote::index::VECTOR_FIELD;
use remote::{EmbeddingService, SearchParams, VectorIndex};
use shared::core::config::{IndexConfig, RetrieveConfig, RuntimeConfig};
use shared::types::{CombinationRecord, InstructionRecord, SliceRecord};
use shared::PipelineError;
use std::collections::HashMap;
use tracing::{info, warn};

pub const NAME: &str = "retrieve";

/// Slice ids and their texts, closest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Retrieved {
    pub slice_ids: Vec<u64>,
    pub contexts: Vec<String>,
}

pub struct RetrieveStage<'a> {
    embedder: &'a dyn EmbeddingService,
    index: &'a dyn VectorIndex,
    template: &'a PromptTemplate,
    collection: String,
    params: SearchParams,
    limit: usize,
    slices: HashMap<u64, String>,
}

impl<'a> RetrieveStage<'a> {
    pub fn new(
        embedder: &'a dyn EmbeddingService,
        index: &'a dyn VectorIndex,
        template: &'a PromptTemplate,
        index_config: &IndexConfig,
        slices: Vec<SliceRecord>,
    ) -> Self {
        Self {
            embedder,
            index,
            template,
            collection: index_config.collection.clone(),
            params: SearchParams::l2(index_config.nprobe),
            limit: index_config.limit,
            slices: slices.into_iter().map(|s| (s.id, s.slice)).collect(),
        }
    }

    pub fn prompt_for(&self, instruction: &str, contexts: &[String]) -> String {
        self.template.render(&[
            ("instruction", instruction),
            ("contexts", contexts.join("\n\n").as_str()),
        ])
    }
}

impl Stage for RetrieveStage<'_> {
    type Input = InstructionRecord;
    type Response = Retrieved;
    type Output = CombinationRecord;

    fn name(&self) -> &'static str {
        NAME
    }

    fn input_id(&self, input: &InstructionRecord) -> u64 {
        input.id
    }

    fn request(&self, input: &InstructionRecord) -> Result<Retrieved, PipelineError> {
        let query = self.embedder.embed(std::slice::from_ref(&input.instruction))?;
        let hits = self
            .index
            .search(&self.collection, &query, VECTOR_FIELD, &self.params, self.limit)?
            .into_iter()
            .next()
            .unwrap_or_default();

        let mut retrieved = Retrieved::default();
        for hit in hits {
            match self.slices.get(&hit.id) {
                Some(text) => {
                    retrieved.slice_ids.push(hit.id);
                    retrieved.contexts.push(text.clone());
                }
                None => warn!(
                    instruction = input.id,
                    slice = hit.id,
                    "index returned a slice missing from the reference file"
                ),
            }
        }
        Ok(retrieved)
    }

    fn record(
        &self,
        input: &InstructionRecord,
        outcome: Result<Retrieved, PipelineError>,
    ) -> CombinationRecord {
        let retrieved = outcome.unwrap_or_default();
        CombinationRecord {
            id: input.id,
            instruction_id: input.id,
            instruction: input.instruction.clone(),
            prompt: self.prompt_for(&input.instruction, &retrieved.contexts),
            slice_ids: retrieved.slice_ids,
            contexts: retrieved.contexts,
        }
    }
}

pub fn run(
    config: &RetrieveConfig,
    runtime: &RuntimeConfig,
    index_config: &IndexConfig,
    embedder: &dyn EmbeddingService,
    index: &dyn VectorIndex,
    template: &PromptTemplate,
) -> Result<RunSummary, PipelineError> {
    let slices: Vec<SliceRecord> = load_records(&config.reference_file)?;
    let instructions: Vec<InstructionRecord> = load_records(&config.input_file)?;
    let driver = StageDriver::open(
        &config.output_file,
        dispatcher_for(runtime)?,
        config.batch_size,
    )?;

    index.load(&index_config.collection)?;
    info!(collection = %index_config.collection, slices = slices.len(), "collection loaded for search");
    let stage = RetrieveStage::new(embedder, index, template, index_config, slices);
    let result = driver.run(&stage, instructions, &config.input_file);
    if let Err(e) = index.disconnect() {
        warn!(error = %e, "failed to disconnect from the vector index");
    }
    result
}
