//! Grows the instruction pool to a target size by self-instruct rounds.

use super::dispatcher_for;
use crate::dedup;
use crate::driver::{claim_sequence, run_span, RunSummary};
use crate::prompts::PromptTemplate;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use remote::{EmbeddingService, GenerationService};
use shared::core::config::{InstructConfig, RuntimeConfig};
use shared::types::InstructionRecord;
use shared::PipelineError;
use tracing::{debug, info, warn};

pub const NAME: &str = "instruct";

/// Strips whitespace and a wrapping pair of quotes; blank replies give `None`.
pub fn clean_response(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed)
        .trim();
    (!unquoted.is_empty()).then(|| unquoted.to_string())
}

pub fn run(
    config: &InstructConfig,
    runtime: &RuntimeConfig,
    generator: &dyn GenerationService,
    embedder: &dyn EmbeddingService,
    template: &PromptTemplate,
) -> Result<RunSummary, PipelineError> {
    let span = run_span(NAME);
    let _enter = span.enter();

    let dispatcher = dispatcher_for(runtime)?;
    let (store, _lease) = claim_sequence(&config.output_file)?;
    let mut rng = match config.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut summary = RunSummary {
        stage: NAME,
        resumed_from: store.resume_point()?,
        ..RunSummary::default()
    };
    let mut stale_rounds = 0usize;

    loop {
        // Reloaded every round so dedup sees what earlier rounds added.
        let existing: Vec<InstructionRecord> = store.read_all()?;
        if existing.len() >= config.generation_sum {
            if summary.batches == 0 {
                summary.already_complete = true;
            }
            info!(total = existing.len(), target = config.generation_sum, "instruction target reached");
            break;
        }
        let existing_texts: Vec<String> =
            existing.iter().map(|r| r.instruction.clone()).collect();
        let remaining = config.generation_sum - existing.len();
        let wanted = remaining.min(config.batch_size.max(1));

        let prompts: Vec<String> = (0..wanted)
            .map(|_| {
                let example = existing_texts
                    .choose(&mut rng)
                    .map(String::as_str)
                    .unwrap_or(config.seed_instruction.as_str());
                template.render(&[("example", example)])
            })
            .collect();

        // Candidates have no ids yet; a failed round is reported at the
        // first id it would have written, which is where a rerun resumes.
        let next_id = store.resume_point()?;
        let outcomes = dispatcher
            .dispatch(&prompts, |prompt| {
                generator.generate(prompt).map_err(PipelineError::from)
            })
            .map_err(|failure| {
                warn!(
                    round = summary.batches + 1,
                    candidate = failure.index,
                    resume_point = next_id,
                    "instruction round aborted"
                );
                PipelineError::PartialBatch {
                    stage: NAME,
                    id: next_id,
                    source: Box::new(failure.error),
                }
            })?;

        let mut candidates = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome {
                Ok(generation) => {
                    if let Some(text) = clean_response(&generation.response) {
                        candidates.push(text);
                    }
                }
                Err(_) => summary.degraded += 1,
            }
        }
        let generated = candidates.len();

        let mut fresh = dedup::filter(
            embedder,
            candidates,
            &existing_texts,
            config.similarity_threshold,
        )?;
        fresh.truncate(remaining);

        let records: Vec<InstructionRecord> = fresh
            .into_iter()
            .enumerate()
            .map(|(i, instruction)| InstructionRecord {
                id: next_id + i as u64,
                instruction,
                is_labeled: false,
                labels: Vec::new(),
            })
            .collect();
        store.append(&records)?;
        summary.batches += 1;
        summary.written += records.len();
        debug!(requested = wanted, generated, kept = records.len(), "instruction round finished");

        if records.is_empty() {
            stale_rounds += 1;
            if stale_rounds >= config.max_stale_rounds {
                warn!(
                    rounds = stale_rounds,
                    total = existing.len(),
                    target = config.generation_sum,
                    "no new instructions in consecutive rounds, stopping early"
                );
                break;
            }
        } else {
            stale_rounds = 0;
            info!(
                added = records.len(),
                total = existing.len() + records.len(),
                target = config.generation_sum,
                "instructions appended"
            );
        }
    }

    Ok(summary)
}
