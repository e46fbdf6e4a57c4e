//! Label-matched pairing of instructions with reference slices.

use super::label::load_label_pool;
use crate::driver::{claim_sequence, run_span, sort_unique, RunSummary};
use crate::prompts::PromptTemplate;
use checkpoint::load_records;
use shared::core::config::CombineConfig;
use shared::types::{CombinationRecord, InstructionRecord, SliceRecord};
use shared::PipelineError;
use std::collections::HashSet;
use tracing::{debug, info};

pub const NAME: &str = "combine";

/// Every (instruction, slice) pair sharing a label, without ids.
///
/// Labels are visited in pool order, instructions and slices in id order,
/// and a pair matched through several labels appears once, at its first
/// match. The order only depends on the inputs.
pub fn plan<'a>(
    labels: &[String],
    instructions: &'a [InstructionRecord],
    slices: &'a [SliceRecord],
) -> Vec<(&'a InstructionRecord, &'a SliceRecord)> {
    let mut seen = HashSet::new();
    let mut pairs = Vec::new();
    for label in labels {
        let matching_slices: Vec<&SliceRecord> = slices
            .iter()
            .filter(|s| s.is_labeled && s.labels.contains(label))
            .collect();
        if matching_slices.is_empty() {
            debug!(label = %label, "no slice carries this label");
            continue;
        }
        for instruction in instructions
            .iter()
            .filter(|i| i.is_labeled && i.labels.contains(label))
        {
            for slice in &matching_slices {
                if seen.insert((instruction.id, slice.id)) {
                    pairs.push((instruction, *slice));
                }
            }
        }
    }
    pairs
}

pub fn run(config: &CombineConfig, template: &PromptTemplate) -> Result<RunSummary, PipelineError> {
    let span = run_span(NAME);
    let _enter = span.enter();

    let labels = load_label_pool(&config.label_file)?;
    let instructions: Vec<InstructionRecord> = load_records(&config.instruction_file)?;
    let instructions = sort_unique(instructions, |i| i.id, &config.instruction_file)?;
    let slices: Vec<SliceRecord> = load_records(&config.reference_file)?;
    let slices = sort_unique(slices, |s| s.id, &config.reference_file)?;

    let pairs = plan(&labels, &instructions, &slices);
    let (store, _lease) = claim_sequence(&config.output_file)?;
    let resume_point = store.resume_point()?;
    let mut summary = RunSummary {
        stage: NAME,
        resumed_from: resume_point,
        ..RunSummary::default()
    };

    let start = usize::try_from(resume_point).unwrap_or(usize::MAX);
    if start >= pairs.len() {
        info!(resume_point, pairs = pairs.len(), "all combinations already written");
        summary.already_complete = true;
        return Ok(summary);
    }
    info!(
        labels = labels.len(),
        instructions = instructions.len(),
        slices = slices.len(),
        pairs = pairs.len(),
        resume_point,
        "pairing by label"
    );

    let mut next_id = resume_point;
    for batch in pairs[start..].chunks(config.batch_size.max(1)) {
        let records: Vec<CombinationRecord> = batch
            .iter()
            .map(|(instruction, slice)| {
                let contexts = vec![slice.slice.clone()];
                let record = CombinationRecord {
                    id: next_id,
                    instruction_id: instruction.id,
                    instruction: instruction.instruction.clone(),
                    slice_ids: vec![slice.id],
                    prompt: template.render(&[
                        ("instruction", instruction.instruction.as_str()),
                        ("contexts", slice.slice.as_str()),
                    ]),
                    contexts,
                };
                next_id += 1;
                record
            })
            .collect();
        store.append(&records)?;
        summary.batches += 1;
        summary.written += records.len();
    }

    info!(batches = summary.batches, written = summary.written, "combination complete");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint::CheckpointStore;
    use shared::types::LabelEntry;
    use tempfile::TempDir;

    fn instruction(id: u64, labels: &[&str]) -> InstructionRecord {
        InstructionRecord {
            id,
            instruction: format!("question {}", id),
            is_labeled: !labels.is_empty(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn slice(id: u64, labels: &[&str]) -> SliceRecord {
        SliceRecord {
            id,
            source: "doc.txt".into(),
            slice: format!("slice {}", id),
            offset: 0,
            is_labeled: !labels.is_empty(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn pairs_follow_label_order_and_are_unique() {
        let labels = vec!["water".to_string(), "shelter".to_string()];
        let instructions = vec![
            instruction(0, &["water", "shelter"]),
            instruction(1, &["shelter"]),
            instruction(2, &[]),
        ];
        let slices = vec![slice(0, &["shelter"]), slice(1, &["water", "shelter"])];

        let got: Vec<(u64, u64)> = plan(&labels, &instructions, &slices)
            .iter()
            .map(|(i, s)| (i.id, s.id))
            .collect();
        assert_eq!(got, vec![(0, 1), (0, 0), (1, 0), (1, 1)]);
    }

    #[test]
    fn unlabeled_records_never_pair() {
        let labels = vec!["water".to_string()];
        let mut stale = instruction(0, &["water"]);
        stale.is_labeled = false;
        assert!(plan(&labels, &[stale], &[slice(0, &["water"])]).is_empty());
    }

    #[test]
    fn rerun_continues_after_the_written_pairs() {
        let dir = TempDir::new().unwrap();
        let write = |name: &str, lines: &[serde_json::Value]| {
            let path = dir.path().join(name);
            let store = CheckpointStore::open_or_create(&path).unwrap();
            store.append(lines).unwrap();
            path
        };
        let config = CombineConfig {
            label_file: write(
                "labels.jsonl",
                &[serde_json::to_value(LabelEntry { label: "water".into() }).unwrap()],
            ),
            instruction_file: write(
                "instructions.jsonl",
                &[
                    serde_json::to_value(instruction(0, &["water"])).unwrap(),
                    serde_json::to_value(instruction(1, &["water"])).unwrap(),
                ],
            ),
            reference_file: write(
                "slices.jsonl",
                &[
                    serde_json::to_value(slice(0, &["water"])).unwrap(),
                    serde_json::to_value(slice(1, &["water"])).unwrap(),
                ],
            ),
            output_file: dir.path().join("combinations.jsonl"),
            batch_size: 3,
        };
        let template = PromptTemplate::new("{instruction} / {contexts}");

        let first = run(&config, &template).unwrap();
        assert_eq!((first.batches, first.written), (2, 4));

        let content = std::fs::read_to_string(&config.output_file).unwrap();
        let kept: String = content.lines().take(1).map(|l| format!("{}\n", l)).collect();
        std::fs::write(&config.output_file, kept).unwrap();

        let second = run(&config, &template).unwrap();
        assert_eq!(second.resumed_from, 1);
        assert_eq!(second.written, 3);

        let records: Vec<CombinationRecord> = load_records(&config.output_file).unwrap();
        let got: Vec<(u64, u64, Vec<u64>)> = records
            .iter()
            .map(|r| (r.id, r.instruction_id, r.slice_ids.clone()))
            .collect();
        assert_eq!(
            got,
            vec![(0, 0, vec![0]), (1, 0, vec![1]), (2, 1, vec![0]), (3, 1, vec![1])]
        );
        assert_eq!(records[3].prompt, "question 1 / slice 1");
    }
}
