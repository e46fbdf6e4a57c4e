//! LLM-as-classifier labelling of slices or instructions against a fixed
//! label pool.

use super::dispatcher_for;
use crate::driver::{RunSummary, Stage, StageDriver};
use crate::prompts::PromptTemplate;
use checkpoint::load_records;
use once_cell::sync::Lazy;
use regex::Regex;
use remote::GenerationService;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::core::config::{LabelConfig, RuntimeConfig};
use shared::types::{InstructionRecord, LabelEntry, LabelKind, Record, SliceRecord};
use shared::PipelineError;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

pub const NAME: &str = "label";

static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r"'(.*?)'").expect("static regex"));

/// A record the classifier can label.
pub trait Labelable: Record + Clone + Serialize + DeserializeOwned + Send + Sync {
    fn text(&self) -> &str;
    fn apply_labels(&mut self, labels: Option<Vec<String>>);
}

impl Labelable for SliceRecord {
    fn text(&self) -> &str {
        &self.slice
    }

    fn apply_labels(&mut self, labels: Option<Vec<String>>) {
        self.is_labeled = labels.is_some();
        self.labels = labels.unwrap_or_default();
    }
}

impl Labelable for InstructionRecord {
    fn text(&self) -> &str {
        &self.instruction
    }

    fn apply_labels(&mut self, labels: Option<Vec<String>>) {
        self.is_labeled = labels.is_some();
        self.labels = labels.unwrap_or_default();
    }
}

/// Loads the label pool: trimmed, non-empty, first occurrence wins.
pub fn load_label_pool(path: &Path) -> Result<Vec<String>, PipelineError> {
    let entries: Vec<LabelEntry> = load_records(path)?;
    let mut seen = HashSet::new();
    let labels: Vec<String> = entries
        .into_iter()
        .map(|e| e.label.trim().to_string())
        .filter(|l| !l.is_empty() && seen.insert(l.clone()))
        .collect();
    if labels.is_empty() {
        return Err(PipelineError::EmptyResource {
            path: path.to_path_buf(),
        });
    }
    Ok(labels)
}

/// Single-quoted strings in `response` that belong to `pool`, in order of
/// first appearance. Anything else is dropped.
pub fn extract_labels(response: &str, pool: &HashSet<String>) -> (Vec<String>, Vec<String>) {
    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for cap in QUOTED.captures_iter(response) {
        let label = cap[1].trim().to_string();
        if pool.contains(&label) {
            if !kept.contains(&label) {
                kept.push(label);
            }
        } else {
            dropped.push(label);
        }
    }
    (kept, dropped)
}

pub struct LabelStage<'a, R> {
    generator: &'a dyn GenerationService,
    template: &'a PromptTemplate,
    pool: HashSet<String>,
    pool_listing: String,
    _record: std::marker::PhantomData<fn() -> R>,
}

impl<'a, R: Labelable> LabelStage<'a, R> {
    pub fn new(
        generator: &'a dyn GenerationService,
        template: &'a PromptTemplate,
        labels: &[String],
    ) -> Self {
        let quoted: Vec<String> = labels.iter().map(|l| format!("'{}'", l)).collect();
        Self {
            generator,
            template,
            pool: labels.iter().cloned().collect(),
            pool_listing: format!("[{}]", quoted.join(", ")),
            _record: std::marker::PhantomData,
        }
    }

    pub fn prompt_for(&self, record: &R) -> String {
        self.template
            .render(&[("labels", self.pool_listing.as_str()), ("text", record.text())])
    }
}

impl<'a, R: Labelable> Stage for LabelStage<'a, R> {
    type Input = R;
    type Response = Vec<String>;
    type Output = R;

    fn name(&self) -> &'static str {
        NAME
    }

    fn input_id(&self, input: &R) -> u64 {
        input.id()
    }

    fn request(&self, input: &R) -> Result<Vec<String>, PipelineError> {
        let generation = self.generator.generate(&self.prompt_for(input))?;
        let (kept, dropped) = extract_labels(&generation.response, &self.pool);
        if !dropped.is_empty() {
            debug!(id = input.id(), ?dropped, "ignored labels outside the pool");
        }
        Ok(kept)
    }

    fn record(&self, input: &R, outcome: Result<Vec<String>, PipelineError>) -> R {
        let mut record = input.clone();
        record.apply_labels(outcome.ok());
        record
    }
}

pub fn run(
    config: &LabelConfig,
    runtime: &RuntimeConfig,
    generator: &dyn GenerationService,
    template: &PromptTemplate,
) -> Result<RunSummary, PipelineError> {
    match config.kind {
        LabelKind::Slice => run_typed::<SliceRecord>(config, runtime, generator, template),
        LabelKind::Instruction => {
            run_typed::<InstructionRecord>(config, runtime, generator, template)
        }
    }
}

fn run_typed<R: Labelable>(
    config: &LabelConfig,
    runtime: &RuntimeConfig,
    generator: &dyn GenerationService,
    template: &PromptTemplate,
) -> Result<RunSummary, PipelineError> {
    let labels = load_label_pool(&config.label_pool)?;
    let inputs: Vec<R> = load_records(&config.input_file)?;
    let driver = StageDriver::open(
        &config.output_file,
        dispatcher_for(runtime)?,
        config.batch_size,
    )?;
    let stage = LabelStage::<R>::new(generator, template, &labels);
    driver.run(&stage, inputs, &config.input_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(labels: &[&str]) -> HashSet<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn quoted_labels_from_the_pool_are_kept() {
        let (kept, dropped) = extract_labels(
            "output: ['Water Safety', 'Shelter', 'Invented']",
            &pool(&["Water Safety", "Shelter"]),
        );
        assert_eq!(kept, vec!["Water Safety", "Shelter"]);
        assert_eq!(dropped, vec!["Invented"]);
    }

    #[test]
    fn repeated_labels_are_kept_once() {
        let (kept, _) = extract_labels("'A' then 'A' and 'B'", &pool(&["A", "B"]));
        assert_eq!(kept, vec!["A", "B"]);
    }

    #[test]
    fn no_quotes_means_no_labels() {
        let (kept, dropped) = extract_labels("Shelter", &pool(&["Shelter"]));
        assert!(kept.is_empty() && dropped.is_empty());
    }

    #[test]
    fn degraded_records_stay_unlabeled() {
        let mut record = InstructionRecord {
            id: 4,
            instruction: "q".into(),
            is_labeled: false,
            labels: vec![],
        };
        record.apply_labels(None);
        assert!(!record.is_labeled);
        record.apply_labels(Some(vec!["A".into()]));
        assert!(record.is_labeled);
        assert_eq!(record.labels, vec!["A"]);
    }

    #[test]
    fn label_pool_rejects_blank_pools() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("labels.jsonl");
        std::fs::write(&path, "{\"label\": \"  \"}\n").unwrap();
        assert!(matches!(
            load_label_pool(&path),
            Err(PipelineError::EmptyResource { .. })
        ));
        std::fs::write(&path, "{\"label\": \"B\"}\n{\"label\": \"A\"}\n{\"label\": \"B\"}\n").unwrap();
        assert_eq!(load_label_pool(&path).unwrap(), vec!["B", "A"]);
    }
}
