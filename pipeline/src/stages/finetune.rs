//! Turns each combination into an `input`/`output` training pair.

use super::dispatcher_for;
use crate::driver::{RunSummary, Stage, StageDriver};
use crate::prompts::PromptTemplate;
use checkpoint::load_records;
use remote::GenerationService;
use shared::core::config::{FinetuneConfig, RuntimeConfig};
use shared::types::{CombinationRecord, FinetuneRecord};
use shared::PipelineError;

pub const NAME: &str = "finetune";

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPair {
    pub input: String,
    pub output: String,
}

fn strip_tag<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let head = line.get(..tag.len())?;
    head.eq_ignore_ascii_case(tag).then(|| line[tag.len()..].trim())
}

/// Reads the `input:` and `output:` lines of a reply. Tags are matched
/// case-insensitively; the output runs on over any following lines until
/// another `input:` tag.
pub fn parse_pair(response: &str) -> Result<TrainingPair, PipelineError> {
    let mut input: Option<String> = None;
    let mut output: Option<Vec<&str>> = None;
    let mut in_output = false;

    for line in response.lines() {
        let trimmed = line.trim();
        if let Some(rest) = strip_tag(trimmed, "input:") {
            if input.is_none() {
                input = Some(rest.to_string());
            }
            in_output = false;
        } else if let Some(rest) = strip_tag(trimmed, "output:") {
            if output.is_none() {
                output = Some(vec![rest]);
                in_output = true;
            } else {
                in_output = false;
            }
        } else if in_output {
            if let Some(lines) = output.as_mut() {
                lines.push(trimmed);
            }
        }
    }

    let input = input.filter(|s| !s.is_empty());
    let output = output
        .map(|lines| lines.join("\n").trim().to_string())
        .filter(|s| !s.is_empty());
    match (input, output) {
        (Some(input), Some(output)) => Ok(TrainingPair { input, output }),
        (None, _) => Err(PipelineError::InvalidResponse(
            "reply has no `input:` line".to_string(),
        )),
        (_, None) => Err(PipelineError::InvalidResponse(
            "reply has no `output:` line".to_string(),
        )),
    }
}

pub struct FinetuneStage<'a> {
    generator: &'a dyn GenerationService,
    template: &'a PromptTemplate,
}

impl<'a> FinetuneStage<'a> {
    pub fn new(generator: &'a dyn GenerationService, template: &'a PromptTemplate) -> Self {
        Self {
            generator,
            template,
        }
    }

    /// Wraps the prompt stored with the combination; `{instruction}` and
    /// `{contexts}` are also available to the template.
    pub fn prompt_for(&self, combination: &CombinationRecord) -> String {
        self.template.render(&[
            ("prompt", combination.prompt.as_str()),
            ("instruction", combination.instruction.as_str()),
            ("contexts", combination.contexts.join("\n\n").as_str()),
        ])
    }
}

impl Stage for FinetuneStage<'_> {
    type Input = CombinationRecord;
    type Response = TrainingPair;
    type Output = FinetuneRecord;

    fn name(&self) -> &'static str {
        NAME
    }

    fn input_id(&self, input: &CombinationRecord) -> u64 {
        input.id
    }

    fn request(&self, input: &CombinationRecord) -> Result<TrainingPair, PipelineError> {
        let generation = self.generator.generate(&self.prompt_for(input))?;
        parse_pair(&generation.response)
    }

    fn record(
        &self,
        input: &CombinationRecord,
        outcome: Result<TrainingPair, PipelineError>,
    ) -> FinetuneRecord {
        match outcome {
            Ok(pair) => FinetuneRecord {
                id: input.id,
                input: pair.input,
                output: pair.output,
                error: None,
            },
            Err(err) => FinetuneRecord {
                id: input.id,
                input: input.instruction.clone(),
                output: String::new(),
                error: Some(err.to_string()),
            },
        }
    }
}

pub fn run(
    config: &FinetuneConfig,
    runtime: &RuntimeConfig,
    generator: &dyn GenerationService,
    template: &PromptTemplate,
) -> Result<RunSummary, PipelineError> {
    let combinations: Vec<CombinationRecord> = load_records(&config.input_file)?;
    let driver = StageDriver::open(
        &config.output_file,
        dispatcher_for(runtime)?,
        config.batch_size,
    )?;
    let stage = FinetuneStage::new(generator, template);
    driver.run(&stage, combinations, &config.input_file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_lines() {
        let pair = parse_pair("Input: How do I store water?\noutput: In sealed containers.").unwrap();
        assert_eq!(pair.input, "How do I store water?");
        assert_eq!(pair.output, "In sealed containers.");
    }

    #[test]
    fn output_continues_over_following_lines() {
        let pair = parse_pair("input: q\noutput: first\n\nsecond\n").unwrap();
        assert_eq!(pair.output, "first\n\nsecond");
    }

    #[test]
    fn preamble_is_ignored() {
        let pair = parse_pair("Sure, here it is.\n  INPUT: q  \n OUTPUT: a").unwrap();
        assert_eq!(pair, TrainingPair { input: "q".into(), output: "a".into() });
    }

    #[test]
    fn missing_parts_are_invalid_responses() {
        assert!(matches!(
            parse_pair("output: only an answer"),
            Err(PipelineError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_pair("input: only a question"),
            Err(PipelineError::InvalidResponse(_))
        ));
        assert!(matches!(parse_pair("input: q\noutput:   "), Err(PipelineError::InvalidResponse(_))));
    }

    #[test]
    fn degraded_record_keeps_the_instruction() {
        let generator = remote::mock::MockGenerator::constant("no tags");
        let template = PromptTemplate::new("{prompt}");
        let stage = FinetuneStage::new(&generator, &template);
        let combination = CombinationRecord {
            id: 5,
            instruction_id: 2,
            instruction: "why".into(),
            slice_ids: vec![],
            contexts: vec![],
            prompt: "explain why".into(),
        };
        let outcome = stage.request(&combination);
        let record = stage.record(&combination, outcome);
        assert_eq!(record.id, 5);
        assert_eq!(record.input, "why");
        assert!(record.output.is_empty());
        assert!(record.error.is_some());
    }

    #[test]
    fn the_stored_prompt_is_sent() {
        let generator = remote::mock::MockGenerator::constant("input: q\noutput: a");
        let template = PromptTemplate::new("Request: {prompt}\nTopic: {instruction}");
        let stage = FinetuneStage::new(&generator, &template);
        let combination = CombinationRecord {
            id: 0,
            instruction_id: 0,
            instruction: "water".into(),
            slice_ids: vec![3],
            contexts: vec!["boil it".into()],
            prompt: "Explain [water] using [boil it] and {contexts}".into(),
        };
        stage.request(&combination).unwrap();
        assert_eq!(
            generator.prompts(),
            vec!["Request: Explain [water] using [boil it] and {contexts}\nTopic: water".to_string()]
        );
    }
}
