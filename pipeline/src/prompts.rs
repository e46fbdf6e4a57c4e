//! Prompt templates with `{placeholder}` substitution.
//!
//! Built-in templates are deliberately plain; deployments supply their own
//! through the `*_PROMPT_TEMPLATE` variables.

use shared::core::config::TemplateOverrides;
use shared::core::constants::{
    FINETUNE_PROMPT_TEMPLATE, INSTRUCTION_PROMPT_TEMPLATE, LABEL_PROMPT_TEMPLATE,
    RETRIEVE_PROMPT_TEMPLATE,
};
use shared::{ConfigError, PipelineError};
use std::path::Path;

const DEFAULT_INSTRUCTION: &str = "\
You write questions for an instruction-tuning dataset.
Here is an example question:
{example}
Write one new question on a related but different aspect of the same topic.
Reply with the question only.";

const DEFAULT_LABEL: &str = "\
Classify the text below using only labels from this set: {labels}
Choose at least one label. Reply with the chosen labels as a list of
single-quoted strings, for example ['first label', 'second label'].
Text:
{text}";

const DEFAULT_RETRIEVE: &str = "\
Provide a thorough and accurate explanation of [{instruction}]. Use the
following reference material where it is relevant, otherwise answer from
general knowledge: [{contexts}]";

const DEFAULT_FINETUNE: &str = "\
Answer the request below, then write it up as one question and its answer.
Request:
{prompt}
Reply with exactly two lines:
input: <the question>
output: <the answer>";

#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Loads a template file and checks that every `required` placeholder
    /// occurs in it.
    pub fn from_file(
        path: &Path,
        key: &'static str,
        required: &[&str],
    ) -> Result<Self, PipelineError> {
        if !path.is_file() {
            return Err(PipelineError::MissingResource {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|name| !text.contains(&format!("{{{}}}", name)))
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Invalid {
                key,
                value: path.display().to_string(),
                reason: format!("template lacks placeholders {:?}", missing),
            }
            .into());
        }
        Ok(Self { text })
    }

    /// Substitutes each `{name}` with its value in one pass over the
    /// template. Values are copied verbatim, so braces inside a value are
    /// never substituted. Unknown placeholders stay.
    pub fn render(&self, values: &[(&str, &str)]) -> String {
        let mut out = String::with_capacity(self.text.len());
        let mut rest = self.text.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let value = after.find('}').and_then(|close| {
                let name = &after[..close];
                values
                    .iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, value)| (*value, close))
            });
            match value {
                Some((value, close)) => {
                    out.push_str(value);
                    rest = &after[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// The four stage templates, built-in or overridden.
#[derive(Debug, Clone, PartialEq)]
pub struct Templates {
    pub instruction: PromptTemplate,
    pub label: PromptTemplate,
    pub retrieve: PromptTemplate,
    pub finetune: PromptTemplate,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            instruction: PromptTemplate::new(DEFAULT_INSTRUCTION),
            label: PromptTemplate::new(DEFAULT_LABEL),
            retrieve: PromptTemplate::new(DEFAULT_RETRIEVE),
            finetune: PromptTemplate::new(DEFAULT_FINETUNE),
        }
    }
}

impl Templates {
    pub fn load(overrides: &TemplateOverrides) -> Result<Self, PipelineError> {
        let mut templates = Self::default();
        if let Some(path) = &overrides.instruction {
            templates.instruction =
                PromptTemplate::from_file(path, INSTRUCTION_PROMPT_TEMPLATE, &["example"])?;
        }
        if let Some(path) = &overrides.label {
            templates.label =
                PromptTemplate::from_file(path, LABEL_PROMPT_TEMPLATE, &["labels", "text"])?;
        }
        if let Some(path) = &overrides.retrieve {
            templates.retrieve = PromptTemplate::from_file(
                path,
                RETRIEVE_PROMPT_TEMPLATE,
                &["instruction", "contexts"],
            )?;
        }
        if let Some(path) = &overrides.finetune {
            templates.finetune =
                PromptTemplate::from_file(path, FINETUNE_PROMPT_TEMPLATE, &["prompt"])?;
        }
        Ok(templates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn render_replaces_every_occurrence() {
        let t = PromptTemplate::new("{a} and {a}, not {b} {c}");
        assert_eq!(t.render(&[("a", "x"), ("b", "y")]), "x and x, not y {c}");
    }

    #[test]
    fn placeholders_inside_values_are_left_alone() {
        let t = PromptTemplate::new("Q: {instruction}\nC: {contexts}");
        let rendered = t.render(&[("instruction", "what is {contexts}?"), ("contexts", "CTX")]);
        assert_eq!(rendered, "Q: what is {contexts}?\nC: CTX");
    }

    #[test]
    fn stray_braces_are_copied() {
        let t = PromptTemplate::new("{ {a}} {b");
        assert_eq!(t.render(&[("a", "x")]), "{ x} {b");
    }

    #[test]
    fn defaults_carry_their_placeholders() {
        let t = Templates::default();
        assert!(t.instruction.as_str().contains("{example}"));
        assert!(t.label.as_str().contains("{labels}") && t.label.as_str().contains("{text}"));
        assert!(t.retrieve.as_str().contains("{contexts}"));
        assert!(t.finetune.as_str().contains("{prompt}") && t.finetune.as_str().contains("input:"));
    }

    #[test]
    fn override_must_keep_required_placeholders() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("label.txt");
        let bad = dir.path().join("bad.txt");
        std::fs::write(&good, "Labels {labels}; text {text}").unwrap();
        std::fs::write(&bad, "Labels only {labels}").unwrap();

        let loaded = Templates::load(&TemplateOverrides {
            label: Some(good),
            ..TemplateOverrides::default()
        })
        .unwrap();
        assert_eq!(loaded.label.render(&[("labels", "A"), ("text", "t")]), "Labels A; text t");

        let err = Templates::load(&TemplateOverrides {
            label: Some(bad),
            ..TemplateOverrides::default()
        })
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Configuration(ConfigError::Invalid { key: LABEL_PROMPT_TEMPLATE, .. })
        ));
    }

    #[test]
    fn missing_override_file_is_a_missing_resource() {
        let err = Templates::load(&TemplateOverrides {
            retrieve: Some("/nonexistent/retrieve.txt".into()),
            ..TemplateOverrides::default()
        })
        .unwrap_err();
        assert!(matches!(err, PipelineError::MissingResource { .. }));
    }
}
