use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Record shapes shared by the pipeline stages.
//
// Every record is one line of a JSONL sequence and carries an `id`. The field
// names match the files the stages exchange, so downstream stages can read
// whatever an upstream stage wrote.
// ============================================================================

/// Anything persisted in a checkpointed sequence.
pub trait Record {
    fn id(&self) -> u64;
}

/// A window of a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceRecord {
    pub id: u64,
    /// Path of the document the slice was cut from.
    pub source: String,
    pub slice: String,
    /// Character offset of the slice inside the document text.
    pub offset: usize,
    #[serde(rename = "isLabeled", default)]
    pub is_labeled: bool,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// A generated instruction (question) awaiting or carrying labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionRecord {
    pub id: u64,
    pub instruction: String,
    #[serde(rename = "isLabeled", default)]
    pub is_labeled: bool,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// One line of the label pool file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelEntry {
    pub label: String,
}

/// Progress entry written once a slice embedding has been inserted into the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedRecord {
    pub id: u64,
    pub dim: usize,
}

/// An instruction paired with the reference text it should be answered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinationRecord {
    pub id: u64,
    pub instruction_id: u64,
    pub instruction: String,
    #[serde(default)]
    pub slice_ids: Vec<u64>,
    #[serde(default)]
    pub contexts: Vec<String>,
    pub prompt: String,
}

/// Final fine-tuning pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetuneRecord {
    pub id: u64,
    pub input: String,
    pub output: String,
    /// Set only on degraded records written under the tolerate policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

macro_rules! impl_record {
    ($($ty:ty),* $(,)?) => {
        $(impl Record for $ty {
            fn id(&self) -> u64 {
                self.id
            }
        })*
    };
}

impl_record!(
    SliceRecord,
    InstructionRecord,
    EmbeddedRecord,
    CombinationRecord,
    FinetuneRecord,
);

/// What happens to a batch when one of its items fails after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// The whole batch is abandoned and the error propagates.
    #[default]
    FailFast,
    /// The failed item is kept as a degraded record and the run continues.
    Tolerate,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "fail_fast" | "failfast" => Ok(Self::FailFast),
            "tolerate" | "continue" => Ok(Self::Tolerate),
            other => Err(format!("expected `fail-fast` or `tolerate`, got `{}`", other)),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailFast => write!(f, "fail-fast"),
            Self::Tolerate => write!(f, "tolerate"),
        }
    }
}

/// Which kind of record the label stage classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Slice,
    Instruction,
}

impl FromStr for LabelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "slice" => Ok(Self::Slice),
            "instruction" => Ok(Self::Instruction),
            other => Err(format!("expected `slice` or `instruction`, got `{}`", other)),
        }
    }
}
