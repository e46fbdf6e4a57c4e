use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::core::constants::*;
use crate::types::{FailurePolicy, LabelKind};

/// A setting that is absent or cannot be coerced to its type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {key} is not set")]
    Missing { key: &'static str },

    #[error("environment variable {key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Snapshot of the variables a stage is configured from.
///
/// Taken once at startup; everything downstream receives typed config structs
/// built from it and never consults the process environment again. Empty
/// values count as unset.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, String>,
}

impl Env {
    pub fn from_process() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        Self { vars }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key)
            .map(str::to_string)
            .ok_or(ConfigError::Missing { key })
    }

    pub fn required_path(&self, key: &'static str) -> Result<PathBuf, ConfigError> {
        self.required(key).map(PathBuf::from)
    }

    pub fn parse<T>(&self, key: &'static str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.required(key)?;
        coerce(key, &raw)
    }

    pub fn optional<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key).map(|raw| coerce(key, raw)).transpose()
    }

    pub fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.optional(key)?.unwrap_or(default))
    }

    /// A required count that must be at least one.
    pub fn positive(&self, key: &'static str) -> Result<usize, ConfigError> {
        let value: usize = self.parse(key)?;
        non_zero(key, value)
    }

    pub fn positive_or(&self, key: &'static str, default: usize) -> Result<usize, ConfigError> {
        let value = self.parse_or(key, default)?;
        non_zero(key, value)
    }
}

fn coerce<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn non_zero(key: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

/// Dispatcher settings shared by every stage that issues remote requests.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
}

impl RuntimeConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        Ok(Self {
            concurrency: env.positive_or(MAX_WORKERS, DEFAULT_MAX_WORKERS)?,
            failure_policy: env.parse_or(FAILURE_POLICY, FailurePolicy::default())?,
        })
    }
}

/// Connection and sampling settings for the text-generation service.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub stop: Vec<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl GenerationConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let stop = env
            .get(STOP_SEQUENCES)
            .map(|raw| {
                raw.split('|')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let max_tokens: u32 = env.parse(MAX_TOKENS)?;
        if max_tokens == 0 {
            return Err(ConfigError::Invalid {
                key: MAX_TOKENS,
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            base_url: env.required(API_BASE_URL)?,
            api_key: env.get(API_KEY).map(str::to_string),
            model: env.required(ENGINE)?,
            max_tokens,
            temperature: env.parse(TEMPERATURE)?,
            top_p: env.parse(TOP_P)?,
            frequency_penalty: env.parse(FREQUENCY_PENALTY)?,
            presence_penalty: env.parse(PRESENCE_PENALTY)?,
            stop,
            timeout: Duration::from_secs(
                env.parse_or(REQUEST_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS)?,
            ),
            max_retries: env.parse_or(MAX_RETRIES, DEFAULT_MAX_RETRIES)?,
            retry_base_delay: Duration::from_secs(
                env.parse_or(RETRY_BASE_DELAY_SECS, DEFAULT_RETRY_BASE_DELAY_SECS)?,
            ),
        })
    }
}

/// Settings for the embedding service. Falls back to the generation
/// endpoint and key when no dedicated ones are given.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dim: usize,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl EmbeddingConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let base_url = match env.get(EMBEDDING_API_BASE_URL) {
            Some(url) => url.to_string(),
            None => env.required(API_BASE_URL)?,
        };
        let api_key = env
            .get(EMBEDDING_API_KEY)
            .or_else(|| env.get(API_KEY))
            .map(str::to_string);

        Ok(Self {
            base_url,
            api_key,
            model: env.required(SENTENCE_BERT_MODEL)?,
            dim: env.positive(EMBEDDING_DIM)?,
            timeout: Duration::from_secs(
                env.parse_or(REQUEST_TIMEOUT_SECS, DEFAULT_REQUEST_TIMEOUT_SECS)?,
            ),
            max_retries: env.parse_or(MAX_RETRIES, DEFAULT_MAX_RETRIES)?,
            retry_base_delay: Duration::from_secs(
                env.parse_or(RETRY_BASE_DELAY_SECS, DEFAULT_RETRY_BASE_DELAY_SECS)?,
            ),
        })
    }
}

/// Vector index connection and search parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    pub host: String,
    pub port: u16,
    pub db_name: String,
    pub collection: String,
    pub nprobe: u32,
    pub limit: usize,
    pub nlist: u32,
}

impl IndexConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        Ok(Self {
            host: env.required(MILVUS_DB_HOST)?,
            port: env.parse(MILVUS_DB_PORT)?,
            db_name: env
                .get(MILVUS_DB_NAME)
                .unwrap_or(DEFAULT_MILVUS_DB_NAME)
                .to_string(),
            collection: env.required(MILVUS_COLLECTION_NAME)?,
            nprobe: env.parse_or(NPROBE, DEFAULT_NPROBE)?,
            limit: env.positive_or(SEARCH_LIMIT, DEFAULT_SEARCH_LIMIT)?,
            nlist: env.parse_or(NLIST, DEFAULT_NLIST)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SliceConfig {
    pub input_folder: PathBuf,
    pub output_file: PathBuf,
    /// Window length in characters.
    pub length: usize,
    /// Distance in characters between consecutive window starts.
    pub step: usize,
    pub batch_size: usize,
}

impl SliceConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        Ok(Self {
            input_folder: env.required_path(SLICE_GENERATION_INPUT_FOLDER)?,
            output_file: env.required_path(SLICE_GENERATION_OUTPUT_FILE)?,
            length: env.positive(SLICE_GENERATION_LENGTH)?,
            step: env.positive(SLICE_GENERATION_OFFSET_UNIT)?,
            batch_size: env.positive_or(SLICE_BATCH_SIZE, DEFAULT_SLICE_BATCH_SIZE)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstructConfig {
    pub output_file: PathBuf,
    pub batch_size: usize,
    pub similarity_threshold: f32,
    /// Total number of instructions the sequence should hold.
    pub generation_sum: usize,
    pub seed_instruction: String,
    pub rng_seed: Option<u64>,
    pub max_stale_rounds: usize,
}

impl InstructConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        let similarity_threshold: f32 = env.parse(SIMILARITY_THRESHOLD)?;
        if !(similarity_threshold > 0.0 && similarity_threshold <= 1.0) {
            return Err(ConfigError::Invalid {
                key: SIMILARITY_THRESHOLD,
                value: similarity_threshold.to_string(),
                reason: "must lie in (0, 1]".to_string(),
            });
        }

        Ok(Self {
            output_file: env.required_path(INSTRUCTIONS_FILE)?,
            batch_size: env.positive(INSTRUCTION_BATCH_SIZE)?,
            similarity_threshold,
            generation_sum: env.parse(INSTRUCTION_GENERATION_SUM)?,
            seed_instruction: env
                .get(INSTRUCTION_SEED)
                .unwrap_or(DEFAULT_INSTRUCTION_SEED)
                .to_string(),
            rng_seed: env.optional(INSTRUCTION_RNG_SEED)?,
            max_stale_rounds: env.positive_or(
                INSTRUCTION_MAX_STALE_ROUNDS,
                DEFAULT_INSTRUCTION_MAX_STALE_ROUNDS,
            )?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelConfig {
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub batch_size: usize,
    pub label_pool: PathBuf,
    pub kind: LabelKind,
}

impl LabelConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        Ok(Self {
            input_file: env.required_path(DATA_LABEL_INPUT_FILE)?,
            output_file: env.required_path(DATA_LABEL_OUTPUT_FILE)?,
            batch_size: env.positive(LABEL_BATCH_SIZE)?,
            label_pool: env.required_path(LABEL_POOL_PATH)?,
            kind: env.parse(LABEL_TYPE)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbedConfig {
    pub reference_file: PathBuf,
    pub batch_size: usize,
    pub progress_file: PathBuf,
}

impl EmbedConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        Ok(Self {
            reference_file: env.required_path(REFERENCE_DATA_FILE)?,
            batch_size: env.positive(EMBEDDING_BATCH_SIZE)?,
            progress_file: env.required_path(EMBEDDING_PROGRESS_FILE)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrieveConfig {
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub batch_size: usize,
    pub reference_file: PathBuf,
}

impl RetrieveConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        Ok(Self {
            input_file: env.required_path(REQUEST_GENERATION_INPUT_FILE)?,
            output_file: env.required_path(REQUEST_GENERATION_OUTPUT_FILE)?,
            batch_size: env.positive(REQUEST_GENERATION_BATCH_SIZE)?,
            reference_file: env.required_path(REFERENCE_DATA_FILE)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CombineConfig {
    pub label_file: PathBuf,
    pub reference_file: PathBuf,
    pub instruction_file: PathBuf,
    pub output_file: PathBuf,
    pub batch_size: usize,
}

impl CombineConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        Ok(Self {
            label_file: env.required_path(LABEL_DATA_FILE)?,
            reference_file: env.required_path(REFERENCE_DATA_FILE)?,
            instruction_file: env.required_path(INSTRUCTION_DATA_FILE)?,
            output_file: env.required_path(COMBINATION_DATA_FILE)?,
            batch_size: env.positive(COMBINATION_BATCH_SIZE)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinetuneConfig {
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub batch_size: usize,
}

impl FinetuneConfig {
    pub fn from_env(env: &Env) -> Result<Self, ConfigError> {
        Ok(Self {
            input_file: env.required_path(FINE_TUNE_DATA_INPUT_FILE)?,
            output_file: env.required_path(FINE_TUNE_DATA_OUTPUT_FILE)?,
            batch_size: env.positive(FINE_TUNE_DATA_BATCH_SIZE)?,
        })
    }
}

/// Optional files replacing the built-in prompt templates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateOverrides {
    pub label: Option<PathBuf>,
    pub instruction: Option<PathBuf>,
    pub retrieve: Option<PathBuf>,
    pub finetune: Option<PathBuf>,
}

impl TemplateOverrides {
    pub fn from_env(env: &Env) -> Self {
        let path = |key: &str| env.get(key).map(PathBuf::from);
        Self {
            label: path(LABEL_PROMPT_TEMPLATE),
            instruction: path(INSTRUCTION_PROMPT_TEMPLATE),
            retrieve: path(RETRIEVE_PROMPT_TEMPLATE),
            finetune: path(FINETUNE_PROMPT_TEMPLATE),
        }
    }
}
