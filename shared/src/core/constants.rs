// Environment variable names. Defaults live next to the names they apply to.

// Runtime
pub const MAX_WORKERS: &str = "MAX_WORKERS";
pub const DEFAULT_MAX_WORKERS: usize = 5;
pub const FAILURE_POLICY: &str = "FAILURE_POLICY";
pub const LOG_FORMAT: &str = "LOG_FORMAT";

// Generation service
pub const API_BASE_URL: &str = "API_BASE_URL";
pub const API_KEY: &str = "API_KEY";
pub const ENGINE: &str = "ENGINE";
pub const MAX_TOKENS: &str = "MAX_TOKENS";
pub const TEMPERATURE: &str = "TEMPERATURE";
pub const TOP_P: &str = "TOP_P";
pub const FREQUENCY_PENALTY: &str = "FREQUENCY_PENALTY";
pub const PRESENCE_PENALTY: &str = "PRESENCE_PENALTY";
pub const STOP_SEQUENCES: &str = "STOP_SEQUENCES";
pub const REQUEST_TIMEOUT_SECS: &str = "REQUEST_TIMEOUT_SECS";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const MAX_RETRIES: &str = "MAX_RETRIES";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const RETRY_BASE_DELAY_SECS: &str = "RETRY_BASE_DELAY_SECS";
pub const DEFAULT_RETRY_BASE_DELAY_SECS: u64 = 30;

// Embedding service
pub const EMBEDDING_API_BASE_URL: &str = "EMBEDDING_API_BASE_URL";
pub const EMBEDDING_API_KEY: &str = "EMBEDDING_API_KEY";
pub const SENTENCE_BERT_MODEL: &str = "SENTENCE_BERT_MODEL";
pub const EMBEDDING_DIM: &str = "EMBEDDING_DIM";

// Vector index
pub const MILVUS_DB_HOST: &str = "MILVUS_DB_HOST";
pub const MILVUS_DB_PORT: &str = "MILVUS_DB_PORT";
pub const MILVUS_DB_NAME: &str = "MILVUS_DB_NAME";
pub const DEFAULT_MILVUS_DB_NAME: &str = "default";
pub const MILVUS_COLLECTION_NAME: &str = "MILVUS_COLLECTION_NAME";
pub const NPROBE: &str = "NPROBE";
pub const DEFAULT_NPROBE: u32 = 16;
pub const SEARCH_LIMIT: &str = "SEARCH_LIMIT";
pub const DEFAULT_SEARCH_LIMIT: usize = 3;
pub const NLIST: &str = "NLIST";
pub const DEFAULT_NLIST: u32 = 1000;

// slice
pub const SLICE_GENERATION_INPUT_FOLDER: &str = "SLICE_GENERATION_INPUT_FOLDER";
pub const SLICE_GENERATION_OUTPUT_FILE: &str = "SLICE_GENERATION_OUTPUT_FILE";
pub const SLICE_GENERATION_LENGTH: &str = "SLICE_GENERATION_LENGTH";
pub const SLICE_GENERATION_OFFSET_UNIT: &str = "SLICE_GENERATION_OFFSET_UNIT";
pub const SLICE_BATCH_SIZE: &str = "SLICE_BATCH_SIZE";
pub const DEFAULT_SLICE_BATCH_SIZE: usize = 256;

// instruct
pub const INSTRUCTIONS_FILE: &str = "INSTRUCTIONS_FILE";
pub const INSTRUCTION_BATCH_SIZE: &str = "INSTRUCTION_BATCH_SIZE";
pub const SIMILARITY_THRESHOLD: &str = "SIMILARITY_THRESHOLD";
pub const INSTRUCTION_GENERATION_SUM: &str = "INSTRUCTION_GENERATION_SUM";
pub const INSTRUCTION_SEED: &str = "INSTRUCTION_SEED";
pub const DEFAULT_INSTRUCTION_SEED: &str =
    "What should a household keep in an emergency preparedness kit?";
pub const INSTRUCTION_RNG_SEED: &str = "INSTRUCTION_RNG_SEED";
pub const INSTRUCTION_MAX_STALE_ROUNDS: &str = "INSTRUCTION_MAX_STALE_ROUNDS";
pub const DEFAULT_INSTRUCTION_MAX_STALE_ROUNDS: usize = 5;

// label
pub const DATA_LABEL_INPUT_FILE: &str = "DATA_LABEL_INPUT_FILE";
pub const DATA_LABEL_OUTPUT_FILE: &str = "DATA_LABEL_OUTPUT_FILE";
pub const LABEL_BATCH_SIZE: &str = "LABEL_BATCH_SIZE";
pub const LABEL_POOL_PATH: &str = "LABEL_POOL_PATH";
pub const LABEL_TYPE: &str = "LABEL_TYPE";

// embed
pub const REFERENCE_DATA_FILE: &str = "REFERENCE_DATA_FILE";
pub const EMBEDDING_BATCH_SIZE: &str = "EMBEDDING_BATCH_SIZE";
pub const EMBEDDING_PROGRESS_FILE: &str = "EMBEDDING_PROGRESS_FILE";

// retrieve
pub const REQUEST_GENERATION_INPUT_FILE: &str = "REQUEST_GENERATION_INPUT_FILE";
pub const REQUEST_GENERATION_OUTPUT_FILE: &str = "REQUEST_GENERATION_OUTPUT_FILE";
pub const REQUEST_GENERATION_BATCH_SIZE: &str = "REQUEST_GENERATION_BATCH_SIZE";

// combine
pub const LABEL_DATA_FILE: &str = "LABEL_DATA_FILE";
pub const INSTRUCTION_DATA_FILE: &str = "INSTRUCTION_DATA_FILE";
pub const COMBINATION_DATA_FILE: &str = "COMBINATION_DATA_FILE";
pub const COMBINATION_BATCH_SIZE: &str = "COMBINATION_BATCH_SIZE";

// finetune
pub const FINE_TUNE_DATA_INPUT_FILE: &str = "FINE_TUNE_DATA_INPUT_FILE";
pub const FINE_TUNE_DATA_OUTPUT_FILE: &str = "FINE_TUNE_DATA_OUTPUT_FILE";
pub const FINE_TUNE_DATA_BATCH_SIZE: &str = "FINE_TUNE_DATA_BATCH_SIZE";

// Prompt template overrides
pub const LABEL_PROMPT_TEMPLATE: &str = "LABEL_PROMPT_TEMPLATE";
pub const INSTRUCTION_PROMPT_TEMPLATE: &str = "INSTRUCTION_PROMPT_TEMPLATE";
pub const RETRIEVE_PROMPT_TEMPLATE: &str = "RETRIEVE_PROMPT_TEMPLATE";
pub const FINETUNE_PROMPT_TEMPLATE: &str = "FINETUNE_PROMPT_TEMPLATE";
