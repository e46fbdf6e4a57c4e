//! `ftgen`: runs one stage of the fine-tuning dataset pipeline.
//!
//! Every stage is resumable. Rerunning a command after a crash continues
//! from the last record its output file holds.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipeline::stages::{combine, embed, finetune, instruct, label, retrieve, slice};
use pipeline::{RunSummary, Templates};
use remote::{ChatClient, EmbeddingClient, MilvusRestIndex, RetryPolicy};
use shared::core::config::{
    CombineConfig, EmbedConfig, EmbeddingConfig, FinetuneConfig, GenerationConfig, IndexConfig,
    InstructConfig, LabelConfig, RetrieveConfig, RuntimeConfig, SliceConfig, TemplateOverrides,
};
use shared::core::constants::LOG_FORMAT;
use shared::{ConfigError, Env, PipelineError};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};

mod logging;

#[derive(Parser, Debug)]
#[command(name = "ftgen", version, about = "Checkpointed fine-tuning dataset pipeline", long_about = None)]
struct Cli {
    /// Settings file loaded before reading the environment; variables
    /// already set win. Defaults to `.env` when present.
    #[arg(long, global = true, value_name = "PATH")]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Cut the documents of a folder into overlapping slices
    Slice,
    /// Generate instructions until the configured total is reached
    Instruct,
    /// Label slices or instructions from the label pool
    Label,
    /// Embed slices into the vector index
    Embed,
    /// Attach the nearest slices to every instruction
    Retrieve,
    /// Pair instructions and slices that share a label
    Combine,
    /// Produce input/output training pairs
    Finetune,
}

impl Command {
    fn stage(self) -> &'static str {
        match self {
            Command::Slice => slice::NAME,
            Command::Instruct => instruct::NAME,
            Command::Label => label::NAME,
            Command::Embed => embed::NAME,
            Command::Retrieve => retrieve::NAME,
            Command::Combine => combine::NAME,
            Command::Finetune => finetune::NAME,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // 1. Load settings
    if let Err(e) = load_env_file(cli.env_file.as_deref()) {
        eprintln!("error: {:#}", e);
        return ExitCode::from(2);
    }
    let env = Env::from_process();

    // 2. Logging
    logging::init(env.get(LOG_FORMAT));

    // 3. Run the stage
    let stage = cli.command.stage();
    match run(cli.command, &env).with_context(|| format!("{} stage failed", stage)) {
        Ok(summary) => {
            info!(
                stage,
                resumed_from = summary.resumed_from,
                batches = summary.batches,
                written = summary.written,
                degraded = summary.degraded,
                "done"
            );
            match serde_json::to_string(&summary) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("Failed to encode run summary: {}", e),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(stage, error = %format!("{:#}", e), "stage aborted");
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn load_env_file(path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?;
        }
        None => match dotenvy::dotenv() {
            Ok(_) => {}
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e).context("failed to load .env"),
        },
    }
    Ok(())
}

/// 2 when the operator has to fix settings or inputs, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<PipelineError>() {
        return e.exit_code();
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    1
}

fn run(command: Command, env: &Env) -> Result<RunSummary> {
    let runtime = RuntimeConfig::from_env(env)?;
    let templates = Templates::load(&TemplateOverrides::from_env(env))?;

    let summary = match command {
        Command::Slice => slice::run(&SliceConfig::from_env(env)?)?,
        Command::Instruct => {
            let config = InstructConfig::from_env(env)?;
            let generator = ChatClient::new(GenerationConfig::from_env(env)?)?;
            let embedder = EmbeddingClient::new(EmbeddingConfig::from_env(env)?)?;
            instruct::run(&config, &runtime, &generator, &embedder, &templates.instruction)?
        }
        Command::Label => {
            let config = LabelConfig::from_env(env)?;
            let generator = ChatClient::new(GenerationConfig::from_env(env)?)?;
            label::run(&config, &runtime, &generator, &templates.label)?
        }
        Command::Embed => {
            let config = EmbedConfig::from_env(env)?;
            let index_config = IndexConfig::from_env(env)?;
            let embedding = EmbeddingConfig::from_env(env)?;
            let dim = embedding.dim;
            let index = connect_index(&index_config, &embedding)?;
            let embedder = EmbeddingClient::new(embedding)?;
            embed::run(&config, &runtime, &index_config, dim, &embedder, &index)?
        }
        Command::Retrieve => {
            let config = RetrieveConfig::from_env(env)?;
            let index_config = IndexConfig::from_env(env)?;
            let embedding = EmbeddingConfig::from_env(env)?;
            let index = connect_index(&index_config, &embedding)?;
            let embedder = EmbeddingClient::new(embedding)?;
            retrieve::run(
                &config,
                &runtime,
                &index_config,
                &embedder,
                &index,
                &templates.retrieve,
            )?
        }
        Command::Combine => combine::run(&CombineConfig::from_env(env)?, &templates.retrieve)?,
        Command::Finetune => {
            let config = FinetuneConfig::from_env(env)?;
            let generator = ChatClient::new(GenerationConfig::from_env(env)?)?;
            finetune::run(&config, &runtime, &generator, &templates.finetune)?
        }
    };
    Ok(summary)
}

/// The index shares the embedding service's timeout and retry settings.
fn connect_index(
    config: &IndexConfig,
    embedding: &EmbeddingConfig,
) -> Result<MilvusRestIndex, PipelineError> {
    let retry = RetryPolicy::new(embedding.max_retries, embedding.retry_base_delay);
    Ok(MilvusRestIndex::connect(config, embedding.timeout, retry)?)
}
