use crate::retry::RetryPolicy;
use crate::types::{Generation, RemoteError};
use reqwest::blocking::{Client, Response};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use shared::core::config::{EmbeddingConfig, GenerationConfig};
use shared::core::constants::{API_BASE_URL, EMBEDDING_API_BASE_URL};
use shared::{ConfigError, PipelineError};
use std::time::Duration;
use tracing::debug;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// Text generation: one prompt in, one completion out.
pub trait GenerationService: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<Generation, RemoteError>;
}

/// Sentence embeddings, one vector per input text, in input order.
pub trait EmbeddingService: Send + Sync {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RemoteError>;
}

const USER_AGENT: &str = concat!("ftgen/", env!("CARGO_PKG_VERSION"));

// Phrases OpenAI-compatible servers use when the prompt plus completion
// budget exceeds the context window.
const OVERSIZED_MARKERS: &[&str] = &[
    "reduce your prompt",
    "maximum context length",
    "context_length_exceeded",
];

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// Thin JSON-over-HTTP transport shared by the chat and embedding clients.
#[derive(Clone)]
struct Transport {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl Transport {
    fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        key: &'static str,
    ) -> Result<Self, PipelineError> {
        Url::parse(base_url).map_err(|e| ConfigError::Invalid {
            key,
            value: base_url.to_string(),
            reason: e.to_string(),
        })?;

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PipelineError::Service(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    fn post<T: Serialize>(&self, path: &str, payload: &T) -> Result<Response, RemoteError> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.client.post(&url).json(payload);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = req.send().map_err(|e| {
            if e.is_timeout() {
                RemoteError::Transient(format!("request timed out: {}", e))
            } else {
                RemoteError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp
            .text()
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        Err(classify_status(status.as_u16(), &body))
    }
}

/// Maps a non-success HTTP status (and its body) to a remote error kind.
pub fn classify_status(status: u16, body: &str) -> RemoteError {
    let detail = format!("{} {}", status, body.trim());
    match status {
        401 | 403 => RemoteError::Authentication(detail),
        429 => RemoteError::RateLimited(detail),
        400 | 413 if is_oversized_message(body) => RemoteError::Oversized(detail),
        413 => RemoteError::Oversized(detail),
        500..=599 => RemoteError::Transient(detail),
        _ => RemoteError::InvalidResponse(detail),
    }
}

fn is_oversized_message(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    OVERSIZED_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Extracts the first choice's text from a chat completion body.
pub fn parse_chat_response(body: &str) -> Result<String, RemoteError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| RemoteError::InvalidResponse(format!("malformed completion: {}", e)))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| RemoteError::InvalidResponse("completion has no content".to_string()))
}

/// Extracts embeddings from an embeddings body, restoring input order and
/// checking count and dimension.
pub fn parse_embedding_response(
    body: &str,
    expected: usize,
    dim: usize,
) -> Result<Vec<Vec<f32>>, RemoteError> {
    let mut parsed: EmbeddingResponse = serde_json::from_str(body)
        .map_err(|e| RemoteError::InvalidResponse(format!("malformed embeddings: {}", e)))?;

    if parsed.data.len() != expected {
        return Err(RemoteError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected,
            parsed.data.len()
        )));
    }
    if parsed.data.iter().all(|d| d.index.is_some()) {
        parsed.data.sort_by_key(|d| d.index);
    }
    if let Some(bad) = parsed.data.iter().find(|d| d.embedding.len() != dim) {
        return Err(RemoteError::InvalidResponse(format!(
            "expected dimension {}, got {}",
            dim,
            bad.embedding.len()
        )));
    }
    Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
}

/// Chat-completions client for an OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct ChatClient {
    config: GenerationConfig,
    transport: Transport,
    retry: RetryPolicy,
}

impl ChatClient {
    pub fn new(config: GenerationConfig) -> Result<Self, PipelineError> {
        let transport = Transport::new(
            &config.base_url,
            config.api_key.clone(),
            config.timeout,
            API_BASE_URL,
        )?;
        let retry = RetryPolicy::new(config.max_retries, config.retry_base_delay);
        Ok(Self {
            config,
            transport,
            retry,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, RemoteError> {
        let payload = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "system",
                content: prompt,
            }],
            max_tokens,
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            frequency_penalty: self.config.frequency_penalty,
            presence_penalty: self.config.presence_penalty,
            stop: (!self.config.stop.is_empty()).then_some(self.config.stop.as_slice()),
        };
        let resp = self.transport.post("/chat/completions", &payload)?;
        let body = resp
            .text()
            .map_err(|e| RemoteError::Network(format!("failed to read completion: {}", e)))?;
        parse_chat_response(&body)
    }
}

impl GenerationService for ChatClient {
    fn generate(&self, prompt: &str) -> Result<Generation, RemoteError> {
        debug!(model = %self.config.model, chars = prompt.len(), "requesting completion");
        let response = self
            .retry
            .run_with_shrink(self.config.max_tokens, |tokens| self.complete(prompt, tokens))?;
        Ok(Generation::new(prompt, response))
    }
}

/// Embeddings client for an OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct EmbeddingClient {
    config: EmbeddingConfig,
    transport: Transport,
    retry: RetryPolicy,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Result<Self, PipelineError> {
        let transport = Transport::new(
            &config.base_url,
            config.api_key.clone(),
            config.timeout,
            EMBEDDING_API_BASE_URL,
        )?;
        let retry = RetryPolicy::new(config.max_retries, config.retry_base_delay);
        Ok(Self {
            config,
            transport,
            retry,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dim(&self) -> usize {
        self.config.dim
    }
}

impl EmbeddingService for EmbeddingClient {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RemoteError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(model = %self.config.model, count = texts.len(), "requesting embeddings");
        let payload = EmbeddingRequest {
            model: &self.config.model,
            input: texts,
        };
        self.retry.run(|| {
            let resp = self.transport.post("/embeddings", &payload)?;
            let body = resp
                .text()
                .map_err(|e| RemoteError::Network(format!("failed to read embeddings: {}", e)))?;
            parse_embedding_response(&body, texts.len(), self.config.dim)
        })
    }
}
