pub mod types;
pub mod client;
pub mod index;
pub mod retry;
pub mod similarity;

pub use client::{ChatClient, EmbeddingClient, EmbeddingService, GenerationService};
pub use index::{
    CollectionSchema, Hit, IndexParams, MilvusRestIndex, SearchParams, VectorIndex, VectorRow,
};
pub use retry::RetryPolicy;
pub use similarity::cosine_similarity;
pub use types::{Generation, RemoteError};

#[cfg(any(test, feature = "mock"))]
pub use client::mock;

use shared::PipelineError;

impl From<RemoteError> for PipelineError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Oversized(msg) => PipelineError::OversizedRequest(msg),
            RemoteError::Authentication(msg) => PipelineError::Service(msg),
            RemoteError::InvalidResponse(msg) => PipelineError::InvalidResponse(msg),
            RemoteError::Index(msg) => PipelineError::Index(msg),
            transient @ (RemoteError::Transient(_)
            | RemoteError::RateLimited(_)
            | RemoteError::Network(_)
            | RemoteError::RetriesExhausted { .. }) => {
                PipelineError::TransientService(transient.to_string())
            }
        }
    }
}
