pub mod combine;
pub mod embed;
pub mod finetune;
pub mod instruct;
pub mod label;
pub mod retrieve;
pub mod slice;

use dispatcher::BatchDispatcher;
use shared::core::config::RuntimeConfig;
use shared::PipelineError;

pub(crate) fn dispatcher_for(runtime: &RuntimeConfig) -> Result<BatchDispatcher, PipelineError> {
    Ok(BatchDispatcher::new(
        runtime.concurrency,
        runtime.failure_policy,
    )?)
}
