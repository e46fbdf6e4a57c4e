pub mod dedup;
pub mod document;
pub mod driver;
pub mod prompts;
pub mod stages;

// Re-export the public API
pub use driver::{RunSummary, Stage, StageDriver};
pub use prompts::{PromptTemplate, Templates};
