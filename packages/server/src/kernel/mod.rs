//! Kernel module - server infrastructure and dependencies.

pub mod deps;
pub mod generation;
pub mod pipeline;
pub mod publishing;

pub use deps::ServerDeps;
pub use generation::{estimate_tokens, GeneratedContent, GenerationApi, HttpGenerationApi};
pub use pipeline::{ContentPipeline, PipelineOutcome};
pub use publishing::{HttpPublishingApi, PublishedPost, PublishingApi};
