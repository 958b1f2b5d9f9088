// Content Pipeline - API Core
//
// Backend for automated content generation and publication. The heart of
// the crate is the job resilience subsystem: error classification, retry
// policy, circuit breakers, rate limiting, durable retry tracking, the job
// lifecycle state machine, failure-rate alerting and admin retry controls.

pub mod config;
pub mod kernel;
pub mod resilience;
pub mod server;

pub use config::*;
