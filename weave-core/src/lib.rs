pub mod cache;
pub mod config;
pub mod detection;
pub mod event;
pub mod fusion;
pub mod identity;
pub mod observation;
pub mod pipeline;
pub mod refine;
pub mod timeline;
pub mod tracking;

// Re-export the error type so callers only need `weave_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;

pub use config::EngineConfig;
pub use event::Event;
pub use pipeline::{Engine, EventFusionPipeline, ExecutionMode, RunReport};
