pub mod appearance;
pub mod config;
pub mod detection;
pub mod enhance;
pub mod pipeline;
pub mod rendering;
pub mod runtime;
pub mod segmentation;
pub mod tracking;
pub mod video;

// Re-export the top-level error type so callers only need `focus_core::Error`
pub use anyhow::Error;
pub use anyhow::Result;

pub use config::SessionConfig;
pub use pipeline::{FrameOutput, Session};
