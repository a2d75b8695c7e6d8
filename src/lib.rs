//! ytwrap library - managed processes for command-line downloaders

pub mod binary;
pub mod config;
pub mod error;
pub mod process;
pub mod progress;

// Re-export commonly used types
pub use config::{Config, Preset, PresetManager};
pub use error::ProcessError;
pub use process::{ExitState, ProcessContext, ProcessController, SpawnRequest, TermSignal, TransformStep};
pub use progress::{ProgressEvent, ProgressTransform};
