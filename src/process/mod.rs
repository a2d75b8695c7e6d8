//! Process management for wrapped command-line tools

pub mod context;
pub mod controller;
pub mod governor;
pub mod registry;
pub mod terminate;
pub mod transform;

pub use context::ProcessContext;
pub use controller::{ExitState, Listen, ProcessController};
pub use governor::{LaunchGovernor, SpawnRequest};
pub use registry::{ControllerInfo, ControllerRegistry};
pub use terminate::{platform_terminator, DirectSignal, TermSignal, Terminator, TreeSignal};
pub use transform::{passthrough, Transform, TransformStep};
