pub mod compile;
pub mod resolve;
pub mod task;

pub use compile::{compile_pipeline, CompilerContext};
pub use resolve::resolve_cross_references;
pub use task::{PipelineSpec, TaskRef, TaskSpec};
