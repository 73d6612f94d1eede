pub mod classify;
pub mod dispatcher;
pub mod local;

pub use dispatcher::Dispatcher;
pub use local::{ExecutionResult, LocalExecutor};
