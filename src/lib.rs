pub mod compiler;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod exec;
pub mod monitor;
pub mod net;
pub mod shutdown;
pub mod store;
