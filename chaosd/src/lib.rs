pub mod attach;
pub mod cgroup;
pub mod config;
pub mod error;
pub mod executor;
pub mod mutator;
pub mod process;
pub mod proctree;
pub mod runtime;
pub mod server;

pub use error::ExecutorError;
pub use executor::Executor;
