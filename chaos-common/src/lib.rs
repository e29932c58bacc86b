//! Types shared between the chaos controller and the node daemon.

pub mod logging;
pub mod protocol;

pub use logging::Logger;
