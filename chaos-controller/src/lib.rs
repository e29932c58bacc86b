pub mod cluster;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod impls;
pub mod queue;
pub mod resource;
pub mod selector;
pub mod sources;
pub mod timer;

pub use controller::Controller;
pub use engine::{Reconciler, ReconcileOutcome};
