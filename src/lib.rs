mod backend;
pub mod dataset;
pub mod eval;
pub mod experiment;
pub mod export;
pub mod focused;
pub mod model;
pub mod scheduler;
pub mod train;

pub use backend::{Backend, TrainBackend};
