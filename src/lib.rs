pub mod checkpoint;
pub mod components;
pub mod data;
pub mod error;
pub mod fetcher;
pub mod initialize;
pub mod loss;
pub mod model;
pub mod sampling;
pub mod training;
pub mod utils;

pub use error::{Result, TrainError};
