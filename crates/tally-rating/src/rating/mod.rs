//! Rating of aggregated usage

mod engine;

pub use engine::RatingEngine;
