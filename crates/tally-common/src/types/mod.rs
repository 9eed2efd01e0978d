//! Core data types for Tally rating

pub mod keys;
pub mod rated;
pub mod sequence;
pub mod usage;
