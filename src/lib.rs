//! Admission control for a CI job queue: decides which pending builds a
//! polling runner may take, and drops builds that can never run because their
//! namespace is out of shared-runner minutes.

pub mod config;
pub mod db;
pub mod matching;
pub mod pipeline;
pub mod quota;
pub mod scheduler;

#[cfg(test)]
mod fixtures;
