//! Oracle node pipeline: listeners turn contract events into jobs, workers turn
//! jobs into transaction payloads and reporters submit them on-chain.

pub mod api;
pub mod chain;
pub mod cli;
pub mod error;
pub mod jobs;
pub mod listener;
pub mod metrics;
pub mod node;
pub mod queue;
pub mod reporter;
pub mod server;
pub mod service;
pub mod store;
pub mod worker;

#[cfg(test)]
mod tests;
