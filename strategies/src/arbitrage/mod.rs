pub mod admission;
pub mod decider;
pub mod engine;
pub mod errors;
pub mod execution;
pub mod journal;
pub mod manager;
pub mod margin;
pub mod oracle;
pub mod params;
pub mod policy;
pub mod recovery;
pub mod types;

#[cfg(test)]
mod tests;
