//! Chaos tester for long-running jobs: kill parts of the cluster while
//! polling the job, then check it was running again within the grace period
//! after every fault.

pub mod checker;
pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod generator;
pub mod history;
pub mod nemesis;
pub mod orchestrator;
pub mod report;
pub mod stop;
pub mod test_spec;
