//! Deployment module

pub mod coordinator;
pub mod executor;
pub mod fsm;
pub mod history;
pub mod registry;
pub mod runner;
pub mod workload;
