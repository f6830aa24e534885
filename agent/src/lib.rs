//! fleetdeploy library
//!
//! Lifecycle hook engine that rolls a built artifact out across a group of
//! hosts, one ordered set of hooks per host.

pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod secrets;
pub mod storage;
pub mod utils;
