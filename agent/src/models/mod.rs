//! Data model

pub mod deployment;
pub mod descriptor;
pub mod result;
