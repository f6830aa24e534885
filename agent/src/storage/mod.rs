//! Persistent engine state

pub mod layout;
pub mod settings;
