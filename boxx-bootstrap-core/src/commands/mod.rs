//! Command implementations: apply, bootstrap, diagnose.

pub mod apply;
pub mod bootstrap;
pub mod diagnose;
