//! CLI Commands

pub mod config;
pub mod env;
pub mod run;
