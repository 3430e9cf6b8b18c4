//! Command-line interface

pub mod args;
pub mod commands;
pub mod signal;

pub use args::{Cli, Commands, LogFormat};
