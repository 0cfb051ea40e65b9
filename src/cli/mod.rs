//! Command line interface

pub mod agent;
pub mod app;
pub mod commands;
pub mod display;
pub mod ops;

pub use app::App;
pub use commands::{CliArgs, Commands, HandlerTable};
