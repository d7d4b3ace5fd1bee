//! Launcher implementations

pub mod command;

pub use command::CommandLauncher;
