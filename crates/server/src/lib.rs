//! Demo server and command-line client for spindle sessions.

pub mod config;
pub mod demo;

pub use config::ServerConfig;
