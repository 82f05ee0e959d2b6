//! Job engine and HTTP surface for the Azure Resource Inventory web front-end.

pub mod config;
pub mod job;
pub mod logging;
pub mod outputs;
pub mod script;
pub mod server;
