//! CLI command modules.

pub mod cache;
pub mod http;
pub mod status;
pub mod workflow;
